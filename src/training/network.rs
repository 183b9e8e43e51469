//! Detection network seam
//!
//! The orchestrator never looks inside the detector. It needs the three
//! per-scale outputs, the variable map holding the weights, a train/eval
//! switch and the grouping of variables into named parameter groups.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{Error, Result};

/// Number of detection scales a network produces
pub const NUM_SCALES: usize = 3;

/// A multi-scale detector trained by [`crate::training::StagedTrainer`]
pub trait DetectionNetwork {
    /// Run the network, returning one raw output per scale
    fn forward(&self, images: &Tensor) -> Result<[Tensor; NUM_SCALES]>;

    /// Variables holding every trainable weight
    fn var_map(&self) -> &VarMap;

    /// Switch between training and evaluation behavior (dropout and similar)
    fn set_training(&mut self, training: bool);

    /// Whether the network is in training mode
    fn is_training(&self) -> bool;

    /// Variables keyed by parameter group
    fn parameter_groups(&self) -> Result<BTreeMap<String, Vec<(String, Var)>>> {
        let mut groups: BTreeMap<String, Vec<(String, Var)>> = BTreeMap::new();
        for (name, var) in named_vars(self.var_map())? {
            groups
                .entry(group_of(&name).to_string())
                .or_default()
                .push((name, var));
        }
        Ok(groups)
    }

    /// Names of all parameter groups
    fn group_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.parameter_groups()?.into_keys().collect())
    }
}

/// Parameter group a variable belongs to: the first dotted segment of its name
pub fn group_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// All variables of a map, sorted by name
pub fn named_vars(var_map: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("variable map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}
