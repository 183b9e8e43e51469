//! Phase table and trainability policies
//!
//! A run is split into three contiguous epoch ranges. The phase an epoch
//! belongs to is always derived from the breakpoint table, both on a cold
//! start and on resume, so a checkpoint never has to remember which phase
//! produced it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::{ParameterGroupConfig, PhaseConfig};
use crate::error::{Error, Result};

/// Training phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Only the detection heads are trained
    Freeze,
    /// Everything except the backbone is trained
    PartialUnfreeze,
    /// The whole network is trained
    FullUnfreeze,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 3] = [Phase::Freeze, Phase::PartialUnfreeze, Phase::FullUnfreeze];

    /// Phase that follows this one, `None` for the terminal phase
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Freeze => Some(Phase::PartialUnfreeze),
            Phase::PartialUnfreeze => Some(Phase::FullUnfreeze),
            Phase::FullUnfreeze => None,
        }
    }

    /// Whether this is the last phase of a run
    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// Short name used in logs and file metadata
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Freeze => "freeze",
            Phase::PartialUnfreeze => "partial_unfreeze",
            Phase::FullUnfreeze => "full_unfreeze",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breakpoint table `F < P < U`
///
/// Epochs `[0, F)` run in [`Phase::Freeze`], `[F, P)` in
/// [`Phase::PartialUnfreeze`] and `[P, U)` in [`Phase::FullUnfreeze`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSchedule {
    freeze_end: usize,
    partial_end: usize,
    unfreeze_end: usize,
}

impl PhaseSchedule {
    /// Build a schedule, rejecting breakpoints that are not strictly increasing
    pub fn new(freeze_end: usize, partial_end: usize, unfreeze_end: usize) -> Result<Self> {
        if !(freeze_end < partial_end && partial_end < unfreeze_end) {
            return Err(Error::config(format!(
                "phase breakpoints must satisfy F < P < U, got F={}, P={}, U={}",
                freeze_end, partial_end, unfreeze_end
            )));
        }
        Ok(Self {
            freeze_end,
            partial_end,
            unfreeze_end,
        })
    }

    /// Build a schedule from the run configuration
    pub fn from_config(config: &PhaseConfig) -> Result<Self> {
        Self::new(config.freeze_end, config.partial_end, config.unfreeze_end)
    }

    /// Full epoch range owned by a phase
    pub fn range(&self, phase: Phase) -> Range<usize> {
        match phase {
            Phase::Freeze => 0..self.freeze_end,
            Phase::PartialUnfreeze => self.freeze_end..self.partial_end,
            Phase::FullUnfreeze => self.partial_end..self.unfreeze_end,
        }
    }

    /// Epochs of `phase` that still have to run when training resumes at `from_epoch`
    ///
    /// The result is empty when the phase lies entirely before `from_epoch`.
    pub fn remaining(&self, phase: Phase, from_epoch: usize) -> Range<usize> {
        let range = self.range(phase);
        range.start.max(from_epoch).min(range.end)..range.end
    }

    /// Phase an epoch falls into, `None` once the run is complete
    pub fn phase_for_epoch(&self, epoch: usize) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|&phase| self.range(phase).contains(&epoch))
    }

    /// Total number of epochs (`U`)
    pub fn total_epochs(&self) -> usize {
        self.unfreeze_end
    }
}

/// Which parameter groups receive optimizer updates under a phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainableParameterSet {
    phase: Phase,
    flags: BTreeMap<String, bool>,
}

impl TrainableParameterSet {
    /// Evaluate the policy of `phase` over every group the network exposes
    ///
    /// Flags are computed from scratch, never patched from an earlier set.
    pub fn for_phase(
        phase: Phase,
        groups: &ParameterGroupConfig,
        network_groups: &BTreeSet<String>,
    ) -> Result<Self> {
        groups.validate_against(network_groups)?;

        let flags = network_groups
            .iter()
            .map(|name| {
                let trainable = match phase {
                    Phase::Freeze => groups.heads.iter().any(|head| head == name),
                    Phase::PartialUnfreeze => *name != groups.backbone,
                    Phase::FullUnfreeze => true,
                };
                (name.clone(), trainable)
            })
            .collect();

        Ok(Self { phase, flags })
    }

    /// Phase that produced this set
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether a group is trainable; unknown groups are frozen
    pub fn is_trainable(&self, group: &str) -> bool {
        self.flags.get(group).copied().unwrap_or(false)
    }

    /// Trainable group names in sorted order
    pub fn trainable_groups(&self) -> Vec<String> {
        self.flags
            .iter()
            .filter(|(_, trainable)| **trainable)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Frozen group names in sorted order
    pub fn frozen_groups(&self) -> Vec<String> {
        self.flags
            .iter()
            .filter(|(_, trainable)| !**trainable)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Raw flag map
    pub fn flags(&self) -> &BTreeMap<String, bool> {
        &self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector_groups() -> BTreeSet<String> {
        ["backbone", "neck", "yolo_head1", "yolo_head2", "yolo_head3"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_schedule_rejects_non_increasing_breakpoints() {
        assert!(PhaseSchedule::new(4, 4, 6).is_err());
        assert!(PhaseSchedule::new(5, 3, 6).is_err());
        assert!(PhaseSchedule::new(2, 4, 4).is_err());
        assert!(PhaseSchedule::new(0, 1, 2).is_ok());
    }

    #[test]
    fn test_phase_for_epoch() {
        let schedule = PhaseSchedule::new(2, 4, 6).unwrap();
        assert_eq!(schedule.phase_for_epoch(0), Some(Phase::Freeze));
        assert_eq!(schedule.phase_for_epoch(1), Some(Phase::Freeze));
        assert_eq!(schedule.phase_for_epoch(2), Some(Phase::PartialUnfreeze));
        assert_eq!(schedule.phase_for_epoch(3), Some(Phase::PartialUnfreeze));
        assert_eq!(schedule.phase_for_epoch(4), Some(Phase::FullUnfreeze));
        assert_eq!(schedule.phase_for_epoch(5), Some(Phase::FullUnfreeze));
        assert_eq!(schedule.phase_for_epoch(6), None);
    }

    #[test]
    fn test_remaining_range_when_resuming() {
        let schedule = PhaseSchedule::new(2, 4, 6).unwrap();
        assert!(schedule.remaining(Phase::Freeze, 5).is_empty());
        assert!(schedule.remaining(Phase::PartialUnfreeze, 5).is_empty());
        assert_eq!(schedule.remaining(Phase::FullUnfreeze, 5), 5..6);
        assert_eq!(schedule.remaining(Phase::PartialUnfreeze, 3), 3..4);
        assert_eq!(schedule.remaining(Phase::Freeze, 0), 0..2);
    }

    #[test]
    fn test_policies() {
        let groups = ParameterGroupConfig::default();
        let all = detector_groups();

        let freeze = TrainableParameterSet::for_phase(Phase::Freeze, &groups, &all).unwrap();
        assert_eq!(
            freeze.trainable_groups(),
            vec!["yolo_head1", "yolo_head2", "yolo_head3"]
        );

        let partial =
            TrainableParameterSet::for_phase(Phase::PartialUnfreeze, &groups, &all).unwrap();
        assert_eq!(partial.frozen_groups(), vec!["backbone"]);
        assert!(partial.is_trainable("neck"));

        let full = TrainableParameterSet::for_phase(Phase::FullUnfreeze, &groups, &all).unwrap();
        assert!(full.frozen_groups().is_empty());
    }

    #[test]
    fn test_policy_with_unknown_group_is_rejected() {
        let groups = ParameterGroupConfig {
            backbone: "darknet".to_string(),
            ..Default::default()
        };
        let err = TrainableParameterSet::for_phase(Phase::FullUnfreeze, &groups, &detector_groups())
            .unwrap_err();
        match err {
            Error::UnknownParameterGroup { group, phase } => {
                assert_eq!(group, "darknet");
                assert_eq!(phase, Phase::PartialUnfreeze);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
