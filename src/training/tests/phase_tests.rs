//! Breakpoint table and trainability properties

use std::collections::BTreeSet;

use proptest::prelude::*;

use crate::config::ParameterGroupConfig;
use crate::training::phase::{Phase, PhaseSchedule, TrainableParameterSet};

use super::fixtures::TOY_GROUPS;

fn breakpoints() -> impl Strategy<Value = (usize, usize, usize)> {
    (1usize..12, 1usize..12, 1usize..12).prop_map(|(a, b, c)| (a, a + b, a + b + c))
}

fn toy_groups() -> BTreeSet<String> {
    TOY_GROUPS.iter().map(|s| s.to_string()).collect()
}

/// Trainable groups per epoch for a run starting at `from_epoch`, derived
/// the way the trainer walks the phases
fn trainability_from(schedule: &PhaseSchedule, from_epoch: usize) -> Vec<(usize, Vec<String>)> {
    let groups = ParameterGroupConfig::default();
    let names = toy_groups();
    let mut sequence = Vec::new();
    for phase in Phase::ALL {
        let remaining = schedule.remaining(phase, from_epoch);
        if remaining.is_empty() {
            continue;
        }
        let set = TrainableParameterSet::for_phase(phase, &groups, &names).unwrap();
        for epoch in remaining {
            sequence.push((epoch, set.trainable_groups()));
        }
    }
    sequence
}

proptest! {
    #[test]
    fn ranges_partition_the_run((f, p, u) in breakpoints()) {
        let schedule = PhaseSchedule::new(f, p, u).unwrap();

        let mut covered = Vec::new();
        for phase in Phase::ALL {
            covered.extend(schedule.range(phase));
        }
        prop_assert_eq!(covered, (0..u).collect::<Vec<_>>());

        for epoch in 0..u {
            let owners: Vec<Phase> = Phase::ALL
                .into_iter()
                .filter(|&phase| schedule.range(phase).contains(&epoch))
                .collect();
            prop_assert_eq!(owners.len(), 1);
            prop_assert_eq!(schedule.phase_for_epoch(epoch), Some(owners[0]));
        }
        prop_assert_eq!(schedule.phase_for_epoch(u), None);
    }

    #[test]
    fn resuming_keeps_the_cold_trainability((f, p, u) in breakpoints(), resume_offset in 0usize..40) {
        let schedule = PhaseSchedule::new(f, p, u).unwrap();
        let resume_at = resume_offset % (u + 1);

        let cold: Vec<_> = trainability_from(&schedule, 0)
            .into_iter()
            .filter(|(epoch, _)| *epoch >= resume_at)
            .collect();
        let resumed = trainability_from(&schedule, resume_at);
        prop_assert_eq!(cold, resumed);
    }

    #[test]
    fn remaining_never_leaves_its_phase((f, p, u) in breakpoints(), from in 0usize..40) {
        let schedule = PhaseSchedule::new(f, p, u).unwrap();
        for phase in Phase::ALL {
            let remaining = schedule.remaining(phase, from);
            let range = schedule.range(phase);
            prop_assert!(remaining.start >= range.start);
            prop_assert_eq!(remaining.end, range.end);
            for epoch in remaining {
                prop_assert!(epoch >= from);
                prop_assert_eq!(schedule.phase_for_epoch(epoch), Some(phase));
            }
        }
    }
}

#[test]
fn test_two_four_six_policy_sequence() {
    let schedule = PhaseSchedule::new(2, 4, 6).unwrap();
    let sequence = trainability_from(&schedule, 0);

    let heads = vec!["yolo_head1", "yolo_head2", "yolo_head3"];
    let all_but_backbone = vec!["neck", "yolo_head1", "yolo_head2", "yolo_head3"];
    let everything = TOY_GROUPS.to_vec();

    let expected: Vec<(usize, Vec<&str>)> = vec![
        (0, heads.clone()),
        (1, heads),
        (2, all_but_backbone.clone()),
        (3, all_but_backbone),
        (4, everything.clone()),
        (5, everything),
    ];
    let actual: Vec<(usize, Vec<&str>)> = sequence
        .iter()
        .map(|(epoch, groups)| (*epoch, groups.iter().map(String::as_str).collect()))
        .collect();
    assert_eq!(actual, expected);
}

#[test]
fn test_phase_transitions() {
    assert_eq!(Phase::Freeze.next(), Some(Phase::PartialUnfreeze));
    assert_eq!(Phase::PartialUnfreeze.next(), Some(Phase::FullUnfreeze));
    assert_eq!(Phase::FullUnfreeze.next(), None);
    assert!(Phase::FullUnfreeze.is_terminal());
}
