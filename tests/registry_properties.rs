// tests/registry_properties.rs

mod common;
use crate::common::init_tracing;

use proptest::prelude::*;

use splatpipe::registry::{id_belongs_to, TaskRegistry, TaskStatus};

fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Uploading),
        Just(TaskStatus::Uploaded),
        Just(TaskStatus::Processing),
        Just(TaskStatus::Training),
        Just(TaskStatus::Completed),
        Just(TaskStatus::Failed),
    ]
}

fn owner_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,3}(_[a-z]{1,2})?"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Progress only moves backwards for a failure while uploading, and
    /// nothing changes once a task is terminal.
    #[test]
    fn progress_and_terminal_rules_hold(
        updates in prop::collection::vec((status_strategy(), 0u8..=100), 1..30)
    ) {
        init_tracing();
        let registry = TaskRegistry::new();
        registry.create("p_1", TaskStatus::Uploading, "start", 0);

        for (status, progress) in updates {
            let before = registry.get("p_1").unwrap();
            registry.update("p_1", status, "step", progress, None);
            let after = registry.get("p_1").unwrap();

            if before.is_terminal() {
                prop_assert_eq!(&after, &before);
                continue;
            }

            prop_assert_eq!(after.status, status);
            let upload_failure =
                status == TaskStatus::Failed && before.status == TaskStatus::Uploading;
            if upload_failure {
                prop_assert_eq!(after.progress, progress);
            } else {
                prop_assert!(after.progress >= before.progress);
                prop_assert_eq!(after.progress, before.progress.max(progress));
            }
            prop_assert!(after.progress <= 100);
        }
    }

    /// `list_for(owner)` returns exactly the ids built for that owner.
    #[test]
    fn list_for_is_exact(owners in prop::collection::vec(owner_strategy(), 1..8)) {
        let registry = TaskRegistry::new();
        let mut issued = Vec::new();
        for owner in &owners {
            let id = registry.next_id(owner);
            registry.create(&id, TaskStatus::Uploading, "", 0);
            issued.push((owner.clone(), id));
        }

        for owner in &owners {
            let mut listed: Vec<String> =
                registry.list_for(owner).into_iter().map(|t| t.id).collect();
            listed.sort();
            let mut expected: Vec<String> = issued
                .iter()
                .filter(|(o, _)| o == owner)
                .map(|(_, id)| id.clone())
                .collect();
            expected.sort();
            expected.dedup();
            prop_assert_eq!(listed, expected);
        }
    }

    #[test]
    fn ids_round_trip_their_owner(owner in owner_strategy(), stamp in 0i64..i64::MAX) {
        let id = splatpipe::registry::task_id(&owner, stamp);
        prop_assert!(id_belongs_to(&id, &owner));
        prop_assert_eq!(splatpipe::registry::owner_of(&id), Some(owner.as_str()));
    }
}
