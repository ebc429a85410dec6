//! Property tests for the in-memory event log and checkpoint store.
//!
//! Random append/update sequences must preserve the storage invariants:
//! gap-free versions, unique command ids per aggregate, and checkpoints that
//! only ever advance by one.

use proptest::prelude::*;
use sequent_core::{
    AggregateId, AppendStatus, CheckpointKey, CheckpointStore, CommandId, DomainEventStream,
    EventLog, Version,
};
use sequent_testing::{InMemoryCheckpointStore, InMemoryEventLog};
use std::collections::HashSet;

fn stream(aggregate: &str, version: u64, command: &str) -> DomainEventStream {
    DomainEventStream::new(
        AggregateId::new(aggregate),
        "Account",
        CommandId::new(command),
        Version::new(version),
        Vec::new(),
    )
}

proptest! {
    #[test]
    fn appends_keep_history_gap_free(
        attempts in prop::collection::vec((0usize..2, 1u64..6, 0usize..6), 1..40)
    ) {
        let log = InMemoryEventLog::new();
        let aggregates = ["A", "B"];

        tokio_test::block_on(async {
            for (aggregate, version, command) in &attempts {
                let id = AggregateId::new(aggregates[*aggregate]);
                let before = log.current_version(&id);
                let command_id = format!("cmd-{command}");
                let already_used = log
                    .find_by_command(id.clone(), CommandId::new(command_id.clone()))
                    .await
                    .unwrap()
                    .is_some();

                let result = log
                    .append(stream(aggregates[*aggregate], *version, &command_id))
                    .await
                    .unwrap();
                let status = result.status_of(&id).unwrap();

                let expected = if *version != before.next().value() {
                    AppendStatus::DuplicateEvent
                } else if already_used {
                    AppendStatus::DuplicateCommand
                } else {
                    AppendStatus::Success
                };
                prop_assert_eq!(status, expected);

                let after = log.current_version(&id);
                if status == AppendStatus::Success {
                    prop_assert_eq!(after, before.next());
                } else {
                    prop_assert_eq!(after, before);
                }
            }

            for name in aggregates {
                let id = AggregateId::new(name);
                let history = log
                    .query(id.clone(), "Account".to_string(), Version::INITIAL, Version::new(u64::MAX))
                    .await
                    .unwrap();
                let versions: Vec<u64> = history.iter().map(|s| s.version.value()).collect();
                let expected: Vec<u64> = (1..=versions.len() as u64).collect();
                prop_assert_eq!(versions, expected);

                let commands: HashSet<_> = history.iter().map(|s| s.command_id.clone()).collect();
                prop_assert_eq!(commands.len(), history.len());
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn checkpoints_only_advance_by_one(updates in prop::collection::vec(1u64..8, 1..30)) {
        let store = InMemoryCheckpointStore::new();
        let key = CheckpointKey::new("P", "T", AggregateId::new("A"));

        tokio_test::block_on(async {
            for version in &updates {
                let before = store.get(key.clone()).await.unwrap();
                let outcome = store.update(key.clone(), Version::new(*version)).await;
                let after = store.get(key.clone()).await.unwrap();

                if *version == before.next().value() {
                    prop_assert_eq!(outcome.unwrap(), Version::new(*version));
                    prop_assert_eq!(after, Version::new(*version));
                } else {
                    prop_assert!(outcome.unwrap_err().is_conflict());
                    prop_assert_eq!(after, before);
                }
            }

            let successful: Vec<u64> = store.updates().iter().map(|(_, v)| v.value()).collect();
            let expected: Vec<u64> = (1..=successful.len() as u64).collect();
            prop_assert_eq!(successful, expected);
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[tokio::test]
async fn duplicate_command_and_version_conflict_are_distinguished() {
    let log = InMemoryEventLog::new();
    let a = AggregateId::new("A");
    log.append(stream("A", 1, "cmd-1")).await.unwrap();

    let conflict = log.append(stream("A", 1, "cmd-9")).await.unwrap();
    let replay = log.append(stream("A", 2, "cmd-1")).await.unwrap();

    assert_eq!(conflict.status_of(&a), Some(AppendStatus::DuplicateEvent));
    assert!(conflict.duplicate_commands.is_empty());
    assert_eq!(replay.status_of(&a), Some(AppendStatus::DuplicateCommand));
    assert!(replay.duplicate_events.is_empty());
}
