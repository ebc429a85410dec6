//! Property tests for the core value types.

use proptest::prelude::*;
use sequent_core::{AggregateId, AppendResult, AppendStatus, CommandId};

const AGGREGATES: [&str; 4] = ["A", "B", "C", "D"];

#[derive(Debug, Clone, Copy)]
enum Mark {
    Success,
    DuplicateEvent,
    DuplicateCommand,
    Failed,
}

fn marks() -> impl Strategy<Value = Vec<(usize, Mark)>> {
    let mark = prop_oneof![
        Just(Mark::Success),
        Just(Mark::DuplicateEvent),
        Just(Mark::DuplicateCommand),
        Just(Mark::Failed),
    ];
    prop::collection::vec((0..AGGREGATES.len(), mark), 0..12)
}

proptest! {
    #[test]
    fn status_of_reflects_the_highest_ranked_mark(marks in marks()) {
        let mut result = AppendResult::new();
        for (index, mark) in &marks {
            let id = AggregateId::new(AGGREGATES[*index]);
            match mark {
                Mark::Success => result.add_success(id),
                Mark::DuplicateEvent => result.add_duplicate_event(id),
                Mark::DuplicateCommand => {
                    result.add_duplicate_commands(id, vec![CommandId::new("cmd")]);
                }
                Mark::Failed => result.add_failed(id),
            }
        }

        prop_assert_eq!(result.is_empty(), marks.is_empty());
        prop_assert_eq!(
            result.is_all_success(),
            marks.iter().all(|(_, mark)| matches!(mark, Mark::Success))
        );

        for (index, name) in AGGREGATES.iter().enumerate() {
            let has = |wanted: fn(&Mark) -> bool| {
                marks.iter().any(|(i, mark)| *i == index && wanted(mark))
            };
            let expected = if has(|m| matches!(m, Mark::Success)) {
                Some(AppendStatus::Success)
            } else if has(|m| matches!(m, Mark::DuplicateEvent)) {
                Some(AppendStatus::DuplicateEvent)
            } else if has(|m| matches!(m, Mark::DuplicateCommand)) {
                Some(AppendStatus::DuplicateCommand)
            } else if has(|m| matches!(m, Mark::Failed)) {
                Some(AppendStatus::Failed)
            } else {
                None
            };
            prop_assert_eq!(result.status_of(&AggregateId::new(*name)), expected);
        }
    }

    #[test]
    fn ids_are_blank_exactly_when_only_whitespace(id in "[ \t\n]{0,4}[a-z0-9-]{0,4}[ \t]{0,2}") {
        let blank = id.chars().all(char::is_whitespace);
        prop_assert_eq!(AggregateId::new(id).is_empty(), blank);
    }
}
