//! In-memory event log.
//!
//! [`InMemoryEventLog`] is the reference implementation of the
//! [`EventLog`] contract: one mutex over every aggregate, held only for the
//! synchronous validate-then-write step.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use sequent_core::{
    AggregateId, AppendResult, CommandId, DomainEventStream, EventLog, EventLogError, Version,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct AggregateHistory {
    /// `streams[i]` holds version `i + 1`.
    streams: Vec<DomainEventStream>,
    commands: HashMap<CommandId, Version>,
}

impl AggregateHistory {
    fn current_version(&self) -> Version {
        Version::new(self.streams.len() as u64)
    }
}

/// In-memory event log for fast, deterministic tests and demos.
///
/// # Example
///
/// ```
/// use sequent_testing::InMemoryEventLog;
/// use sequent_core::{AggregateId, AppendStatus, CommandId, DomainEventStream, EventLog, Version};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryEventLog::new();
/// let stream = DomainEventStream::new(
///     AggregateId::new("A"), "Account", CommandId::new("cmd-1"), Version::new(1), vec![],
/// );
///
/// let result = log.append(stream).await?;
/// assert_eq!(result.status_of(&AggregateId::new("A")), Some(AppendStatus::Success));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventLog {
    aggregates: Arc<Mutex<HashMap<AggregateId, AggregateHistory>>>,
}

impl InMemoryEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of `aggregate_id` (0 if unknown).
    #[must_use]
    pub fn current_version(&self, aggregate_id: &AggregateId) -> Version {
        self.aggregates
            .lock()
            .unwrap()
            .get(aggregate_id)
            .map_or(Version::INITIAL, AggregateHistory::current_version)
    }

    /// Total number of stored records across all aggregates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.aggregates
            .lock()
            .unwrap()
            .values()
            .map(|history| history.streams.len())
            .sum()
    }

    /// Whether no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all records (for test isolation).
    pub fn clear(&self) {
        self.aggregates.lock().unwrap().clear();
    }

    fn append_batch(&self, streams: Vec<DomainEventStream>) -> AppendResult {
        // Collapse identical duplicates, then group per aggregate in arrival order.
        let mut distinct: Vec<DomainEventStream> = Vec::with_capacity(streams.len());
        for stream in streams {
            if !distinct.contains(&stream) {
                distinct.push(stream);
            }
        }

        let mut order: Vec<AggregateId> = Vec::new();
        let mut groups: HashMap<AggregateId, Vec<DomainEventStream>> = HashMap::new();
        for stream in distinct {
            if !groups.contains_key(&stream.aggregate_id) {
                order.push(stream.aggregate_id.clone());
            }
            groups
                .entry(stream.aggregate_id.clone())
                .or_default()
                .push(stream);
        }

        let mut result = AppendResult::new();
        let mut aggregates = self.aggregates.lock().unwrap();
        for aggregate_id in order {
            let Some(group) = groups.remove(&aggregate_id) else {
                continue;
            };
            let history = aggregates.entry(aggregate_id.clone()).or_default();

            let first_ok = group
                .first()
                .is_some_and(|first| first.version == history.current_version().next());
            let contiguous = group
                .windows(2)
                .all(|pair| pair[1].version == pair[0].version.next());
            if !first_ok || !contiguous {
                result.add_duplicate_event(aggregate_id);
                continue;
            }

            let mut batch_commands = HashSet::new();
            let replayed: Vec<CommandId> = group
                .iter()
                .filter(|stream| {
                    history.commands.contains_key(&stream.command_id)
                        || !batch_commands.insert(stream.command_id.clone())
                })
                .map(|stream| stream.command_id.clone())
                .collect();
            if !replayed.is_empty() {
                result.add_duplicate_commands(aggregate_id, replayed);
                continue;
            }

            for stream in group {
                history.commands.insert(stream.command_id.clone(), stream.version);
                history.streams.push(stream);
            }
            result.add_success(aggregate_id);
        }
        aggregates.retain(|_, history| !history.streams.is_empty());

        result
    }
}

impl EventLog for InMemoryEventLog {
    fn batch_append(
        &self,
        streams: Vec<DomainEventStream>,
    ) -> Pin<Box<dyn Future<Output = Result<AppendResult, EventLogError>> + Send + '_>> {
        Box::pin(async move { Ok(self.append_batch(streams)) })
    }

    fn query(
        &self,
        aggregate_id: AggregateId,
        _aggregate_type: String,
        min_version: Version,
        max_version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEventStream>, EventLogError>> + Send + '_>>
    {
        Box::pin(async move {
            let aggregates = self.aggregates.lock().unwrap();
            let Some(history) = aggregates.get(&aggregate_id) else {
                return Ok(Vec::new());
            };

            let low = min_version.max(Version::FIRST);
            let high = max_version.min(history.current_version());
            if low > high {
                return Ok(Vec::new());
            }
            #[allow(clippy::cast_possible_truncation)]
            let range = (low.value() - 1) as usize..high.value() as usize;
            Ok(history.streams[range].to_vec())
        })
    }

    fn find_by_version(
        &self,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DomainEventStream>, EventLogError>> + Send + '_>>
    {
        Box::pin(async move {
            let aggregates = self.aggregates.lock().unwrap();
            let found = aggregates.get(&aggregate_id).and_then(|history| {
                let index = usize::try_from(version.value()).ok()?.checked_sub(1)?;
                history.streams.get(index).cloned()
            });
            Ok(found)
        })
    }

    fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DomainEventStream>, EventLogError>> + Send + '_>>
    {
        Box::pin(async move {
            let aggregates = self.aggregates.lock().unwrap();
            let found = aggregates.get(&aggregate_id).and_then(|history| {
                let version = history.commands.get(&command_id)?;
                let index = usize::try_from(version.value()).ok()?.checked_sub(1)?;
                history.streams.get(index).cloned()
            });
            Ok(found)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequent_core::AppendStatus;

    fn stream(id: &str, version: u64, command: &str) -> DomainEventStream {
        DomainEventStream::new(
            AggregateId::new(id),
            "Account",
            CommandId::new(command),
            Version::new(version),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn first_append_at_version_one_succeeds_and_replay_conflicts() {
        let log = InMemoryEventLog::new();
        let a = AggregateId::new("A");

        let result = log.append(stream("A", 1, "cmd-1")).await.unwrap();
        assert_eq!(result.status_of(&a), Some(AppendStatus::Success));

        let result = log.append(stream("A", 1, "cmd-2")).await.unwrap();
        assert_eq!(result.status_of(&a), Some(AppendStatus::DuplicateEvent));
        assert_eq!(log.current_version(&a), Version::new(1));
    }

    #[tokio::test]
    async fn replayed_command_is_rejected_even_at_valid_version() {
        let log = InMemoryEventLog::new();
        let a = AggregateId::new("A");
        log.append(stream("A", 1, "cmd-1")).await.unwrap();

        let result = log.append(stream("A", 2, "cmd-1")).await.unwrap();
        assert_eq!(result.status_of(&a), Some(AppendStatus::DuplicateCommand));
        assert_eq!(
            result.duplicate_commands.get(&a),
            Some(&vec![CommandId::new("cmd-1")])
        );
        assert_eq!(log.current_version(&a), Version::new(1));
    }

    #[tokio::test]
    async fn version_check_runs_before_command_check() {
        let log = InMemoryEventLog::new();
        let a = AggregateId::new("A");
        log.append(stream("A", 1, "cmd-1")).await.unwrap();

        let result = log.append(stream("A", 1, "cmd-1")).await.unwrap();
        assert_eq!(result.status_of(&a), Some(AppendStatus::DuplicateEvent));
    }

    #[tokio::test]
    async fn non_contiguous_sub_batch_is_rejected_whole() {
        let log = InMemoryEventLog::new();
        let a = AggregateId::new("A");

        let result = log
            .batch_append(vec![stream("A", 1, "c1"), stream("A", 3, "c3")])
            .await
            .unwrap();
        assert_eq!(result.status_of(&a), Some(AppendStatus::DuplicateEvent));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn batch_partially_succeeds_per_aggregate() {
        let log = InMemoryEventLog::new();
        log.append(stream("B", 1, "b1")).await.unwrap();

        let result = log
            .batch_append(vec![
                stream("A", 1, "a1"),
                stream("B", 1, "b-again"),
                stream("A", 2, "a2"),
                stream("C", 1, "c1"),
                stream("C", 2, "c1"),
            ])
            .await
            .unwrap();

        assert_eq!(result.status_of(&AggregateId::new("A")), Some(AppendStatus::Success));
        assert_eq!(result.status_of(&AggregateId::new("B")), Some(AppendStatus::DuplicateEvent));
        assert_eq!(result.status_of(&AggregateId::new("C")), Some(AppendStatus::DuplicateCommand));
        assert!(!result.is_all_success());
        assert_eq!(log.current_version(&AggregateId::new("A")), Version::new(2));
        assert_eq!(log.current_version(&AggregateId::new("C")), Version::INITIAL);
    }

    #[tokio::test]
    async fn identical_duplicates_in_batch_collapse() {
        let log = InMemoryEventLog::new();
        let record = stream("A", 1, "cmd-1");

        let result = log.batch_append(vec![record.clone(), record]).await.unwrap();
        assert_eq!(result.status_of(&AggregateId::new("A")), Some(AppendStatus::Success));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn query_is_clamped_and_lookups_work() {
        let log = InMemoryEventLog::new();
        let a = AggregateId::new("A");
        log.batch_append(vec![stream("A", 1, "c1"), stream("A", 2, "c2"), stream("A", 3, "c3")])
            .await
            .unwrap();

        let all = log
            .query(a.clone(), "Account".to_string(), Version::INITIAL, Version::new(100))
            .await
            .unwrap();
        let versions: Vec<u64> = all.iter().map(|s| s.version.value()).collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let middle = log
            .query(a.clone(), "Account".to_string(), Version::new(2), Version::new(2))
            .await
            .unwrap();
        assert_eq!(middle.len(), 1);

        let empty = log
            .query(a.clone(), "Account".to_string(), Version::new(5), Version::new(9))
            .await
            .unwrap();
        assert!(empty.is_empty());

        let by_version = log.find_by_version(a.clone(), Version::new(2)).await.unwrap();
        assert_eq!(by_version.map(|s| s.command_id), Some(CommandId::new("c2")));
        assert!(log.find_by_version(a.clone(), Version::INITIAL).await.unwrap().is_none());

        let by_command = log.find_by_command(a.clone(), CommandId::new("c3")).await.unwrap();
        assert_eq!(by_command.map(|s| s.version), Some(Version::new(3)));
        assert!(log.find_by_command(a, CommandId::new("nope")).await.unwrap().is_none());
    }
}
