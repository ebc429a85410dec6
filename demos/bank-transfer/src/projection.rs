//! Balance read model fed by the event processor.

use crate::account::{AccountEvent, decode_events};
use sequent_core::{AggregateId, DispatchError, DomainEventStream, EventDispatcher, Version};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Row {
    owner: String,
    balance: i64,
    version: Version,
}

/// Per-account balances, updated as records are dispatched.
///
/// Records arrive in version order per account, so each one is applied
/// directly. A version that does not follow the last applied one is reported
/// as a dispatch failure.
#[derive(Clone, Debug, Default)]
pub struct BalanceProjection {
    rows: Arc<Mutex<BTreeMap<AggregateId, Row>>>,
}

impl BalanceProjection {
    /// Create an empty projection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance of `account` in cents.
    #[must_use]
    pub fn balance(&self, account: &AggregateId) -> Option<i64> {
        self.rows().get(account).map(|row| row.balance)
    }

    /// Last applied version of `account`.
    #[must_use]
    pub fn version(&self, account: &AggregateId) -> Version {
        self.rows()
            .get(account)
            .map_or(Version::INITIAL, |row| row.version)
    }

    /// `(account, owner, balance)` for every account, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(AggregateId, String, i64)> {
        self.rows()
            .iter()
            .map(|(id, row)| (id.clone(), row.owner.clone(), row.balance))
            .collect()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, BTreeMap<AggregateId, Row>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, stream: &DomainEventStream) -> Result<(), DispatchError> {
        let events = decode_events(stream).map_err(DispatchError::Failed)?;

        let mut rows = self.rows();
        let row = rows.entry(stream.aggregate_id.clone()).or_default();
        if stream.version != row.version.next() {
            return Err(DispatchError::Failed(format!(
                "{} expected version {}, got {}",
                stream.aggregate_id,
                row.version.next(),
                stream.version
            )));
        }
        for event in events {
            match event {
                AccountEvent::Opened { owner } => row.owner = owner,
                AccountEvent::Deposited { amount } => row.balance += amount,
                AccountEvent::Withdrawn { amount } => row.balance -= amount,
            }
        }
        row.version = stream.version;
        Ok(())
    }
}

impl EventDispatcher for BalanceProjection {
    fn dispatch<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            self.apply(stream)?;
            tracing::debug!(
                aggregate_id = %stream.aggregate_id,
                version = %stream.version,
                "Balance updated"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequent_core::event::Event;
    use sequent_core::{CommandId, SerializedEvent};

    #[allow(clippy::unwrap_used)]
    fn record(version: u64, event: &AccountEvent) -> DomainEventStream {
        DomainEventStream::new(
            AggregateId::new("acct"),
            "BankAccount",
            CommandId::new(format!("c{version}")),
            Version::new(version),
            vec![SerializedEvent::from_event(event, None).unwrap()],
        )
    }

    #[tokio::test]
    async fn applies_in_order_and_refuses_gaps() {
        let projection = BalanceProjection::new();
        let id = AggregateId::new("acct");

        let opened = AccountEvent::Opened { owner: "alice".to_string() };
        assert!(projection.dispatch(&record(1, &opened)).await.is_ok());
        let deposit = AccountEvent::Deposited { amount: 250 };
        assert!(projection.dispatch(&record(2, &deposit)).await.is_ok());
        assert!(projection.dispatch(&record(4, &deposit)).await.is_err());

        assert_eq!(projection.balance(&id), Some(250));
        assert_eq!(projection.version(&id), Version::new(2));
        assert_eq!(opened.event_type(), "AccountOpened.v1");
    }
}
