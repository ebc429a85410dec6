//! Bank account aggregate and its command handler.

use serde::{Deserialize, Serialize};
use sequent_core::event::Event;
use sequent_core::{
    AggregateId, CommandHandler, CommandId, CommandMessage, DomainEventStream, EventLog,
    HandlerError, SerializedEvent, Version,
};
use sequent_runtime::{CommitOutcome, EventCommitter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

/// Aggregate type name for accounts.
pub const ACCOUNT_TYPE: &str = "BankAccount";

/// Commands accepted by an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountCommand {
    /// Open the account for `owner`.
    Open {
        /// Account holder.
        owner: String,
    },
    /// Add `amount` cents.
    Deposit {
        /// Amount in cents.
        amount: i64,
    },
    /// Remove `amount` cents if the balance covers it.
    Withdraw {
        /// Amount in cents.
        amount: i64,
    },
}

impl AccountCommand {
    /// Command type identifier.
    #[must_use]
    pub const fn command_type(&self) -> &'static str {
        match self {
            Self::Open { .. } => "OpenAccount.v1",
            Self::Deposit { .. } => "Deposit.v1",
            Self::Withdraw { .. } => "Withdraw.v1",
        }
    }

    /// Wrap this command in a message for `account`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Failed`] if the payload cannot be encoded.
    pub fn into_message(
        self,
        id: impl Into<String>,
        account: &AggregateId,
    ) -> Result<CommandMessage, HandlerError> {
        let payload = bincode::serialize(&self).map_err(|e| HandlerError::Failed(e.to_string()))?;
        Ok(CommandMessage::new(
            CommandId::new(id),
            account.clone(),
            self.command_type(),
            payload,
        ))
    }
}

/// Events emitted by an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    /// The account was opened.
    Opened {
        /// Account holder.
        owner: String,
    },
    /// Money was deposited.
    Deposited {
        /// Amount in cents.
        amount: i64,
    },
    /// Money was withdrawn.
    Withdrawn {
        /// Amount in cents.
        amount: i64,
    },
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "AccountOpened.v1",
            Self::Deposited { .. } => "MoneyDeposited.v1",
            Self::Withdrawn { .. } => "MoneyWithdrawn.v1",
        }
    }
}

/// Account state rebuilt from its history.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    /// Holder, `None` until opened.
    pub owner: Option<String>,
    /// Balance in cents.
    pub balance: i64,
}

impl Account {
    /// Fold one event into the state.
    pub fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::Opened { owner } => self.owner = Some(owner.clone()),
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
        }
    }

    /// Decide which event `command` produces.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Rejected`] when the command is not valid for the
    /// current state.
    pub fn decide(&self, command: &AccountCommand) -> Result<AccountEvent, HandlerError> {
        match (command, &self.owner) {
            (AccountCommand::Open { .. }, Some(owner)) => Err(HandlerError::Rejected(format!(
                "account already opened for {owner}"
            ))),
            (AccountCommand::Open { owner }, None) => Ok(AccountEvent::Opened {
                owner: owner.clone(),
            }),
            (_, None) => Err(HandlerError::Rejected("account is not open".to_string())),
            (AccountCommand::Deposit { amount } | AccountCommand::Withdraw { amount }, _)
                if *amount <= 0 =>
            {
                Err(HandlerError::Rejected(format!("amount must be positive, got {amount}")))
            }
            (AccountCommand::Deposit { amount }, Some(_)) => {
                Ok(AccountEvent::Deposited { amount: *amount })
            }
            (AccountCommand::Withdraw { amount }, Some(_)) if *amount > self.balance => {
                Err(HandlerError::Rejected(format!(
                    "insufficient funds: balance {}, requested {amount}",
                    self.balance
                )))
            }
            (AccountCommand::Withdraw { amount }, Some(_)) => {
                Ok(AccountEvent::Withdrawn { amount: *amount })
            }
        }
    }
}

/// Decode every event carried by `stream`.
///
/// # Errors
///
/// Returns the decoding error message if any payload is not an [`AccountEvent`].
pub fn decode_events(stream: &DomainEventStream) -> Result<Vec<AccountEvent>, String> {
    stream
        .events
        .iter()
        .map(|event| AccountEvent::from_bytes(&event.data).map_err(|e| e.to_string()))
        .collect()
}

/// Handles account commands: rebuild the account from the log, decide, commit.
///
/// The committer is attached after the engine is built, since the engine
/// owns the event processor the committer publishes to.
pub struct AccountHandler {
    log: Arc<dyn EventLog>,
    committer: OnceLock<EventCommitter>,
}

impl AccountHandler {
    /// Create a handler reading history from `log`.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            committer: OnceLock::new(),
        }
    }

    /// Attach the committer. Later calls are ignored.
    pub fn attach(&self, committer: EventCommitter) {
        if self.committer.set(committer).is_err() {
            tracing::warn!("Account handler already has a committer");
        }
    }

    async fn load(&self, id: &AggregateId) -> Result<(Account, Version), HandlerError> {
        let history = self
            .log
            .query(id.clone(), ACCOUNT_TYPE.to_string(), Version::FIRST, Version::new(u64::MAX))
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        let mut account = Account::default();
        let mut version = Version::INITIAL;
        for stream in &history {
            for event in decode_events(stream).map_err(HandlerError::Failed)? {
                account.apply(&event);
            }
            version = stream.version;
        }
        Ok((account, version))
    }
}

impl CommandHandler for AccountHandler {
    fn handle<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        command: &'a CommandMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let committer = self
                .committer
                .get()
                .ok_or_else(|| HandlerError::Failed("no committer attached".to_string()))?;
            let decoded: AccountCommand = bincode::deserialize(&command.payload)
                .map_err(|e| HandlerError::Failed(format!("bad payload: {e}")))?;

            let (account, version) = self.load(aggregate_id).await?;
            let event = account.decide(&decoded)?;
            let serialized = SerializedEvent::from_event(&event, None)
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
            let record = DomainEventStream::new(
                aggregate_id.clone(),
                ACCOUNT_TYPE,
                command.id.clone(),
                version.next(),
                vec![serialized],
            );

            match committer.commit(record).await {
                Ok(CommitOutcome::Committed(_) | CommitOutcome::Republished(_)) => Ok(()),
                Ok(CommitOutcome::VersionConflict) => Err(HandlerError::Failed(format!(
                    "account {aggregate_id} advanced past version {version} concurrently"
                ))),
                Err(e) => Err(HandlerError::Failed(e.to_string())),
            }
        })
    }
}
