//! The engine facade: command and event processors on a shared worker pool,
//! plus the periodic sweeps.

use crate::command::{CommandProcessor, CommandReceipt};
use crate::commit::EventCommitter;
use crate::config::{ConfigError, EngineConfig};
use crate::error::EngineError;
use crate::event::{EventProcessor, EventReceipt};
use crate::scheduler::{PeriodicTasks, Scheduler, WorkerPool};
use sequent_core::{
    CheckpointStore, CommandHandler, CommandMessage, DomainEventStream, EventDispatcher, EventLog,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const CLEAN_INACTIVE_TASK: &str = "clean_inactive_mailboxes";
const REFRESH_TASK: &str = "refresh_waiting_mailboxes";

/// Per-aggregate ordered execution of commands and event streams.
///
/// # Example
///
/// ```rust,ignore
/// let engine = Engine::new(EngineConfig::default(), handler, dispatcher, checkpoints)?;
/// engine.start();
///
/// let receipt = engine.submit_command(command).await?;
/// receipt.outcome().await?;
///
/// engine.stop();
/// ```
pub struct Engine {
    config: EngineConfig,
    commands: Arc<CommandProcessor>,
    events: Arc<EventProcessor>,
    tasks: PeriodicTasks,
    shutting_down: AtomicBool,
}

impl Engine {
    /// Build an engine from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(
        config: EngineConfig,
        handler: Arc<dyn CommandHandler>,
        dispatcher: Arc<dyn EventDispatcher>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let scheduler: Arc<dyn Scheduler> = Arc::new(WorkerPool::new(config.worker_pool_size));
        let commands = CommandProcessor::new(handler, Arc::clone(&scheduler), config.command_batch_size)
            .with_lease_settings(config.lease_retry_delay, config.lease_warn_threshold);
        let events = EventProcessor::new(
            config.processor_name.clone(),
            dispatcher,
            checkpoints,
            scheduler,
            config.retry_policy.clone(),
        )
        .with_lease_settings(config.lease_retry_delay, config.lease_warn_threshold);

        tracing::info!(
            processor = %config.processor_name,
            worker_pool_size = config.worker_pool_size,
            "Engine created"
        );

        Ok(Self {
            config,
            commands: Arc::new(commands),
            events: Arc::new(events),
            tasks: PeriodicTasks::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Start the inactive-mailbox sweep and the waiting-mailbox refresh.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.shutting_down.store(false, Ordering::Release);

        let commands = Arc::clone(&self.commands);
        let events = Arc::clone(&self.events);
        let timeout = self.config.mailbox_inactive_timeout;
        self.tasks
            .start_task(CLEAN_INACTIVE_TASK, self.config.scan_inactive_interval, move || {
                let commands = Arc::clone(&commands);
                let events = Arc::clone(&events);
                async move {
                    let removed = commands.clean_inactive(timeout) + events.clean_inactive(timeout);
                    if removed > 0 {
                        tracing::debug!(removed, "Inactive mailbox sweep finished");
                    }
                }
            });

        let events = Arc::clone(&self.events);
        self.tasks
            .start_task(REFRESH_TASK, self.config.refresh_interval, move || {
                let events = Arc::clone(&events);
                async move { events.process_refresh() }
            });

        tracing::info!(processor = %self.config.processor_name, "Engine started");
    }

    /// Stop the periodic sweeps and reject new submissions. In-flight drains
    /// are not cancelled.
    pub fn stop(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.tasks.stop_all();
        tracing::info!(processor = %self.config.processor_name, "Engine stopped");
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_shutting_down() {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Submit a command for ordered execution on its aggregate.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ShuttingDown`] after [`stop`](Self::stop)
    /// - [`EngineError::InvalidAggregateId`] for a blank aggregate id
    pub async fn submit_command(&self, command: CommandMessage) -> Result<CommandReceipt, EngineError> {
        self.ensure_running()?;
        self.commands.process(command).await
    }

    /// Submit an event stream record for ordered dispatch on its aggregate.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ShuttingDown`] after [`stop`](Self::stop)
    /// - [`EngineError::InvalidAggregateId`] / [`EngineError::InvalidVersion`]
    ///   for malformed records
    pub async fn submit_event_stream(
        &self,
        stream: DomainEventStream,
    ) -> Result<EventReceipt, EngineError> {
        self.ensure_running()?;
        self.events.process(stream).await
    }

    /// A committer that appends to `log` and publishes through this engine's
    /// event processor.
    #[must_use]
    pub fn committer(&self, log: Arc<dyn EventLog>) -> EventCommitter {
        EventCommitter::new(log, Arc::clone(&self.events), self.config.retry_policy.clone())
    }

    /// The configuration the engine runs with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The command processor.
    #[must_use]
    pub fn command_processor(&self) -> &CommandProcessor {
        &self.commands
    }

    /// The event processor.
    #[must_use]
    pub fn event_processor(&self) -> &EventProcessor {
        &self.events
    }

    /// Number of live command mailboxes.
    #[must_use]
    pub fn command_mailbox_count(&self) -> usize {
        self.commands.mailbox_count()
    }

    /// Number of live event mailboxes.
    #[must_use]
    pub fn event_mailbox_count(&self) -> usize {
        self.events.mailbox_count()
    }

    /// Number of event mailboxes waiting on a version refresh.
    #[must_use]
    pub fn refreshing_count(&self) -> usize {
        self.events.refreshing_count()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("commands", &self.commands)
            .field("events", &self.events)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
