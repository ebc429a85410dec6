//! Prometheus metrics for the mailbox engine.
//!
//! Metrics are always emitted through the `metrics` facade. Without an
//! installed recorder they are no-ops; [`MetricsServer::start`] installs a
//! Prometheus recorder so they can be rendered.
//!
//! # Example
//!
//! ```rust,no_run
//! use sequent_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed is tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Commands
    describe_counter!(
        "sequent_commands_enqueued_total",
        "Total number of commands enqueued into command mailboxes"
    );
    describe_counter!(
        "sequent_commands_handled_total",
        "Total number of commands handled, by outcome"
    );

    // Events
    describe_counter!(
        "sequent_events_enqueued_total",
        "Total number of event stream records enqueued, by enqueue result"
    );
    describe_counter!(
        "sequent_events_dispatched_total",
        "Total number of event stream records dispatched and checkpointed"
    );
    describe_histogram!(
        "sequent_event_dispatch_duration_seconds",
        "Time taken to dispatch and checkpoint one event stream record"
    );
    describe_counter!(
        "sequent_event_checkpoint_stalls_total",
        "Checkpoint conflicts where the stored version lags the record being completed"
    );

    // Mailboxes
    describe_gauge!(
        "sequent_mailboxes_active",
        "Number of live mailboxes, by kind"
    );
    describe_counter!(
        "sequent_mailboxes_removed_total",
        "Total number of inactive mailboxes removed by the sweep, by kind"
    );
    describe_counter!(
        "sequent_mailbox_lease_retries_total",
        "Lease acquisition retries, counted every warn threshold, by kind"
    );

    // Retry
    describe_counter!(
        "sequent_retry_attempts_total",
        "Total number of retry attempts, by action"
    );
    describe_counter!(
        "sequent_retry_successes_total",
        "Total number of operations that succeeded after retrying, by action"
    );
    describe_counter!(
        "sequent_retry_exhausted_total",
        "Total number of operations that exhausted their retry budget, by action"
    );

    // Event log
    describe_counter!(
        "sequent_event_log_appends_total",
        "Event log append outcomes per aggregate, by status"
    );
}

/// Command mailbox metrics recorder.
pub struct CommandMetrics;

impl CommandMetrics {
    /// Record a command entering a mailbox.
    pub fn record_enqueued() {
        counter!("sequent_commands_enqueued_total").increment(1);
    }

    /// Record a handled command. `outcome` is `"ok"`, `"rejected"` or `"failed"`.
    pub fn record_handled(outcome: &'static str) {
        counter!("sequent_commands_handled_total", "outcome" => outcome).increment(1);
    }
}

/// Event mailbox metrics recorder.
pub struct EventMetrics;

impl EventMetrics {
    /// Record an enqueue result (`"accepted"`, `"ignored"`, `"waiting"`).
    pub fn record_enqueued(result: &'static str) {
        counter!("sequent_events_enqueued_total", "result" => result).increment(1);
    }

    /// Record a dispatched and checkpointed record.
    pub fn record_dispatched(duration: Duration) {
        counter!("sequent_events_dispatched_total").increment(1);
        histogram!("sequent_event_dispatch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a checkpoint conflict that left a record parked behind the
    /// stored version.
    pub fn record_checkpoint_stall() {
        counter!("sequent_event_checkpoint_stalls_total").increment(1);
    }
}

/// Mailbox router metrics recorder.
pub struct MailboxMetrics;

impl MailboxMetrics {
    /// Set the number of live mailboxes of `kind`.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_active(kind: &'static str, count: usize) {
        gauge!("sequent_mailboxes_active", "kind" => kind).set(count as f64);
    }

    /// Record a mailbox removed by the inactivity sweep.
    pub fn record_removed(kind: &'static str) {
        counter!("sequent_mailboxes_removed_total", "kind" => kind).increment(1);
    }

    /// Record `count` lease retries.
    pub fn record_lease_retries(kind: &'static str, count: u64) {
        counter!("sequent_mailbox_lease_retries_total", "kind" => kind).increment(count);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt(action: &'static str) {
        counter!("sequent_retry_attempts_total", "action" => action).increment(1);
    }

    /// Record a successful retry.
    pub fn record_success(action: &'static str) {
        counter!("sequent_retry_successes_total", "action" => action).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted(action: &'static str) {
        counter!("sequent_retry_exhausted_total", "action" => action).increment(1);
    }
}

/// Event log metrics recorder.
pub struct EventLogMetrics;

impl EventLogMetrics {
    /// Record one aggregate's append status (`"success"`, `"duplicate_event"`,
    /// `"duplicate_command"`, `"failed"`).
    pub fn record_append(status: &'static str) {
        counter!("sequent_event_log_appends_total", "status" => status).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        CommandMetrics::record_enqueued();
        CommandMetrics::record_handled("ok");
        EventMetrics::record_enqueued("accepted");
        EventMetrics::record_dispatched(Duration::from_millis(3));
        MailboxMetrics::record_active("event", 2);
        RetryMetrics::record_attempt("dispatch");

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("sequent_commands_enqueued_total"));
            assert!(rendered.contains("sequent_events_dispatched_total"));
            assert!(rendered.contains("sequent_mailboxes_active"));
            assert!(rendered.contains("sequent_retry_attempts_total"));
        }
    }
}
