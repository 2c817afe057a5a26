//! Background watcher for an authorized optimization job.
//!
//! Started once per completed negotiation. It polls the remote status endpoint,
//! and on a terminal state speaks the remote's message exactly once, never
//! earlier than `min_duration` after it started. It never reports errors to
//! the caller; the worst case is a missing notification.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::PollerSettings;
use crate::gateway::ControlGateway;
use crate::output::{wait_until_ready, OutputSink};

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_iterations: u32,
    pub min_duration: Duration,
    pub sink_ready_timeout: Duration,
}

impl From<&PollerSettings> for PollerConfig {
    fn from(settings: &PollerSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            max_iterations: settings.max_iterations,
            min_duration: Duration::from_secs(settings.min_duration_secs),
            sink_ready_timeout: Duration::from_secs(settings.sink_ready_timeout_secs),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::from(&PollerSettings::default())
    }
}

/// Snapshot handed to the poller when the job is authorized. The session
/// record itself is gone by the time the poller runs.
#[derive(Debug, Clone)]
pub struct CompletionContext {
    pub session_id: String,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Terminal state reached and the remote message was delivered.
    Notified { terminal: Terminal, message: String },
    /// Terminal state reached but the remote sent no message.
    Silent { terminal: Terminal },
    /// Terminal state reached but the output sink never became usable.
    SinkUnavailable { terminal: Terminal },
    /// Iteration budget ran out.
    TimedOut { iterations: u32 },
    Panicked { reason: String },
}

/// Observable handle on a running poller. Dropping it does not stop the task.
pub struct PollerHandle {
    session_id: String,
    started_at: DateTime<Utc>,
    outcome: Arc<OnceLock<PollOutcome>>,
    task: JoinHandle<PollOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerSnapshot {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished: bool,
    pub outcome: Option<PollOutcome>,
}

impl PollerHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn snapshot(&self) -> PollerSnapshot {
        PollerSnapshot {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            finished: self.is_finished(),
            outcome: self.outcome.get().cloned(),
        }
    }

    /// Wait for the poller to stop.
    pub async fn join(self) -> PollOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => PollOutcome::Panicked {
                reason: e.to_string(),
            },
        }
    }
}

pub fn spawn_completion_poller(
    gateway: Arc<dyn ControlGateway>,
    sink: Arc<dyn OutputSink>,
    config: PollerConfig,
    context: CompletionContext,
) -> PollerHandle {
    let session_id = context.session_id.clone();
    let outcome = Arc::new(OnceLock::new());
    let slot = outcome.clone();

    tracing::info!(
        "Starting completion poller for session '{}' ({})",
        session_id,
        context.summary
    );

    let task_session = session_id.clone();
    let task = tokio::spawn(async move {
        let result = AssertUnwindSafe(run_poller(gateway, sink, config, context))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                tracing::error!(
                    "Completion poller for session '{}' panicked: {}\n{}",
                    task_session,
                    reason,
                    std::backtrace::Backtrace::force_capture()
                );
                PollOutcome::Panicked { reason }
            }
        };
        tracing::info!(
            "Completion poller for session '{}' finished: {:?}",
            task_session,
            outcome
        );
        let _ = slot.set(outcome.clone());
        outcome
    });

    PollerHandle {
        session_id,
        started_at: Utc::now(),
        outcome,
        task,
    }
}

async fn run_poller(
    gateway: Arc<dyn ControlGateway>,
    sink: Arc<dyn OutputSink>,
    config: PollerConfig,
    context: CompletionContext,
) -> PollOutcome {
    let started = Instant::now();
    let mut last_stage: Option<String> = None;

    for iteration in 1..=config.max_iterations {
        match gateway.query_status().await {
            Ok(status) => {
                if last_stage.as_deref() != Some(status.stage.as_str()) {
                    tracing::info!(
                        "Session '{}' optimization stage: {:?} -> '{}' ({})",
                        context.session_id,
                        last_stage,
                        status.stage,
                        status.message
                    );
                    last_stage = Some(status.stage.clone());
                }

                let terminal = if status.is_failed() {
                    Some(Terminal::Failed)
                } else if status.is_complete() {
                    Some(Terminal::Completed)
                } else {
                    None
                };
                if let Some(terminal) = terminal {
                    return finish(terminal, &status.message, started, &config, sink.as_ref(), &context)
                        .await;
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Status poll {}/{} for session '{}' failed: {}",
                    iteration,
                    config.max_iterations,
                    context.session_id,
                    e
                );
            }
        }

        sleep(config.interval).await;
    }

    tracing::warn!(
        "Gave up waiting for optimization of session '{}' after {} polls",
        context.session_id,
        config.max_iterations
    );
    PollOutcome::TimedOut {
        iterations: config.max_iterations,
    }
}

async fn finish(
    terminal: Terminal,
    message: &str,
    started: Instant,
    config: &PollerConfig,
    sink: &dyn OutputSink,
    context: &CompletionContext,
) -> PollOutcome {
    let elapsed = started.elapsed();
    if elapsed < config.min_duration {
        let remaining = config.min_duration - elapsed;
        tracing::debug!(
            "Holding {:?} notification for session '{}' another {:?}",
            terminal,
            context.session_id,
            remaining
        );
        sleep(remaining).await;
    }

    let message = message.trim();
    if message.is_empty() {
        tracing::info!(
            "Optimization for session '{}' ended ({:?}) without a message",
            context.session_id,
            terminal
        );
        return PollOutcome::Silent { terminal };
    }

    if !wait_until_ready(sink, config.sink_ready_timeout).await {
        tracing::warn!(
            "Output for session '{}' not ready within {:?}; dropping notification",
            context.session_id,
            config.sink_ready_timeout
        );
        return PollOutcome::SinkUnavailable { terminal };
    }

    if let Err(e) = sink.append_history("assistant", message).await {
        tracing::warn!("Failed to append notification to history: {:#}", e);
        return PollOutcome::SinkUnavailable { terminal };
    }
    if let Err(e) = sink.speak(message).await {
        tracing::warn!("Failed to speak notification: {:#}", e);
        return PollOutcome::SinkUnavailable { terminal };
    }

    PollOutcome::Notified {
        terminal,
        message: message.to_string(),
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{ConfirmReply, OptimizationStatus, SetParametersReply};
    use crate::test_support::{optimizing, status_done, status_failed, MemorySink, MockGateway};
    use async_trait::async_trait;

    fn fast_config(min_duration_ms: u64) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(10),
            max_iterations: 50,
            min_duration: Duration::from_millis(min_duration_ms),
            sink_ready_timeout: Duration::from_millis(200),
        }
    }

    fn context() -> CompletionContext {
        CompletionContext {
            session_id: "s1".to_string(),
            summary: "temperature 22℃, load rate 90%".to_string(),
        }
    }

    #[tokio::test]
    async fn completion_on_first_poll_waits_for_min_duration() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_status(Ok(status_done("optimization finished")));
        let sink = Arc::new(MemorySink::new());

        let before = std::time::Instant::now();
        let handle = spawn_completion_poller(gateway.clone(), sink.clone(), fast_config(300), context());
        let outcome = handle.join().await;

        assert_eq!(
            outcome,
            PollOutcome::Notified {
                terminal: Terminal::Completed,
                message: "optimization finished".to_string()
            }
        );
        let spoken = sink.spoken();
        assert_eq!(spoken.len(), 1);
        assert!(spoken[0].1.duration_since(before) >= Duration::from_millis(300));
        assert_eq!(sink.history(), vec!["optimization finished".to_string()]);
        assert_eq!(gateway.status_calls(), 1);
    }

    #[tokio::test]
    async fn transient_errors_do_not_stop_polling() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_status(Err(GatewayError::Network("refused".into())));
        gateway.push_status(Ok(optimizing("planning")));
        gateway.push_status(Err(GatewayError::Timeout(Duration::from_secs(5))));
        gateway.push_status(Ok(optimizing("running")));
        gateway.push_status(Ok(status_done("all done")));
        let sink = Arc::new(MemorySink::new());

        let outcome = spawn_completion_poller(gateway.clone(), sink.clone(), fast_config(0), context())
            .join()
            .await;

        assert!(matches!(outcome, PollOutcome::Notified { terminal: Terminal::Completed, .. }));
        assert_eq!(gateway.status_calls(), 5);
    }

    #[tokio::test]
    async fn remote_failure_is_terminal() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_status(Ok(optimizing("running")));
        gateway.push_status(Ok(status_failed("optimization failed: sensor offline")));
        let sink = Arc::new(MemorySink::new());

        let outcome = spawn_completion_poller(gateway, sink.clone(), fast_config(0), context())
            .join()
            .await;

        assert_eq!(
            outcome,
            PollOutcome::Notified {
                terminal: Terminal::Failed,
                message: "optimization failed: sensor offline".to_string()
            }
        );
        assert_eq!(sink.spoken().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_times_out_silently() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_status_fallback(optimizing("running"));
        let sink = Arc::new(MemorySink::new());
        let config = PollerConfig {
            max_iterations: 5,
            ..fast_config(0)
        };

        let outcome = spawn_completion_poller(gateway.clone(), sink.clone(), config, context())
            .join()
            .await;

        assert_eq!(outcome, PollOutcome::TimedOut { iterations: 5 });
        assert_eq!(gateway.status_calls(), 5);
        assert!(sink.spoken().is_empty());
        assert!(sink.history().is_empty());
    }

    #[tokio::test]
    async fn unready_sink_drops_notification() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_status(Ok(status_done("done")));
        let sink = Arc::new(MemorySink::new());
        sink.set_ready(false);

        let outcome = spawn_completion_poller(gateway, sink.clone(), fast_config(0), context())
            .join()
            .await;

        assert_eq!(
            outcome,
            PollOutcome::SinkUnavailable {
                terminal: Terminal::Completed
            }
        );
        assert!(sink.spoken().is_empty());
    }

    #[tokio::test]
    async fn empty_message_is_not_spoken() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_status(Ok(status_done("  ")));
        let sink = Arc::new(MemorySink::new());

        let outcome = spawn_completion_poller(gateway, sink.clone(), fast_config(0), context())
            .join()
            .await;

        assert_eq!(
            outcome,
            PollOutcome::Silent {
                terminal: Terminal::Completed
            }
        );
        assert!(sink.spoken().is_empty());
    }

    struct PanickingGateway;

    #[async_trait]
    impl ControlGateway for PanickingGateway {
        async fn set_parameters(
            &self,
            _temperature: Option<f64>,
            _load_rate: Option<f64>,
        ) -> Result<SetParametersReply, GatewayError> {
            unreachable!()
        }

        async fn confirm(&self, _authorize: bool) -> Result<ConfirmReply, GatewayError> {
            unreachable!()
        }

        async fn query_status(&self) -> Result<OptimizationStatus, GatewayError> {
            panic!("status decoder exploded")
        }
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let sink = Arc::new(MemorySink::new());
        let handle = spawn_completion_poller(
            Arc::new(PanickingGateway),
            sink.clone(),
            fast_config(0),
            context(),
        );
        let outcome = handle.join().await;
        assert_eq!(
            outcome,
            PollOutcome::Panicked {
                reason: "status decoder exploded".to_string()
            }
        );
        assert!(sink.spoken().is_empty());
    }

    #[tokio::test]
    async fn snapshot_reports_outcome_after_finish() {
        let gateway = Arc::new(MockGateway::new());
        gateway.push_status(Ok(status_done("done")));
        let sink = Arc::new(MemorySink::new());

        let handle = spawn_completion_poller(gateway, sink, fast_config(0), context());
        while !handle.is_finished() {
            sleep(Duration::from_millis(10)).await;
        }
        let snapshot = handle.snapshot();
        assert!(snapshot.finished);
        assert_eq!(snapshot.session_id, "s1");
        assert!(matches!(snapshot.outcome, Some(PollOutcome::Notified { .. })));
    }
}
