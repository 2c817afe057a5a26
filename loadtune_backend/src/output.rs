//! User-facing output used outside the normal turn/response path.
//!
//! Only the completion poller writes here: it appends its notification to the
//! dialogue history and asks the host to speak it.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flume::Sender;
use serde::Serialize;

#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Whether the host can currently deliver speech.
    async fn is_ready(&self) -> bool;

    async fn append_history(&self, role: &str, text: &str) -> Result<()>;

    /// Synthesize and play `text`.
    async fn speak(&self, text: &str) -> Result<()>;
}

/// Poll `sink` until it reports ready or `timeout` elapses.
pub async fn wait_until_ready(sink: &dyn OutputSink, timeout: Duration) -> bool {
    let step = Duration::from_millis(100).min(timeout.max(Duration::from_millis(1)));
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if sink.is_ready().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(step).await;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputEvent {
    HistoryAppended {
        session_id: String,
        role: String,
        text: String,
        at: DateTime<Utc>,
    },
    Speech {
        session_id: String,
        text: String,
        at: DateTime<Utc>,
    },
}

impl OutputEvent {
    pub fn session_id(&self) -> &str {
        match self {
            OutputEvent::HistoryAppended { session_id, .. } => session_id,
            OutputEvent::Speech { session_id, .. } => session_id,
        }
    }
}

/// Sink that forwards output as [`OutputEvent`]s over a flume channel to
/// whatever host loop drains it.
pub struct ChannelSink {
    session_id: String,
    tx: Sender<OutputEvent>,
    ready: Box<dyn Fn() -> bool + Send + Sync>,
}

impl ChannelSink {
    pub fn new(session_id: impl Into<String>, tx: Sender<OutputEvent>) -> Self {
        let check = tx.clone();
        Self {
            session_id: session_id.into(),
            tx,
            ready: Box::new(move || !check.is_disconnected()),
        }
    }

    /// Use a custom readiness check, e.g. "a websocket client is listening".
    pub fn with_ready_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.ready = Box::new(check);
        self
    }

    fn send(&self, event: OutputEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("output channel for session '{}' is closed", self.session_id))
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn is_ready(&self) -> bool {
        !self.tx.is_disconnected() && (self.ready)()
    }

    async fn append_history(&self, role: &str, text: &str) -> Result<()> {
        self.send(OutputEvent::HistoryAppended {
            session_id: self.session_id.clone(),
            role: role.to_string(),
            text: text.to_string(),
            at: Utc::now(),
        })
    }

    async fn speak(&self, text: &str) -> Result<()> {
        self.send(OutputEvent::Speech {
            session_id: self.session_id.clone(),
            text: text.to_string(),
            at: Utc::now(),
        })
    }
}
