//! Per-session negotiation records.
//!
//! A session either has exactly one [`SessionState`] in the [`SessionStore`] or
//! none at all; "no record" means no negotiation is in progress.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::gateway::ConfirmReply;
use crate::output::OutputSink;
use crate::params::ParsedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Collecting,
    WaitingFirstConfirm,
    WaitingSecondConfirm,
    Completed,
}

impl Stage {
    /// Stages where values have been proposed and await confirmation.
    pub fn is_confirming(&self) -> bool {
        matches!(self, Stage::WaitingFirstConfirm | Stage::WaitingSecondConfirm)
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self, Stage::Init | Stage::Collecting)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub temperature: Option<ParsedValue>,
    pub load_rate: Option<ParsedValue>,
    pub stage: Stage,
    /// Number of remote confirmations accepted so far (0..=2).
    pub confirm_stage: u8,
    /// Kept for diagnostics only.
    pub first_stage_response: Option<ConfirmReply>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            temperature: None,
            load_rate: None,
            stage: Stage::Init,
            confirm_stage: 0,
            first_stage_response: None,
        }
    }
}

impl SessionState {
    pub fn has_any_parameter(&self) -> bool {
        self.temperature.is_some() || self.load_rate.is_some()
    }

    /// Drop previously negotiated values before new input is applied.
    pub fn reset_for_reentry(&mut self) {
        self.temperature = None;
        self.load_rate = None;
        self.stage = Stage::Collecting;
        self.confirm_stage = 0;
        self.first_stage_response = None;
    }

    /// Whether cancelling should also tell the remote to drop its pending job.
    pub fn needs_remote_cancel(&self) -> bool {
        self.has_any_parameter() || self.confirm_stage > 0
    }

    pub fn temperature_raw(&self) -> Option<f64> {
        self.temperature.as_ref().map(|v| v.raw)
    }

    pub fn load_rate_raw(&self) -> Option<f64> {
        self.load_rate.as_ref().map(|v| v.raw)
    }
}

/// Identifies a conversation and the output channel bound to its host
/// connection.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub output: Arc<dyn OutputSink>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, output: Arc<dyn OutputSink>) -> Self {
        Self {
            id: id.into(),
            output,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

/// Keyed store of live negotiations.
///
/// Callers read a copy, work on it without holding the lock, and write it back
/// or remove it. Turns for one session are serialized by the negotiator.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn put(&self, session_id: &str, state: SessionState) {
        tracing::debug!("Session '{}' now at stage {:?}", session_id, state.stage);
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), state);
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
