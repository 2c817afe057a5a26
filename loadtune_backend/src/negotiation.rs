//! The per-session confirmation state machine.
//!
//! ```text
//! INIT/COLLECTING --values or preset--> WAITING_FIRST_CONFIRM
//! WAITING_FIRST_CONFIRM --confirm: set params + confirm(1), remote stage 1--> WAITING_SECOND_CONFIRM
//! WAITING_SECOND_CONFIRM --confirm: confirm(1), remote stage 2--> COMPLETED (poller spawned, record deleted)
//! any --cancel: confirm(0) best-effort--> record deleted
//! ```
//!
//! New values arriving while waiting for a confirmation (without a
//! confirm/preset signal) wipe the old values first, so nothing stale is ever
//! confirmed. Values plus `confirm` in one call are applied first and the
//! confirm is judged against the updated record.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::{OptimizerConfig, ParameterLimits, PresetParameter};
use crate::error::{GatewayError, NegotiationError};
use crate::gateway::{ConfirmReply, ConfirmStatus, ControlGateway};
use crate::params::{
    format_load_rate, format_temperature, parse_load_rate, parse_temperature, validate_load_rate,
    validate_temperature, ParsedValue,
};
use crate::poller::{
    spawn_completion_poller, CompletionContext, PollerConfig, PollerHandle, PollerSnapshot,
};
use crate::prompts;
use crate::session::{SessionHandle, SessionState, SessionStore, Stage};

/// Arguments produced by the intent layer for one turn.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InvokeArgs {
    #[serde(default, deserialize_with = "loose_text")]
    pub temperature: Option<String>,
    #[serde(default, alias = "loadRate", deserialize_with = "loose_text")]
    pub load_rate: Option<String>,
    #[serde(default, alias = "usePreset", deserialize_with = "loose_bool")]
    pub use_preset: bool,
    #[serde(default, deserialize_with = "loose_bool")]
    pub confirm: bool,
    #[serde(default, deserialize_with = "loose_bool")]
    pub cancel: bool,
}

impl InvokeArgs {
    pub fn values(temperature: Option<&str>, load_rate: Option<&str>) -> Self {
        Self {
            temperature: temperature.map(str::to_string),
            load_rate: load_rate.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn confirm() -> Self {
        Self {
            confirm: true,
            ..Self::default()
        }
    }

    pub fn cancel() -> Self {
        Self {
            cancel: true,
            ..Self::default()
        }
    }

    pub fn preset() -> Self {
        Self {
            use_preset: true,
            ..Self::default()
        }
    }
}

fn loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn loose_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    })
}

/// What the host should do with the outcome of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "text", rename_all = "snake_case")]
pub enum Directive {
    /// Speak this text verbatim.
    RespondDirectly(String),
    /// Let the LLM phrase a reply from these instructions.
    AskModelToPhrase(String),
    Error(String),
}

impl Directive {
    pub fn text(&self) -> &str {
        match self {
            Directive::RespondDirectly(text)
            | Directive::AskModelToPhrase(text)
            | Directive::Error(text) => text,
        }
    }

    /// Convert to a string representation suitable for feeding back to the LLM
    pub fn to_llm_string(&self) -> String {
        match self {
            Directive::Error(e) => format!("[ERROR] {}", e),
            other => other.text().to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Directive::Error(_))
    }
}

impl From<&NegotiationError> for Directive {
    fn from(error: &NegotiationError) -> Self {
        let message = error.user_message();
        match error {
            NegotiationError::Validation(_)
            | NegotiationError::Gateway(GatewayError::RemoteRejected(_))
            | NegotiationError::Gateway(GatewayError::OptimizationInProgress(_)) => {
                Directive::RespondDirectly(message)
            }
            _ => Directive::Error(message),
        }
    }
}

enum Step {
    /// Keep the (possibly updated) record.
    Keep(Directive),
    /// The record is gone: completed or cancelled.
    Done(Directive),
}

const DEFAULT_POLLER_CAPACITY: usize = 256;

pub struct Negotiator {
    store: Arc<SessionStore>,
    gateway: Arc<dyn ControlGateway>,
    limits: ParameterLimits,
    presets: Vec<PresetParameter>,
    poller_config: PollerConfig,
    pollers: Mutex<HashMap<String, PollerHandle>>,
    /// Finished handles beyond this many are dropped.
    poller_capacity: usize,
    /// One turn at a time per session; entries live while a turn holds or
    /// waits for them.
    turns: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Negotiator {
    pub fn new(
        config: &OptimizerConfig,
        gateway: Arc<dyn ControlGateway>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            store,
            gateway,
            limits: config.limits.clone(),
            presets: config.presets.clone(),
            poller_config: PollerConfig::from(&config.poller),
            pollers: Mutex::new(HashMap::new()),
            poller_capacity: DEFAULT_POLLER_CAPACITY,
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poller_config(mut self, poller_config: PollerConfig) -> Self {
        self.poller_config = poller_config;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn poller(&self, session_id: &str) -> Option<PollerSnapshot> {
        self.pollers
            .lock()
            .await
            .get(session_id)
            .map(PollerHandle::snapshot)
    }

    /// Hand over the tracked poller handle, e.g. to await it.
    pub async fn take_poller(&self, session_id: &str) -> Option<PollerHandle> {
        self.pollers.lock().await.remove(session_id)
    }

    /// Run one turn for `session`.
    pub async fn invoke(&self, session: &SessionHandle, args: InvokeArgs) -> Directive {
        tracing::debug!(
            "invoke session='{}' temperature={:?} load_rate={:?} use_preset={} confirm={} cancel={}",
            session.id,
            args.temperature,
            args.load_rate,
            args.use_preset,
            args.confirm,
            args.cancel
        );

        let turn = self.turn_lock(&session.id).await;
        let directive = {
            let _turn = turn.lock().await;
            self.run_turn(session, args).await
        };
        self.release_turn(&session.id, turn).await;
        directive
    }

    async fn turn_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.turns
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn release_turn(&self, session_id: &str, turn: Arc<Mutex<()>>) {
        let mut turns = self.turns.lock().await;
        // The map and `turn` are the only holders: nobody else is waiting.
        if Arc::strong_count(&turn) == 2 {
            turns.remove(session_id);
        }
    }

    /// The record stays readable in the store while gateway calls are in
    /// flight; it is written back (or removed) once the turn settles.
    async fn run_turn(&self, session: &SessionHandle, args: InvokeArgs) -> Directive {
        let existing = self.store.get(&session.id).await;

        if args.cancel {
            return self.cancel(&session.id, existing).await;
        }

        let mut state = existing.unwrap_or_default();
        match self.advance(session, &mut state, &args).await {
            Ok(Step::Keep(directive)) => {
                self.persist(&session.id, state).await;
                directive
            }
            Ok(Step::Done(directive)) => {
                self.store.remove(&session.id).await;
                directive
            }
            Err(error) if error.is_transient() => {
                tracing::warn!(
                    "Session '{}' stays at {:?} until the user retries: {}",
                    session.id,
                    state.stage,
                    error
                );
                self.persist(&session.id, state).await;
                Directive::from(&error)
            }
            Err(error) => {
                tracing::info!(
                    "Session '{}' stays at {:?}: {}",
                    session.id,
                    state.stage,
                    error
                );
                self.persist(&session.id, state).await;
                Directive::from(&error)
            }
        }
    }

    /// An untouched INIT record is the same as no record.
    async fn persist(&self, session_id: &str, state: SessionState) {
        if state.stage == Stage::Init && !state.has_any_parameter() {
            return;
        }
        self.store.put(session_id, state).await;
    }

    async fn cancel(&self, session_id: &str, existing: Option<SessionState>) -> Directive {
        let Some(state) = existing else {
            tracing::info!("Cancel for session '{}' with nothing pending", session_id);
            return Directive::Error(prompts::NOTHING_TO_CANCEL.to_string());
        };

        if state.needs_remote_cancel() {
            match self.gateway.confirm(false).await {
                Ok(reply) => tracing::info!(
                    "Remote acknowledged cancel for session '{}': {:?} {}",
                    session_id,
                    reply.status,
                    reply.message
                ),
                Err(e) => tracing::warn!(
                    "Best-effort remote cancel for session '{}' failed: {}",
                    session_id,
                    e
                ),
            }
        }

        self.store.remove(session_id).await;
        tracing::info!(
            "Session '{}' cancelled at stage {:?}",
            session_id,
            state.stage
        );
        Directive::RespondDirectly(prompts::CANCELLED.to_string())
    }

    async fn advance(
        &self,
        session: &SessionHandle,
        state: &mut SessionState,
        args: &InvokeArgs,
    ) -> Result<Step, NegotiationError> {
        let mut unparsed = Vec::new();
        let temperature = parse_input(args.temperature.as_deref(), parse_temperature, &mut unparsed);
        let load_rate = parse_input(args.load_rate.as_deref(), parse_load_rate, &mut unparsed);

        // Nothing is applied unless every supplied value is in range.
        validate_temperature(temperature.as_ref().map(|v| v.raw), &self.limits)?;
        validate_load_rate(load_rate.as_ref().map(|v| v.raw), &self.limits)?;

        let previous_values = (state.temperature.clone(), state.load_rate.clone());
        let has_new_values = temperature.is_some() || load_rate.is_some();

        if has_new_values && state.stage.is_confirming() && !args.confirm && !args.use_preset {
            tracing::info!(
                "Session '{}' got new values at {:?}; discarding previous values",
                session.id,
                state.stage
            );
            state.reset_for_reentry();
        }

        if let Some(value) = temperature {
            tracing::info!("Session '{}' temperature set to {}", session.id, value.formatted);
            state.temperature = Some(value);
        }
        if let Some(value) = load_rate {
            tracing::info!("Session '{}' load rate set to {}", session.id, value.formatted);
            state.load_rate = Some(value);
        }

        if args.use_preset {
            self.apply_preset(&session.id, state)?;
        }

        // The remote holds the values from the first confirmation; changed
        // values must go through set-parameters again.
        if state.stage == Stage::WaitingSecondConfirm
            && (state.temperature.clone(), state.load_rate.clone()) != previous_values
        {
            tracing::info!(
                "Session '{}' values changed after first confirmation; back to first confirmation",
                session.id
            );
            state.stage = Stage::WaitingFirstConfirm;
            state.confirm_stage = 0;
            state.first_stage_response = None;
        }

        if state.stage.is_collecting() {
            if !state.has_any_parameter() {
                if args.confirm {
                    return Err(NegotiationError::InvalidTransition(
                        prompts::NOTHING_TO_CONFIRM.to_string(),
                    ));
                }
                state.stage = Stage::Collecting;
                return Ok(Step::Keep(Directive::AskModelToPhrase(prompts::ask_for_values(
                    &unparsed,
                    self.presets.first(),
                ))));
            }
            tracing::info!(
                "Session '{}' moves to first confirmation ({})",
                session.id,
                prompts::summary(state)
            );
            state.stage = Stage::WaitingFirstConfirm;
        }

        if !args.confirm {
            let prompt = match state.stage {
                Stage::WaitingSecondConfirm => {
                    let remote_message = state
                        .first_stage_response
                        .as_ref()
                        .map(|reply| reply.message.clone())
                        .unwrap_or_default();
                    prompts::second_confirmation(state, &remote_message)
                }
                _ => prompts::proposal(state),
            };
            return Ok(Step::Keep(Directive::AskModelToPhrase(prompt)));
        }

        match state.stage {
            Stage::WaitingFirstConfirm => self.first_confirmation(session, state).await,
            Stage::WaitingSecondConfirm => self.second_confirmation(session, state).await,
            other => Err(NegotiationError::InvalidTransition(format!(
                "cannot confirm at stage {:?}",
                other
            ))),
        }
    }

    fn apply_preset(&self, session_id: &str, state: &mut SessionState) -> Result<(), NegotiationError> {
        let preset = self.presets.first().copied().ok_or_else(|| {
            NegotiationError::InvalidTransition("No preset parameters are configured.".to_string())
        })?;

        if state.temperature.is_none() {
            state.temperature = Some(ParsedValue {
                raw: preset.temperature,
                formatted: format_temperature(preset.temperature),
            });
        }
        if state.load_rate.is_none() {
            state.load_rate = Some(ParsedValue {
                raw: preset.load_rate,
                formatted: format_load_rate(preset.load_rate),
            });
        }
        tracing::info!(
            "Session '{}' filled from preset ({})",
            session_id,
            prompts::summary(state)
        );
        Ok(())
    }

    async fn first_confirmation(
        &self,
        session: &SessionHandle,
        state: &mut SessionState,
    ) -> Result<Step, NegotiationError> {
        let set = self
            .gateway
            .set_parameters(state.temperature_raw(), state.load_rate_raw())
            .await?;
        tracing::info!("Session '{}' parameters accepted: {}", session.id, set.message);

        let reply = self.gateway.confirm(true).await?;
        match (reply.status, reply.stage) {
            (ConfirmStatus::Success, Some(1)) => {
                state.confirm_stage = 1;
                state.stage = Stage::WaitingSecondConfirm;
                let prompt = prompts::second_confirmation(state, &reply.message);
                state.first_stage_response = Some(reply);
                tracing::info!("Session '{}' moves to second confirmation", session.id);
                Ok(Step::Keep(Directive::AskModelToPhrase(prompt)))
            }
            (ConfirmStatus::Canceled, _) => Ok(self.remote_cancelled(&session.id, &reply)),
            _ => Err(unexpected_reply(1, &reply)),
        }
    }

    async fn second_confirmation(
        &self,
        session: &SessionHandle,
        state: &mut SessionState,
    ) -> Result<Step, NegotiationError> {
        let reply = self.gateway.confirm(true).await?;
        match (reply.status, reply.stage) {
            (ConfirmStatus::Success, Some(2)) => {
                state.confirm_stage = 2;
                state.stage = Stage::Completed;
                let message = prompts::completion(state);
                tracing::info!(
                    "Session '{}' completed ({}); optimization authorized",
                    session.id,
                    prompts::summary(state)
                );
                self.start_poller(session, prompts::summary(state)).await;
                Ok(Step::Done(Directive::RespondDirectly(message)))
            }
            (ConfirmStatus::Canceled, _) => Ok(self.remote_cancelled(&session.id, &reply)),
            _ => Err(unexpected_reply(2, &reply)),
        }
    }

    fn remote_cancelled(&self, session_id: &str, reply: &ConfirmReply) -> Step {
        tracing::info!(
            "Remote cancelled session '{}' during confirmation: {}",
            session_id,
            reply.message
        );
        Step::Done(Directive::RespondDirectly(prompts::REMOTE_CANCELLED.to_string()))
    }

    async fn start_poller(&self, session: &SessionHandle, summary: String) {
        let handle = spawn_completion_poller(
            self.gateway.clone(),
            session.output.clone(),
            self.poller_config,
            CompletionContext {
                session_id: session.id.clone(),
                summary,
            },
        );

        let mut pollers = self.pollers.lock().await;
        if let Some(previous) = pollers.insert(session.id.clone(), handle) {
            if !previous.is_finished() {
                tracing::warn!(
                    "Session '{}' started a new optimization while the previous poller is still running; it will finish on its own",
                    previous.session_id()
                );
            }
        }
        if pollers.len() > self.poller_capacity {
            let current = session.id.as_str();
            pollers.retain(|id, handle| id == current || !handle.is_finished());
            tracing::debug!("Pruned finished pollers; {} still tracked", pollers.len());
        }
    }
}

fn parse_input(
    text: Option<&str>,
    parse: fn(&str) -> Option<ParsedValue>,
    unparsed: &mut Vec<String>,
) -> Option<ParsedValue> {
    let text = text?;
    let parsed = parse(text);
    if parsed.is_none() {
        tracing::warn!("Could not parse a number from {:?}", text);
        unparsed.push(text.to_string());
    }
    parsed
}

fn unexpected_reply(expected_stage: u8, reply: &ConfirmReply) -> NegotiationError {
    NegotiationError::InvalidTransition(format!(
        "The optimization service answered with stage {:?} where stage {} was expected: {}",
        reply.stage, expected_stage, reply.message
    ))
}
