//! Error types for parameter negotiation.

use std::time::Duration;

/// Which negotiated parameter a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Temperature,
    LoadRate,
}

/// Local validation failure. Always recoverable: the user re-enters the value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("{} {value}{} is outside the allowed range ({min}{}~{max}{}), please enter it again", .kind.label(), .kind.unit(), .kind.unit(), .kind.unit())]
    OutOfRange {
        kind: ParamKind,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl ParamKind {
    pub fn label(&self) -> &'static str {
        match self {
            ParamKind::Temperature => "Temperature",
            ParamKind::LoadRate => "Load rate",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            ParamKind::Temperature => "℃",
            ParamKind::LoadRate => "%",
        }
    }
}

/// Failure talking to the remote optimization service.
///
/// Remote-reported failures (`OptimizationInProgress`, `RemoteRejected`) are kept
/// apart from transport failures (`Timeout`, `Network`) so callers can tell a
/// business refusal from a flaky link.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Remote answered `fail` with code 409.
    #[error("an optimization is already in progress: {0}")]
    OptimizationInProgress(String),

    /// Remote answered `fail` for any other reason.
    #[error("remote rejected the request: {0}")]
    RemoteRejected(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    /// Response body could not be decoded.
    #[error("invalid response from remote: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// True for failures where simply trying again later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Timeout(_) | GatewayError::Network(_))
    }
}

/// Everything an `invoke` call can fail with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Validation(#[from] ParamError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Confirm/cancel with nothing pending, or a remote reply that does not fit
    /// the current stage.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl NegotiationError {
    /// A transport failure the user can clear by confirming again.
    pub fn is_transient(&self) -> bool {
        matches!(self, NegotiationError::Gateway(e) if e.is_transient())
    }

    /// Text suitable for speaking back to the user.
    pub fn user_message(&self) -> String {
        match self {
            NegotiationError::Validation(e) => e.to_string(),
            NegotiationError::Gateway(GatewayError::OptimizationInProgress(_)) => {
                "An optimization is already running. Please try again later.".to_string()
            }
            NegotiationError::Gateway(GatewayError::RemoteRejected(message)) => {
                format!("The optimization service rejected the request: {}", message)
            }
            NegotiationError::Gateway(GatewayError::Timeout(_)) => {
                "The optimization service did not answer in time. Please say confirm again to retry."
                    .to_string()
            }
            NegotiationError::Gateway(GatewayError::Network(_)) => {
                "Could not reach the optimization service. Please try again.".to_string()
            }
            NegotiationError::Gateway(GatewayError::InvalidResponse(_)) => {
                "The optimization service sent an unexpected reply. Please try again.".to_string()
            }
            NegotiationError::InvalidTransition(reason) => reason.clone(),
        }
    }
}
