//! Temperature / load-rate negotiation plugin for a voice assistant.
//!
//! The core is a per-session confirmation state machine ([`negotiation`]) that
//! talks to a remote optimization service ([`gateway`]) and, once the job is
//! authorized, hands off to a background completion poller ([`poller`]).

pub mod config;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod negotiation;
pub mod output;
pub mod params;
pub mod poller;
pub mod prompts;
pub mod runtime;
pub mod server;
pub mod session;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::OptimizerConfig;
pub use error::{GatewayError, NegotiationError, ParamError};
pub use negotiation::{Directive, InvokeArgs, Negotiator};
pub use runtime::BackendRuntime;
pub use session::{SessionHandle, SessionState, SessionStore, Stage};
