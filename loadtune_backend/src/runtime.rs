use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::OptimizerConfig;
use crate::gateway::{ControlGateway, HttpGateway};
use crate::http_client::build_http_client;
use crate::negotiation::Negotiator;
use crate::output::{ChannelSink, OutputEvent};
use crate::poller::PollerConfig;
use crate::session::{SessionHandle, SessionStore};
use crate::tools::{TemperatureLoadRateTool, ToolCall, ToolCallResult, ToolContext, ToolRegistry};

pub struct BackendRuntime {
    pub config: OptimizerConfig,
    pub negotiator: Arc<Negotiator>,
    pub tool_registry: Arc<ToolRegistry>,
    output_tx: Sender<OutputEvent>,
    listeners: Arc<AtomicUsize>,
}

pub struct BackendRuntimeBuilder {
    config: OptimizerConfig,
    output_tx: Sender<OutputEvent>,
    gateway: Option<Arc<dyn ControlGateway>>,
    poller_config: Option<PollerConfig>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: OptimizerConfig, output_tx: Sender<OutputEvent>) -> Self {
        Self {
            config,
            output_tx,
            gateway: None,
            poller_config: None,
        }
    }

    /// Use this gateway instead of the HTTP one built from config.
    pub fn with_gateway(mut self, gateway: Arc<dyn ControlGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_poller_config(mut self, poller_config: PollerConfig) -> Self {
        self.poller_config = Some(poller_config);
        self
    }

    pub async fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        config.validate().context("invalid optimizer config")?;

        let gateway = match self.gateway {
            Some(gateway) => gateway,
            None => {
                let client = build_http_client().context("failed to build HTTP client")?;
                tracing::info!("Optimization gateway: {}", config.gateway.base_url);
                Arc::new(HttpGateway::from_config(&config.gateway, client))
            }
        };

        let mut negotiator = Negotiator::new(&config, gateway, Arc::new(SessionStore::new()));
        if let Some(poller_config) = self.poller_config {
            negotiator = negotiator.with_poller_config(poller_config);
        }
        let negotiator = Arc::new(negotiator);

        let tool_registry = Arc::new(ToolRegistry::new());
        tool_registry
            .register(Arc::new(TemperatureLoadRateTool::new(negotiator.clone())))
            .await;
        tracing::info!(
            "Tool registry initialized with {:?}",
            tool_registry.list_names().await
        );

        Ok(BackendRuntime {
            config,
            negotiator,
            tool_registry,
            output_tx: self.output_tx,
            listeners: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// Keeps session output "ready" while held.
pub struct ListenerGuard {
    listeners: Arc<AtomicUsize>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.listeners.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackendRuntime {
    pub async fn bootstrap(config: OptimizerConfig, output_tx: Sender<OutputEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, output_tx).build().await
    }

    /// Handle for `session_id` whose output goes to the runtime's event channel.
    pub fn session(&self, session_id: &str) -> SessionHandle {
        let listeners = self.listeners.clone();
        let sink = ChannelSink::new(session_id, self.output_tx.clone())
            .with_ready_check(move || listeners.load(Ordering::SeqCst) > 0);
        SessionHandle::new(session_id, Arc::new(sink))
    }

    /// Register a consumer of output events, e.g. a websocket client.
    pub fn attach_listener(&self) -> ListenerGuard {
        self.listeners.fetch_add(1, Ordering::SeqCst);
        ListenerGuard {
            listeners: self.listeners.clone(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    pub async fn invoke_tool(&self, session_id: &str, call: &ToolCall) -> ToolCallResult {
        let ctx = ToolContext::new(self.session(session_id));
        self.tool_registry.execute_call(call, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::Directive;
    use crate::output::OutputSink;
    use crate::test_support::MockGateway;

    async fn runtime() -> (BackendRuntime, flume::Receiver<OutputEvent>) {
        let (tx, rx) = flume::unbounded();
        let runtime = BackendRuntimeBuilder::new(OptimizerConfig::default(), tx)
            .with_gateway(Arc::new(MockGateway::new()))
            .build()
            .await
            .unwrap();
        (runtime, rx)
    }

    #[tokio::test]
    async fn registers_the_negotiation_tool() {
        let (runtime, _rx) = runtime().await;
        assert_eq!(
            runtime.tool_registry.list_names().await,
            vec!["set_temperature_load_rate".to_string()]
        );
    }

    #[tokio::test]
    async fn session_output_is_ready_only_with_listeners() {
        let (runtime, _rx) = runtime().await;
        let session = runtime.session("s1");
        assert!(!session.output.is_ready().await);

        let guard = runtime.attach_listener();
        assert!(session.output.is_ready().await);
        assert_eq!(runtime.listener_count(), 1);

        drop(guard);
        assert!(!session.output.is_ready().await);
    }

    #[tokio::test]
    async fn invoke_tool_uses_per_session_state() {
        let (runtime, _rx) = runtime().await;
        let call = ToolCall {
            name: "set_temperature_load_rate".to_string(),
            arguments: serde_json::json!({"temperature": "22"}),
        };

        let result = runtime.invoke_tool("a", &call).await;

        assert!(matches!(result.directive, Directive::AskModelToPhrase(_)));
        assert!(runtime.negotiator.store().contains("a").await);
        assert!(!runtime.negotiator.store().contains("b").await);
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let (tx, _rx) = flume::unbounded();
        let mut config = OptimizerConfig::default();
        config.limits.temperature_min = 50.0;
        let result = BackendRuntimeBuilder::new(config, tx)
            .with_gateway(Arc::new(MockGateway::new()))
            .build()
            .await;
        assert!(result.is_err());
    }
}
