//! Function-calling surface exposed to the intent layer.
//!
//! Each tool declares a JSON Schema for its parameters so an LLM can call it.
//! Tools live in a thread-safe [`ToolRegistry`] that generates OpenAI-format
//! function definitions and dispatches calls for a given session.

pub mod optimization;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::negotiation::Directive;
use crate::session::SessionHandle;

pub use optimization::TemperatureLoadRateTool;

/// Category of tool, used for grouping in listings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCategory {
    /// Changes set points on remote equipment
    DeviceControl,
}

/// Context passed to tools during execution
pub struct ToolContext {
    /// Conversation the call belongs to, with its output channel
    pub session: SessionHandle,
}

impl ToolContext {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g. "set_temperature_load_rate")
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<Directive>;

    fn category(&self) -> ToolCategory;
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// A tool call parsed from LLM output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub name: String,
    pub directive: Directive,
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!(
            "Registered tool: {} (category: {:?})",
            name,
            tool.category()
        );
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Generate OpenAI-format tool definitions for all registered tools.
    pub async fn tool_definitions(&self) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDef> = tools
            .values()
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool call. Unknown tools and execution failures come back as
    /// [`Directive::Error`].
    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        let tool = match self.get(&call.name).await {
            Some(t) => t,
            None => {
                return ToolCallResult {
                    name: call.name.clone(),
                    directive: Directive::Error(format!("Unknown tool: {}", call.name)),
                };
            }
        };

        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(directive) => ToolCallResult {
                name: call.name.clone(),
                directive,
            },
            Err(e) => {
                tracing::warn!(
                    "Tool '{}' failed for session '{}': {}",
                    call.name,
                    ctx.session.id,
                    e
                );
                ToolCallResult {
                    name: call.name.clone(),
                    directive: Directive::Error(format!("Tool execution failed: {}", e)),
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
