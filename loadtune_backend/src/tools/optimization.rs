//! `set_temperature_load_rate`: routes one turn of the user's request into the
//! negotiation state machine.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::negotiation::{Directive, InvokeArgs, Negotiator};

use super::{Tool, ToolCategory, ToolContext};

pub struct TemperatureLoadRateTool {
    negotiator: Arc<Negotiator>,
}

impl TemperatureLoadRateTool {
    pub fn new(negotiator: Arc<Negotiator>) -> Self {
        Self { negotiator }
    }
}

#[async_trait]
impl Tool for TemperatureLoadRateTool {
    fn name(&self) -> &str {
        "set_temperature_load_rate"
    }

    fn description(&self) -> &str {
        "Set the chiller temperature and load rate and start AI optimization. Call it whenever the user gives a temperature or load rate, asks for the preset, confirms, or cancels. Every change needs two confirmations from the user before it takes effect."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "temperature": {
                    "type": "string",
                    "description": "Target temperature as the user said it, e.g. \"22\" or \"22.5度\""
                },
                "load_rate": {
                    "type": "string",
                    "description": "Target load rate as the user said it, e.g. \"90%\" or \"0.9\""
                },
                "use_preset": {
                    "type": "boolean",
                    "description": "Fill any missing value from the recommended preset"
                },
                "confirm": {
                    "type": "boolean",
                    "description": "The user confirmed the values currently proposed"
                },
                "cancel": {
                    "type": "boolean",
                    "description": "The user wants to abandon the setting"
                }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Directive> {
        let params = if params.is_null() { json!({}) } else { params };
        if !params.is_object() {
            return Ok(Directive::Error(format!(
                "Arguments for {} must be a JSON object",
                self.name()
            )));
        }
        let args: InvokeArgs = match serde_json::from_value(params) {
            Ok(args) => args,
            Err(e) => {
                return Ok(Directive::Error(format!(
                    "Invalid arguments for {}: {}",
                    self.name(),
                    e
                )))
            }
        };

        Ok(self.negotiator.invoke(&ctx.session, args).await)
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::DeviceControl
    }
}
