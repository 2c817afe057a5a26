//! Client for the remote optimization service.
//!
//! Three endpoints:
//! - `POST /api/asr` sets temperature and/or load rate
//! - `POST /api/confirm` authorizes (`1`) or cancels (`0`) the pending job
//! - `GET /api/ai/status` reports optimization progress

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::params::wire_number;

const IN_PROGRESS_CODE: i64 = 409;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetParametersReply {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmStatus {
    Success,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmReply {
    pub status: ConfirmStatus,
    /// How many confirmations the remote has accepted so far.
    pub stage: Option<u8>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptimizationStatus {
    #[serde(default)]
    pub is_optimizing: bool,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

impl OptimizationStatus {
    pub fn is_complete(&self) -> bool {
        !self.is_optimizing && self.stage == "complete"
    }

    pub fn is_failed(&self) -> bool {
        self.status == "fail"
    }
}

/// The operations the negotiation core needs from the remote service.
#[async_trait]
pub trait ControlGateway: Send + Sync {
    /// Push whichever values are present. At least one must be.
    async fn set_parameters(
        &self,
        temperature: Option<f64>,
        load_rate: Option<f64>,
    ) -> Result<SetParametersReply, GatewayError>;

    /// `true` authorizes the pending job, `false` cancels it.
    async fn confirm(&self, authorize: bool) -> Result<ConfirmReply, GatewayError>;

    async fn query_status(&self) -> Result<OptimizationStatus, GatewayError>;
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayTimeouts {
    pub set_parameters: Duration,
    pub confirm: Duration,
    pub status: Duration,
}

impl From<&GatewayConfig> for GatewayTimeouts {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            set_parameters: config.set_parameters_timeout(),
            confirm: config.confirm_timeout(),
            status: config.status_timeout(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SetParametersRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    load_rate: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConfirmRequest {
    status: u8,
}

#[derive(Debug, Deserialize)]
struct RemoteReply {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    stage: Option<u8>,
}

/// HTTP implementation of [`ControlGateway`].
pub struct HttpGateway {
    base_url: String,
    client: Client,
    timeouts: GatewayTimeouts,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, client: Client, timeouts: GatewayTimeouts) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client,
            timeouts,
        }
    }

    pub fn from_config(config: &GatewayConfig, client: Client) -> Self {
        Self::new(config.base_url.clone(), client, GatewayTimeouts::from(config))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<RemoteReply, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        decode(response, timeout).await
    }
}

#[async_trait]
impl ControlGateway for HttpGateway {
    async fn set_parameters(
        &self,
        temperature: Option<f64>,
        load_rate: Option<f64>,
    ) -> Result<SetParametersReply, GatewayError> {
        if temperature.is_none() && load_rate.is_none() {
            return Err(GatewayError::RemoteRejected(
                "no temperature or load rate to set".to_string(),
            ));
        }

        let request = SetParametersRequest {
            temperature: temperature.map(wire_number),
            load_rate: load_rate.map(wire_number),
        };
        tracing::info!(
            "Setting remote parameters: temperature={:?} load_rate={:?}",
            request.temperature,
            request.load_rate
        );

        let reply = self
            .post("/api/asr", &request, self.timeouts.set_parameters)
            .await?;
        match reply.status.as_str() {
            "success" => Ok(SetParametersReply {
                message: reply.message,
            }),
            _ => Err(classify_failure(reply)),
        }
    }

    async fn confirm(&self, authorize: bool) -> Result<ConfirmReply, GatewayError> {
        let request = ConfirmRequest {
            status: u8::from(authorize),
        };
        tracing::info!("Sending remote confirmation (authorize={})", authorize);

        let reply = self
            .post("/api/confirm", &request, self.timeouts.confirm)
            .await?;
        let status = match reply.status.as_str() {
            "success" => ConfirmStatus::Success,
            "canceled" | "cancelled" => ConfirmStatus::Canceled,
            _ => return Err(classify_failure(reply)),
        };
        Ok(ConfirmReply {
            status,
            stage: reply.stage,
            message: reply.message,
        })
    }

    async fn query_status(&self) -> Result<OptimizationStatus, GatewayError> {
        let url = format!("{}/api/ai/status", self.base_url);
        let timeout = self.timeouts.status;
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        decode(response, timeout).await
    }
}

fn classify_failure(reply: RemoteReply) -> GatewayError {
    let message = if reply.message.trim().is_empty() {
        format!("remote status '{}'", reply.status)
    } else {
        reply.message
    };
    if reply.code == Some(IN_PROGRESS_CODE) {
        GatewayError::OptimizationInProgress(message)
    } else {
        GatewayError::RemoteRejected(message)
    }
}

fn transport_error(error: reqwest::Error, timeout: Duration) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout(timeout)
    } else {
        GatewayError::Network(error.to_string())
    }
}

/// Decode a JSON body regardless of HTTP status: the remote reports business
/// failures in the body, sometimes alongside a 4xx/5xx.
async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<T, GatewayError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    match serde_json::from_str::<T>(&body) {
        Ok(value) => Ok(value),
        Err(_) if status == StatusCode::CONFLICT => {
            Err(GatewayError::OptimizationInProgress(format!("HTTP {}", status)))
        }
        Err(_) if !status.is_success() => Err(GatewayError::RemoteRejected(format!(
            "HTTP {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        ))),
        Err(e) => Err(GatewayError::InvalidResponse(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn timeouts() -> GatewayTimeouts {
        GatewayTimeouts {
            set_parameters: Duration::from_secs(2),
            confirm: Duration::from_secs(2),
            status: Duration::from_secs(2),
        }
    }

    fn gateway(server: &MockServer) -> HttpGateway {
        HttpGateway::new(server.uri(), Client::new(), timeouts())
    }

    #[tokio::test]
    async fn set_parameters_posts_only_present_values() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/asr"))
            .and(body_json(json!({"load_rate": "60"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "success", "message": "ok"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let reply = gateway(&server)
            .set_parameters(None, Some(60.0))
            .await
            .unwrap();
        assert_eq!(reply.message, "ok");
    }

    #[tokio::test]
    async fn set_parameters_sends_both_values() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/asr"))
            .and(body_json(json!({"temperature": "22.5", "load_rate": "90"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "success", "message": "set"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        assert!(gateway(&server)
            .set_parameters(Some(22.5), Some(90.0))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn set_parameters_requires_a_value() {
        let server = MockServer::start().await;
        let err = gateway(&server).set_parameters(None, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::RemoteRejected(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn code_409_maps_to_optimization_in_progress() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/asr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"status": "fail", "code": 409, "message": "optimizing"}),
            ))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .set_parameters(Some(22.0), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::OptimizationInProgress("optimizing".to_string())
        );
    }

    #[tokio::test]
    async fn other_failures_map_to_remote_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/asr"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"status": "fail", "message": "bad value"})),
            )
            .mount(&server)
            .await;

        let err = gateway(&server)
            .set_parameters(Some(22.0), None)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::RemoteRejected("bad value".to_string()));
    }

    #[tokio::test]
    async fn slow_remote_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/asr"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "success", "message": "late"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let gateway = HttpGateway::new(
            server.uri(),
            Client::new(),
            GatewayTimeouts {
                set_parameters: Duration::from_millis(200),
                ..timeouts()
            },
        );
        let err = gateway.set_parameters(Some(22.0), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_remote_maps_to_network_error() {
        let gateway = HttpGateway::new("http://127.0.0.1:9", Client::new(), timeouts());
        let err = gateway.confirm(true).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn confirm_reports_stage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/confirm"))
            .and(body_json(json!({"status": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"status": "success", "stage": 1, "message": "first ok"}),
            ))
            .mount(&server)
            .await;

        let reply = gateway(&server).confirm(true).await.unwrap();
        assert_eq!(reply.status, ConfirmStatus::Success);
        assert_eq!(reply.stage, Some(1));
        assert_eq!(reply.message, "first ok");
    }

    #[tokio::test]
    async fn canceled_confirm_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/confirm"))
            .and(body_json(json!({"status": 0})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "canceled", "message": "dropped"})),
            )
            .mount(&server)
            .await;

        let reply = gateway(&server).confirm(false).await.unwrap();
        assert_eq!(reply.status, ConfirmStatus::Canceled);
        assert_eq!(reply.stage, None);
    }

    #[tokio::test]
    async fn query_status_decodes_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ai/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "is_optimizing": false,
                "stage": "complete",
                "message": "done",
                "status": "success"
            })))
            .mount(&server)
            .await;

        let status = gateway(&server).query_status().await.unwrap();
        assert!(status.is_complete());
        assert!(!status.is_failed());
        assert_eq!(status.message, "done");
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ai/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = gateway(&server).query_status().await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)));
    }
}
