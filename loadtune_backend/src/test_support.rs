//! Scripted collaborators shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::GatewayError;
use crate::gateway::{
    ConfirmReply, ConfirmStatus, ControlGateway, OptimizationStatus, SetParametersReply,
};
use crate::output::OutputSink;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    SetParameters {
        temperature: Option<f64>,
        load_rate: Option<f64>,
    },
    Confirm(bool),
    QueryStatus,
}

/// Gateway that replays queued results and records every call.
///
/// With nothing queued it behaves like a healthy remote: parameters are
/// accepted, each `confirm(true)` advances the remote stage by one and
/// `confirm(false)` cancels.
pub struct MockGateway {
    calls: Mutex<Vec<GatewayCall>>,
    set_results: Mutex<VecDeque<Result<SetParametersReply, GatewayError>>>,
    confirm_results: Mutex<VecDeque<Result<ConfirmReply, GatewayError>>>,
    status_results: Mutex<VecDeque<Result<OptimizationStatus, GatewayError>>>,
    status_fallback: Mutex<OptimizationStatus>,
    remote_stage: Mutex<u8>,
    set_delay: Mutex<Duration>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            set_results: Mutex::new(VecDeque::new()),
            confirm_results: Mutex::new(VecDeque::new()),
            status_results: Mutex::new(VecDeque::new()),
            status_fallback: Mutex::new(status_done("optimization finished")),
            remote_stage: Mutex::new(0),
            set_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn push_set(&self, result: Result<SetParametersReply, GatewayError>) {
        self.set_results.lock().unwrap().push_back(result);
    }

    pub fn push_confirm(&self, result: Result<ConfirmReply, GatewayError>) {
        self.confirm_results.lock().unwrap().push_back(result);
    }

    pub fn push_status(&self, result: Result<OptimizationStatus, GatewayError>) {
        self.status_results.lock().unwrap().push_back(result);
    }

    /// Make `set_parameters` take this long, like a remote planning a schedule.
    pub fn set_parameters_delay(&self, delay: Duration) {
        *self.set_delay.lock().unwrap() = delay;
    }

    pub fn set_status_fallback(&self, status: OptimizationStatus) {
        *self.status_fallback.lock().unwrap() = status;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than status polls, in order.
    pub fn control_calls(&self) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|call| *call != GatewayCall::QueryStatus)
            .collect()
    }

    pub fn status_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == GatewayCall::QueryStatus)
            .count()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ControlGateway for MockGateway {
    async fn set_parameters(
        &self,
        temperature: Option<f64>,
        load_rate: Option<f64>,
    ) -> Result<SetParametersReply, GatewayError> {
        self.record(GatewayCall::SetParameters {
            temperature,
            load_rate,
        });
        let delay = *self.set_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let queued = self.set_results.lock().unwrap().pop_front();
        let result = queued.unwrap_or_else(|| {
            Ok(SetParametersReply {
                message: "parameters accepted".to_string(),
            })
        });
        if result.is_ok() {
            *self.remote_stage.lock().unwrap() = 0;
        }
        result
    }

    async fn confirm(&self, authorize: bool) -> Result<ConfirmReply, GatewayError> {
        self.record(GatewayCall::Confirm(authorize));
        if let Some(queued) = self.confirm_results.lock().unwrap().pop_front() {
            return queued;
        }
        let mut stage = self.remote_stage.lock().unwrap();
        if authorize {
            *stage += 1;
            Ok(ConfirmReply {
                status: ConfirmStatus::Success,
                stage: Some(*stage),
                message: format!("confirmation {} accepted", *stage),
            })
        } else {
            *stage = 0;
            Ok(ConfirmReply {
                status: ConfirmStatus::Canceled,
                stage: None,
                message: "canceled".to_string(),
            })
        }
    }

    async fn query_status(&self) -> Result<OptimizationStatus, GatewayError> {
        self.record(GatewayCall::QueryStatus);
        if let Some(queued) = self.status_results.lock().unwrap().pop_front() {
            return queued;
        }
        Ok(self.status_fallback.lock().unwrap().clone())
    }
}

pub fn status_done(message: &str) -> OptimizationStatus {
    OptimizationStatus {
        is_optimizing: false,
        stage: "complete".to_string(),
        message: message.to_string(),
        status: "success".to_string(),
    }
}

pub fn status_failed(message: &str) -> OptimizationStatus {
    OptimizationStatus {
        is_optimizing: false,
        stage: "error".to_string(),
        message: message.to_string(),
        status: "fail".to_string(),
    }
}

pub fn optimizing(stage: &str) -> OptimizationStatus {
    OptimizationStatus {
        is_optimizing: true,
        stage: stage.to_string(),
        message: format!("{} in progress", stage),
        status: "success".to_string(),
    }
}

/// Output sink that keeps everything in memory.
pub struct MemorySink {
    ready: AtomicBool,
    history: Mutex<Vec<String>>,
    spoken: Mutex<Vec<(String, Instant)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            history: Mutex::new(Vec::new()),
            spoken: Mutex::new(Vec::new()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    pub fn spoken(&self) -> Vec<(String, Instant)> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn append_history(&self, _role: &str, text: &str) -> Result<()> {
        self.history.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken
            .lock()
            .unwrap()
            .push((text.to_string(), Instant::now()));
        Ok(())
    }
}
