//! Request and response types for every vox-orchestrator HTTP endpoint.
//!
//! Plain `Serialize + Deserialize` structs; no business logic here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vox_schemas::{BindingId, WorkerStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfoResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
}

/// Body of `POST /v1/orchestration/start`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub binding_ids: Vec<BindingId>,
    pub product_id: String,
    pub email: String,
    pub limit_harga: i64,
    pub interval_ms: u64,
    pub max_retry_status: u32,
    pub cooldown_on_error_ms: u64,
}

/// Body of `POST /v1/orchestration/pause` and `/stop`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReasonedBindingsRequest {
    pub binding_ids: Vec<BindingId>,
    pub reason: Option<String>,
}

/// Body of `POST /v1/orchestration/resume` and `/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct BindingsRequest {
    pub binding_ids: Vec<BindingId>,
}

/// Per-binding outcome shared by start/pause/resume/stop.
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub binding_id: BindingId,
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlEnvelope {
    pub action: &'static str,
    pub items: Vec<ItemResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusItem {
    pub binding_id: BindingId,
    pub state: WorkerStatus,
    pub reason: Option<String>,
    pub owner: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub items: Vec<StatusItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorItem {
    pub binding_id: BindingId,
    pub state: WorkerStatus,
    pub reason: Option<String>,
    pub lock_owner: Option<String>,
    pub heartbeat_cycle: Option<u64>,
    pub heartbeat_last_action: Option<String>,
    pub heartbeat_age_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorResponse {
    pub total_workers: usize,
    pub active_workers: usize,
    pub items: Vec<MonitorItem>,
}

/// Body of the OTP ingress endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitOtpRequest {
    pub binding_id: BindingId,
    pub otp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOtpResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}
