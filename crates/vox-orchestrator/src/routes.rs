//! Axum router and all HTTP handlers for vox-orchestrator.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! after calling it. Handlers are generic over the `AppState`'s backend
//! types so the exact same router runs in tests against in-memory/mock
//! backends and in production against Postgres/HTTP.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;

use vox_engine::PersistencePort;
use vox_provider::ProviderClient;
use vox_registry::Registry;
use vox_schemas::{WorkerConfig, WorkerStatus};

use crate::api_types::{
    BindingsRequest, BuildInfoResponse, ControlEnvelope, HealthResponse, ItemResult, MonitorItem,
    MonitorResponse, ReasonedBindingsRequest, StartRequest, StatusItem, StatusResponse,
    SubmitOtpRequest, SubmitOtpResponse,
};
use crate::state::{AppState, BusMsg};

pub fn build_router<R, P, Pp>(state: Arc<AppState<R, P, Pp>>) -> Router
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/healthz", get(healthz::<R, P, Pp>))
        .route("/v1/orchestration/build-info", get(build_info::<R, P, Pp>))
        .route("/v1/orchestration/stream", get(stream::<R, P, Pp>))
        .route("/v1/orchestration/start", post(start::<R, P, Pp>))
        .route("/v1/orchestration/pause", post(pause::<R, P, Pp>))
        .route("/v1/orchestration/resume", post(resume::<R, P, Pp>))
        .route("/v1/orchestration/stop", post(stop::<R, P, Pp>))
        .route("/v1/orchestration/status", post(status::<R, P, Pp>))
        .route("/v1/orchestration/monitor", get(monitor::<R, P, Pp>))
        .route("/v1/orchestration/otp", post(submit_otp::<R, P, Pp>))
        .with_state(state)
}

async fn healthz<R, P, Pp>(State(st): State<Arc<AppState<R, P, Pp>>>) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    (
        StatusCode::OK,
        Json(HealthResponse { ok: true, service: st.build.service, version: st.build.version }),
    )
}

async fn build_info<R, P, Pp>(State(st): State<Arc<AppState<R, P, Pp>>>) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    Json(BuildInfoResponse {
        service: st.build.service,
        version: st.build.version,
        git_hash: st.build.git_hash,
    })
}

async fn stream<R, P, Pp>(State(st): State<Arc<AppState<R, P, Pp>>>) -> Response
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);
    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: tokio::sync::broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::WorkerSpawned { .. } => "worker_spawned",
                    BusMsg::WorkerExited { .. } => "worker_exited",
                    BusMsg::CommandApplied { .. } => "command_applied",
                    BusMsg::Heartbeat { .. } => "heartbeat",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

async fn start<R, P, Pp>(
    State(st): State<Arc<AppState<R, P, Pp>>>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let cfg = WorkerConfig {
        interval_ms: req.interval_ms,
        max_retry_status: req.max_retry_status,
        cooldown_on_error_ms: req.cooldown_on_error_ms,
        product_id: req.product_id.clone(),
        email: req.email.clone(),
        limit_harga: req.limit_harga,
    };
    if let Err(e) = cfg.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ControlEnvelope {
                action: "start",
                items: req
                    .binding_ids
                    .iter()
                    .map(|&binding_id| ItemResult { binding_id, ok: false, message: e.clone() })
                    .collect(),
            }),
        );
    }

    let mut items = Vec::with_capacity(req.binding_ids.len());
    for binding_id in req.binding_ids {
        let current = st.registry.get_state(binding_id).await;
        // A binding already `running` and owned by this process is a restart
        // with new config, not a rejection: issuing `start` twice in
        // succession must leave one worker running with the later cfg.
        let restart_owned_by_self = matches!(
            &current,
            Ok(s) if s.status == WorkerStatus::Running && s.owner.as_ref() == Some(&st.owner_id)
        );
        let eligible = restart_owned_by_self
            || match &current {
                Ok(s) => matches!(s.status, WorkerStatus::Idle | WorkerStatus::Stopped | WorkerStatus::Paused),
                Err(_) => true, // no state yet recorded: treat as idle
            };
        if !eligible {
            items.push(ItemResult {
                binding_id,
                ok: false,
                message: "binding is already running".to_string(),
            });
            continue;
        }

        let _ = st.registry.put_config(binding_id, &cfg).await;
        if !restart_owned_by_self {
            let _ = st
                .registry
                .force_state(binding_id, WorkerStatus::Running, None, Some(&st.owner_id))
                .await;
        }
        st.publish_start_config(binding_id, cfg.clone()).await;
        let spawned = st.spawn_worker_if_absent(binding_id).await;
        let _ = st.bus.send(BusMsg::CommandApplied { binding_id, op: "start".to_string() });

        items.push(ItemResult {
            binding_id,
            ok: true,
            message: if spawned {
                "started".to_string()
            } else if restart_owned_by_self {
                "restarted with new config".to_string()
            } else {
                "already owned in this process".to_string()
            },
        });
    }
    (StatusCode::OK, Json(ControlEnvelope { action: "start", items }))
}

async fn pause<R, P, Pp>(
    State(st): State<Arc<AppState<R, P, Pp>>>,
    Json(req): Json<ReasonedBindingsRequest>,
) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let items = transition_if_current(&st, &req.binding_ids, WorkerStatus::Running, WorkerStatus::Paused, req.reason.as_deref(), "pause").await;
    (StatusCode::OK, Json(ControlEnvelope { action: "pause", items }))
}

async fn resume<R, P, Pp>(
    State(st): State<Arc<AppState<R, P, Pp>>>,
    Json(req): Json<BindingsRequest>,
) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let items = transition_if_current(&st, &req.binding_ids, WorkerStatus::Paused, WorkerStatus::Running, None, "resume").await;
    (StatusCode::OK, Json(ControlEnvelope { action: "resume", items }))
}

async fn stop<R, P, Pp>(
    State(st): State<Arc<AppState<R, P, Pp>>>,
    Json(req): Json<ReasonedBindingsRequest>,
) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let mut items = Vec::with_capacity(req.binding_ids.len());
    for binding_id in req.binding_ids {
        // Unconditional, per the spec's `stop` idempotence property: issuing
        // stop with no worker running is a no-op that still sets `stopped`.
        let result = st
            .registry
            .force_state(binding_id, WorkerStatus::Stopped, req.reason.as_deref(), None)
            .await;
        let _ = st.bus.send(BusMsg::CommandApplied { binding_id, op: "stop".to_string() });
        items.push(ItemResult {
            binding_id,
            ok: result.is_ok(),
            message: match result {
                Ok(()) => "stopped".to_string(),
                Err(e) => e.to_string(),
            },
        });
    }
    (StatusCode::OK, Json(ControlEnvelope { action: "stop", items }))
}

/// Shared logic for `pause`/`resume`: read current state, transition only
/// if it matches `from`, no-op otherwise.
async fn transition_if_current<R, P, Pp>(
    st: &AppState<R, P, Pp>,
    binding_ids: &[vox_schemas::BindingId],
    from: WorkerStatus,
    to: WorkerStatus,
    reason: Option<&str>,
    op: &str,
) -> Vec<ItemResult>
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let mut items = Vec::with_capacity(binding_ids.len());
    for &binding_id in binding_ids {
        let current = st.registry.get_state(binding_id).await;
        let ok = match &current {
            Ok(s) if s.status == from => {
                let owner = s.owner.clone();
                st.registry.force_state(binding_id, to, reason, owner.as_ref()).await.is_ok()
            }
            Ok(_) => false,
            Err(_) => false,
        };
        let _ = st.bus.send(BusMsg::CommandApplied { binding_id, op: op.to_string() });
        items.push(ItemResult {
            binding_id,
            ok,
            message: if ok {
                format!("{op}d")
            } else {
                format!("not {from:?}, no-op")
            },
        });
    }
    items
}

async fn status<R, P, Pp>(
    State(st): State<Arc<AppState<R, P, Pp>>>,
    Json(req): Json<BindingsRequest>,
) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let mut items = Vec::with_capacity(req.binding_ids.len());
    for binding_id in req.binding_ids {
        if let Ok(s) = st.registry.get_state(binding_id).await {
            items.push(StatusItem {
                binding_id,
                state: s.status,
                reason: s.reason,
                owner: s.owner.map(|o| o.0),
                updated_at: s.updated_at,
            });
        }
    }
    (StatusCode::OK, Json(StatusResponse { items }))
}

async fn monitor<R, P, Pp>(State(st): State<Arc<AppState<R, P, Pp>>>) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let snapshot = st.registry.snapshot_all().await.unwrap_or_default();
    let total_workers = snapshot.len();
    let active_workers = snapshot
        .iter()
        .filter(|e| e.state.status == WorkerStatus::Running && e.lock.is_some())
        .count();

    let now = chrono::Utc::now();
    let items = snapshot
        .into_iter()
        .map(|e| MonitorItem {
            binding_id: e.binding_id,
            state: e.state.status,
            reason: e.state.reason,
            lock_owner: e.lock.map(|l| l.owner.0),
            heartbeat_cycle: e.heartbeat.as_ref().map(|h| h.cycle),
            heartbeat_last_action: e.heartbeat.as_ref().map(|h| h.last_action.clone()),
            heartbeat_age_ms: e.heartbeat.map(|h| (now - h.updated_at).num_milliseconds()),
        })
        .collect();

    (StatusCode::OK, Json(MonitorResponse { total_workers, active_workers, items }))
}

async fn submit_otp<R, P, Pp>(
    State(st): State<Arc<AppState<R, P, Pp>>>,
    Json(req): Json<SubmitOtpRequest>,
) -> impl IntoResponse
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    let accepted = st.otp.submit(req.binding_id, req.otp).await;
    (
        StatusCode::OK,
        Json(SubmitOtpResponse {
            accepted,
            reason: if accepted { None } else { Some("otp_already_pending".to_string()) },
        }),
    )
}
