//! Shared runtime state for vox-orchestrator.
//!
//! `AppState` is generic over the Registry/Provider Client/Persistence
//! backend so the same router and handlers run against Postgres + HTTP in
//! production and against `InMemoryRegistry` + `MockProviderClient` in
//! tests, without duplicating a single route.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use vox_config::OrchestratorConfig;
use vox_engine::{EngineConfig, PersistencePort, TransactionEngine};
use vox_provider::ProviderClient;
use vox_registry::Registry;
use vox_schemas::{BindingId, OwnerId, WorkerConfig};
use vox_worker::{OtpMailboxRegistry, RegistryOtpRendezvous, Worker, WorkerExitReason, WorkerTunables};

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    WorkerSpawned { binding_id: BindingId },
    WorkerExited { binding_id: BindingId, reason: String },
    CommandApplied { binding_id: BindingId, op: String },
    Heartbeat { ts_millis: i64 },
}

/// Static build metadata included in health / build-info responses.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
}

/// Which upstream server and credentials a `Worker` should use. The core
/// does not own the servers/accounts/bindings relational schema (a
/// Non-goal); the orchestrator is handed one shared upstream endpoint and a
/// `server_key` used only for the Provider Client's per-server concurrency
/// cap bookkeeping.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoint {
    pub server_key: String,
}

impl Default for UpstreamEndpoint {
    fn default() -> Self {
        Self { server_key: "default".to_string() }
    }
}

/// Cloneable (via `Arc`-wrapped fields) handle shared across every Axum
/// handler and every spawned worker task.
pub struct AppState<R, P, Pp>
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    pub registry: R,
    pub provider: P,
    pub persistence: Pp,
    pub otp: Arc<OtpMailboxRegistry>,
    pub owner_id: OwnerId,
    pub config: OrchestratorConfig,
    pub engine_config: EngineConfig,
    pub endpoint: UpstreamEndpoint,
    /// Workers this process has spawned and is still tracking. A `start`
    /// only spawns when this process has no live entry for the binding —
    /// the authoritative "who may spawn" decision is `acquire_lock`, this
    /// map is just bookkeeping so a duplicate `start` in the same process
    /// does not leak a second task.
    pub local_workers: Mutex<HashMap<BindingId, JoinHandle<WorkerExitReason>>>,
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
}

impl<R, P, Pp> AppState<R, P, Pp>
where
    R: Registry + Clone + Send + Sync + 'static,
    P: ProviderClient + Clone + Send + Sync + 'static,
    Pp: PersistencePort + Clone + Send + Sync + 'static,
{
    pub fn new(
        registry: R,
        provider: P,
        persistence: Pp,
        owner_id: OwnerId,
        config: OrchestratorConfig,
    ) -> Self {
        let (bus, _rx) = broadcast::channel(1024);
        let engine_config = EngineConfig {
            otp_timeout: config.otp_timeout(),
            ..EngineConfig::default()
        };
        Self {
            registry,
            provider,
            persistence,
            otp: Arc::new(OtpMailboxRegistry::new()),
            owner_id,
            engine_config,
            endpoint: UpstreamEndpoint::default(),
            config,
            local_workers: Mutex::new(HashMap::new()),
            bus,
            build: BuildInfo {
                service: "vox-orchestrator",
                version: env!("CARGO_PKG_VERSION"),
                git_hash: option_env!("VOX_GIT_HASH").unwrap_or("unknown"),
            },
        }
    }

    fn tunables(&self) -> WorkerTunables {
        WorkerTunables {
            lock_ttl: chrono::Duration::milliseconds(self.config.lock_ttl_ms as i64),
            server_key: self.endpoint.server_key.clone(),
            pause_poll_interval: std::time::Duration::from_millis(200),
        }
    }

    /// Spawns a worker for `binding_id` if this process does not already
    /// have one tracked. Returns `true` if a worker was (newly) spawned.
    /// Losing the lock race is not an error: the caller still reports `ok`
    /// to the operator because the binding is now owned by *some* worker.
    pub async fn spawn_worker_if_absent(&self, binding_id: BindingId) -> bool {
        let mut workers = self.local_workers.lock().await;
        if let Some(handle) = workers.get(&binding_id) {
            if !handle.is_finished() {
                return false;
            }
        }

        let engine = TransactionEngine::new(
            self.provider.clone(),
            self.persistence.clone(),
            RegistryOtpRendezvous::new(self.otp.clone()),
            self.engine_config.clone(),
        );
        let worker = Worker::new(
            binding_id,
            self.owner_id.clone(),
            self.registry.clone(),
            engine,
            self.tunables(),
        );

        let bus = self.bus.clone();
        let handle = tokio::spawn(async move {
            let reason = worker.run().await;
            let _ = bus.send(BusMsg::WorkerExited { binding_id, reason: format!("{reason:?}") });
            reason
        });
        workers.insert(binding_id, handle);
        let _ = self.bus.send(BusMsg::WorkerSpawned { binding_id });
        true
    }

    pub async fn publish_start_config(&self, binding_id: BindingId, cfg: WorkerConfig) {
        let _ = self
            .registry
            .enqueue_command(binding_id, vox_schemas::CommandKind::Start { cfg })
            .await;
    }
}

/// Spawn a background task that emits a heartbeat SSE tick every `interval`,
/// mirroring how this lineage's daemon keeps its SSE stream visibly alive
/// even with no worker activity.
pub fn spawn_bus_heartbeat(bus: broadcast::Sender<BusMsg>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
