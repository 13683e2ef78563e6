//! The Registry: durable worker-state store + distributed single-holder
//! lock + heartbeat + command delivery.
//!
//! `Registry` is the mandated seam (spec §4.1): an in-process map behind a
//! mutex for tests (`InMemoryRegistry`), and a Postgres-backed implementation
//! for production (`PostgresRegistry`). Both must uphold the same two
//! invariants: single-holder lock with TTL, and per-key CAS.

use async_trait::async_trait;
use chrono::Duration;
use thiserror::Error;
use vox_schemas::{
    BindingId, Command, CommandKind, Heartbeat, Lock, OwnerId, RegistrySnapshotEntry,
    WorkerConfig, WorkerState, WorkerStatus,
};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryRegistry;
pub use postgres::PostgresRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error("registry internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Short machine-readable reason code, per the tagged-outcome requirement.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RegistryError::Unavailable(_) => "registry_unavailable",
            RegistryError::Internal(_) => "registry_internal",
        }
    }
}

/// All operations are scoped to a `binding_id`. Implementations must be
/// `Send + Sync` so a single registry instance can be shared across every
/// worker task.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_state(&self, binding_id: BindingId) -> Result<WorkerState, RegistryError>;

    /// Compare-and-set guarded by ownership. `None` as `expected_owner` means
    /// "no current owner required" (used by control-plane writes that target
    /// by state rather than by owner, e.g. transitioning `idle` -> `running`).
    async fn set_state(
        &self,
        binding_id: BindingId,
        expected_owner: Option<&OwnerId>,
        new_state: WorkerStatus,
        reason: Option<&str>,
    ) -> Result<bool, RegistryError>;

    /// Unconditional control-plane write: assigns state, reason, and owner
    /// regardless of the current owner. Used by `start` (assigns a fresh
    /// owner) and by `pause`/`resume`/`stop` (which target by current state,
    /// enforced by the caller before invoking this).
    async fn force_state(
        &self,
        binding_id: BindingId,
        new_state: WorkerStatus,
        reason: Option<&str>,
        owner: Option<&OwnerId>,
    ) -> Result<(), RegistryError>;

    async fn put_config(&self, binding_id: BindingId, cfg: &WorkerConfig) -> Result<(), RegistryError>;
    async fn get_config(&self, binding_id: BindingId) -> Result<Option<WorkerConfig>, RegistryError>;

    /// Succeeds only if no live lock exists; stores `(owner, expires_at)`.
    async fn acquire_lock(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, RegistryError>;

    /// Succeeds only if the current owner matches.
    async fn refresh_lock(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, RegistryError>;

    /// Succeeds only if the current owner matches (prevents releasing a
    /// lock stolen after TTL expiry).
    async fn release_lock(&self, binding_id: BindingId, owner: &OwnerId) -> Result<bool, RegistryError>;

    async fn get_lock(&self, binding_id: BindingId) -> Result<Option<Lock>, RegistryError>;

    /// Best-effort write; rejected (returns `false`) if `owner` mismatches.
    async fn heartbeat(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        cycle: u64,
        last_action: &str,
    ) -> Result<bool, RegistryError>;

    async fn get_heartbeat(&self, binding_id: BindingId) -> Result<Option<Heartbeat>, RegistryError>;

    /// At-least-once delivery; commands carry a monotonically increasing
    /// sequence number per binding so replays are detectable.
    async fn enqueue_command(
        &self,
        binding_id: BindingId,
        kind: CommandKind,
    ) -> Result<Command, RegistryError>;

    async fn drain_commands(&self, binding_id: BindingId) -> Result<Vec<Command>, RegistryError>;

    /// Used by monitoring; consistency is per-entry, not global.
    async fn snapshot_all(&self) -> Result<Vec<RegistrySnapshotEntry>, RegistryError>;
}

/// Lets a single `Registry` instance be shared (via `Arc`) across every
/// worker task and the orchestrator's own handlers without each caller
/// needing to know whether it holds the concrete type or a shared handle.
#[async_trait]
impl<T: Registry + ?Sized> Registry for std::sync::Arc<T> {
    async fn get_state(&self, binding_id: BindingId) -> Result<WorkerState, RegistryError> {
        (**self).get_state(binding_id).await
    }

    async fn set_state(
        &self,
        binding_id: BindingId,
        expected_owner: Option<&OwnerId>,
        new_state: WorkerStatus,
        reason: Option<&str>,
    ) -> Result<bool, RegistryError> {
        (**self).set_state(binding_id, expected_owner, new_state, reason).await
    }

    async fn force_state(
        &self,
        binding_id: BindingId,
        new_state: WorkerStatus,
        reason: Option<&str>,
        owner: Option<&OwnerId>,
    ) -> Result<(), RegistryError> {
        (**self).force_state(binding_id, new_state, reason, owner).await
    }

    async fn put_config(&self, binding_id: BindingId, cfg: &WorkerConfig) -> Result<(), RegistryError> {
        (**self).put_config(binding_id, cfg).await
    }

    async fn get_config(&self, binding_id: BindingId) -> Result<Option<WorkerConfig>, RegistryError> {
        (**self).get_config(binding_id).await
    }

    async fn acquire_lock(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, RegistryError> {
        (**self).acquire_lock(binding_id, owner, ttl).await
    }

    async fn refresh_lock(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, RegistryError> {
        (**self).refresh_lock(binding_id, owner, ttl).await
    }

    async fn release_lock(&self, binding_id: BindingId, owner: &OwnerId) -> Result<bool, RegistryError> {
        (**self).release_lock(binding_id, owner).await
    }

    async fn get_lock(&self, binding_id: BindingId) -> Result<Option<Lock>, RegistryError> {
        (**self).get_lock(binding_id).await
    }

    async fn heartbeat(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        cycle: u64,
        last_action: &str,
    ) -> Result<bool, RegistryError> {
        (**self).heartbeat(binding_id, owner, cycle, last_action).await
    }

    async fn get_heartbeat(&self, binding_id: BindingId) -> Result<Option<Heartbeat>, RegistryError> {
        (**self).get_heartbeat(binding_id).await
    }

    async fn enqueue_command(
        &self,
        binding_id: BindingId,
        kind: CommandKind,
    ) -> Result<Command, RegistryError> {
        (**self).enqueue_command(binding_id, kind).await
    }

    async fn drain_commands(&self, binding_id: BindingId) -> Result<Vec<Command>, RegistryError> {
        (**self).drain_commands(binding_id).await
    }

    async fn snapshot_all(&self) -> Result<Vec<RegistrySnapshotEntry>, RegistryError> {
        (**self).snapshot_all().await
    }
}
