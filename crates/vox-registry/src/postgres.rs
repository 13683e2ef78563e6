use async_trait::async_trait;
use chrono::Duration;
use sqlx::PgPool;
use vox_schemas::{
    BindingId, Command, CommandKind, Heartbeat, Lock, OwnerId, RegistrySnapshotEntry,
    WorkerConfig, WorkerState, WorkerStatus,
};

use crate::{Registry, RegistryError};

/// Production `Registry` backed by Postgres via `vox-db`'s CAS/outbox-style
/// SQL functions. Holds a connection pool; cheap to clone and share across
/// every worker task.
#[derive(Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_err(e: anyhow::Error) -> RegistryError {
    RegistryError::Internal(e.to_string())
}

#[async_trait]
impl Registry for PostgresRegistry {
    async fn get_state(&self, binding_id: BindingId) -> Result<WorkerState, RegistryError> {
        vox_db::get_or_create_worker_state(&self.pool, binding_id)
            .await
            .map_err(map_err)
    }

    async fn set_state(
        &self,
        binding_id: BindingId,
        expected_owner: Option<&OwnerId>,
        new_state: WorkerStatus,
        reason: Option<&str>,
    ) -> Result<bool, RegistryError> {
        vox_db::set_worker_state(&self.pool, binding_id, expected_owner, new_state, reason)
            .await
            .map_err(map_err)
    }

    async fn force_state(
        &self,
        binding_id: BindingId,
        new_state: WorkerStatus,
        reason: Option<&str>,
        owner: Option<&OwnerId>,
    ) -> Result<(), RegistryError> {
        vox_db::force_worker_state(&self.pool, binding_id, new_state, reason, owner)
            .await
            .map_err(map_err)
    }

    async fn put_config(&self, binding_id: BindingId, cfg: &WorkerConfig) -> Result<(), RegistryError> {
        vox_db::put_worker_config(&self.pool, binding_id, cfg)
            .await
            .map_err(map_err)
    }

    async fn get_config(&self, binding_id: BindingId) -> Result<Option<WorkerConfig>, RegistryError> {
        vox_db::get_worker_config(&self.pool, binding_id)
            .await
            .map_err(map_err)
    }

    async fn acquire_lock(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, RegistryError> {
        vox_db::acquire_lock(&self.pool, binding_id, owner, ttl)
            .await
            .map_err(map_err)
    }

    async fn refresh_lock(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, RegistryError> {
        vox_db::refresh_lock(&self.pool, binding_id, owner, ttl)
            .await
            .map_err(map_err)
    }

    async fn release_lock(&self, binding_id: BindingId, owner: &OwnerId) -> Result<bool, RegistryError> {
        vox_db::release_lock(&self.pool, binding_id, owner)
            .await
            .map_err(map_err)
    }

    async fn get_lock(&self, binding_id: BindingId) -> Result<Option<Lock>, RegistryError> {
        vox_db::get_lock(&self.pool, binding_id).await.map_err(map_err)
    }

    async fn heartbeat(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        cycle: u64,
        last_action: &str,
    ) -> Result<bool, RegistryError> {
        vox_db::write_heartbeat(&self.pool, binding_id, owner, cycle, last_action)
            .await
            .map_err(map_err)
    }

    async fn get_heartbeat(&self, binding_id: BindingId) -> Result<Option<Heartbeat>, RegistryError> {
        vox_db::get_heartbeat(&self.pool, binding_id).await.map_err(map_err)
    }

    async fn enqueue_command(
        &self,
        binding_id: BindingId,
        kind: CommandKind,
    ) -> Result<Command, RegistryError> {
        vox_db::enqueue_command(&self.pool, binding_id, kind)
            .await
            .map_err(map_err)
    }

    async fn drain_commands(&self, binding_id: BindingId) -> Result<Vec<Command>, RegistryError> {
        vox_db::drain_commands(&self.pool, binding_id).await.map_err(map_err)
    }

    async fn snapshot_all(&self) -> Result<Vec<RegistrySnapshotEntry>, RegistryError> {
        vox_db::snapshot_all(&self.pool).await.map_err(map_err)
    }
}
