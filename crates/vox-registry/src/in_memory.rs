use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use vox_schemas::{
    BindingId, Command, CommandKind, Heartbeat, Lock, OwnerId, RegistrySnapshotEntry,
    WorkerConfig, WorkerState, WorkerStatus,
};

use crate::{Registry, RegistryError};

#[derive(Default)]
struct BindingRow {
    state: Option<WorkerState>,
    config: Option<WorkerConfig>,
    lock: Option<Lock>,
    heartbeat: Option<Heartbeat>,
    commands: Vec<Command>,
    next_seq: u64,
}

/// In-process map behind a mutex, for tests — spec §4.1's explicitly
/// sanctioned implementation. The clock is injectable (`Fn() -> DateTime<Utc>`)
/// so lock-TTL behavior is deterministic under test without real sleeps,
/// matching the clock-injection idiom used for reconcile freshness elsewhere
/// in this lineage of code.
pub struct InMemoryRegistry<C = fn() -> DateTime<Utc>>
where
    C: Fn() -> DateTime<Utc> + Send + Sync,
{
    rows: StdMutex<HashMap<BindingId, BindingRow>>,
    clock: C,
}

impl InMemoryRegistry<fn() -> DateTime<Utc>> {
    pub fn new() -> Self {
        Self {
            rows: StdMutex::new(HashMap::new()),
            clock: Utc::now,
        }
    }
}

impl Default for InMemoryRegistry<fn() -> DateTime<Utc>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> InMemoryRegistry<C>
where
    C: Fn() -> DateTime<Utc> + Send + Sync,
{
    pub fn with_clock(clock: C) -> Self {
        Self {
            rows: StdMutex::new(HashMap::new()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

#[async_trait]
impl<C> Registry for InMemoryRegistry<C>
where
    C: Fn() -> DateTime<Utc> + Send + Sync,
{
    async fn get_state(&self, binding_id: BindingId) -> Result<WorkerState, RegistryError> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let row = rows.entry(binding_id).or_default();
        Ok(row
            .state
            .get_or_insert_with(|| WorkerState::idle(binding_id, now))
            .clone())
    }

    async fn set_state(
        &self,
        binding_id: BindingId,
        expected_owner: Option<&OwnerId>,
        new_state: WorkerStatus,
        reason: Option<&str>,
    ) -> Result<bool, RegistryError> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let row = rows.entry(binding_id).or_default();
        let current = row
            .state
            .get_or_insert_with(|| WorkerState::idle(binding_id, now));

        if current.owner.as_ref() != expected_owner {
            return Ok(false);
        }

        current.status = new_state;
        current.reason = reason.map(String::from);
        current.updated_at = now;
        Ok(true)
    }

    async fn force_state(
        &self,
        binding_id: BindingId,
        new_state: WorkerStatus,
        reason: Option<&str>,
        owner: Option<&OwnerId>,
    ) -> Result<(), RegistryError> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let row = rows.entry(binding_id).or_default();
        row.state = Some(WorkerState {
            binding_id,
            status: new_state,
            reason: reason.map(String::from),
            owner: owner.cloned(),
            updated_at: now,
        });
        Ok(())
    }

    async fn put_config(&self, binding_id: BindingId, cfg: &WorkerConfig) -> Result<(), RegistryError> {
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        rows.entry(binding_id).or_default().config = Some(cfg.clone());
        Ok(())
    }

    async fn get_config(&self, binding_id: BindingId) -> Result<Option<WorkerConfig>, RegistryError> {
        let rows = self.rows.lock().expect("registry mutex poisoned");
        Ok(rows.get(&binding_id).and_then(|r| r.config.clone()))
    }

    async fn acquire_lock(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, RegistryError> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let row = rows.entry(binding_id).or_default();

        let live = row
            .lock
            .as_ref()
            .map(|l| l.expires_at > now)
            .unwrap_or(false);

        if live {
            return Ok(false);
        }

        row.lock = Some(Lock {
            binding_id,
            owner: owner.clone(),
            expires_at: now + ttl,
        });
        Ok(true)
    }

    async fn refresh_lock(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, RegistryError> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let Some(row) = rows.get_mut(&binding_id) else {
            return Ok(false);
        };
        match row.lock.as_mut() {
            Some(l) if &l.owner == owner => {
                l.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, binding_id: BindingId, owner: &OwnerId) -> Result<bool, RegistryError> {
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let Some(row) = rows.get_mut(&binding_id) else {
            return Ok(false);
        };
        match &row.lock {
            Some(l) if &l.owner == owner => {
                row.lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, binding_id: BindingId) -> Result<Option<Lock>, RegistryError> {
        let now = self.now();
        let rows = self.rows.lock().expect("registry mutex poisoned");
        Ok(rows
            .get(&binding_id)
            .and_then(|r| r.lock.clone())
            .filter(|l| l.expires_at > now))
    }

    async fn heartbeat(
        &self,
        binding_id: BindingId,
        owner: &OwnerId,
        cycle: u64,
        last_action: &str,
    ) -> Result<bool, RegistryError> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let row = rows.entry(binding_id).or_default();

        // Gated on the *current* lock holder, not the previous heartbeat
        // owner, so a new owner can heartbeat immediately after taking over
        // an expired lock. No lock on record at all is not a mismatch.
        if let Some(lock) = &row.lock {
            if &lock.owner != owner {
                return Ok(false);
            }
        }

        row.heartbeat = Some(Heartbeat {
            binding_id,
            owner: owner.clone(),
            cycle,
            last_action: last_action.to_string(),
            updated_at: now,
        });
        Ok(true)
    }

    async fn get_heartbeat(&self, binding_id: BindingId) -> Result<Option<Heartbeat>, RegistryError> {
        let rows = self.rows.lock().expect("registry mutex poisoned");
        Ok(rows.get(&binding_id).and_then(|r| r.heartbeat.clone()))
    }

    async fn enqueue_command(
        &self,
        binding_id: BindingId,
        kind: CommandKind,
    ) -> Result<Command, RegistryError> {
        let now = self.now();
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let row = rows.entry(binding_id).or_default();
        row.next_seq += 1;
        let cmd = Command {
            binding_id,
            seq: row.next_seq,
            kind,
            issued_at: now,
        };
        row.commands.push(cmd.clone());
        Ok(cmd)
    }

    async fn drain_commands(&self, binding_id: BindingId) -> Result<Vec<Command>, RegistryError> {
        let mut rows = self.rows.lock().expect("registry mutex poisoned");
        let row = rows.entry(binding_id).or_default();
        Ok(std::mem::take(&mut row.commands))
    }

    async fn snapshot_all(&self) -> Result<Vec<RegistrySnapshotEntry>, RegistryError> {
        let now = self.now();
        let rows = self.rows.lock().expect("registry mutex poisoned");
        Ok(rows
            .iter()
            .filter_map(|(binding_id, row)| {
                row.state.clone().map(|state| RegistrySnapshotEntry {
                    binding_id: *binding_id,
                    state,
                    lock: row.lock.clone().filter(|l| l.expires_at > now),
                    heartbeat: row.heartbeat.clone(),
                })
            })
            .collect())
    }
}
