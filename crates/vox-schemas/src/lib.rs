use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque stable identifier of a binding: the pairing of one consumable
/// credential with one upstream server. Partition key for all worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingId(pub Uuid);

impl BindingId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BindingId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Process identity currently holding a binding's lock. Scoped uniquely per
/// `(host, pid, nonce)` so that a restarted process never collides with its
/// own previous incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(host: &str, pid: u32, nonce: &str) -> Self {
        Self(format!("{host}:{pid}:{nonce}"))
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// The durable, replica-visible snapshot of one binding's worker. Exactly
/// one `WorkerState` exists per `BindingId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub binding_id: BindingId,
    pub status: WorkerStatus,
    pub reason: Option<String>,
    pub owner: Option<OwnerId>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerState {
    pub fn idle(binding_id: BindingId, now: DateTime<Utc>) -> Self {
        Self {
            binding_id,
            status: WorkerStatus::Idle,
            reason: None,
            owner: None,
            updated_at: now,
        }
    }
}

/// Parameters of the per-binding loop. Immutable for the lifetime of a
/// worker run; a new `start` command replaces the whole struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Gap between iterations, in milliseconds. Valid range 100-10000.
    pub interval_ms: u64,
    /// Bounded status re-polls per cycle. Valid range 0-10.
    pub max_retry_status: u32,
    /// Backoff after an exhausted-retry transport failure. Valid range 0-30000.
    pub cooldown_on_error_ms: u64,
    pub product_id: String,
    pub email: String,
    /// Minimum acceptable pre-transaction balance.
    pub limit_harga: i64,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(100..=10_000).contains(&self.interval_ms) {
            return Err(format!("interval_ms out of range: {}", self.interval_ms));
        }
        if self.max_retry_status > 10 {
            return Err(format!(
                "max_retry_status out of range: {}",
                self.max_retry_status
            ));
        }
        if self.cooldown_on_error_ms > 30_000 {
            return Err(format!(
                "cooldown_on_error_ms out of range: {}",
                self.cooldown_on_error_ms
            ));
        }
        Ok(())
    }
}

/// `(binding_id, owner, expires_at)`. Exactly one holder at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub binding_id: BindingId,
    pub owner: OwnerId,
    pub expires_at: DateTime<Utc>,
}

/// `(binding_id, owner, cycle, last_action, updated_at)`. `cycle` is
/// monotonic per owner, incremented once per completed iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub binding_id: BindingId,
    pub owner: OwnerId,
    pub cycle: u64,
    pub last_action: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    Start { cfg: WorkerConfig },
    Pause { reason: Option<String> },
    Resume,
    Stop { reason: Option<String> },
}

/// One control-plane command targeted at a single binding. Delivered
/// at-least-once; `seq` lets a receiver detect replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub binding_id: BindingId,
    pub seq: u64,
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Processing,
    Paused,
    Resumed,
    Sukses,
    Suspect,
    Gagal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OtpStatus {
    Pending,
    Success,
    Failed,
}

/// Owned by the persistence port; the core writes it through a narrow
/// interface and never reads it back to decide future behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub binding_id: BindingId,
    pub status: TransactionStatus,
    pub balance_start: i64,
    pub balance_end: Option<i64>,
    pub trx_id: Option<String>,
    pub voucher_code: Option<String>,
    pub error_message: Option<String>,
    pub otp_required: bool,
    pub otp_status: Option<OtpStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-binding snapshot as returned by `Registry::snapshot_all`. Consistency
/// is per-entry, not global across the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshotEntry {
    pub binding_id: BindingId,
    pub state: WorkerState,
    pub lock: Option<Lock>,
    pub heartbeat: Option<Heartbeat>,
}
