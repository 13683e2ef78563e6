// crates/vox-db/src/lib.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use vox_schemas::{
    BindingId, Command, CommandKind, Heartbeat, Lock, OtpStatus, OwnerId, RegistrySnapshotEntry,
    TransactionRecord, TransactionStatus, WorkerConfig, WorkerState, WorkerStatus,
};

pub const ENV_DB_URL: &str = "ORCH_DATABASE_URL";

/// Connect to Postgres using ORCH_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper: connect using ORCH_DATABASE_URL and ensure migrations are applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='orch_worker_state'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_orchestration_tables: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orchestration_tables: bool,
}

fn status_to_str(s: WorkerStatus) -> &'static str {
    match s {
        WorkerStatus::Idle => "idle",
        WorkerStatus::Running => "running",
        WorkerStatus::Paused => "paused",
        WorkerStatus::Stopped => "stopped",
    }
}

fn status_from_str(s: &str) -> Result<WorkerStatus> {
    Ok(match s {
        "idle" => WorkerStatus::Idle,
        "running" => WorkerStatus::Running,
        "paused" => WorkerStatus::Paused,
        "stopped" => WorkerStatus::Stopped,
        other => anyhow::bail!("unknown worker status in db: {other}"),
    })
}

/// Fetch the current `WorkerState`, creating a lazy `idle` row on first read
/// if none exists yet (mirrors the spec's "created lazily on first command").
pub async fn get_or_create_worker_state(pool: &PgPool, binding_id: BindingId) -> Result<WorkerState> {
    let row = sqlx::query(
        r#"
        select status, reason, owner, updated_at_utc
        from orch_worker_state
        where binding_id = $1
        "#,
    )
    .bind(binding_id.0)
    .fetch_optional(pool)
    .await
    .context("get_or_create_worker_state select failed")?;

    if let Some(row) = row {
        let status: String = row.try_get("status")?;
        let reason: Option<String> = row.try_get("reason")?;
        let owner: Option<String> = row.try_get("owner")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at_utc")?;
        return Ok(WorkerState {
            binding_id,
            status: status_from_str(&status)?,
            reason,
            owner: owner.map(OwnerId),
            updated_at,
        });
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        insert into orch_worker_state (binding_id, status, reason, owner, updated_at_utc)
        values ($1, 'idle', null, null, $2)
        on conflict (binding_id) do nothing
        "#,
    )
    .bind(binding_id.0)
    .bind(now)
    .execute(pool)
    .await
    .context("get_or_create_worker_state insert failed")?;

    Ok(WorkerState::idle(binding_id, now))
}

/// Compare-and-set on `owner`. Only a caller whose `expected_owner` matches
/// the row's current `owner` (or the row has no owner when `expected_owner`
/// is `None`, e.g. control-plane writes to `stopped`) may transition it.
/// Returns `false` (no effect) on mismatch.
pub async fn set_worker_state(
    pool: &PgPool,
    binding_id: BindingId,
    expected_owner: Option<&OwnerId>,
    new_status: WorkerStatus,
    reason: Option<&str>,
) -> Result<bool> {
    get_or_create_worker_state(pool, binding_id).await?;

    let expected = expected_owner.map(|o| o.0.as_str());
    let result = sqlx::query(
        r#"
        update orch_worker_state
           set status = $2,
               reason = $3,
               owner = case when $2 in ('running') then owner else owner end,
               updated_at_utc = now()
         where binding_id = $1
           and owner is not distinct from $4
        "#,
    )
    .bind(binding_id.0)
    .bind(status_to_str(new_status))
    .bind(reason)
    .bind(expected)
    .execute(pool)
    .await
    .context("set_worker_state update failed")?;

    Ok(result.rows_affected() == 1)
}

/// Control-plane write that is allowed regardless of current owner (start
/// assigns a fresh owner, stop/pause/resume target by state not by owner).
pub async fn force_worker_state(
    pool: &PgPool,
    binding_id: BindingId,
    new_status: WorkerStatus,
    reason: Option<&str>,
    owner: Option<&OwnerId>,
) -> Result<()> {
    get_or_create_worker_state(pool, binding_id).await?;

    sqlx::query(
        r#"
        update orch_worker_state
           set status = $2,
               reason = $3,
               owner = $4,
               updated_at_utc = now()
         where binding_id = $1
        "#,
    )
    .bind(binding_id.0)
    .bind(status_to_str(new_status))
    .bind(reason)
    .bind(owner.map(|o| o.0.as_str()))
    .execute(pool)
    .await
    .context("force_worker_state update failed")?;

    Ok(())
}

pub async fn put_worker_config(pool: &PgPool, binding_id: BindingId, cfg: &WorkerConfig) -> Result<()> {
    sqlx::query(
        r#"
        insert into orch_worker_config
            (binding_id, interval_ms, max_retry_status, cooldown_on_error_ms, product_id, email, limit_harga, updated_at_utc)
        values ($1, $2, $3, $4, $5, $6, $7, now())
        on conflict (binding_id) do update
            set interval_ms          = excluded.interval_ms,
                max_retry_status     = excluded.max_retry_status,
                cooldown_on_error_ms = excluded.cooldown_on_error_ms,
                product_id           = excluded.product_id,
                email                = excluded.email,
                limit_harga          = excluded.limit_harga,
                updated_at_utc       = excluded.updated_at_utc
        "#,
    )
    .bind(binding_id.0)
    .bind(cfg.interval_ms as i64)
    .bind(cfg.max_retry_status as i32)
    .bind(cfg.cooldown_on_error_ms as i64)
    .bind(&cfg.product_id)
    .bind(&cfg.email)
    .bind(cfg.limit_harga)
    .execute(pool)
    .await
    .context("put_worker_config failed")?;
    Ok(())
}

pub async fn get_worker_config(pool: &PgPool, binding_id: BindingId) -> Result<Option<WorkerConfig>> {
    let row = sqlx::query(
        r#"
        select interval_ms, max_retry_status, cooldown_on_error_ms, product_id, email, limit_harga
        from orch_worker_config
        where binding_id = $1
        "#,
    )
    .bind(binding_id.0)
    .fetch_optional(pool)
    .await
    .context("get_worker_config failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(WorkerConfig {
        interval_ms: row.try_get::<i64, _>("interval_ms")? as u64,
        max_retry_status: row.try_get::<i32, _>("max_retry_status")? as u32,
        cooldown_on_error_ms: row.try_get::<i64, _>("cooldown_on_error_ms")? as u64,
        product_id: row.try_get("product_id")?,
        email: row.try_get("email")?,
        limit_harga: row.try_get("limit_harga")?,
    }))
}

/// Succeeds only if no live (non-expired) lock exists for the binding.
/// Atomic via `ON CONFLICT ... DO UPDATE ... WHERE` guarded by expiry.
pub async fn acquire_lock(
    pool: &PgPool,
    binding_id: BindingId,
    owner: &OwnerId,
    ttl: chrono::Duration,
) -> Result<bool> {
    let expires_at = Utc::now() + ttl;

    let row: Option<(String,)> = sqlx::query_as(
        r#"
        insert into orch_lock (binding_id, owner, expires_at_utc)
        values ($1, $2, $3)
        on conflict (binding_id) do update
            set owner = excluded.owner,
                expires_at_utc = excluded.expires_at_utc
            where orch_lock.expires_at_utc < now()
        returning owner
        "#,
    )
    .bind(binding_id.0)
    .bind(&owner.0)
    .bind(expires_at)
    .fetch_optional(pool)
    .await
    .context("acquire_lock failed")?;

    Ok(row.map(|(o,)| o == owner.0).unwrap_or(false))
}

/// Succeeds only if `owner` currently holds the lock.
pub async fn refresh_lock(
    pool: &PgPool,
    binding_id: BindingId,
    owner: &OwnerId,
    ttl: chrono::Duration,
) -> Result<bool> {
    let expires_at = Utc::now() + ttl;

    let result = sqlx::query(
        r#"
        update orch_lock
           set expires_at_utc = $3
         where binding_id = $1
           and owner = $2
        "#,
    )
    .bind(binding_id.0)
    .bind(&owner.0)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("refresh_lock failed")?;

    Ok(result.rows_affected() == 1)
}

/// Succeeds only if `owner` currently holds the lock (prevents releasing a
/// lock stolen after TTL expiry by a different owner).
pub async fn release_lock(pool: &PgPool, binding_id: BindingId, owner: &OwnerId) -> Result<bool> {
    let result = sqlx::query(
        r#"
        delete from orch_lock
         where binding_id = $1
           and owner = $2
        "#,
    )
    .bind(binding_id.0)
    .bind(&owner.0)
    .execute(pool)
    .await
    .context("release_lock failed")?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_lock(pool: &PgPool, binding_id: BindingId) -> Result<Option<Lock>> {
    let row = sqlx::query(
        r#"
        select owner, expires_at_utc
        from orch_lock
        where binding_id = $1
          and expires_at_utc >= now()
        "#,
    )
    .bind(binding_id.0)
    .fetch_optional(pool)
    .await
    .context("get_lock failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(Lock {
        binding_id,
        owner: OwnerId(row.try_get("owner")?),
        expires_at: row.try_get("expires_at_utc")?,
    }))
}

/// Best-effort heartbeat write; rejected (returns false) if `owner` mismatches
/// the binding's current lock holder in `orch_lock` (or there is no lock row
/// at all, in which case this call is let through).
pub async fn write_heartbeat(
    pool: &PgPool,
    binding_id: BindingId,
    owner: &OwnerId,
    cycle: u64,
    last_action: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        insert into orch_heartbeat (binding_id, owner, cycle, last_action, updated_at_utc)
        select $1, $2, $3, $4, now()
        where not exists (
            select 1 from orch_lock l where l.binding_id = $1 and l.owner <> $2
        )
        on conflict (binding_id) do update
            set owner = excluded.owner,
                cycle = excluded.cycle,
                last_action = excluded.last_action,
                updated_at_utc = excluded.updated_at_utc
        "#,
    )
    .bind(binding_id.0)
    .bind(&owner.0)
    .bind(cycle as i64)
    .bind(last_action)
    .execute(pool)
    .await
    .context("write_heartbeat failed")?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_heartbeat(pool: &PgPool, binding_id: BindingId) -> Result<Option<Heartbeat>> {
    let row = sqlx::query(
        r#"
        select owner, cycle, last_action, updated_at_utc
        from orch_heartbeat
        where binding_id = $1
        "#,
    )
    .bind(binding_id.0)
    .fetch_optional(pool)
    .await
    .context("get_heartbeat failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(Heartbeat {
        binding_id,
        owner: OwnerId(row.try_get("owner")?),
        cycle: row.try_get::<i64, _>("cycle")? as u64,
        last_action: row.try_get("last_action")?,
        updated_at: row.try_get("updated_at_utc")?,
    }))
}

/// Enqueue a command, assigning the next monotonic `seq` for this binding
/// inside a row-locked transaction so concurrent enqueues never collide.
pub async fn enqueue_command(pool: &PgPool, binding_id: BindingId, kind: CommandKind) -> Result<Command> {
    let mut tx = pool.begin().await.context("enqueue_command begin failed")?;

    // Row-lock an advisory marker by locking any existing rows for this binding;
    // absent rows simply proceed (first command for the binding).
    sqlx::query(
        r#"select command_id from orch_command where binding_id = $1 order by seq desc limit 1 for update"#,
    )
    .bind(binding_id.0)
    .fetch_optional(&mut *tx)
    .await
    .context("enqueue_command lock failed")?;

    let (next_seq,): (i64,) = sqlx::query_as(
        r#"select coalesce(max(seq), 0) + 1 from orch_command where binding_id = $1"#,
    )
    .bind(binding_id.0)
    .fetch_one(&mut *tx)
    .await
    .context("enqueue_command seq query failed")?;

    let issued_at = Utc::now();
    let payload = serde_json::to_value(&kind).context("command kind serialize failed")?;

    sqlx::query(
        r#"
        insert into orch_command (binding_id, seq, payload_json, issued_at_utc, applied)
        values ($1, $2, $3, $4, false)
        "#,
    )
    .bind(binding_id.0)
    .bind(next_seq)
    .bind(&payload)
    .bind(issued_at)
    .execute(&mut *tx)
    .await
    .context("enqueue_command insert failed")?;

    tx.commit().await.context("enqueue_command commit failed")?;

    Ok(Command {
        binding_id,
        seq: next_seq as u64,
        kind,
        issued_at,
    })
}

/// Atomically claim every unapplied command for a binding in FIFO (`seq`)
/// order, marking them applied in the same statement, mirroring the
/// outbox claim-batch pattern used for dispatch elsewhere in this workspace.
pub async fn drain_commands(pool: &PgPool, binding_id: BindingId) -> Result<Vec<Command>> {
    let rows = sqlx::query(
        r#"
        with to_drain as (
            select command_id
            from orch_command
            where binding_id = $1
              and not applied
            order by seq asc
            for update skip locked
        )
        update orch_command
           set applied = true
         where command_id in (select command_id from to_drain)
        returning binding_id, seq, payload_json, issued_at_utc
        "#,
    )
    .bind(binding_id.0)
    .fetch_all(pool)
    .await
    .context("drain_commands failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let payload: Value = row.try_get("payload_json")?;
        let kind: CommandKind = serde_json::from_value(payload).context("command kind deserialize failed")?;
        out.push(Command {
            binding_id,
            seq: row.try_get::<i64, _>("seq")? as u64,
            kind,
            issued_at: row.try_get("issued_at_utc")?,
        });
    }
    Ok(out)
}

/// Used by monitoring; consistency is per-entry, not global across bindings.
pub async fn snapshot_all(pool: &PgPool) -> Result<Vec<RegistrySnapshotEntry>> {
    let rows = sqlx::query(
        r#"select binding_id, status, reason, owner, updated_at_utc from orch_worker_state"#,
    )
    .fetch_all(pool)
    .await
    .context("snapshot_all state query failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let binding_id = BindingId(row.try_get("binding_id")?);
        let status: String = row.try_get("status")?;
        let state = WorkerState {
            binding_id,
            status: status_from_str(&status)?,
            reason: row.try_get("reason")?,
            owner: row.try_get::<Option<String>, _>("owner")?.map(OwnerId),
            updated_at: row.try_get("updated_at_utc")?,
        };
        let lock = get_lock(pool, binding_id).await?;
        let heartbeat = get_heartbeat(pool, binding_id).await?;
        out.push(RegistrySnapshotEntry {
            binding_id,
            state,
            lock,
            heartbeat,
        });
    }
    Ok(out)
}

fn trx_status_to_str(s: TransactionStatus) -> &'static str {
    match s {
        TransactionStatus::Processing => "PROCESSING",
        TransactionStatus::Paused => "PAUSED",
        TransactionStatus::Resumed => "RESUMED",
        TransactionStatus::Sukses => "SUKSES",
        TransactionStatus::Suspect => "SUSPECT",
        TransactionStatus::Gagal => "GAGAL",
    }
}

fn otp_status_to_str(s: OtpStatus) -> &'static str {
    match s {
        OtpStatus::Pending => "PENDING",
        OtpStatus::Success => "SUCCESS",
        OtpStatus::Failed => "FAILED",
    }
}

/// Idempotent on `(binding_id, trx_id)`: a later write with the same
/// `trx_id` updates the existing row rather than creating a duplicate.
/// Records with no `trx_id` (the precheck synthetic record) always insert
/// a fresh row, since the partial unique index only covers non-null trx_id.
pub async fn upsert_transaction(pool: &PgPool, record: &TransactionRecord) -> Result<()> {
    sqlx::query(
        r#"
        insert into orch_transaction
            (id, binding_id, trx_id, status, balance_start, balance_end,
             voucher_code, error_message, otp_required, otp_status, updated_at_utc)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
        on conflict (binding_id, trx_id) where trx_id is not null do update
            set status         = excluded.status,
                balance_end    = excluded.balance_end,
                voucher_code   = excluded.voucher_code,
                error_message  = excluded.error_message,
                otp_required   = excluded.otp_required,
                otp_status     = excluded.otp_status,
                updated_at_utc = now()
        "#,
    )
    .bind(record.id)
    .bind(record.binding_id.0)
    .bind(&record.trx_id)
    .bind(trx_status_to_str(record.status))
    .bind(record.balance_start)
    .bind(record.balance_end)
    .bind(&record.voucher_code)
    .bind(&record.error_message)
    .bind(record.otp_required)
    .bind(record.otp_status.map(otp_status_to_str))
    .execute(pool)
    .await
    .context("upsert_transaction failed")?;
    Ok(())
}

/// Snapshot write (final `balance_end` + terminal status) is the same
/// idempotent upsert as `upsert_transaction`; kept as a distinct name at the
/// persistence-port boundary because callers reach it at a different point
/// in the cycle (see the Transaction Engine's step 6).
pub async fn upsert_snapshot(pool: &PgPool, record: &TransactionRecord) -> Result<()> {
    upsert_transaction(pool, record).await
}

/// Adapts the raw `upsert_transaction`/`upsert_snapshot` functions to the
/// Engine's `PersistencePort` seam. Holds a pool; cheap to clone and share
/// across every worker task in the process.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl vox_engine::PersistencePort for PostgresPersistence {
    async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<()> {
        upsert_transaction(&self.pool, record).await
    }

    async fn upsert_snapshot(&self, record: &TransactionRecord) -> Result<()> {
        upsert_snapshot(&self.pool, record).await
    }
}

#[cfg(test)]
mod tests {
    // Real scenario coverage lives in tests/ and requires ORCH_TEST_DATABASE_URL;
    // see tests/scenario_lock_single_holder.rs.
}
