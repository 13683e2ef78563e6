//! Worker: the per-binding loop that consumes state from the Registry,
//! invokes the Transaction Engine, evaluates stop/pause conditions,
//! heartbeats, and releases its lock on exit.
//!
//! The lifecycle is `starting -> running <-> paused -> stopping -> exited`
//! (spec §4.4). Transitions between `running` and `paused` are driven by
//! `WorkerState` reads, not by an in-process flag — a second replica's
//! write to the Registry is what actually moves this worker, mirroring the
//! "state is data, not code" design note. The explicit-transition-table
//! shape here is grounded on this lineage's OMS order state machine, with
//! one departure: that state machine is `apply()`-driven by discrete
//! events, while a worker's phase is driven by polling the Registry each
//! iteration, per the spec's stop-at-loop-boundary discipline.

use std::time::{Duration as StdDuration, Instant};

use chrono::Duration as ChronoDuration;
use tracing::{info, warn};

use vox_engine::{CycleOutcome, OtpRendezvous as EngineOtpRendezvous, PersistencePort, TransactionEngine};
use vox_provider::ProviderClient;
use vox_registry::Registry;
use vox_schemas::{BindingId, CommandKind, OwnerId, WorkerConfig, WorkerStatus};

pub mod otp;
pub use otp::{OtpMailbox, OtpMailboxRegistry, RegistryOtpRendezvous};

/// Why a worker's `run()` returned. Every variant corresponds to one of the
/// exit paths the spec enumerates in §4.4 and §7's error table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExitReason {
    /// `stopped` was observed at step 1 (control-plane write, or this
    /// worker's own hard-stop write on a prior iteration).
    ControlPlaneStop,
    /// The Engine reported a `STOP_CONDITION` (e.g. insufficient balance).
    HardStop(String),
    /// Could not acquire the lock at startup, or lost it (refresh failed)
    /// mid-run. In the latter case another owner now holds it; this worker
    /// exits without attempting to release.
    LockLost,
    /// The Registry was unreachable for longer than the lock TTL.
    RegistryUnavailableTooLong,
}

/// Tunables the Worker owns directly (as opposed to `WorkerConfig`, which
/// is swapped out wholesale by the next `start` command).
#[derive(Debug, Clone)]
pub struct WorkerTunables {
    pub lock_ttl: ChronoDuration,
    /// Identifies the upstream server for the Provider Client's per-server
    /// concurrency cap; opaque to the Worker otherwise.
    pub server_key: String,
    /// How long to sleep between re-reads while paused.
    pub pause_poll_interval: StdDuration,
}

pub struct Worker<R, P, Pp, O>
where
    R: Registry,
    P: ProviderClient,
    Pp: PersistencePort,
    O: EngineOtpRendezvous,
{
    binding_id: BindingId,
    owner: OwnerId,
    registry: R,
    engine: TransactionEngine<P, Pp, O>,
    tunables: WorkerTunables,
}

impl<R, P, Pp, O> Worker<R, P, Pp, O>
where
    R: Registry,
    P: ProviderClient,
    Pp: PersistencePort,
    O: EngineOtpRendezvous,
{
    pub fn new(
        binding_id: BindingId,
        owner: OwnerId,
        registry: R,
        engine: TransactionEngine<P, Pp, O>,
        tunables: WorkerTunables,
    ) -> Self {
        Self { binding_id, owner, registry, engine, tunables }
    }

    /// Runs the full lifecycle to completion. Consumes `self`: a worker is
    /// a one-shot task, spawned fresh by the Orchestrator on every `start`.
    pub async fn run(mut self) -> WorkerExitReason {
        if !self
            .registry
            .acquire_lock(self.binding_id, &self.owner, self.tunables.lock_ttl)
            .await
            .unwrap_or(false)
        {
            info!(binding = %self.binding_id, "worker_lock_not_acquired_at_startup");
            return WorkerExitReason::LockLost;
        }

        let mut cycle: u64 = 0;
        let mut cached_cfg: Option<WorkerConfig> =
            self.registry.get_config(self.binding_id).await.ok().flatten();
        let mut registry_unavailable_since: Option<Instant> = None;
        let mut pending_stop = false;

        loop {
            let iter_start = Instant::now();

            // Step 1: read WorkerState.
            let state = self.registry.get_state(self.binding_id).await;
            let observed_status = match &state {
                Ok(s) => {
                    registry_unavailable_since = None;
                    Some(s.status)
                }
                Err(e) => {
                    warn!(binding = %self.binding_id, error = %e, "registry_unavailable_treating_as_running");
                    let since = *registry_unavailable_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > chrono_duration_to_std(self.tunables.lock_ttl) {
                        return WorkerExitReason::RegistryUnavailableTooLong;
                    }
                    None
                }
            };

            if pending_stop || observed_status == Some(WorkerStatus::Stopped) {
                let _ = self.registry.release_lock(self.binding_id, &self.owner).await;
                info!(binding = %self.binding_id, "worker_exiting_on_control_plane_stop");
                return WorkerExitReason::ControlPlaneStop;
            }

            // Step 2: paused -> sleep and re-read, never run the Engine.
            if observed_status == Some(WorkerStatus::Paused) {
                tokio::time::sleep(self.tunables.pause_poll_interval).await;
                continue;
            }

            // Step 3: acquire-or-refresh lock.
            let refreshed = self
                .registry
                .refresh_lock(self.binding_id, &self.owner, self.tunables.lock_ttl)
                .await
                .unwrap_or(false);
            if !refreshed {
                warn!(binding = %self.binding_id, owner = %self.owner, "lock_refresh_failed_exiting");
                // Another owner now holds the lock; do not attempt release.
                return WorkerExitReason::LockLost;
            }

            if let Ok(Some(cfg)) = self.registry.get_config(self.binding_id).await {
                cached_cfg = Some(cfg);
            }
            let Some(cfg) = cached_cfg.clone() else {
                // No config published yet for this binding; nothing to run.
                tokio::time::sleep(self.tunables.pause_poll_interval).await;
                continue;
            };

            // Step 4: invoke Engine with a per-cycle deadline of 2x the
            // worst expected cycle time, approximated here as 2x interval.
            let per_cycle_deadline = StdDuration::from_millis(cfg.interval_ms.saturating_mul(2));
            let last_action = match tokio::time::timeout(
                per_cycle_deadline,
                self.engine.run_cycle(self.binding_id, &self.tunables.server_key, &cfg),
            )
            .await
            {
                Ok(Ok(CycleOutcome { terminal_status, stop_condition: Some(stop) })) => {
                    // Step 6: hard stop.
                    let _ = self
                        .registry
                        .force_state(self.binding_id, WorkerStatus::Stopped, Some(&stop.reason), None)
                        .await;
                    let _ = self.registry.release_lock(self.binding_id, &self.owner).await;
                    info!(
                        binding = %self.binding_id,
                        status = ?terminal_status,
                        reason = %stop.reason,
                        "worker_hard_stop"
                    );
                    return WorkerExitReason::HardStop(stop.reason);
                }
                Ok(Ok(CycleOutcome { terminal_status, stop_condition: None })) => {
                    format!("cycle_complete:{terminal_status:?}")
                }
                Ok(Err(e)) => {
                    warn!(binding = %self.binding_id, error = %e, reason = e.reason_code(), "cycle_error");
                    tokio::time::sleep(StdDuration::from_millis(cfg.cooldown_on_error_ms)).await;
                    format!("cycle_error:{}", e.reason_code())
                }
                Err(_elapsed) => {
                    warn!(binding = %self.binding_id, "cycle_deadline_exceeded");
                    "cycle_deadline_exceeded".to_string()
                }
            };

            // Step 7: heartbeat.
            cycle += 1;
            let _ = self
                .registry
                .heartbeat(self.binding_id, &self.owner, cycle, &last_action)
                .await;

            // Step 8: drain + apply commands.
            if let Ok(commands) = self.registry.drain_commands(self.binding_id).await {
                for cmd in commands {
                    if let CommandKind::Stop { .. } = &cmd.kind {
                        pending_stop = true;
                    }
                    if let CommandKind::Start { cfg: new_cfg } = cmd.kind {
                        cached_cfg = Some(new_cfg);
                        pending_stop = false;
                    }
                }
            }

            // Step 9: sleep interval_ms minus elapsed, floor 0.
            let elapsed = iter_start.elapsed();
            let interval = StdDuration::from_millis(cfg.interval_ms);
            tokio::time::sleep(interval.saturating_sub(elapsed)).await;
        }
    }
}

fn chrono_duration_to_std(d: ChronoDuration) -> StdDuration {
    d.to_std().unwrap_or(StdDuration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use uuid::Uuid;
    use vox_engine::EngineConfig;
    use vox_provider::mock::{MockProviderClient, Scenario, ScriptedStatus};
    use vox_registry::InMemoryRegistry;
    use vox_schemas::TransactionRecord;

    struct NoopPersistence;

    #[async_trait]
    impl PersistencePort for NoopPersistence {
        async fn upsert_transaction(&self, _record: &TransactionRecord) -> Result<(), anyhow::Error> {
            Ok(())
        }
        async fn upsert_snapshot(&self, _record: &TransactionRecord) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    struct NoOtp;

    #[async_trait]
    impl EngineOtpRendezvous for NoOtp {
        async fn await_otp(&self, _binding: BindingId, _timeout: StdDuration) -> Option<String> {
            None
        }
    }

    fn tunables() -> WorkerTunables {
        WorkerTunables {
            lock_ttl: ChronoDuration::milliseconds(15_000),
            server_key: "srv-1".to_string(),
            pause_poll_interval: StdDuration::from_millis(10),
        }
    }

    fn cfg() -> WorkerConfig {
        WorkerConfig {
            interval_ms: 10,
            max_retry_status: 0,
            cooldown_on_error_ms: 5,
            product_id: "PULSA_10K".into(),
            email: "user@example.com".into(),
            limit_harga: 100_000,
        }
    }

    #[tokio::test]
    async fn hard_stop_transitions_state_and_releases_lock() {
        let binding = BindingId(Uuid::new_v4());
        let owner = OwnerId::new("h", 1, "a");
        let registry = InMemoryRegistry::new();
        registry.put_config(binding, &cfg()).await.unwrap();
        registry
            .force_state(binding, WorkerStatus::Running, None, Some(&owner))
            .await
            .unwrap();

        let provider = MockProviderClient::new();
        provider.script(
            binding,
            Scenario {
                balance: 50_000, // below limit_harga: hard stop
                trx_id: "unused".into(),
                status_sequence: vec![],
                otp_accepted: true,
                fail_start_transport: false,
            },
        );
        let engine = TransactionEngine::new(provider, NoopPersistence, NoOtp, EngineConfig::default());
        let worker = Worker::new(binding, owner.clone(), registry, engine, tunables());

        let reason = worker.run().await;
        assert_eq!(reason, WorkerExitReason::HardStop("insufficient_balance_before_start".into()));
    }

    #[tokio::test]
    async fn control_plane_stop_is_observed_at_next_boundary() {
        let binding = BindingId(Uuid::new_v4());
        let owner = OwnerId::new("h", 1, "a");
        let registry = InMemoryRegistry::new();
        registry.put_config(binding, &cfg()).await.unwrap();
        registry
            .force_state(binding, WorkerStatus::Stopped, Some("operator_stop"), None)
            .await
            .unwrap();

        let provider = MockProviderClient::new();
        let engine = TransactionEngine::new(provider, NoopPersistence, NoOtp, EngineConfig::default());
        let worker = Worker::new(binding, owner, registry, engine, tunables());

        let reason = worker.run().await;
        assert_eq!(reason, WorkerExitReason::ControlPlaneStop);
    }

    #[tokio::test]
    async fn lock_contested_at_startup_exits_immediately() {
        let binding = BindingId(Uuid::new_v4());
        let owner_a = OwnerId::new("h", 1, "a");
        let owner_b = OwnerId::new("h", 2, "b");
        let registry = InMemoryRegistry::new();
        registry
            .acquire_lock(binding, &owner_a, ChronoDuration::milliseconds(15_000))
            .await
            .unwrap();
        registry.put_config(binding, &cfg()).await.unwrap();

        let provider = MockProviderClient::new();
        let engine = TransactionEngine::new(provider, NoopPersistence, NoOtp, EngineConfig::default());
        let worker = Worker::new(binding, owner_b, registry, engine, tunables());

        let reason = worker.run().await;
        assert_eq!(reason, WorkerExitReason::LockLost);
    }

    #[tokio::test]
    async fn happy_path_runs_several_cycles_then_honors_a_later_stop() {
        let binding = BindingId(Uuid::new_v4());
        let owner = OwnerId::new("h", 1, "a");
        let registry = Arc::new(InMemoryRegistry::new());
        registry.put_config(binding, &cfg()).await.unwrap();
        registry
            .force_state(binding, WorkerStatus::Running, None, Some(&owner))
            .await
            .unwrap();

        let provider = MockProviderClient::new();
        provider.script(
            binding,
            Scenario {
                balance: 200_000,
                trx_id: "TRX1".into(),
                status_sequence: vec![ScriptedStatus {
                    is_success: 2,
                    voucher_code: Some("V1".into()),
                    otp_required: false,
                }],
                otp_accepted: true,
                fail_start_transport: false,
            },
        );
        let engine = TransactionEngine::new(provider, NoopPersistence, NoOtp, EngineConfig::default());
        let worker = Worker::new(binding, owner, registry.clone(), engine, tunables());

        let handle = tokio::spawn(worker.run());

        // Let a few cycles complete, then issue a control-plane stop from
        // outside the worker, exactly as the orchestrator's `stop()` would.
        tokio::time::sleep(StdDuration::from_millis(35)).await;
        registry
            .force_state(binding, WorkerStatus::Stopped, Some("operator_stop"), None)
            .await
            .unwrap();

        let reason = tokio::time::timeout(StdDuration::from_secs(2), handle)
            .await
            .expect("worker must observe stop promptly")
            .expect("worker task must not panic");

        assert_eq!(reason, WorkerExitReason::ControlPlaneStop);
        assert!(registry.get_heartbeat(binding).await.unwrap().unwrap().cycle >= 1);
        assert!(registry.get_lock(binding).await.unwrap().is_none(), "lock must be released on clean stop");
    }
}
