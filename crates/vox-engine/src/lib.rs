//! Transaction Engine: executes one cycle — precheck balance, start
//! transaction, poll status, handle OTP, snapshot outcome.
//!
//! The engine is pure with respect to control state: it reports
//! `CycleOutcome` to its caller (the Worker) and never mutates WorkerState
//! itself. It is the single choke-point through which every provider call
//! in a cycle passes, mirroring the gate pattern this lineage of codebase
//! uses for its broker dispatch boundary — here there is no verdict to
//! refuse against, only the classification rules below, so the "gate" is a
//! single entry point (`run_cycle`) rather than a pre-flight check list.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use vox_provider::{CallCtx, ProviderClient, ProviderError};
use vox_schemas::{BindingId, OtpStatus, TransactionRecord, TransactionStatus, WorkerConfig};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl EngineError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            EngineError::Provider(e) => e.reason_code(),
        }
    }
}

/// Outbound persistence port. The core writes through this narrow interface
/// and never reads it back to decide future behavior. Both operations must
/// be idempotent on `(binding_id, trx_id)`.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<(), anyhow::Error>;
    async fn upsert_snapshot(&self, record: &TransactionRecord) -> Result<(), anyhow::Error>;
}

/// A per-binding single-slot mailbox: writer = the OTP ingress API endpoint,
/// reader = the worker's engine cycle. Implemented one layer up (the
/// mailbox's lifecycle is owned by the Worker, which is what wires it here).
#[async_trait]
pub trait OtpRendezvous: Send + Sync {
    /// Marks the binding as awaiting an OTP, then waits up to `timeout` for
    /// one to arrive. Returns `None` on timeout.
    async fn await_otp(&self, binding: BindingId, timeout: std::time::Duration) -> Option<String>;
}

/// Tunables the Worker does not own: the engine's own retry/timing/hard-stop
/// policy, independent from `WorkerConfig`'s loop-level knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub per_call_deadline: std::time::Duration,
    pub status_retry_delay: std::time::Duration,
    pub otp_timeout: std::time::Duration,
    /// Default `false`: `SUSPECT` is a terminal classification for the
    /// cycle, not a hard stop. See DESIGN.md's Open Question resolution.
    pub suspect_is_hard_stop: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            per_call_deadline: std::time::Duration::from_secs(5),
            status_retry_delay: std::time::Duration::from_millis(300),
            otp_timeout: std::time::Duration::from_millis(120_000),
            suspect_is_hard_stop: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopCondition {
    pub reason: String,
}

/// What the engine reports to its caller after one cycle. Never mutates
/// WorkerState; the Worker decides what to do with `stop_condition`.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub terminal_status: TransactionStatus,
    pub stop_condition: Option<StopCondition>,
}

pub struct TransactionEngine<P, Pp, O>
where
    P: ProviderClient,
    Pp: PersistencePort,
    O: OtpRendezvous,
{
    provider: P,
    persistence: Pp,
    otp: O,
    config: EngineConfig,
}

impl<P, Pp, O> TransactionEngine<P, Pp, O>
where
    P: ProviderClient,
    Pp: PersistencePort,
    O: OtpRendezvous,
{
    pub fn new(provider: P, persistence: Pp, otp: O, config: EngineConfig) -> Self {
        Self { provider, persistence, otp, config }
    }

    fn call_ctx(&self, server_key: &str) -> CallCtx {
        CallCtx {
            deadline: self.config.per_call_deadline,
            server_key: server_key.to_string(),
        }
    }

    /// Runs one full cycle per spec §4.3. `server_key` identifies the
    /// upstream server for concurrency-cap bookkeeping in the Provider
    /// Client; it is not otherwise interpreted here.
    pub async fn run_cycle(
        &self,
        binding: BindingId,
        server_key: &str,
        cfg: &WorkerConfig,
    ) -> Result<CycleOutcome, EngineError> {
        let ctx = self.call_ctx(server_key);
        let now = Utc::now();

        // 1. Precheck.
        let balance_start = self.provider.get_balance(&ctx, binding).await?;
        if balance_start < cfg.limit_harga {
            let record = TransactionRecord {
                id: Uuid::new_v4(),
                binding_id: binding,
                status: TransactionStatus::Gagal,
                balance_start,
                balance_end: Some(balance_start),
                trx_id: None,
                voucher_code: None,
                error_message: Some(format!(
                    "insufficient_balance_before_start:{balance_start}<{}",
                    cfg.limit_harga
                )),
                otp_required: false,
                otp_status: None,
                created_at: now,
                updated_at: now,
            };
            self.persist_best_effort(&record).await;

            return Ok(CycleOutcome {
                terminal_status: TransactionStatus::Gagal,
                stop_condition: Some(StopCondition {
                    reason: "insufficient_balance_before_start".to_string(),
                }),
            });
        }

        // 2. Start.
        let start = self
            .provider
            .start_transaction(&ctx, binding, &cfg.product_id, &cfg.email, cfg.limit_harga)
            .await?;

        let mut record = TransactionRecord {
            id: Uuid::new_v4(),
            binding_id: binding,
            status: TransactionStatus::Processing,
            balance_start,
            balance_end: None,
            trx_id: Some(start.trx_id.clone()),
            voucher_code: None,
            error_message: None,
            otp_required: false,
            otp_status: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_best_effort(&record).await;

        // 3. Initial status.
        let mut status = self.provider.check_status(&ctx, binding, &start.trx_id).await?;
        self.apply_classification(&mut record, &status);
        self.persist_best_effort(&record).await;

        // 4. OTP handling.
        if record.status == TransactionStatus::Processing && status.otp_required {
            record.otp_required = true;
            record.otp_status = Some(OtpStatus::Pending);
            self.persist_best_effort(&record).await;

            match self.otp.await_otp(binding, self.config.otp_timeout).await {
                Some(otp) => {
                    let otp_result = self.provider.submit_otp(&ctx, binding, &otp).await?;
                    if otp_result.accepted {
                        record.otp_status = Some(OtpStatus::Success);
                        status = self.provider.check_status(&ctx, binding, &start.trx_id).await?;
                        self.apply_classification(&mut record, &status);
                    } else {
                        record.otp_status = Some(OtpStatus::Failed);
                        record.status = TransactionStatus::Gagal;
                        record.error_message = Some("otp_rejected".to_string());
                    }
                }
                None => {
                    record.otp_status = Some(OtpStatus::Failed);
                    record.status = TransactionStatus::Gagal;
                    record.error_message = Some("otp_timeout".to_string());
                }
            }
            self.persist_best_effort(&record).await;
        }

        // 5. Short-retry status loop.
        let mut retries = 0;
        while record.status == TransactionStatus::Processing && retries < cfg.max_retry_status {
            tokio::time::sleep(self.config.status_retry_delay).await;
            status = self.provider.check_status(&ctx, binding, &start.trx_id).await?;
            self.apply_classification(&mut record, &status);
            retries += 1;
        }

        // 6. Snapshot.
        let balance_end = self.provider.get_balance(&ctx, binding).await?;
        record.balance_end = Some(balance_end);
        record.updated_at = Utc::now();
        if let Err(e) = self.persistence.upsert_snapshot(&record).await {
            tracing::warn!(binding = %binding, error = %e, "persistence_unavailable_on_snapshot");
        }

        let stop_condition = if record.status == TransactionStatus::Suspect
            && self.config.suspect_is_hard_stop
        {
            Some(StopCondition { reason: "suspect_transaction".to_string() })
        } else {
            None
        };

        Ok(CycleOutcome { terminal_status: record.status, stop_condition })
    }

    fn apply_classification(&self, record: &mut TransactionRecord, status: &vox_provider::StatusResult) {
        record.status = if status.is_success == 2 && status.voucher_code.is_some() {
            TransactionStatus::Sukses
        } else if status.is_success == 2 {
            TransactionStatus::Suspect
        } else {
            TransactionStatus::Processing
        };
        record.voucher_code = status.voucher_code.clone();
        record.updated_at = Utc::now();
    }

    async fn persist_best_effort(&self, record: &TransactionRecord) {
        if let Err(e) = self.persistence.upsert_transaction(record).await {
            // Persistence unavailable: log and continue. The provider
            // remains authoritative; a later cycle over-writes.
            tracing::warn!(binding = %record.binding_id, error = %e, "persistence_unavailable");
        }
    }
}

/// Lets one persistence backend be shared via `Arc` across every worker
/// task, mirroring the same sharing pattern used for the Registry and the
/// Provider Client.
#[async_trait]
impl<T: PersistencePort + ?Sized> PersistencePort for std::sync::Arc<T> {
    async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<(), anyhow::Error> {
        (**self).upsert_transaction(record).await
    }

    async fn upsert_snapshot(&self, record: &TransactionRecord) -> Result<(), anyhow::Error> {
        (**self).upsert_snapshot(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vox_provider::mock::{MockProviderClient, Scenario, ScriptedStatus};

    struct RecordingPersistence {
        records: Mutex<Vec<TransactionRecord>>,
    }

    impl RecordingPersistence {
        fn new() -> Self {
            Self { records: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl PersistencePort for RecordingPersistence {
        async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<(), anyhow::Error> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
        async fn upsert_snapshot(&self, record: &TransactionRecord) -> Result<(), anyhow::Error> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct NoOtp;

    #[async_trait]
    impl OtpRendezvous for NoOtp {
        async fn await_otp(&self, _binding: BindingId, _timeout: std::time::Duration) -> Option<String> {
            None
        }
    }

    struct ImmediateOtp(&'static str);

    #[async_trait]
    impl OtpRendezvous for ImmediateOtp {
        async fn await_otp(&self, _binding: BindingId, _timeout: std::time::Duration) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn cfg() -> WorkerConfig {
        WorkerConfig {
            interval_ms: 800,
            max_retry_status: 3,
            cooldown_on_error_ms: 1000,
            product_id: "PULSA_10K".into(),
            email: "user@example.com".into(),
            limit_harga: 100_000,
        }
    }

    #[tokio::test]
    async fn happy_path_yields_sukses_with_no_stop_condition() {
        let binding = BindingId(Uuid::new_v4());
        let provider = MockProviderClient::new();
        provider.script(
            binding,
            Scenario {
                balance: 200_000,
                trx_id: "TRX1".into(),
                status_sequence: vec![ScriptedStatus {
                    is_success: 2,
                    voucher_code: Some("VOUCHER123".into()),
                    otp_required: false,
                }],
                otp_accepted: true,
                fail_start_transport: false,
            },
        );
        let persistence = RecordingPersistence::new();
        let engine = TransactionEngine::new(provider, persistence, NoOtp, EngineConfig::default());

        let outcome = engine.run_cycle(binding, "srv-1", &cfg()).await.unwrap();
        assert_eq!(outcome.terminal_status, TransactionStatus::Sukses);
        assert!(outcome.stop_condition.is_none());
    }

    #[tokio::test]
    async fn insufficient_balance_stops_before_any_start_call() {
        let binding = BindingId(Uuid::new_v4());
        let provider = MockProviderClient::new();
        provider.script(
            binding,
            Scenario {
                balance: 50_000,
                trx_id: "unused".into(),
                status_sequence: vec![],
                otp_accepted: true,
                fail_start_transport: false,
            },
        );
        let persistence = RecordingPersistence::new();
        let engine = TransactionEngine::new(provider, persistence, NoOtp, EngineConfig::default());

        let outcome = engine.run_cycle(binding, "srv-1", &cfg()).await.unwrap();
        assert_eq!(outcome.terminal_status, TransactionStatus::Gagal);
        let stop = outcome.stop_condition.expect("must hard stop");
        assert_eq!(stop.reason, "insufficient_balance_before_start");
        assert_eq!(engine.provider.start_transaction_calls(binding), 0);
    }

    #[tokio::test]
    async fn otp_required_and_provided_resolves_to_sukses() {
        let binding = BindingId(Uuid::new_v4());
        let provider = MockProviderClient::new();
        provider.script(
            binding,
            Scenario {
                balance: 200_000,
                trx_id: "TRX2".into(),
                status_sequence: vec![
                    ScriptedStatus { is_success: 1, voucher_code: None, otp_required: true },
                    ScriptedStatus { is_success: 2, voucher_code: Some("V2".into()), otp_required: false },
                ],
                otp_accepted: true,
                fail_start_transport: false,
            },
        );
        let persistence = RecordingPersistence::new();
        let engine = TransactionEngine::new(provider, persistence, ImmediateOtp("123456"), EngineConfig::default());

        let outcome = engine.run_cycle(binding, "srv-1", &cfg()).await.unwrap();
        assert_eq!(outcome.terminal_status, TransactionStatus::Sukses);
    }

    #[tokio::test]
    async fn otp_timeout_marks_transaction_gagal() {
        let binding = BindingId(Uuid::new_v4());
        let provider = MockProviderClient::new();
        provider.script(
            binding,
            Scenario {
                balance: 200_000,
                trx_id: "TRX3".into(),
                status_sequence: vec![ScriptedStatus { is_success: 1, voucher_code: None, otp_required: true }],
                otp_accepted: true,
                fail_start_transport: false,
            },
        );
        let persistence = RecordingPersistence::new();
        let engine = TransactionEngine::new(provider, persistence, NoOtp, EngineConfig::default());

        let outcome = engine.run_cycle(binding, "srv-1", &cfg()).await.unwrap();
        assert_eq!(outcome.terminal_status, TransactionStatus::Gagal);
    }

    #[tokio::test]
    async fn suspect_is_not_a_hard_stop_by_default() {
        let binding = BindingId(Uuid::new_v4());
        let provider = MockProviderClient::new();
        provider.script(
            binding,
            Scenario {
                balance: 200_000,
                trx_id: "TRX4".into(),
                status_sequence: vec![ScriptedStatus { is_success: 2, voucher_code: None, otp_required: false }],
                otp_accepted: true,
                fail_start_transport: false,
            },
        );
        let persistence = RecordingPersistence::new();
        let engine = TransactionEngine::new(provider, persistence, NoOtp, EngineConfig::default());

        let outcome = engine.run_cycle(binding, "srv-1", &cfg()).await.unwrap();
        assert_eq!(outcome.terminal_status, TransactionStatus::Suspect);
        assert!(outcome.stop_condition.is_none());
    }
}
