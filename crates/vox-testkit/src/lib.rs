//! Shared test-support crate for the orchestration core. No production
//! caller — every crate in this workspace reaches for these helpers only
//! from `#[cfg(test)]` modules and `tests/` directories, the same
//! no-production-caller isolation this lineage's own test-harness crate
//! uses.
//!
//! Exports: a `ManualClock` for deterministic lock-TTL/heartbeat-age tests
//! without real sleeps, a `RecordingPersistence` port that captures every
//! write, and a small set of scripted `OtpRendezvous` implementations. The
//! scripted Provider Client (`MockProviderClient`) and the in-memory
//! Registry already live in their own production crates (`vox-provider`,
//! `vox-registry`) since the spec explicitly sanctions both as first-class,
//! not test-only, implementations — this crate just re-exports them so a
//! scenario test has one `use` line for its whole harness.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

pub use vox_provider::mock::{MockProviderClient, Scenario, ScriptedStatus};
pub use vox_registry::InMemoryRegistry;

use vox_engine::{OtpRendezvous, PersistencePort};
use vox_schemas::{BindingId, TransactionRecord};

/// An explicitly-advanced clock, for deterministic TTL/heartbeat-age
/// assertions without real sleeps. Grounded on `InMemoryRegistry`'s own
/// `Fn() -> DateTime<Utc>` clock-injection seam (`with_clock`); this struct
/// is just the `Arc<AtomicI64>` plumbing that seam expects a closure over.
#[derive(Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { millis: Arc::new(AtomicI64::new(start.timestamp_millis())) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .expect("manual clock millis must be a valid instant")
    }

    pub fn advance(&self, amount: Duration) {
        self.millis.fetch_add(amount.as_millis() as i64, Ordering::SeqCst);
    }

    /// A closure suitable for `InMemoryRegistry::with_clock`. Cloning the
    /// closure shares the same underlying counter as `self`.
    pub fn as_fn(&self) -> impl Fn() -> DateTime<Utc> + Send + Sync + Clone {
        let millis = self.millis.clone();
        move || {
            Utc.timestamp_millis_opt(millis.load(Ordering::SeqCst))
                .single()
                .expect("manual clock millis must be a valid instant")
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

/// Captures every record passed through the `PersistencePort` seam, in
/// call order, so a scenario test can assert on the exact write sequence
/// a cycle produced.
#[derive(Clone, Default)]
pub struct RecordingPersistence {
    records: Arc<Mutex<Vec<TransactionRecord>>>,
}

impl RecordingPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TransactionRecord> {
        self.records.lock().expect("recording persistence mutex poisoned").clone()
    }

    pub fn last(&self) -> Option<TransactionRecord> {
        self.records.lock().expect("recording persistence mutex poisoned").last().cloned()
    }
}

#[async_trait]
impl PersistencePort for RecordingPersistence {
    async fn upsert_transaction(&self, record: &TransactionRecord) -> Result<(), anyhow::Error> {
        self.records.lock().expect("recording persistence mutex poisoned").push(record.clone());
        Ok(())
    }

    async fn upsert_snapshot(&self, record: &TransactionRecord) -> Result<(), anyhow::Error> {
        self.records.lock().expect("recording persistence mutex poisoned").push(record.clone());
        Ok(())
    }
}

/// Never produces an OTP; the rendezvous always times out. Used for the
/// "OTP timeout" end-to-end scenario.
pub struct NoOtp;

#[async_trait]
impl OtpRendezvous for NoOtp {
    async fn await_otp(&self, _binding: BindingId, _timeout: Duration) -> Option<String> {
        None
    }
}

/// Returns a fixed OTP immediately, with no simulated user delay.
pub struct ImmediateOtp(pub &'static str);

#[async_trait]
impl OtpRendezvous for ImmediateOtp {
    async fn await_otp(&self, _binding: BindingId, _timeout: Duration) -> Option<String> {
        Some(self.0.to_string())
    }
}

/// Simulates a user submitting an OTP `delay` after the worker starts
/// waiting, as long as `delay` is still inside `timeout`. Grounds the
/// spec §8 scenario 2 "user submits OTP 5000ms later" end-to-end case.
pub struct DelayedOtp {
    pub otp: &'static str,
    pub delay: Duration,
}

#[async_trait]
impl OtpRendezvous for DelayedOtp {
    async fn await_otp(&self, _binding: BindingId, timeout: Duration) -> Option<String> {
        if self.delay >= timeout {
            return None;
        }
        tokio::time::sleep(self.delay).await;
        Some(self.otp.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advance_is_reflected_in_now_and_closure() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let clock_fn = clock.as_fn();
        assert_eq!(clock_fn(), start);

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now(), start + chrono::Duration::milliseconds(1_500));
        assert_eq!(clock_fn(), clock.now());
    }

    #[tokio::test]
    async fn recording_persistence_captures_writes_in_order() {
        let persistence = RecordingPersistence::new();
        let binding = BindingId(uuid::Uuid::new_v4());
        let now = Utc::now();
        let mk = |status| TransactionRecord {
            id: uuid::Uuid::new_v4(),
            binding_id: binding,
            status,
            balance_start: 0,
            balance_end: None,
            trx_id: None,
            voucher_code: None,
            error_message: None,
            otp_required: false,
            otp_status: None,
            created_at: now,
            updated_at: now,
        };

        persistence.upsert_transaction(&mk(vox_schemas::TransactionStatus::Processing)).await.unwrap();
        persistence.upsert_snapshot(&mk(vox_schemas::TransactionStatus::Sukses)).await.unwrap();

        let records = persistence.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, vox_schemas::TransactionStatus::Processing);
        assert_eq!(records[1].status, vox_schemas::TransactionStatus::Sukses);
    }

    #[tokio::test]
    async fn delayed_otp_returns_none_once_delay_exceeds_timeout() {
        let otp = DelayedOtp { otp: "123456", delay: Duration::from_millis(50) };
        let result = otp.await_otp(BindingId(uuid::Uuid::new_v4()), Duration::from_millis(10)).await;
        assert_eq!(result, None);
    }
}
