//! End-to-end scenario 5 from spec §8: owner A fails to refresh before TTL,
//! owner B acquires. Exactly one of {A, B} ends up driving the binding
//! going forward; A exits `LockLost` without releasing (B already holds
//! the lock by the time A notices).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use uuid::Uuid;
use vox_engine::{EngineConfig, TransactionEngine};
use vox_schemas::{BindingId, OwnerId, WorkerConfig, WorkerStatus};
use vox_testkit::{InMemoryRegistry, ManualClock, MockProviderClient, RecordingPersistence, Scenario, ScriptedStatus};
use vox_worker::{Worker, WorkerExitReason, WorkerTunables};

fn cfg() -> WorkerConfig {
    WorkerConfig {
        interval_ms: 20,
        max_retry_status: 0,
        cooldown_on_error_ms: 5,
        product_id: "PULSA_10K".into(),
        email: "user@example.com".into(),
        limit_harga: 100_000,
    }
}

fn tunables(lock_ttl_ms: i64) -> WorkerTunables {
    WorkerTunables {
        lock_ttl: ChronoDuration::milliseconds(lock_ttl_ms),
        server_key: "srv-1".to_string(),
        pause_poll_interval: StdDuration::from_millis(5),
    }
}

struct NoOtp;

#[async_trait::async_trait]
impl vox_engine::OtpRendezvous for NoOtp {
    async fn await_otp(&self, _binding: BindingId, _timeout: StdDuration) -> Option<String> {
        None
    }
}

#[tokio::test]
async fn owner_b_acquires_after_owner_a_s_lock_expires_and_a_exits_without_releasing() {
    let binding = BindingId(Uuid::new_v4());
    let owner_a = OwnerId::new("host-a", 1, "nonce-a");
    let owner_b = OwnerId::new("host-b", 2, "nonce-b");

    let clock = ManualClock::default();
    let registry = Arc::new(InMemoryRegistry::with_clock(clock.as_fn()));
    registry.put_config(binding, &cfg()).await.unwrap();

    // Owner A acquires a very short-lived lock directly (bypassing a full
    // worker run) to simulate it being already mid-cycle when its TTL lapses.
    let short_ttl = ChronoDuration::milliseconds(10);
    assert!(registry.acquire_lock(binding, &owner_a, short_ttl).await.unwrap());

    // Advance the manual clock past the TTL: A's lock is now expired.
    clock.advance(StdDuration::from_millis(50));

    // Owner B can now acquire the same binding's lock.
    assert!(registry.acquire_lock(binding, &owner_b, ChronoDuration::milliseconds(15_000)).await.unwrap());

    // A's refresh must now fail: B holds the lock.
    let a_refreshed = registry.refresh_lock(binding, &owner_a, short_ttl).await.unwrap();
    assert!(!a_refreshed, "owner A must not be able to refresh a lock owner B now holds");

    // Exactly one worker, built for owner A, exits LockLost without
    // releasing anything (B's lock must remain intact).
    registry.force_state(binding, WorkerStatus::Running, None, Some(&owner_a)).await.unwrap();
    let provider = MockProviderClient::new();
    provider.script(
        binding,
        Scenario {
            balance: 200_000,
            trx_id: "TRXLOCK".into(),
            status_sequence: vec![ScriptedStatus { is_success: 2, voucher_code: Some("V".into()), otp_required: false }],
            otp_accepted: true,
            fail_start_transport: false,
        },
    );
    let engine = TransactionEngine::new(provider, RecordingPersistence::new(), NoOtp, EngineConfig::default());
    let worker_a = Worker::new(binding, owner_a, registry.clone(), engine, tunables(10));

    let reason = worker_a.run().await;
    assert_eq!(reason, WorkerExitReason::LockLost);

    let lock = registry.get_lock(binding).await.unwrap().expect("B's lock must still be held");
    assert_eq!(lock.owner, owner_b);
}
