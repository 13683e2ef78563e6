//! End-to-end scenario 2 from spec §8: OTP required, user submits 5000ms
//! later (scaled down here to keep the test fast), final status SUKSES and
//! `otp_status` transitions PENDING -> SUCCESS.

use std::time::Duration;

use uuid::Uuid;
use vox_engine::{EngineConfig, TransactionEngine};
use vox_schemas::{BindingId, OtpStatus, TransactionStatus, WorkerConfig};
use vox_testkit::{DelayedOtp, MockProviderClient, RecordingPersistence, Scenario, ScriptedStatus};

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
async fn otp_submitted_within_timeout_yields_sukses_with_success_status() {
    let binding = BindingId(Uuid::new_v4());
    let provider = MockProviderClient::new();
    provider.script(
        binding,
        Scenario {
            balance: 200_000,
            trx_id: "TRXOTP".into(),
            status_sequence: vec![
                ScriptedStatus { is_success: 1, voucher_code: None, otp_required: true },
                ScriptedStatus { is_success: 2, voucher_code: Some("VOTP".into()), otp_required: false },
            ],
            otp_accepted: true,
            fail_start_transport: false,
        },
    );
    let persistence = RecordingPersistence::new();
    let otp = DelayedOtp { otp: "123456", delay: Duration::from_millis(50) };
    let engine_cfg = EngineConfig { otp_timeout: Duration::from_millis(5_000), ..EngineConfig::default() };
    let engine = TransactionEngine::new(provider, persistence.clone(), otp, engine_cfg);

    let outcome = engine.run_cycle(binding, "srv-1", &cfg()).await.unwrap();

    assert_eq!(outcome.terminal_status, TransactionStatus::Sukses);
    assert!(outcome.stop_condition.is_none());

    let records = persistence.records();
    let pending = records
        .iter()
        .find(|r| r.otp_status == Some(OtpStatus::Pending))
        .expect("a PENDING snapshot must have been written while waiting on the OTP");
    assert!(pending.otp_required);

    let final_record = records.last().expect("at least one record written");
    assert_eq!(final_record.otp_status, Some(OtpStatus::Success));
    assert_eq!(final_record.status, TransactionStatus::Sukses);
}

#[tokio::test]
async fn otp_arriving_after_timeout_is_treated_as_no_otp() {
    let binding = BindingId(Uuid::new_v4());
    let provider = MockProviderClient::new();
    provider.script(
        binding,
        Scenario {
            balance: 200_000,
            trx_id: "TRXOTP2".into(),
            status_sequence: vec![ScriptedStatus { is_success: 1, voucher_code: None, otp_required: true }],
            otp_accepted: true,
            fail_start_transport: false,
        },
    );
    let persistence = RecordingPersistence::new();
    // Delay exceeds the engine's configured OTP timeout: the rendezvous
    // reports no OTP arrived, mirroring a user who never responds in time.
    let otp = DelayedOtp { otp: "999999", delay: Duration::from_millis(200) };
    let engine_cfg = EngineConfig { otp_timeout: Duration::from_millis(50), ..EngineConfig::default() };
    let engine = TransactionEngine::new(provider, persistence, otp, engine_cfg);

    let outcome = engine.run_cycle(binding, "srv-1", &cfg()).await.unwrap();

    assert_eq!(outcome.terminal_status, TransactionStatus::Gagal);
}
