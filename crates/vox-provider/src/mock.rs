//! Deterministic in-memory mock `ProviderClient`.
//!
//! Design decisions (kept intentionally simple/deterministic, matching the
//! paper-broker adapter this crate is patterned on):
//! - No randomness, no wall-clock reads.
//! - Each binding is scripted independently via `Scenario`.
//! - Call counts are recorded so scenario tests can assert exact dispatch
//!   counts (e.g. "no `start_transaction` call was made").

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use vox_schemas::BindingId;

use crate::{CallCtx, OtpResult, ProviderClient, ProviderError, StartResult, StatusResult};

#[derive(Debug, Clone)]
pub struct ScriptedStatus {
    pub is_success: i32,
    pub voucher_code: Option<String>,
    pub otp_required: bool,
}

/// The scripted behavior for one binding.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    pub balance: i64,
    pub trx_id: String,
    /// Status responses returned in order across successive `check_status`
    /// calls; the last entry repeats once exhausted.
    pub status_sequence: Vec<ScriptedStatus>,
    pub otp_accepted: bool,
    pub fail_start_transport: bool,
}

#[derive(Debug, Default)]
struct CallCounts {
    start_transaction: u32,
    check_status: u32,
    submit_otp: u32,
    get_balance: u32,
}

#[derive(Default)]
pub struct MockProviderClient {
    scenarios: Mutex<HashMap<BindingId, Scenario>>,
    status_cursor: Mutex<HashMap<BindingId, usize>>,
    counts: Mutex<HashMap<BindingId, CallCounts>>,
}

impl MockProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, binding: BindingId, scenario: Scenario) {
        self.scenarios.lock().expect("mock mutex poisoned").insert(binding, scenario);
    }

    pub fn start_transaction_calls(&self, binding: BindingId) -> u32 {
        self.counts
            .lock()
            .expect("mock mutex poisoned")
            .get(&binding)
            .map(|c| c.start_transaction)
            .unwrap_or(0)
    }

    pub fn check_status_calls(&self, binding: BindingId) -> u32 {
        self.counts
            .lock()
            .expect("mock mutex poisoned")
            .get(&binding)
            .map(|c| c.check_status)
            .unwrap_or(0)
    }

    fn scenario_for(&self, binding: BindingId) -> Scenario {
        self.scenarios
            .lock()
            .expect("mock mutex poisoned")
            .get(&binding)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn start_transaction(
        &self,
        _ctx: &CallCtx,
        binding: BindingId,
        _product_id: &str,
        _email: &str,
        _limit_harga: i64,
    ) -> Result<StartResult, ProviderError> {
        self.counts
            .lock()
            .expect("mock mutex poisoned")
            .entry(binding)
            .or_default()
            .start_transaction += 1;

        let scenario = self.scenario_for(binding);
        if scenario.fail_start_transport {
            return Err(ProviderError::Transport("mock transport failure".into()));
        }

        Ok(StartResult { trx_id: scenario.trx_id })
    }

    async fn check_status(
        &self,
        _ctx: &CallCtx,
        binding: BindingId,
        _trx_id: &str,
    ) -> Result<StatusResult, ProviderError> {
        self.counts
            .lock()
            .expect("mock mutex poisoned")
            .entry(binding)
            .or_default()
            .check_status += 1;

        let scenario = self.scenario_for(binding);
        if scenario.status_sequence.is_empty() {
            return Ok(StatusResult {
                is_success: 0,
                voucher_code: None,
                otp_required: false,
            });
        }

        let mut cursor_guard = self.status_cursor.lock().expect("mock mutex poisoned");
        let cursor = cursor_guard.entry(binding).or_insert(0);
        let idx = (*cursor).min(scenario.status_sequence.len() - 1);
        *cursor += 1;

        let scripted = &scenario.status_sequence[idx];
        Ok(StatusResult {
            is_success: scripted.is_success,
            voucher_code: scripted.voucher_code.clone(),
            otp_required: scripted.otp_required,
        })
    }

    async fn submit_otp(
        &self,
        _ctx: &CallCtx,
        binding: BindingId,
        _otp: &str,
    ) -> Result<OtpResult, ProviderError> {
        self.counts
            .lock()
            .expect("mock mutex poisoned")
            .entry(binding)
            .or_default()
            .submit_otp += 1;

        let scenario = self.scenario_for(binding);
        Ok(OtpResult { accepted: scenario.otp_accepted })
    }

    async fn get_balance(&self, _ctx: &CallCtx, binding: BindingId) -> Result<i64, ProviderError> {
        self.counts
            .lock()
            .expect("mock mutex poisoned")
            .entry(binding)
            .or_default()
            .get_balance += 1;

        Ok(self.scenario_for(binding).balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx() -> CallCtx {
        CallCtx {
            deadline: Duration::from_secs(1),
            server_key: "srv-1".into(),
        }
    }

    #[tokio::test]
    async fn status_sequence_advances_then_sticks_on_last_entry() {
        let mock = MockProviderClient::new();
        let binding = BindingId(Uuid::new_v4());
        mock.script(
            binding,
            Scenario {
                balance: 0,
                trx_id: "T1".into(),
                status_sequence: vec![
                    ScriptedStatus { is_success: 1, voucher_code: None, otp_required: false },
                    ScriptedStatus { is_success: 2, voucher_code: Some("V1".into()), otp_required: false },
                ],
                otp_accepted: true,
                fail_start_transport: false,
            },
        );

        let first = mock.check_status(&ctx(), binding, "T1").await.unwrap();
        assert_eq!(first.is_success, 1);
        let second = mock.check_status(&ctx(), binding, "T1").await.unwrap();
        assert_eq!(second.is_success, 2);
        let third = mock.check_status(&ctx(), binding, "T1").await.unwrap();
        assert_eq!(third.is_success, 2);
        assert_eq!(mock.check_status_calls(binding), 3);
    }
}
