//! Provider Client: typed calls against one upstream provider endpoint.
//!
//! This module defines the thin, immutable boundary through which every
//! outbound call to a provider server must pass — the `ProviderClient`
//! trait — so the Transaction Engine never speaks HTTP directly. Isolating
//! the boundary here keeps the engine deterministic and lets production
//! (`HttpProviderClient`) and test (`MockProviderClient`) backends be
//! swapped without touching engine logic.

use async_trait::async_trait;
use std::time::Duration;
use vox_schemas::BindingId;

pub mod http;
pub mod mock;

pub use http::HttpProviderClient;
pub use mock::MockProviderClient;

/// Deadline + identity context for one provider call.
#[derive(Debug, Clone)]
pub struct CallCtx {
    pub deadline: Duration,
    pub server_key: String,
}

#[derive(Debug, Clone)]
pub struct StartResult {
    pub trx_id: String,
}

#[derive(Debug, Clone)]
pub struct StatusResult {
    pub is_success: i32,
    pub voucher_code: Option<String>,
    pub otp_required: bool,
}

#[derive(Debug, Clone)]
pub struct OtpResult {
    pub accepted: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Transport error (timeout, connection refused, DNS) after the retry
    /// budget is exhausted. Never retried further by the caller — the
    /// Engine treats this as a cycle-level failure per the error table.
    #[error("provider transport error: {0}")]
    Transport(String),
    /// Application-level rejection returned as data by the provider, never
    /// as a transport retry trigger.
    #[error("provider application error: {0}")]
    Application(String),
    /// The supplied deadline elapsed before the provider responded.
    #[error("provider call deadline exceeded")]
    DeadlineExceeded,
}

impl ProviderError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProviderError::Transport(_) => "transport",
            ProviderError::Application(_) => "application",
            ProviderError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// One typed operation per upstream endpoint the Engine needs. Every call
/// carries a deadline and is cancellation-aware: it returns promptly when
/// the deadline elapses but never aborts mid-flight on a user stop (that
/// discipline lives one layer up, in the Worker).
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn start_transaction(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        product_id: &str,
        email: &str,
        limit_harga: i64,
    ) -> Result<StartResult, ProviderError>;

    async fn check_status(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        trx_id: &str,
    ) -> Result<StatusResult, ProviderError>;

    async fn submit_otp(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        otp: &str,
    ) -> Result<OtpResult, ProviderError>;

    async fn get_balance(&self, ctx: &CallCtx, binding: BindingId) -> Result<i64, ProviderError>;
}

/// Retry policy for transport-level failures. Exponential backoff, capped.
/// Defaults (3 retries, 200ms initial, 2s cap) are the spec's suggested
/// defaults, not mandated ones — see the Open Question resolution in
/// DESIGN.md.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.max_backoff)
    }
}

/// Lets one `ProviderClient` (and its concurrency-cap semaphores) be shared
/// via `Arc` across every worker task that targets the same upstream server.
#[async_trait]
impl<T: ProviderClient + ?Sized> ProviderClient for std::sync::Arc<T> {
    async fn start_transaction(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        product_id: &str,
        email: &str,
        limit_harga: i64,
    ) -> Result<StartResult, ProviderError> {
        (**self).start_transaction(ctx, binding, product_id, email, limit_harga).await
    }

    async fn check_status(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        trx_id: &str,
    ) -> Result<StatusResult, ProviderError> {
        (**self).check_status(ctx, binding, trx_id).await
    }

    async fn submit_otp(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        otp: &str,
    ) -> Result<OtpResult, ProviderError> {
        (**self).submit_otp(ctx, binding, otp).await
    }

    async fn get_balance(&self, ctx: &CallCtx, binding: BindingId) -> Result<i64, ProviderError> {
        (**self).get_balance(ctx, binding).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates_at_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(2));
    }
}
