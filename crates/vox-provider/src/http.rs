use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};
use vox_schemas::BindingId;

use crate::{CallCtx, OtpResult, ProviderClient, ProviderError, RetryPolicy, StartResult, StatusResult};

/// Async `reqwest`-backed `ProviderClient`. Deliberately uses the async
/// client (not `reqwest::blocking` + `spawn_blocking`) so every provider
/// call is a genuine yield point, per the concurrency model's requirement
/// that no task's call can stall another.
///
/// Concurrency is capped with two counting semaphores — one global, one
/// keyed per upstream server — acquired before dispatch and released on
/// completion. This is a concurrency ceiling, not a request-rate limiter.
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    global_permits: Arc<Semaphore>,
    per_server_permits: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_server_cap: usize,
}

impl HttpProviderClient {
    pub fn new(base_url: String, global_cap: usize, per_server_cap: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            retry: RetryPolicy::default(),
            global_permits: Arc::new(Semaphore::new(global_cap)),
            per_server_permits: Mutex::new(HashMap::new()),
            per_server_cap,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn server_semaphore(&self, server_key: &str) -> Arc<Semaphore> {
        let mut map = self.per_server_permits.lock().await;
        map.entry(server_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_server_cap)))
            .clone()
    }

    /// Executes one HTTP call under both concurrency caps with bounded
    /// exponential-backoff retry on transport failures. Application-level
    /// error codes returned in the response body are surfaced as data by
    /// the caller, never retried here.
    async fn call_with_retry<T, F, Fut>(&self, ctx: &CallCtx, f: F) -> Result<T, ProviderError>
    where
        F: Fn(reqwest::Client) -> Fut,
        Fut: std::future::Future<Output = Result<T, reqwest::Error>>,
    {
        let server_sem = self.server_semaphore(&ctx.server_key).await;
        let _global_permit = self.global_permits.acquire().await.expect("semaphore closed");
        let _server_permit = server_sem.acquire().await.expect("semaphore closed");

        let deadline = Instant::now() + ctx.deadline;
        let mut attempt = 0u32;

        loop {
            if Instant::now() >= deadline {
                return Err(ProviderError::DeadlineExceeded);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let client = self.http.clone();
            let call = tokio::time::timeout(remaining, f(client)).await;

            match call {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if attempt >= self.retry.max_retries {
                        return Err(ProviderError::Transport(e.to_string()));
                    }
                    tokio::time::sleep(self.retry.backoff_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(_elapsed) => return Err(ProviderError::DeadlineExceeded),
            }
        }
    }
}

#[derive(Deserialize)]
struct StartTrxResponse {
    trx_id: String,
}

#[derive(Deserialize)]
struct StatusTrxResponse {
    is_success: i32,
    voucher_code: Option<String>,
    #[serde(default)]
    otp_required: bool,
}

#[derive(Deserialize)]
struct SubmitOtpResponse {
    accepted: bool,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: i64,
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn start_transaction(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        product_id: &str,
        email: &str,
        limit_harga: i64,
    ) -> Result<StartResult, ProviderError> {
        let url = format!("{}/start-trx", self.base_url);
        let body = serde_json::json!({
            "binding_id": binding.to_string(),
            "product_id": product_id,
            "email": email,
            "limit_harga": limit_harga,
        });

        let resp: StartTrxResponse = self
            .call_with_retry(ctx, |client| {
                let url = url.clone();
                let body = body.clone();
                async move { client.post(&url).json(&body).send().await?.json().await }
            })
            .await?;

        Ok(StartResult { trx_id: resp.trx_id })
    }

    async fn check_status(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        trx_id: &str,
    ) -> Result<StatusResult, ProviderError> {
        let url = format!("{}/status-trx", self.base_url);
        let body = serde_json::json!({
            "binding_id": binding.to_string(),
            "trx_id": trx_id,
        });

        let resp: StatusTrxResponse = self
            .call_with_retry(ctx, |client| {
                let url = url.clone();
                let body = body.clone();
                async move { client.post(&url).json(&body).send().await?.json().await }
            })
            .await?;

        Ok(StatusResult {
            is_success: resp.is_success,
            voucher_code: resp.voucher_code,
            otp_required: resp.otp_required,
        })
    }

    async fn submit_otp(
        &self,
        ctx: &CallCtx,
        binding: BindingId,
        otp: &str,
    ) -> Result<OtpResult, ProviderError> {
        let url = format!("{}/submit-otp", self.base_url);
        let body = serde_json::json!({
            "binding_id": binding.to_string(),
            "otp": otp,
        });

        let resp: SubmitOtpResponse = self
            .call_with_retry(ctx, |client| {
                let url = url.clone();
                let body = body.clone();
                async move { client.post(&url).json(&body).send().await?.json().await }
            })
            .await?;

        Ok(OtpResult { accepted: resp.accepted })
    }

    async fn get_balance(&self, ctx: &CallCtx, binding: BindingId) -> Result<i64, ProviderError> {
        let url = format!("{}/balance", self.base_url);
        let binding_str = binding.to_string();

        let resp: BalanceResponse = self
            .call_with_retry(ctx, |client| {
                let url = url.clone();
                let binding_str = binding_str.clone();
                async move {
                    client
                        .get(&url)
                        .query(&[("binding_id", binding_str)])
                        .send()
                        .await?
                        .json()
                        .await
                }
            })
            .await?;

        Ok(resp.balance)
    }
}
