//! Per-binding OTP rendezvous mailbox (spec §5, §9).
//!
//! A single-slot mailbox per binding: writer = the OTP ingress API endpoint
//! (`submit_otp(binding_id, otp)`), reader = the worker's engine cycle
//! waiting inside `TransactionEngine::run_cycle`. Overwrites are rejected
//! while an OTP is already pending and unconsumed.
//!
//! The mailbox's lifecycle is owned here (by the Worker layer), not by the
//! Engine: the Engine only sees the narrow `OtpRendezvous` trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use vox_schemas::BindingId;

/// Single-slot mailbox for one binding's OTP.
pub struct OtpMailbox {
    slot: Mutex<Option<String>>,
    notify: Notify,
}

impl Default for OtpMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl OtpMailbox {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Called by the OTP ingress API. Returns `false` (rejected) if an OTP
    /// is already pending and has not yet been consumed by the worker.
    pub async fn submit(&self, otp: String) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(otp);
        drop(slot);
        self.notify.notify_one();
        true
    }

    /// Called by the worker's engine cycle. Waits up to `timeout` for an
    /// OTP to arrive; consumes it on arrival. Returns `None` on timeout.
    pub async fn wait(&self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut slot = self.slot.lock().await;
                if let Some(otp) = slot.take() {
                    return Some(otp);
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }
}

/// Registry of per-binding mailboxes, created lazily on first touch by
/// either side (ingress API or worker). Shared (via `Arc`) between the
/// orchestrator's OTP ingress handler and every spawned worker.
#[derive(Default)]
pub struct OtpMailboxRegistry {
    mailboxes: Mutex<HashMap<BindingId, Arc<OtpMailbox>>>,
}

impl OtpMailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, binding: BindingId) -> Arc<OtpMailbox> {
        let mut map = self.mailboxes.lock().await;
        map.entry(binding).or_insert_with(|| Arc::new(OtpMailbox::new())).clone()
    }

    /// Called by the OTP ingress endpoint. `false` means rejected (already
    /// pending) — the caller should surface `{accepted: false}`.
    pub async fn submit(&self, binding: BindingId, otp: String) -> bool {
        self.get_or_create(binding).await.submit(otp).await
    }
}

/// Adapts an `OtpMailboxRegistry` to the Engine's narrow `OtpRendezvous`
/// seam, so the Engine never knows mailboxes exist as a concept beyond
/// "wait for a string, maybe timeout."
pub struct RegistryOtpRendezvous {
    registry: Arc<OtpMailboxRegistry>,
}

impl RegistryOtpRendezvous {
    pub fn new(registry: Arc<OtpMailboxRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl vox_engine::OtpRendezvous for RegistryOtpRendezvous {
    async fn await_otp(&self, binding: BindingId, timeout: Duration) -> Option<String> {
        let mailbox = self.registry.get_or_create(binding).await;
        mailbox.wait(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn submit_then_wait_delivers_the_otp() {
        let mailbox = OtpMailbox::new();
        mailbox.submit("123456".to_string()).await;
        let got = mailbox.wait(Duration::from_millis(50)).await;
        assert_eq!(got, Some("123456".to_string()));
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_arrives() {
        let mailbox = OtpMailbox::new();
        let got = mailbox.wait(Duration::from_millis(20)).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn second_submit_is_rejected_while_first_is_unconsumed() {
        let mailbox = OtpMailbox::new();
        assert!(mailbox.submit("111111".to_string()).await);
        assert!(!mailbox.submit("222222".to_string()).await);
        assert_eq!(mailbox.wait(Duration::from_millis(20)).await, Some("111111".to_string()));
    }

    #[tokio::test]
    async fn concurrent_waiter_is_woken_by_a_later_submit() {
        let mailbox = Arc::new(OtpMailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.wait(Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.submit("999999".to_string()).await;
        let got = waiter.await.unwrap();
        assert_eq!(got, Some("999999".to_string()));
    }

    #[tokio::test]
    async fn registry_creates_independent_mailboxes_per_binding() {
        let registry = OtpMailboxRegistry::new();
        let a = BindingId(Uuid::new_v4());
        let b = BindingId(Uuid::new_v4());

        assert!(registry.submit(a, "AAA".to_string()).await);
        let mailbox_b = registry.get_or_create(b).await;
        assert_eq!(mailbox_b.wait(Duration::from_millis(10)).await, None);
    }
}
