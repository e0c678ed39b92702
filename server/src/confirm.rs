use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use argus_common::args::BrokerArgs;
use argus_common::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Approved,
    Rejected,
    Expired,
}

/// A destructive tool call waiting for its human. Returned by
/// `list_pending`; the approval future itself is single-consumer.
#[derive(Debug, Clone, Serialize)]
pub struct PendingConfirmation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

struct PendingEntry {
    info: PendingConfirmation,
    tx: oneshot::Sender<Outcome>,
}

pub struct ConfirmationBrokerInner {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    ttl: Duration,
    cancel: CancellationToken,
}

/// In-memory rendezvous for pending tool-call approvals. Every entry
/// resolves exactly once (approved, rejected, or expired) and resolution
/// removes it immediately.
#[derive(Clone)]
pub struct ConfirmationBroker {
    inner: Arc<ConfirmationBrokerInner>,
}

impl Deref for ConfirmationBroker {
    type Target = ConfirmationBrokerInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl ConfirmationBroker {
    pub fn new(ttl: Duration, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ConfirmationBrokerInner {
                pending: Mutex::new(HashMap::new()),
                ttl,
                cancel,
            }),
        }
    }

    pub fn from_args(args: &BrokerArgs, cancel: CancellationToken) -> Self {
        Self::new(Duration::from_secs(args.confirmation_ttl_secs), cancel)
    }

    /// Create a pending entry and hand back its single-consumer future.
    /// Times out to `Expired` after the configured TTL.
    pub async fn request(
        &self,
        user_id: Uuid,
        tool_name: &str,
        tool_args: serde_json::Value,
    ) -> Result<(Uuid, oneshot::Receiver<Outcome>), ApiError> {
        if self.cancel.is_cancelled() {
            return Err(ApiError::Unavailable("server is shutting down".into()));
        }
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            info: PendingConfirmation {
                id,
                user_id,
                tool_name: tool_name.to_string(),
                tool_args,
                created_at: Utc::now(),
            },
            tx,
        };
        self.pending.lock().await.insert(id, entry);

        let broker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = broker.cancel.cancelled() => {
                    broker.finish(id, Outcome::Expired).await;
                }
                _ = tokio::time::sleep(broker.ttl) => {
                    if broker.finish(id, Outcome::Expired).await {
                        metrics::counter!("argus_confirmations_total", "outcome" => "expired")
                            .increment(1);
                        tracing::info!(confirmation = %id, "confirmation expired");
                    }
                }
            }
        });

        Ok((id, rx))
    }

    /// First resolution wins; later calls fail. Only the owning user may
    /// resolve.
    pub async fn resolve(&self, id: Uuid, user_id: Uuid, outcome: Outcome) -> Result<(), ApiError> {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get(&id) else {
            return Err(ApiError::NotFound(
                "confirmation not found or already resolved".into(),
            ));
        };
        if entry.info.user_id != user_id {
            return Err(ApiError::forbidden());
        }
        let entry = pending.remove(&id).expect("entry present under lock");
        drop(pending);
        let _ = entry.tx.send(outcome);
        metrics::counter!(
            "argus_confirmations_total",
            "outcome" => match outcome {
                Outcome::Approved => "approved",
                Outcome::Rejected => "rejected",
                Outcome::Expired => "expired",
            }
        )
        .increment(1);
        Ok(())
    }

    /// Resolve as expired without an owner check. Used when the originating
    /// turn is cancelled and by the TTL timer.
    pub async fn expire(&self, id: Uuid) {
        self.finish(id, Outcome::Expired).await;
    }

    async fn finish(&self, id: Uuid, outcome: Outcome) -> bool {
        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub async fn list_pending(&self, user_id: Uuid) -> Vec<PendingConfirmation> {
        let pending = self.pending.lock().await;
        let mut entries: Vec<_> = pending
            .values()
            .filter(|e| e.info.user_id == user_id)
            .map(|e| e.info.clone())
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(ttl: Duration) -> ConfirmationBroker {
        ConfirmationBroker::new(ttl, CancellationToken::new())
    }

    #[tokio::test]
    async fn first_resolution_wins_and_removes() {
        let broker = broker(Duration::from_secs(60));
        let user = Uuid::new_v4();
        let (id, rx) = broker
            .request(user, "delete_resource", serde_json::json!({"name": "web-1"}))
            .await
            .unwrap();

        broker.resolve(id, user, Outcome::Approved).await.unwrap();
        assert_eq!(rx.await.unwrap(), Outcome::Approved);

        let err = broker.resolve(id, user, Outcome::Rejected).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(broker.list_pending(user).await.is_empty());
    }

    #[tokio::test]
    async fn only_the_owner_may_resolve() {
        let broker = broker(Duration::from_secs(60));
        let owner = Uuid::new_v4();
        let (id, _rx) = broker
            .request(owner, "scale_workload", serde_json::json!({}))
            .await
            .unwrap();

        let err = broker
            .resolve(id, Uuid::new_v4(), Outcome::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        // Still pending for the rightful owner.
        assert_eq!(broker.list_pending(owner).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_entries_expire_after_ttl() {
        let broker = broker(Duration::from_secs(60));
        let user = Uuid::new_v4();
        let (id, rx) = broker
            .request(user, "delete_resource", serde_json::json!({}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(rx.await.unwrap(), Outcome::Expired);
        assert!(broker.list_pending(user).await.is_empty());
        assert!(broker.resolve(id, user, Outcome::Approved).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_beats_the_timer() {
        let broker = broker(Duration::from_secs(60));
        let user = Uuid::new_v4();
        let (id, rx) = broker
            .request(user, "apply_resource", serde_json::json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        broker.resolve(id, user, Outcome::Rejected).await.unwrap();
        assert_eq!(rx.await.unwrap(), Outcome::Rejected);
        // The timer firing later is a no-op.
        tokio::time::sleep(Duration::from_secs(60)).await;
    }

    #[tokio::test]
    async fn cancelled_context_expires_entry() {
        let broker = broker(Duration::from_secs(60));
        let user = Uuid::new_v4();
        let (id, rx) = broker
            .request(user, "delete_resource", serde_json::json!({}))
            .await
            .unwrap();
        broker.expire(id).await;
        assert_eq!(rx.await.unwrap(), Outcome::Expired);
        assert!(broker.list_pending(user).await.is_empty());
    }

    #[tokio::test]
    async fn requests_fail_after_shutdown() {
        let cancel = CancellationToken::new();
        let broker = ConfirmationBroker::new(Duration::from_secs(60), cancel.clone());
        cancel.cancel();
        let err = broker
            .request(Uuid::new_v4(), "delete_resource", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)));
    }

    #[tokio::test]
    async fn list_pending_is_per_user() {
        let broker = broker(Duration::from_secs(60));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        broker.request(alice, "a", serde_json::json!({})).await.unwrap();
        broker.request(bob, "b", serde_json::json!({})).await.unwrap();
        assert_eq!(broker.list_pending(alice).await.len(), 1);
        assert_eq!(broker.list_pending(alice).await[0].tool_name, "a");
    }
}
