use std::{collections::HashMap, ops::Deref, sync::Arc};

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use argus_common::error::ApiError;

use crate::store::{
    AgentToken, ClusterRecord, ConnectionType, Store, StoreError, hash_secret, new_agent_secret,
};
use crate::transport::{Transport, direct::DirectTransport};

/// Registration tokens are short-lived; the agent principal minted on
/// consumption is what persists.
const AGENT_TOKEN_TTL_MINUTES: i64 = 30;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Pending,
    Connected,
    Reconnecting,
    Error,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Connected,
    Reconnecting,
    Offline,
}

/// Broadcast to interested parties (the watch hub) whenever a cluster's
/// liveness changes.
#[derive(Debug, Clone, Copy)]
pub enum ClusterEvent {
    Connected(Uuid),
    Reconnecting(Uuid),
    Deleted(Uuid),
}

struct ClusterEntry {
    record: ClusterRecord,
    state: ClusterState,
    transport: Option<Arc<dyn Transport>>,
    /// Cancelled on delete; agent sessions hang their teardown off this.
    cancel: CancellationToken,
}

/// What `list` and `get` surface to the HTTP boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    #[serde(flatten)]
    pub record: ClusterRecord,
    pub state: ClusterState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_status: Option<AgentStatus>,
}

pub struct RegistryInner {
    clusters: Mutex<HashMap<Uuid, ClusterEntry>>,
    store: Arc<dyn Store>,
    events: broadcast::Sender<ClusterEvent>,
    cancel: CancellationToken,
}

/// Owns every cluster record and its active transport. State transitions for
/// one cluster are serialized under the map lock.
#[derive(Clone)]
pub struct ClusterRegistry {
    inner: Arc<RegistryInner>,
}

impl Deref for ClusterRegistry {
    type Target = RegistryInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl ClusterRegistry {
    pub fn new(store: Arc<dyn Store>, cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                clusters: Mutex::new(HashMap::new()),
                store,
                events,
                cancel,
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Rebuild in-memory entries from the store on startup. Direct clusters
    /// reconnect eagerly; agent clusters wait for their session.
    pub async fn load_existing(&self) -> anyhow::Result<()> {
        let records = self.store.list_clusters().await?;
        for record in records {
            match record.connection_type {
                ConnectionType::Direct => {
                    let id = record.id;
                    match self.connect_direct_transport(id).await {
                        Ok(transport) => {
                            self.insert_entry(record, ClusterState::Connected, Some(transport))
                                .await;
                            let _ = self.events.send(ClusterEvent::Connected(id));
                        }
                        Err(e) => {
                            tracing::warn!(cluster = %id, error = %e, "direct cluster failed to connect");
                            self.insert_entry(record, ClusterState::Error, None).await;
                        }
                    }
                }
                ConnectionType::Agent => {
                    self.insert_entry(record, ClusterState::Pending, None).await;
                }
            }
        }
        Ok(())
    }

    async fn connect_direct_transport(&self, id: Uuid) -> anyhow::Result<Arc<dyn Transport>> {
        let kubeconfig = self
            .store
            .load_kubeconfig(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no credentials stored for cluster {id}"))?;
        let transport = DirectTransport::connect(&kubeconfig)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(Arc::new(transport))
    }

    async fn insert_entry(
        &self,
        record: ClusterRecord,
        state: ClusterState,
        transport: Option<Arc<dyn Transport>>,
    ) {
        let mut clusters = self.clusters.lock().await;
        let cancel = self.cancel.child_token();
        clusters.insert(
            record.id,
            ClusterEntry {
                record,
                state,
                transport,
                cancel,
            },
        );
    }

    /// Register a cluster we hold credentials for. The credentials are
    /// sealed by the store; the transport is built before they leave the
    /// call stack.
    pub async fn register_direct(
        &self,
        name: &str,
        api_server_url: &str,
        kubeconfig: &str,
    ) -> Result<ClusterView, ApiError> {
        let record = self
            .store
            .save_direct_cluster(name, api_server_url, kubeconfig)
            .await
            .map_err(store_error)?;
        let id = record.id;
        match DirectTransport::connect(kubeconfig).await {
            Ok(transport) => {
                self.insert_entry(record, ClusterState::Connected, Some(Arc::new(transport)))
                    .await;
                let _ = self.events.send(ClusterEvent::Connected(id));
            }
            Err(e) => {
                tracing::warn!(cluster = %id, error = %e, "cluster registered but unreachable");
                self.insert_entry(record, ClusterState::Error, None).await;
            }
        }
        self.view(id)
            .await
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("cluster entry vanished")))
    }

    /// Mint a single-use registration token for an agent-connected cluster.
    /// Returns the record and the plaintext secret (shown exactly once).
    pub async fn register_agent(
        &self,
        cluster_name_hint: &str,
        permissions_preset: &str,
        created_by: Uuid,
    ) -> Result<(AgentToken, String), ApiError> {
        let secret = new_agent_secret();
        let token = AgentToken {
            id: Uuid::new_v4(),
            secret_hash: hash_secret(&secret),
            cluster_name_hint: cluster_name_hint.to_string(),
            permissions_preset: permissions_preset.to_string(),
            created_by,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(AGENT_TOKEN_TTL_MINUTES),
            used: false,
            used_at: None,
            cluster_id: None,
        };
        self.store
            .create_agent_token(token.clone())
            .await
            .map_err(store_error)?;
        Ok((token, secret))
    }

    /// Make a freshly-registered agent cluster visible before its session
    /// stream arrives.
    pub async fn track_agent_cluster(&self, record: ClusterRecord) {
        self.insert_entry(record, ClusterState::Pending, None).await;
    }

    /// Attach a live agent session to its cluster, on first registration and
    /// on every reconnect. Returns the cluster id.
    pub async fn adopt_agent_session(
        &self,
        record: ClusterRecord,
        transport: Arc<dyn Transport>,
        session_cancel: CancellationToken,
    ) -> Uuid {
        let id = record.id;
        let mut clusters = self.clusters.lock().await;
        clusters.insert(
            id,
            ClusterEntry {
                record,
                state: ClusterState::Connected,
                transport: Some(transport),
                cancel: session_cancel,
            },
        );
        drop(clusters);
        let _ = self.events.send(ClusterEvent::Connected(id));
        id
    }

    /// Agent liveness lapsed: keep the record, drop the transport, and tell
    /// subscribers. Pending requests were already failed by the session.
    pub async fn mark_reconnecting(&self, id: Uuid) {
        let mut clusters = self.clusters.lock().await;
        let Some(entry) = clusters.get_mut(&id) else {
            return;
        };
        if entry.state == ClusterState::Terminated {
            return;
        }
        entry.state = ClusterState::Reconnecting;
        entry.transport = None;
        drop(clusters);
        let _ = self.events.send(ClusterEvent::Reconnecting(id));
    }

    /// Route a logical request to the cluster's live transport.
    pub async fn get(&self, id: Uuid) -> Result<Arc<dyn Transport>, ApiError> {
        let clusters = self.clusters.lock().await;
        let Some(entry) = clusters.get(&id) else {
            return Err(ApiError::NotFound(format!("cluster {id} not found")));
        };
        match (&entry.state, &entry.transport) {
            (ClusterState::Connected, Some(transport)) => Ok(transport.clone()),
            (ClusterState::Reconnecting, _) => Err(ApiError::Unavailable(
                "cluster is reconnecting; retry later".into(),
            )),
            _ => Err(ApiError::Unavailable("cluster is not connected".into())),
        }
    }

    pub async fn get_state(&self, id: Uuid) -> Option<ClusterState> {
        self.clusters.lock().await.get(&id).map(|e| e.state)
    }

    pub async fn get_record(&self, id: Uuid) -> Option<ClusterRecord> {
        self.clusters
            .lock()
            .await
            .get(&id)
            .map(|e| e.record.clone())
    }

    pub async fn view(&self, id: Uuid) -> Option<ClusterView> {
        self.clusters.lock().await.get(&id).map(entry_view)
    }

    pub async fn list(&self) -> Vec<ClusterView> {
        let clusters = self.clusters.lock().await;
        let mut views: Vec<_> = clusters.values().map(entry_view).collect();
        views.sort_by_key(|v| v.record.created_at);
        views
    }

    /// Tear the cluster down: cancel its session, delete the record, and
    /// notify so in-flight watches terminate within a bounded interval.
    pub async fn delete(&self, id: Uuid) -> Result<(), ApiError> {
        let entry = self.clusters.lock().await.remove(&id);
        let deleted = self.store.delete_cluster(id).await.map_err(store_error)?;
        if let Some(entry) = entry {
            entry.cancel.cancel();
        } else if !deleted {
            return Err(ApiError::NotFound(format!("cluster {id} not found")));
        }
        let _ = self.events.send(ClusterEvent::Deleted(id));
        Ok(())
    }
}

fn entry_view(entry: &ClusterEntry) -> ClusterView {
    let agent_status = match entry.record.connection_type {
        ConnectionType::Direct => None,
        ConnectionType::Agent => Some(match entry.state {
            ClusterState::Connected => AgentStatus::Connected,
            ClusterState::Reconnecting => AgentStatus::Reconnecting,
            _ => AgentStatus::Offline,
        }),
    };
    ClusterView {
        record: entry.record.clone(),
        state: entry.state,
        agent_status,
    }
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound => ApiError::NotFound("not found".into()),
        StoreError::Conflict(msg) => ApiError::Conflict(msg),
        StoreError::TokenRejected(reason) => {
            ApiError::Conflict(format!("agent token rejected: {reason}"))
        }
        StoreError::Backend(e) => ApiError::Internal(e),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::seal::Sealer;
    use crate::transport::{EventStream, K8sOp, K8sReply, TransportError};

    pub(crate) struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn do_request(&self, _op: K8sOp) -> Result<K8sReply, TransportError> {
            Ok(K8sReply {
                status: 200,
                body: bytes::Bytes::from_static(b"{}"),
            })
        }

        async fn open_watch(
            &self,
            _resource: &str,
            _namespace: Option<&str>,
        ) -> Result<EventStream, TransportError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    fn registry() -> ClusterRegistry {
        use base64::Engine;
        let key = base64::engine::general_purpose::STANDARD.encode([1u8; 32]);
        let store = Arc::new(MemoryStore::new(Sealer::from_base64(&key).unwrap()));
        ClusterRegistry::new(store, CancellationToken::new())
    }

    async fn adopt(registry: &ClusterRegistry, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let record = registry
            .store()
            .create_agent_cluster(id, name, Uuid::new_v4(), Default::default())
            .await
            .unwrap();
        registry
            .adopt_agent_session(record, Arc::new(NullTransport), CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn adopted_session_routes_requests() {
        let registry = registry();
        let id = adopt(&registry, "prod").await;
        assert!(registry.get(id).await.is_ok());
        assert_eq!(registry.get_state(id).await, Some(ClusterState::Connected));
    }

    #[tokio::test]
    async fn reconnecting_cluster_is_retryable_unavailable() {
        let registry = registry();
        let id = adopt(&registry, "prod").await;
        registry.mark_reconnecting(id).await;

        let err = match registry.get(id).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ApiError::Unavailable(_)));
        let view = registry.view(id).await.unwrap();
        assert_eq!(view.agent_status, Some(AgentStatus::Reconnecting));
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let registry = registry();
        let err = match registry.get(Uuid::new_v4()).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_cancels_session_and_broadcasts() {
        let registry = registry();
        let mut events = registry.subscribe_events();
        let id = adopt(&registry, "prod").await;
        // Drain the Connected event.
        let _ = events.recv().await.unwrap();

        let session_cancel = CancellationToken::new();
        let record = registry.get_record(id).await.unwrap();
        registry
            .adopt_agent_session(record, Arc::new(NullTransport), session_cancel.clone())
            .await;
        let _ = events.recv().await.unwrap();

        registry.delete(id).await.unwrap();
        assert!(session_cancel.is_cancelled());
        assert!(matches!(
            events.recv().await.unwrap(),
            ClusterEvent::Deleted(deleted) if deleted == id
        ));
        assert!(registry.get_record(id).await.is_none());
    }

    #[tokio::test]
    async fn reconnect_returns_cluster_to_connected() {
        let registry = registry();
        let id = adopt(&registry, "prod").await;
        registry.mark_reconnecting(id).await;
        assert_eq!(
            registry.get_state(id).await,
            Some(ClusterState::Reconnecting)
        );

        let record = registry.get_record(id).await.unwrap();
        registry
            .adopt_agent_session(record, Arc::new(NullTransport), CancellationToken::new())
            .await;
        assert_eq!(registry.get_state(id).await, Some(ClusterState::Connected));
        assert!(registry.get(id).await.is_ok());
    }

    #[tokio::test]
    async fn agent_token_minted_and_single_use() {
        let registry = registry();
        let (token, secret) = registry
            .register_agent("prod", "operator", Uuid::new_v4())
            .await
            .unwrap();
        assert!(!token.used);
        assert_eq!(token.secret_hash, hash_secret(&secret));

        let store = registry.store();
        let consumed = store
            .consume_agent_token(&hash_secret(&secret), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(consumed.id, token.id);
        assert!(store
            .consume_agent_token(&hash_secret(&secret), Uuid::new_v4())
            .await
            .is_err());
    }
}
