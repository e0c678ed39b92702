use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use argus_common::args::HubArgs;
use argus_common::error::ApiError;

use crate::registry::{ClusterEvent, ClusterRegistry, ClusterState};
use crate::transport::WatchEvent;

/// Interest in one class of cluster events. Cluster-wide iff `namespace` is
/// `None`; a namespaced key never shares an upstream watch with the
/// cluster-wide key for the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SubKey {
    pub cluster_id: Uuid,
    pub resource: String,
    pub namespace: Option<String>,
}

impl SubKey {
    pub fn new(cluster_id: Uuid, resource: &str, namespace: Option<&str>) -> Self {
        Self {
            cluster_id,
            resource: resource.to_string(),
            namespace: namespace.map(str::to_string),
        }
    }
}

impl std::fmt::Display for SubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.cluster_id, self.resource, ns),
            None => write!(f, "{}/{}", self.cluster_id, self.resource),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The subscriber's queue overflowed; its socket is being closed.
    SlowConsumer,
    /// The key is gone (cluster deleted or upstream terminally failed).
    WatchClosed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::WatchClosed => "watch_closed",
        }
    }
}

/// What lands in a subscriber's queue. Per-socket delivery is serialized by
/// the queue itself, so no socket observes out-of-order events for a key.
#[derive(Debug, Clone)]
pub enum HubMessage {
    Event { key: SubKey, event: WatchEvent },
    Closed { key: SubKey, reason: CloseReason },
}

/// One client socket as the hub sees it: a bounded queue plus a kill switch.
/// The socket task owns the receiving half and the actual WebSocket.
#[derive(Clone)]
pub struct SubscriberSocket {
    pub id: Uuid,
    tx: mpsc::Sender<HubMessage>,
    kill: CancellationToken,
    close_reason: Arc<std::sync::Mutex<Option<CloseReason>>>,
}

impl SubscriberSocket {
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel(queue_size);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
                kill: CancellationToken::new(),
                close_reason: Arc::new(std::sync::Mutex::new(None)),
            },
            rx,
        )
    }

    pub fn killed(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub fn close(&self, reason: CloseReason) {
        if let Ok(mut slot) = self.close_reason.lock() {
            slot.get_or_insert(reason);
        }
        self.kill.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|slot| *slot)
    }
}

/// Returned by `subscribe`; releases exactly that interest.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub key: SubKey,
}

struct Member {
    handle_id: u64,
    socket: SubscriberSocket,
}

struct KeyEntry {
    members: Vec<Member>,
    upstream: Option<CancellationToken>,
    /// Bumped every time a new upstream reader starts; stale readers use it
    /// to avoid clobbering their successor's state.
    epoch: u64,
}

impl KeyEntry {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            upstream: None,
            epoch: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Size of each subscriber's bounded queue
    pub subscriber_queue: usize,
    /// How long an upstream watch outlives its last subscriber
    pub linger: Duration,
}

impl From<&HubArgs> for HubConfig {
    fn from(args: &HubArgs) -> Self {
        Self {
            subscriber_queue: args.subscriber_queue,
            linger: Duration::from_millis(args.linger_ms),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: 256,
            linger: Duration::from_millis(2000),
        }
    }
}

pub struct WatchHubInner {
    registry: ClusterRegistry,
    keys: Mutex<HashMap<SubKey, KeyEntry>>,
    config: HubConfig,
    next_handle: AtomicU64,
    cancel: CancellationToken,
}

/// De-duplicates upstream watches and fans their events out to any number
/// of subscribed sockets. The first subscriber to a key opens the upstream
/// watch; the last one out closes it after a linger interval.
#[derive(Clone)]
pub struct WatchHub {
    inner: Arc<WatchHubInner>,
}

impl Deref for WatchHub {
    type Target = WatchHubInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl WatchHub {
    pub fn new(registry: ClusterRegistry, config: HubConfig, cancel: CancellationToken) -> Self {
        let hub = Self {
            inner: Arc::new(WatchHubInner {
                registry,
                keys: Mutex::new(HashMap::new()),
                config,
                next_handle: AtomicU64::new(0),
                cancel,
            }),
        };
        hub.spawn_cluster_listener();
        hub
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register interest. The first subscriber for a key starts the single
    /// upstream reader; further subscribers attach to it.
    pub async fn subscribe(
        &self,
        socket: &SubscriberSocket,
        key: SubKey,
    ) -> Result<SubscriptionHandle, ApiError> {
        // Subscribing to a deleted cluster fails fast instead of idling.
        if self.registry.get_state(key.cluster_id).await.is_none() {
            return Err(ApiError::NotFound(format!(
                "cluster {} not found",
                key.cluster_id
            )));
        }
        let handle_id = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        let mut keys = self.keys.lock().await;
        let entry = keys.entry(key.clone()).or_insert_with(KeyEntry::new);
        entry.members.push(Member {
            handle_id,
            socket: socket.clone(),
        });
        metrics::gauge!("argus_hub_subscribers").increment(1.0);
        if entry.upstream.is_none() {
            self.start_upstream(&key, entry);
        }
        Ok(SubscriptionHandle { id: handle_id, key })
    }

    /// Remove one subscription. When the key's last subscriber leaves, the
    /// upstream watch is shut down after the linger interval.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut keys = self.keys.lock().await;
        let Some(entry) = keys.get_mut(&handle.key) else {
            return;
        };
        let before = entry.members.len();
        entry.members.retain(|m| m.handle_id != handle.id);
        if entry.members.len() < before {
            metrics::gauge!("argus_hub_subscribers").decrement(1.0);
        }
        if entry.members.is_empty() {
            self.schedule_linger(handle.key.clone());
        }
    }

    /// Release every subscription a socket holds, in one pass. Called when
    /// the socket closes, for whatever reason.
    pub async fn drop_socket(&self, socket_id: Uuid) {
        let mut idle_keys = Vec::new();
        {
            let mut keys = self.keys.lock().await;
            for (key, entry) in keys.iter_mut() {
                let before = entry.members.len();
                entry.members.retain(|m| m.socket.id != socket_id);
                let removed = before - entry.members.len();
                if removed > 0 {
                    metrics::gauge!("argus_hub_subscribers").decrement(removed as f64);
                }
                if removed > 0 && entry.members.is_empty() {
                    idle_keys.push(key.clone());
                }
            }
        }
        for key in idle_keys {
            self.schedule_linger(key);
        }
    }

    /// Deliver one event to every current subscriber of `key`, in the order
    /// received here. A subscriber whose queue is full is evicted and its
    /// socket closed; it never stalls the others or the upstream reader.
    pub async fn publish(&self, key: &SubKey, event: WatchEvent) {
        // Snapshot members so delivery never holds the table lock.
        let members: Vec<(u64, SubscriberSocket)> = {
            let keys = self.keys.lock().await;
            let Some(entry) = keys.get(key) else { return };
            entry
                .members
                .iter()
                .map(|m| (m.handle_id, m.socket.clone()))
                .collect()
        };

        let mut evicted = Vec::new();
        for (handle_id, socket) in members {
            let message = HubMessage::Event {
                key: key.clone(),
                event: event.clone(),
            };
            match socket.tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(socket = %socket.id, %key, "subscriber queue overflow, evicting");
                    metrics::counter!("argus_hub_slow_consumers_total").increment(1);
                    socket.close(CloseReason::SlowConsumer);
                    evicted.push(handle_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evicted.push(handle_id);
                }
            }
        }
        if !evicted.is_empty() {
            let mut schedule = false;
            {
                let mut keys = self.keys.lock().await;
                if let Some(entry) = keys.get_mut(key) {
                    let before = entry.members.len();
                    entry.members.retain(|m| !evicted.contains(&m.handle_id));
                    let removed = before - entry.members.len();
                    if removed > 0 {
                        metrics::gauge!("argus_hub_subscribers").decrement(removed as f64);
                    }
                    schedule = removed > 0 && entry.members.is_empty();
                }
            }
            if schedule {
                self.schedule_linger(key.clone());
            }
        }
    }

    /// Start an upstream reader for `key`. Caller holds the table lock and
    /// has verified none is running.
    fn start_upstream(&self, key: &SubKey, entry: &mut KeyEntry) {
        entry.epoch += 1;
        let epoch = entry.epoch;
        let cancel = self.cancel.child_token();
        entry.upstream = Some(cancel.clone());
        let hub = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            hub.run_upstream(key, epoch, cancel).await;
        });
    }

    async fn run_upstream(&self, key: SubKey, epoch: u64, cancel: CancellationToken) {
        let transport = match self.registry.get(key.cluster_id).await {
            Ok(transport) => transport,
            Err(ApiError::NotFound(_)) => {
                self.close_key(&key, CloseReason::WatchClosed).await;
                return;
            }
            Err(_) => {
                // Cluster is between sessions; members stay and the
                // reconnect listener reopens this key.
                self.mark_upstream_gone(&key, epoch).await;
                return;
            }
        };
        let stream = match transport
            .open_watch(&key.resource, key.namespace.as_deref())
            .await
        {
            Ok(stream) => stream,
            Err(e) if e.is_retryable() => {
                tracing::debug!(%key, error = %e, "upstream watch unavailable, waiting for reconnect");
                self.mark_upstream_gone(&key, epoch).await;
                return;
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "upstream watch failed");
                self.close_key(&key, CloseReason::WatchClosed).await;
                return;
            }
        };
        tracing::debug!(%key, "upstream watch open");
        let mut stream = stream;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                item = stream.next() => match item {
                    Some(Ok(event)) => self.publish(&key, event).await,
                    Some(Err(e)) if e.is_retryable() => {
                        tracing::debug!(%key, error = %e, "upstream watch disconnected");
                        self.mark_upstream_gone(&key, epoch).await;
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%key, error = %e, "upstream watch error");
                        self.close_key_if_epoch(&key, epoch, CloseReason::WatchClosed).await;
                        return;
                    }
                    None => {
                        // Natural end of stream: keep members through an
                        // agent reconnect, otherwise the key is done.
                        let reconnecting = matches!(
                            self.registry.get_state(key.cluster_id).await,
                            Some(ClusterState::Reconnecting)
                        );
                        if reconnecting {
                            self.mark_upstream_gone(&key, epoch).await;
                        } else {
                            self.close_key_if_epoch(&key, epoch, CloseReason::WatchClosed).await;
                        }
                        return;
                    }
                }
            }
        }
    }

    async fn mark_upstream_gone(&self, key: &SubKey, epoch: u64) {
        let mut keys = self.keys.lock().await;
        if let Some(entry) = keys.get_mut(key)
            && entry.epoch == epoch
        {
            entry.upstream = None;
        }
    }

    /// Remove the key entirely, notifying every member with a terminal
    /// close. Used for cluster deletion and non-retryable upstream failure.
    async fn close_key(&self, key: &SubKey, reason: CloseReason) {
        let entry = self.keys.lock().await.remove(key);
        let Some(entry) = entry else { return };
        if let Some(upstream) = entry.upstream {
            upstream.cancel();
        }
        metrics::gauge!("argus_hub_subscribers").decrement(entry.members.len() as f64);
        for member in entry.members {
            let _ = member.socket.tx.try_send(HubMessage::Closed {
                key: key.clone(),
                reason,
            });
        }
    }

    async fn close_key_if_epoch(&self, key: &SubKey, epoch: u64, reason: CloseReason) {
        let stale = {
            let keys = self.keys.lock().await;
            keys.get(key).map(|entry| entry.epoch != epoch)
        };
        match stale {
            Some(false) => self.close_key(key, reason).await,
            _ => {}
        }
    }

    /// Delay the upstream shutdown so subscribe/unsubscribe churn doesn't
    /// thrash the cluster API.
    fn schedule_linger(&self, key: SubKey) {
        let hub = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = hub.cancel.cancelled() => {}
                _ = tokio::time::sleep(hub.config.linger) => {
                    let mut keys = hub.keys.lock().await;
                    if let Some(entry) = keys.get(&key)
                        && entry.members.is_empty()
                    {
                        if let Some(entry) = keys.remove(&key)
                            && let Some(upstream) = entry.upstream
                        {
                            upstream.cancel();
                        }
                        tracing::debug!(%key, "upstream watch closed after linger");
                    }
                }
            }
        });
    }

    /// React to cluster liveness changes: tear down keys of deleted
    /// clusters, re-open surviving keys when a cluster comes back.
    fn spawn_cluster_listener(&self) {
        let hub = self.clone();
        let mut events = self.registry.subscribe_events();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(ClusterEvent::Deleted(cluster_id)) => {
                            hub.teardown_cluster(cluster_id).await;
                        }
                        Ok(ClusterEvent::Connected(cluster_id)) => {
                            hub.reopen_cluster(cluster_id).await;
                        }
                        Ok(ClusterEvent::Reconnecting(cluster_id)) => {
                            hub.pause_cluster(cluster_id).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "cluster event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// The cluster dropped between sessions: stop its upstream readers but
    /// keep every membership, ready for `reopen_cluster`.
    async fn pause_cluster(&self, cluster_id: Uuid) {
        let mut keys = self.keys.lock().await;
        for (key, entry) in keys.iter_mut() {
            if key.cluster_id == cluster_id
                && let Some(upstream) = entry.upstream.take()
            {
                upstream.cancel();
                tracing::debug!(%key, "upstream watch paused for reconnect");
            }
        }
    }

    /// Synchronously tear down every key that mentions the cluster.
    pub async fn teardown_cluster(&self, cluster_id: Uuid) {
        let doomed: Vec<SubKey> = {
            let keys = self.keys.lock().await;
            keys.keys()
                .filter(|k| k.cluster_id == cluster_id)
                .cloned()
                .collect()
        };
        for key in doomed {
            self.close_key(&key, CloseReason::WatchClosed).await;
        }
    }

    /// Re-open every key of the cluster that still has a subscriber. No
    /// event replay: clients reconcile via an explicit list.
    async fn reopen_cluster(&self, cluster_id: Uuid) {
        let mut keys = self.keys.lock().await;
        let reopen: Vec<SubKey> = keys
            .iter()
            .filter(|(k, entry)| {
                k.cluster_id == cluster_id && entry.upstream.is_none() && !entry.members.is_empty()
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in reopen {
            if let Some(entry) = keys.get_mut(&key) {
                self.start_upstream(&key, entry);
            }
        }
    }

    #[cfg(test)]
    async fn member_count(&self, key: &SubKey) -> usize {
        self.keys
            .lock()
            .await
            .get(key)
            .map(|e| e.members.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    async fn has_upstream(&self, key: &SubKey) -> bool {
        self.keys
            .lock()
            .await
            .get(key)
            .is_some_and(|e| e.upstream.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use base64::Engine;
    use tokio::sync::broadcast;
    use tokio_stream::wrappers::BroadcastStream;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::seal::Sealer;
    use crate::transport::{
        EventStream, K8sOp, K8sReply, Transport, TransportError, WatchEventType,
    };

    /// Transport whose watches are fed from a broadcast channel; counts
    /// opens so de-duplication is observable.
    struct FeedTransport {
        opens: AtomicUsize,
        feed: broadcast::Sender<WatchEvent>,
    }

    impl FeedTransport {
        fn new() -> Arc<Self> {
            let (feed, _) = broadcast::channel(64);
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                feed,
            })
        }

        fn emit(&self, event: WatchEvent) {
            let _ = self.feed.send(event);
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FeedTransport {
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
            self.opens.fetch_add(1, Ordering::SeqCst);
            let rx = self.feed.subscribe();
            let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok().map(Ok) });
            Ok(Box::pin(stream))
        }
    }

    fn event(name: &str) -> WatchEvent {
        WatchEvent {
            event_type: WatchEventType::Added,
            object: bytes::Bytes::from(format!("{{\"name\":\"{name}\"}}")),
        }
    }

    async fn fixture(config: HubConfig) -> (WatchHub, ClusterRegistry, Arc<FeedTransport>, Uuid) {
        let key = base64::engine::general_purpose::STANDARD.encode([2u8; 32]);
        let store = Arc::new(MemoryStore::new(Sealer::from_base64(&key).unwrap()));
        let registry = ClusterRegistry::new(store, CancellationToken::new());
        let transport = FeedTransport::new();
        let id = Uuid::new_v4();
        let record = registry
            .store()
            .create_agent_cluster(id, "test", Uuid::new_v4(), Default::default())
            .await
            .unwrap();
        registry
            .adopt_agent_session(record, transport.clone(), CancellationToken::new())
            .await;
        let hub = WatchHub::new(registry.clone(), config, CancellationToken::new());
        (hub, registry, transport, id)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn next_event(message: Option<HubMessage>) -> WatchEvent {
        match message {
            Some(HubMessage::Event { event, .. }) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_share_one_upstream_per_key() {
        let (hub, _registry, transport, cluster) = fixture(HubConfig::default()).await;

        let (socket_a, mut rx_a) = SubscriberSocket::new(16);
        let (socket_b, mut rx_b) = SubscriberSocket::new(16);
        let key = SubKey::new(cluster, "pods", Some("default"));
        hub.subscribe(&socket_a, key.clone()).await.unwrap();
        hub.subscribe(&socket_b, key.clone()).await.unwrap();
        settle().await;
        assert_eq!(transport.open_count(), 1);

        // A cluster-wide subscription is a different key with its own
        // upstream watch.
        let (socket_c, mut rx_c) = SubscriberSocket::new(16);
        let wide = SubKey::new(cluster, "pods", None);
        hub.subscribe(&socket_c, wide.clone()).await.unwrap();
        settle().await;
        assert_eq!(transport.open_count(), 2);

        transport.emit(event("default/p"));
        settle().await;

        let a = next_event(rx_a.recv().await);
        let b = next_event(rx_b.recv().await);
        let c = next_event(rx_c.recv().await);
        assert_eq!(a.object, b.object);
        assert_eq!(a.object, c.object);
    }

    #[tokio::test(start_paused = true)]
    async fn events_delivered_in_publish_order() {
        let (hub, _registry, _transport, cluster) = fixture(HubConfig::default()).await;
        let key = SubKey::new(cluster, "pods", Some("default"));
        let (socket, mut rx) = SubscriberSocket::new(16);
        hub.subscribe(&socket, key.clone()).await.unwrap();

        for i in 0..5 {
            hub.publish(&key, event(&format!("p{i}"))).await;
        }
        for i in 0..5 {
            let got = next_event(rx.recv().await);
            assert_eq!(got.object, bytes::Bytes::from(format!("{{\"name\":\"p{i}\"}}")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_is_evicted_others_unaffected() {
        let (hub, _registry, _transport, cluster) = fixture(HubConfig {
            subscriber_queue: 4,
            ..HubConfig::default()
        })
        .await;
        let key = SubKey::new(cluster, "pods", Some("default"));

        let (slow, _slow_rx) = SubscriberSocket::new(4); // receiver never read
        let (healthy, mut healthy_rx) = SubscriberSocket::new(16);
        hub.subscribe(&slow, key.clone()).await.unwrap();
        hub.subscribe(&healthy, key.clone()).await.unwrap();

        for i in 0..5 {
            hub.publish(&key, event(&format!("p{i}"))).await;
        }

        assert!(slow.killed().is_cancelled());
        assert_eq!(slow.close_reason(), Some(CloseReason::SlowConsumer));
        assert_eq!(hub.member_count(&key).await, 1);

        for i in 0..5 {
            let got = next_event(healthy_rx.recv().await);
            assert_eq!(got.object, bytes::Bytes::from(format!("{{\"name\":\"p{i}\"}}")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn last_unsubscribe_closes_upstream_after_linger() {
        let (hub, _registry, transport, cluster) = fixture(HubConfig {
            subscriber_queue: 16,
            linger: Duration::from_millis(500),
        })
        .await;
        let key = SubKey::new(cluster, "pods", Some("default"));
        let (socket, _rx) = SubscriberSocket::new(16);
        let handle = hub.subscribe(&socket, key.clone()).await.unwrap();
        settle().await;
        assert_eq!(transport.open_count(), 1);

        hub.unsubscribe(handle).await;
        // Within the linger window, a re-subscribe reuses the reader.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let handle = hub.subscribe(&socket, key.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(transport.open_count(), 1);
        assert!(hub.has_upstream(&key).await);

        // Past the linger window, the upstream goes away.
        hub.unsubscribe(handle).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!hub.has_upstream(&key).await);
        assert_eq!(hub.member_count(&key).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn socket_drop_releases_all_subscriptions() {
        let (hub, _registry, _transport, cluster) = fixture(HubConfig::default()).await;
        let (socket, _rx) = SubscriberSocket::new(16);
        let pods = SubKey::new(cluster, "pods", Some("default"));
        let deployments = SubKey::new(cluster, "deployments", None);
        hub.subscribe(&socket, pods.clone()).await.unwrap();
        hub.subscribe(&socket, deployments.clone()).await.unwrap();

        hub.drop_socket(socket.id).await;
        assert_eq!(hub.member_count(&pods).await, 0);
        assert_eq!(hub.member_count(&deployments).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_delete_sends_terminal_close() {
        let (hub, registry, _transport, cluster) = fixture(HubConfig::default()).await;
        let key = SubKey::new(cluster, "pods", Some("default"));
        let (socket, mut rx) = SubscriberSocket::new(16);
        hub.subscribe(&socket, key.clone()).await.unwrap();
        settle().await;

        registry.delete(cluster).await.unwrap();
        settle().await;

        match rx.recv().await {
            Some(HubMessage::Closed { reason, .. }) => {
                assert_eq!(reason, CloseReason::WatchClosed);
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(hub.member_count(&key).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reopens_surviving_keys() {
        let (hub, registry, transport, cluster) = fixture(HubConfig::default()).await;
        let key = SubKey::new(cluster, "pods", Some("default"));
        let (socket, _rx) = SubscriberSocket::new(16);
        hub.subscribe(&socket, key.clone()).await.unwrap();
        settle().await;
        assert_eq!(transport.open_count(), 1);

        registry.mark_reconnecting(cluster).await;
        settle().await;

        // The agent comes back with a fresh session.
        let record = registry.get_record(cluster).await.unwrap();
        registry
            .adopt_agent_session(record, transport.clone(), CancellationToken::new())
            .await;
        settle().await;

        assert_eq!(transport.open_count(), 2);
        assert_eq!(hub.member_count(&key).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_to_unknown_cluster_fails() {
        let (hub, _registry, _transport, _cluster) = fixture(HubConfig::default()).await;
        let (socket, _rx) = SubscriberSocket::new(16);
        let key = SubKey::new(Uuid::new_v4(), "pods", None);
        assert!(hub.subscribe(&socket, key).await.is_err());
    }
}
