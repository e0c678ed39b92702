use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::proto::tunnel::{self as pb, server_frame};
use crate::transport::{
    EventStream, K8sOp, K8sReply, TransportError, WatchEvent, WatchEventType,
};

/// Applied when the caller brought no deadline of its own.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const WATCH_CHANNEL_CAPACITY: usize = 256;

/// One live tunnel to one agent. Requests and watches are multiplexed by
/// server-generated correlation ids; an id is never reused while
/// outstanding (the counter is monotonic for the session's lifetime).
pub struct AgentSession {
    cluster_id: Uuid,
    to_agent: mpsc::Sender<pb::ServerFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<K8sReply, TransportError>>>>,
    watches: Mutex<HashMap<u64, mpsc::Sender<Result<WatchEvent, TransportError>>>>,
    correlation: AtomicU64,
    cancel: CancellationToken,
    last_pong: std::sync::Mutex<Instant>,
}

impl AgentSession {
    pub fn new(
        cluster_id: Uuid,
        to_agent: mpsc::Sender<pb::ServerFrame>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster_id,
            to_agent,
            pending: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            correlation: AtomicU64::new(0),
            cancel,
            last_pong: std::sync::Mutex::new(Instant::now()),
        })
    }

    pub fn cluster_id(&self) -> Uuid {
        self.cluster_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn next_correlation(&self) -> u64 {
        self.correlation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn closed_error() -> TransportError {
        TransportError::Unavailable("agent session closed; retry after reconnect".into())
    }

    /// Write a `K8sRequest` frame and await the matching `K8sResponse`.
    pub async fn request(&self, op: K8sOp) -> Result<K8sReply, TransportError> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        let body = match &op.body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| TransportError::Protocol(format!("unserializable body: {e}")))?,
            None => Vec::new(),
        };
        let correlation_id = self.next_correlation();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id, tx);

        let frame = pb::ServerFrame {
            kind: Some(server_frame::Kind::Request(pb::K8sRequest {
                correlation_id,
                verb: op.verb.as_str().to_string(),
                group: op.group,
                version: op.version,
                resource: op.resource,
                namespace: op.namespace.unwrap_or_default(),
                name: op.name.unwrap_or_default(),
                body: body.into(),
            })),
        };
        if self.to_agent.send(frame).await.is_err() {
            self.pending.lock().await.remove(&correlation_id);
            return Err(Self::closed_error());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Self::closed_error()),
            res = tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, rx) => match res {
                Err(_) => {
                    self.pending.lock().await.remove(&correlation_id);
                    Err(TransportError::Unavailable("agent request timed out".into()))
                }
                Ok(Err(_)) => Err(Self::closed_error()),
                Ok(Ok(reply)) => reply,
            },
        }
    }

    /// Send `WatchSubscribe` and expose the inbound event subseries as a
    /// stream. Dropping the stream unsubscribes.
    pub async fn open_watch(
        self: &Arc<Self>,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<EventStream, TransportError> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        let correlation_id = self.next_correlation();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.watches.lock().await.insert(correlation_id, tx);

        let frame = pb::ServerFrame {
            kind: Some(server_frame::Kind::WatchSubscribe(pb::WatchSubscribe {
                correlation_id,
                resource: resource.to_string(),
                namespace: namespace.unwrap_or_default().to_string(),
            })),
        };
        if self.to_agent.send(frame).await.is_err() {
            self.watches.lock().await.remove(&correlation_id);
            return Err(Self::closed_error());
        }

        Ok(Box::pin(TunnelWatch {
            rx,
            session: Arc::downgrade(self),
            correlation_id,
        }))
    }

    /// Route an inbound response to its waiter. Unknown or already-answered
    /// correlations are a protocol violation by the agent; logged and dropped.
    pub async fn route_response(&self, resp: pb::K8sResponse) {
        let Some(tx) = self.pending.lock().await.remove(&resp.correlation_id) else {
            tracing::warn!(
                cluster = %self.cluster_id,
                correlation = resp.correlation_id,
                "response for unknown correlation id"
            );
            return;
        };
        let reply = if resp.error.is_empty() {
            Ok(K8sReply {
                status: u16::try_from(resp.status_code).unwrap_or(502),
                body: resp.body.into(),
            })
        } else {
            Err(TransportError::Upstream {
                status: u16::try_from(resp.status_code).ok().filter(|s| *s >= 100).unwrap_or(502),
                message: resp.error,
            })
        };
        let _ = tx.send(reply);
    }

    pub async fn route_watch_event(&self, event: pb::WatchEvent) {
        let tx = {
            let watches = self.watches.lock().await;
            let Some(tx) = watches.get(&event.correlation_id) else {
                return;
            };
            tx.clone()
        };
        match event.r#type.parse::<WatchEventType>() {
            Ok(event_type) => {
                let _ = tx
                    .send(Ok(WatchEvent {
                        event_type,
                        object: event.object.into(),
                    }))
                    .await;
            }
            Err(e) => {
                tracing::warn!(cluster = %self.cluster_id, error = %e, "malformed watch event");
            }
        }
    }

    pub async fn send_ping(&self, nonce: u64) -> bool {
        let frame = pb::ServerFrame {
            kind: Some(server_frame::Kind::Ping(pb::Ping { nonce })),
        };
        self.to_agent.send(frame).await.is_ok()
    }

    pub async fn send_pong(&self, nonce: u64) -> bool {
        let frame = pb::ServerFrame {
            kind: Some(server_frame::Kind::Pong(pb::Pong { nonce })),
        };
        self.to_agent.send(frame).await.is_ok()
    }

    pub fn note_pong(&self) {
        if let Ok(mut last) = self.last_pong.lock() {
            *last = Instant::now();
        }
    }

    pub fn since_last_pong(&self) -> Duration {
        self.last_pong
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Declare the session dead: every pending request completes with a
    /// retryable error and every watch sees an explicit disconnect before
    /// its stream ends.
    pub async fn teardown(&self, reason: &str) {
        self.cancel.cancel();
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(TransportError::Unavailable(reason.to_string())));
        }
        let watches: Vec<_> = self.watches.lock().await.drain().collect();
        for (_, tx) in watches {
            let _ = tx.try_send(Err(TransportError::Unavailable(reason.to_string())));
            // Sender drops here; streams end after the disconnect signal.
        }
    }
}

/// Inbound event subseries for one `WatchSubscribe`. Dropping it removes the
/// route and tells the agent to stop.
struct TunnelWatch {
    rx: mpsc::Receiver<Result<WatchEvent, TransportError>>,
    session: Weak<AgentSession>,
    correlation_id: u64,
}

impl Stream for TunnelWatch {
    type Item = Result<WatchEvent, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TunnelWatch {
    fn drop(&mut self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }
        let frame = pb::ServerFrame {
            kind: Some(server_frame::Kind::WatchUnsubscribe(pb::WatchUnsubscribe {
                correlation_id: self.correlation_id,
            })),
        };
        let _ = session.to_agent.try_send(frame);
        let correlation_id = self.correlation_id;
        tokio::spawn(async move {
            session.watches.lock().await.remove(&correlation_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::transport::Verb;

    fn op() -> K8sOp {
        K8sOp {
            verb: Verb::List,
            group: String::new(),
            version: "v1".into(),
            resource: "pods".into(),
            namespace: Some("default".into()),
            name: None,
            body: None,
        }
    }

    fn session() -> (Arc<AgentSession>, mpsc::Receiver<pb::ServerFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let session = AgentSession::new(Uuid::new_v4(), tx, CancellationToken::new());
        (session, rx)
    }

    fn correlation_of(frame: &pb::ServerFrame) -> u64 {
        match frame.kind.as_ref().unwrap() {
            server_frame::Kind::Request(r) => r.correlation_id,
            server_frame::Kind::WatchSubscribe(w) => w.correlation_id,
            server_frame::Kind::WatchUnsubscribe(w) => w.correlation_id,
            _ => panic!("unexpected frame"),
        }
    }

    #[tokio::test]
    async fn request_resolves_by_correlation_id() {
        let (session, mut rx) = session();

        let echo = session.clone();
        let pump = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let correlation_id = correlation_of(&frame);
            echo.route_response(pb::K8sResponse {
                correlation_id,
                status_code: 200,
                body: b"{\"items\":[]}".to_vec().into(),
                error: String::new(),
            })
            .await;
        });

        let reply = session.request(op()).await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(&reply.body[..], b"{\"items\":[]}");
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn interleaved_responses_route_to_their_requests() {
        let (session, mut rx) = session();

        let echo = session.clone();
        tokio::spawn(async move {
            let first = correlation_of(&rx.recv().await.unwrap());
            let second = correlation_of(&rx.recv().await.unwrap());
            // Answer out of order.
            for (correlation_id, body) in [(second, "second"), (first, "first")] {
                echo.route_response(pb::K8sResponse {
                    correlation_id,
                    status_code: 200,
                    body: body.as_bytes().to_vec().into(),
                    error: String::new(),
                })
                .await;
            }
        });

        let (a, b) = tokio::join!(session.request(op()), session.request(op()));
        assert_eq!(&a.unwrap().body[..], b"first");
        assert_eq!(&b.unwrap().body[..], b"second");
    }

    #[tokio::test]
    async fn agent_error_surfaces_with_upstream_status() {
        let (session, mut rx) = session();
        let echo = session.clone();
        tokio::spawn(async move {
            let correlation_id = correlation_of(&rx.recv().await.unwrap());
            echo.route_response(pb::K8sResponse {
                correlation_id,
                status_code: 404,
                body: Default::default(),
                error: "pods \"web-1\" not found".into(),
            })
            .await;
        });

        let err = session.request(op()).await.unwrap_err();
        match err {
            TransportError::Upstream { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn teardown_completes_pending_with_retryable_error() {
        let (session, mut rx) = session();
        let worker = {
            let session = session.clone();
            tokio::spawn(async move { session.request(op()).await })
        };
        // Wait until the request frame is on the wire.
        let _ = rx.recv().await.unwrap();
        session.teardown("agent disconnected").await;

        let err = worker.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert!(session.request(op()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_without_response() {
        let (session, _rx) = session();
        let err = session.request(op()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(session.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn watch_events_flow_until_disconnect() {
        let (session, mut rx) = session();
        let mut stream = session.open_watch("pods", Some("default")).await.unwrap();
        let correlation_id = correlation_of(&rx.recv().await.unwrap());

        session
            .route_watch_event(pb::WatchEvent {
                correlation_id,
                r#type: "ADDED".into(),
                object: b"{}".to_vec().into(),
            })
            .await;
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, WatchEventType::Added);

        session.teardown("agent disconnected").await;
        let disconnect = stream.next().await.unwrap();
        assert!(disconnect.is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_watch_sends_unsubscribe() {
        let (session, mut rx) = session();
        let stream = session.open_watch("pods", None).await.unwrap();
        let subscribe = rx.recv().await.unwrap();
        let correlation_id = correlation_of(&subscribe);

        drop(stream);
        let unsubscribe = rx.recv().await.unwrap();
        match unsubscribe.kind.unwrap() {
            server_frame::Kind::WatchUnsubscribe(w) => {
                assert_eq!(w.correlation_id, correlation_id);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
