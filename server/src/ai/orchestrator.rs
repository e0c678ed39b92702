use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use argus_common::auth::Claims;
use argus_common::rbac::{AccessRequest, Permission, authorize};

use crate::audit::AuditSink;
use crate::confirm::{ConfirmationBroker, Outcome};
use crate::registry::ClusterRegistry;
use crate::store::{AuditEntry, Store};

use super::model::{ChatMessage, ModelClient, ModelEvent};
use super::tools::{self, ChatContext, ToolCall};

const SYSTEM_PROMPT: &str = "You are Argus, an assistant operating Kubernetes clusters on the \
user's behalf. Use the provided tools to inspect and change cluster state. Destructive tools \
require the user's explicit approval; never assume one was approved. Prefer reading state \
before mutating it, and report exactly what you did.";

/// Events emitted to the chat socket during one user turn.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    StreamDelta(String),
    ConfirmRequest {
        confirmation_id: Uuid,
        tool_name: String,
        tool_args: Value,
    },
    StreamEnd,
    Error(String),
}

/// Drives the bounded model/tool loop for one chat socket: stream model
/// output, authorize and (for destructive tools) confirm each call, execute,
/// feed the result back, repeat until the model stops or the cap is hit.
#[derive(Clone)]
pub struct Orchestrator {
    model: Arc<dyn ModelClient>,
    registry: ClusterRegistry,
    broker: ConfirmationBroker,
    audit: AuditSink,
    store: Arc<dyn Store>,
    max_tool_iterations: u32,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: ClusterRegistry,
        broker: ConfirmationBroker,
        audit: AuditSink,
        store: Arc<dyn Store>,
        max_tool_iterations: u32,
    ) -> Self {
        Self {
            model,
            registry,
            broker,
            audit,
            store,
            max_tool_iterations,
        }
    }

    pub fn broker(&self) -> &ConfirmationBroker {
        &self.broker
    }

    /// Run one user turn. Emits `TurnEvent`s as they happen; all failure
    /// modes surface as events rather than a return value so the socket
    /// stays in one piece.
    pub async fn run_turn(
        &self,
        principal: &Claims,
        context: &ChatContext,
        conversation: &mut Vec<ChatMessage>,
        user_message: &str,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) {
        conversation.push(ChatMessage::user_text(&with_context(user_message, context)));

        let permissions = match self.store.permissions_for(principal.sub).await {
            Ok(permissions) => permissions,
            Err(e) => {
                tracing::error!(error = %e, "failed to load permissions for chat turn");
                let _ = events
                    .send(TurnEvent::Error("failed to load permissions".into()))
                    .await;
                return;
            }
        };
        let model_tools = tools::model_tools();

        for _ in 0..self.max_tool_iterations {
            let mut stream = match self
                .model
                .stream(SYSTEM_PROMPT, conversation, &model_tools)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(TurnEvent::Error(e.to_string())).await;
                    return;
                }
            };

            let mut text = String::new();
            let mut calls: Vec<ToolCall> = Vec::new();
            loop {
                tokio::select! {
                    // Socket gone: dropping the stream aborts the model call.
                    _ = cancel.cancelled() => return,
                    item = stream.next() => match item {
                        None => break,
                        Some(Ok(ModelEvent::Done)) => break,
                        Some(Ok(ModelEvent::TextDelta(delta))) => {
                            text.push_str(&delta);
                            let _ = events.send(TurnEvent::StreamDelta(delta)).await;
                        }
                        Some(Ok(ModelEvent::ToolCall { id, name, input })) => {
                            calls.push(ToolCall { id, name, input });
                        }
                        Some(Err(e)) => {
                            let _ = events.send(TurnEvent::Error(e.to_string())).await;
                            return;
                        }
                    }
                }
            }

            let mut blocks = Vec::new();
            if !text.is_empty() {
                blocks.push(json!({"type": "text", "text": text}));
            }
            for call in &calls {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.input,
                }));
            }
            if !blocks.is_empty() {
                conversation.push(ChatMessage::assistant_blocks(blocks));
            }

            if calls.is_empty() {
                let _ = events.send(TurnEvent::StreamEnd).await;
                return;
            }

            for call in calls {
                if cancel.is_cancelled() {
                    return;
                }
                let (content, is_error) = self
                    .execute_call(principal, &permissions, context, &call, events, cancel)
                    .await;
                conversation.push(ChatMessage::tool_result(&call.id, &content, is_error));
            }
        }

        // Cap reached: terminal notice, end of turn.
        let notice = format!(
            "Stopping: this turn reached the {}-tool-call limit.",
            self.max_tool_iterations
        );
        conversation.push(ChatMessage::assistant_blocks(vec![
            json!({"type": "text", "text": notice}),
        ]));
        let _ = events.send(TurnEvent::StreamDelta(notice)).await;
        let _ = events.send(TurnEvent::StreamEnd).await;
    }

    /// Authorize, confirm when destructive, execute, audit. Errors come back
    /// as tool-error content fed to the model, never as a dropped turn.
    async fn execute_call(
        &self,
        principal: &Claims,
        permissions: &[Permission],
        context: &ChatContext,
        call: &ToolCall,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> (String, bool) {
        let Some(spec) = tools::lookup(&call.name) else {
            return (format!("unknown tool {:?}", call.name), true);
        };

        let cluster = tools::target_cluster(&call.input, context)
            .ok()
            .map(|id| id.to_string());
        let namespace = call
            .input
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| context.namespace.clone());
        let request = AccessRequest {
            resource: spec.permission.0,
            action: spec.permission.1,
            cluster: cluster.as_deref(),
            namespace: namespace.as_deref(),
        };
        if !authorize(permissions, &request) {
            return (
                format!(
                    "permission denied: {} on {}",
                    spec.permission.1, spec.permission.0
                ),
                true,
            );
        }

        if spec.destructive {
            let (confirmation_id, decision) = match self
                .broker
                .request(principal.sub, spec.name, call.input.clone())
                .await
            {
                Ok(pair) => pair,
                Err(e) => return (e.to_string(), true),
            };
            let _ = events
                .send(TurnEvent::ConfirmRequest {
                    confirmation_id,
                    tool_name: spec.name.to_string(),
                    tool_args: call.input.clone(),
                })
                .await;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.broker.expire(confirmation_id).await;
                    return ("turn cancelled".into(), true);
                }
                decision = decision => decision.unwrap_or(Outcome::Expired),
            };
            match outcome {
                Outcome::Approved => {}
                Outcome::Rejected => return ("tool call rejected by the user".into(), true),
                Outcome::Expired => {
                    return ("confirmation expired before approval".into(), true);
                }
            }
        }

        let result = tools::run_tool(spec, &call.input, context, &self.registry).await;

        if spec.destructive {
            let mut entry = AuditEntry::new(&principal.name, &format!("ai.{}", spec.name))
                .outcome(if result.is_ok() { "ok" } else { "error" })
                .digest(&request_digest(&call.input));
            if let Ok(cluster_id) = tools::target_cluster(&call.input, context) {
                entry = entry.cluster(cluster_id);
            }
            if let Some(resource) = call.input.get("resource").and_then(Value::as_str) {
                let target = match call.input.get("name").and_then(Value::as_str) {
                    Some(name) => format!("{resource}/{name}"),
                    None => resource.to_string(),
                };
                entry = entry.resource(&target);
            }
            self.audit.append(entry).await;
        }

        match result {
            Ok(content) => (content, false),
            Err(e) => (e.to_string(), true),
        }
    }
}

fn request_digest(input: &Value) -> String {
    use sha2::Digest;
    hex::encode(sha2::Sha256::digest(input.to_string().as_bytes()))
}

fn with_context(user_message: &str, context: &ChatContext) -> String {
    match (&context.cluster_id, &context.namespace) {
        (Some(cluster), Some(ns)) => {
            format!("[context: cluster {cluster}, namespace {ns}]\n{user_message}")
        }
        (Some(cluster), None) => format!("[context: cluster {cluster}]\n{user_message}"),
        _ => user_message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::Engine;
    use tokio::sync::Mutex;

    use super::super::model::{ModelError, ModelStream, ModelTool};
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::seal::Sealer;
    use crate::store::{AuditQuery, RoleBinding};
    use crate::transport::{
        EventStream, K8sOp, K8sReply, Transport, TransportError,
    };
    use argus_common::auth::TokenKind;
    use argus_common::rbac::Role;

    struct ScriptedModel {
        responses: Mutex<VecDeque<Vec<ModelEvent>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Vec<ModelEvent>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn stream(
            &self,
            _system: &str,
            _messages: &[ChatMessage],
            _tools: &[ModelTool],
        ) -> Result<ModelStream, ModelError> {
            let events = self
                .responses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| vec![ModelEvent::Done]);
            Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
        }
    }

    struct CountingTransport {
        requests: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn do_request(&self, _op: K8sOp) -> Result<K8sReply, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(K8sReply {
                status: 200,
                body: bytes::Bytes::from_static(b"{\"items\":[]}"),
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

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        transport: Arc<CountingTransport>,
        cluster: Uuid,
        principal: Claims,
    }

    async fn fixture(model: Arc<dyn ModelClient>, ttl: Duration, role: Role) -> Fixture {
        let key = base64::engine::general_purpose::STANDARD.encode([5u8; 32]);
        let store = Arc::new(MemoryStore::new(Sealer::from_base64(&key).unwrap()));
        let registry = ClusterRegistry::new(store.clone(), CancellationToken::new());
        let transport = Arc::new(CountingTransport {
            requests: AtomicUsize::new(0),
        });
        let cluster = Uuid::new_v4();
        let record = registry
            .store()
            .create_agent_cluster(cluster, "test", Uuid::new_v4(), Default::default())
            .await
            .unwrap();
        registry
            .adopt_agent_session(record, transport.clone(), CancellationToken::new())
            .await;

        let user = Uuid::new_v4();
        store
            .create_role_binding(RoleBinding::global(user, role))
            .await
            .unwrap();
        let principal = Claims {
            sub: user,
            name: "alice".into(),
            kind: TokenKind::Access,
            cluster_id: None,
            iat: 0,
            exp: i64::MAX,
        };

        let broker = ConfirmationBroker::new(ttl, CancellationToken::new());
        let orchestrator = Orchestrator::new(
            model,
            registry,
            broker,
            AuditSink::new(store.clone()),
            store.clone(),
            8,
        );
        Fixture {
            orchestrator,
            store,
            transport,
            cluster,
            principal,
        }
    }

    fn tool_call(name: &str, input: Value) -> ModelEvent {
        ModelEvent::ToolCall {
            id: format!("call-{name}"),
            name: name.into(),
            input,
        }
    }

    async fn run(
        fixture: &Fixture,
        message: &str,
    ) -> (mpsc::Receiver<TurnEvent>, Vec<ChatMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let mut conversation = Vec::new();
        let context = ChatContext {
            cluster_id: Some(fixture.cluster),
            namespace: Some("default".into()),
        };
        fixture
            .orchestrator
            .run_turn(
                &fixture.principal,
                &context,
                &mut conversation,
                message,
                &tx,
                &CancellationToken::new(),
            )
            .await;
        (rx, conversation)
    }

    async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn plain_text_turn_streams_and_ends() {
        let model = ScriptedModel::new(vec![vec![
            ModelEvent::TextDelta("All ".into()),
            ModelEvent::TextDelta("good.".into()),
            ModelEvent::Done,
        ]]);
        let fixture = fixture(model, Duration::from_secs(60), Role::Viewer).await;
        let (rx, conversation) = run(&fixture, "how are my pods?").await;

        let events = drain(rx).await;
        assert!(matches!(events[0], TurnEvent::StreamDelta(ref d) if d == "All "));
        assert!(matches!(events.last(), Some(TurnEvent::StreamEnd)));
        // user message + assistant text
        assert_eq!(conversation.len(), 2);
    }

    #[tokio::test]
    async fn read_only_tool_executes_without_confirmation() {
        let model = ScriptedModel::new(vec![
            vec![
                tool_call("list_resources", json!({"resource": "pods"})),
                ModelEvent::Done,
            ],
            vec![ModelEvent::TextDelta("2 pods running".into()), ModelEvent::Done],
        ]);
        let fixture = fixture(model, Duration::from_secs(60), Role::Viewer).await;
        let (rx, conversation) = run(&fixture, "list my pods").await;

        let events = drain(rx).await;
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, TurnEvent::ConfirmRequest { .. }))
        );
        assert!(matches!(events.last(), Some(TurnEvent::StreamEnd)));
        assert_eq!(fixture.transport.requests.load(Ordering::SeqCst), 1);
        // user, assistant tool_use, tool_result, assistant text
        assert_eq!(conversation.len(), 4);
    }

    #[tokio::test]
    async fn unauthorized_tool_becomes_tool_error() {
        let model = ScriptedModel::new(vec![
            vec![
                tool_call("delete_resource", json!({"resource": "pods", "name": "web-1"})),
                ModelEvent::Done,
            ],
            vec![ModelEvent::Done],
        ]);
        // Viewer cannot delete.
        let fixture = fixture(model, Duration::from_secs(60), Role::Viewer).await;
        let (_rx, conversation) = run(&fixture, "delete web-1").await;

        assert_eq!(fixture.transport.requests.load(Ordering::SeqCst), 0);
        let result = serde_json::to_string(&conversation[2].content).unwrap();
        assert!(result.contains("permission denied"));
    }

    #[tokio::test]
    async fn approved_destructive_tool_executes_and_audits() {
        let model = ScriptedModel::new(vec![
            vec![
                tool_call("delete_resource", json!({"resource": "pods", "name": "web-1"})),
                ModelEvent::Done,
            ],
            vec![ModelEvent::TextDelta("Deleted.".into()), ModelEvent::Done],
        ]);
        let fixture = fixture(model, Duration::from_secs(60), Role::Operator).await;

        let (tx, mut rx) = mpsc::channel(64);
        let mut conversation = Vec::new();
        let context = ChatContext {
            cluster_id: Some(fixture.cluster),
            namespace: Some("default".into()),
        };
        let orchestrator = fixture.orchestrator.clone();
        let principal = fixture.principal.clone();
        let turn = tokio::spawn(async move {
            orchestrator
                .run_turn(
                    &principal,
                    &context,
                    &mut conversation,
                    "delete web-1",
                    &tx,
                    &CancellationToken::new(),
                )
                .await;
        });

        // Approve as soon as the confirmation shows up.
        let confirmation_id = loop {
            match rx.recv().await.expect("turn ended early") {
                TurnEvent::ConfirmRequest {
                    confirmation_id, ..
                } => break confirmation_id,
                _ => continue,
            }
        };
        fixture
            .orchestrator
            .broker()
            .resolve(confirmation_id, fixture.principal.sub, Outcome::Approved)
            .await
            .unwrap();
        turn.await.unwrap();

        assert_eq!(fixture.transport.requests.load(Ordering::SeqCst), 1);
        let audit = fixture.store.query_audit(AuditQuery::default()).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "ai.delete_resource");
        assert_eq!(audit[0].outcome, "ok");
        assert_eq!(audit[0].target_resource.as_deref(), Some("pods/web-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_destructive_tool_expires_without_executing() {
        let model = ScriptedModel::new(vec![
            vec![
                tool_call("delete_resource", json!({"resource": "pods", "name": "web-1"})),
                ModelEvent::Done,
            ],
            vec![ModelEvent::Done],
        ]);
        let fixture = fixture(model, Duration::from_secs(60), Role::Operator).await;
        let (_rx, conversation) = run(&fixture, "delete web-1").await;

        // TTL elapsed inside run() thanks to the paused clock auto-advance.
        assert_eq!(fixture.transport.requests.load(Ordering::SeqCst), 0);
        let result = serde_json::to_string(&conversation[2].content).unwrap();
        assert!(result.contains("expired"));
    }

    #[tokio::test]
    async fn runaway_tool_loop_is_capped() {
        // Model returns a tool call every single time.
        let always: Vec<Vec<ModelEvent>> = (0..32)
            .map(|_| {
                vec![
                    tool_call("list_resources", json!({"resource": "pods"})),
                    ModelEvent::Done,
                ]
            })
            .collect();
        let fixture = fixture(ScriptedModel::new(always), Duration::from_secs(60), Role::Viewer).await;
        let (rx, _conversation) = run(&fixture, "loop forever").await;

        assert_eq!(fixture.transport.requests.load(Ordering::SeqCst), 8);
        let events = drain(rx).await;
        let notice = events.iter().any(
            |e| matches!(e, TurnEvent::StreamDelta(d) if d.contains("tool-call limit")),
        );
        assert!(notice);
        assert!(matches!(events.last(), Some(TurnEvent::StreamEnd)));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let model = ScriptedModel::new(vec![
            vec![tool_call("rm_rf", json!({})), ModelEvent::Done],
            vec![ModelEvent::Done],
        ]);
        let fixture = fixture(model, Duration::from_secs(60), Role::Operator).await;
        let (_rx, conversation) = run(&fixture, "do something odd").await;
        let result = serde_json::to_string(&conversation[2].content).unwrap();
        assert!(result.contains("unknown tool"));
        assert_eq!(fixture.transport.requests.load(Ordering::SeqCst), 0);
    }
}
