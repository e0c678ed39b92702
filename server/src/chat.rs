use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, Utf8Bytes, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use argus_common::auth::{AuthPrincipal, Claims};
use argus_common::rbac::{AccessRequest, authorize};

use crate::ai::model::ChatMessage;
use crate::ai::orchestrator::TurnEvent;
use crate::ai::tools::ChatContext;
use crate::confirm::Outcome;
use crate::server::AppState;

/// Client frames on `/ws/ai/chat`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    UserMessage {
        content: String,
    },
    ConfirmAction {
        confirmation_id: Uuid,
        approved: bool,
    },
    ContextUpdate {
        context: ContextBody,
    },
    NewConversation,
}

#[derive(Debug, Deserialize, Default)]
struct ContextBody {
    #[serde(default)]
    cluster_id: Option<Uuid>,
    #[serde(default)]
    namespace: Option<String>,
}

pub async fn chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn sender_main(
    mut sender: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = out_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sender.send(msg).await {
                    tracing::debug!("failed to send chat frame: {}", e);
                    break;
                }
            }
        }
    }
}

fn frame(value: serde_json::Value) -> Message {
    Message::Text(Utf8Bytes::from(value.to_string()))
}

fn render_turn_event(event: TurnEvent) -> Message {
    match event {
        TurnEvent::StreamDelta(content) => frame(json!({
            "type": "stream_delta",
            "content": content,
        })),
        TurnEvent::StreamEnd => frame(json!({"type": "stream_end"})),
        TurnEvent::ConfirmRequest {
            confirmation_id,
            tool_name,
            tool_args,
        } => frame(json!({
            "type": "confirm_request",
            "confirmation_id": confirmation_id,
            "tool_name": tool_name,
            "tool_args": tool_args,
        })),
        TurnEvent::Error(content) => frame(json!({
            "type": "error",
            "content": content,
        })),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: Claims) {
    let (sender, mut receiver) = socket.split();
    let socket_cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel::<Message>(64);
    tokio::spawn(sender_main(sender, out_rx, socket_cancel.clone()));

    // One chat turn at a time; the conversation survives across turns.
    let conversation = Arc::new(Mutex::new(Vec::<ChatMessage>::new()));
    let context = Arc::new(Mutex::new(ChatContext::default()));
    let mut turn_cancel: Option<CancellationToken> = None;

    let permissions = match state.store.permissions_for(claims.sub).await {
        Ok(permissions) => permissions,
        Err(e) => {
            tracing::error!(error = %e, "failed to load permissions for chat socket");
            let _ = out_tx
                .send(frame(json!({"type": "error", "content": "internal error"})))
                .await;
            socket_cancel.cancel();
            return;
        }
    };
    let chat_request = AccessRequest {
        resource: "ai",
        action: "chat",
        cluster: None,
        namespace: None,
    };
    if !authorize(&permissions, &chat_request) {
        let _ = out_tx
            .send(frame(json!({"type": "error", "content": "permission denied"})))
            .await;
        socket_cancel.cancel();
        return;
    }

    tracing::info!(user = %claims.name, "chat socket connected");

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let parsed = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        let _ = out_tx
                            .send(frame(json!({
                                "type": "error",
                                "content": format!("malformed frame: {e}"),
                            })))
                            .await;
                        continue;
                    }
                };
                match parsed {
                    ClientFrame::UserMessage { content } => {
                        if turn_cancel
                            .as_ref()
                            .is_some_and(|cancel| !cancel.is_cancelled())
                        {
                            let _ = out_tx
                                .send(frame(json!({
                                    "type": "error",
                                    "content": "a turn is already in progress",
                                })))
                                .await;
                            continue;
                        }
                        let cancel = socket_cancel.child_token();
                        turn_cancel = Some(cancel.clone());
                        spawn_turn(
                            state.clone(),
                            claims.clone(),
                            conversation.clone(),
                            context.clone(),
                            content,
                            out_tx.clone(),
                            cancel,
                        );
                    }
                    ClientFrame::ConfirmAction {
                        confirmation_id,
                        approved,
                    } => {
                        let outcome = if approved {
                            Outcome::Approved
                        } else {
                            Outcome::Rejected
                        };
                        if let Err(e) = state
                            .broker
                            .resolve(confirmation_id, claims.sub, outcome)
                            .await
                        {
                            let _ = out_tx
                                .send(frame(json!({"type": "error", "content": e.to_string()})))
                                .await;
                        }
                    }
                    ClientFrame::ContextUpdate { context: body } => {
                        let mut ctx = context.lock().await;
                        ctx.cluster_id = body.cluster_id;
                        ctx.namespace = body.namespace;
                    }
                    ClientFrame::NewConversation => {
                        if let Some(cancel) = turn_cancel.take() {
                            cancel.cancel();
                        }
                        conversation.lock().await.clear();
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = out_tx.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("chat socket error: {}", e);
                break;
            }
        }
    }

    // Socket gone: abort any in-flight turn; its pending confirmations
    // resolve as expired on the way down.
    socket_cancel.cancel();
    tracing::info!(user = %claims.name, "chat socket closed");
}

#[allow(clippy::too_many_arguments)]
fn spawn_turn(
    state: AppState,
    claims: Claims,
    conversation: Arc<Mutex<Vec<ChatMessage>>>,
    context: Arc<Mutex<ChatContext>>,
    content: String,
    out_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let (events_tx, mut events_rx) = mpsc::channel::<TurnEvent>(64);

        let pump = {
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    if out_tx.send(render_turn_event(event)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let turn_context = context.lock().await.clone();
        let mut conversation = conversation.lock().await;
        state
            .orchestrator
            .run_turn(
                &claims,
                &turn_context,
                &mut conversation,
                &content,
                &events_tx,
                &cancel,
            )
            .await;
        drop(events_tx);
        let _ = pump.await;
        // Turn finished; release the one-turn-at-a-time slot.
        cancel.cancel();
    });
}
