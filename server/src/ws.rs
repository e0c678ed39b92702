use std::collections::HashMap;

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
use tokio::sync::mpsc;
use uuid::Uuid;

use argus_common::auth::{AuthPrincipal, Claims};
use argus_common::rbac::{AccessRequest, authorize};

use crate::hub::{CloseReason, HubMessage, SubKey, SubscriberSocket, SubscriptionHandle};
use crate::server::AppState;

/// Client frames on `/ws`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        cluster: Uuid,
        resource: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    Unsubscribe {
        handle: u64,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn sender_main(
    mut sender: SplitSink<WebSocket, Message>,
    mut hub_rx: mpsc::Receiver<HubMessage>,
    mut ctrl_rx: mpsc::Receiver<Message>,
    socket: SubscriberSocket,
) {
    let killed = socket.killed();
    loop {
        tokio::select! {
            _ = killed.cancelled() => {
                let reason = socket
                    .close_reason()
                    .map(|r| r.as_str())
                    .unwrap_or("closed");
                let _ = sender
                    .send(Message::Text(Utf8Bytes::from(
                        json!({"type": "closed", "reason": reason}).to_string(),
                    )))
                    .await;
                let _ = sender.close().await;
                break;
            }
            msg = hub_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sender.send(render_hub_message(msg)).await {
                    tracing::debug!("failed to send watch frame: {}", e);
                    break;
                }
            }
            msg = ctrl_rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sender.send(msg).await {
                    tracing::debug!("failed to send control frame: {}", e);
                    break;
                }
            }
        }
    }
}

fn render_hub_message(msg: HubMessage) -> Message {
    let value = match msg {
        HubMessage::Event { key, event } => {
            // Object bytes are upstream JSON already; embed them verbatim.
            let object: serde_json::Value =
                serde_json::from_slice(&event.object).unwrap_or(serde_json::Value::Null);
            json!({
                "type": event.event_type.as_str(),
                "cluster": key.cluster_id,
                "resource": key.resource,
                "namespace": key.namespace,
                "object": object,
            })
        }
        HubMessage::Closed { key, reason } => json!({
            "type": reason.as_str(),
            "cluster": key.cluster_id,
            "resource": key.resource,
            "namespace": key.namespace,
        }),
    };
    Message::Text(Utf8Bytes::from(value.to_string()))
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: Claims) {
    let (sender, mut receiver) = socket.split();
    let queue_size = state.hub.config().subscriber_queue;
    let (hub_socket, hub_rx) = SubscriberSocket::new(queue_size);
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Message>(32);
    tokio::spawn(sender_main(sender, hub_rx, ctrl_rx, hub_socket.clone()));

    let permissions = match state.store.permissions_for(claims.sub).await {
        Ok(permissions) => permissions,
        Err(e) => {
            tracing::error!(error = %e, "failed to load permissions for watch socket");
            hub_socket.close(CloseReason::WatchClosed);
            return;
        }
    };

    tracing::info!(user = %claims.name, socket = %hub_socket.id, "watch socket connected");
    let mut handles: HashMap<u64, SubscriptionHandle> = HashMap::new();

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = ctrl_tx
                            .send(error_frame(&format!("malformed frame: {e}")))
                            .await;
                        continue;
                    }
                };
                match frame {
                    ClientFrame::Subscribe {
                        cluster,
                        resource,
                        namespace,
                    } => {
                        let cluster_str = cluster.to_string();
                        let request = AccessRequest {
                            resource: "resources",
                            action: "watch",
                            cluster: Some(&cluster_str),
                            namespace: namespace.as_deref(),
                        };
                        if !authorize(&permissions, &request) {
                            let _ = ctrl_tx.send(error_frame("permission denied")).await;
                            continue;
                        }
                        let key = SubKey::new(cluster, &resource, namespace.as_deref());
                        match state.hub.subscribe(&hub_socket, key).await {
                            Ok(handle) => {
                                let _ = ctrl_tx
                                    .send(Message::Text(Utf8Bytes::from(
                                        json!({
                                            "type": "subscribed",
                                            "handle": handle.id,
                                            "cluster": handle.key.cluster_id,
                                            "resource": handle.key.resource,
                                            "namespace": handle.key.namespace,
                                        })
                                        .to_string(),
                                    )))
                                    .await;
                                handles.insert(handle.id, handle);
                            }
                            Err(e) => {
                                let _ = ctrl_tx.send(error_frame(&e.to_string())).await;
                            }
                        }
                    }
                    ClientFrame::Unsubscribe { handle } => match handles.remove(&handle) {
                        Some(subscription) => {
                            state.hub.unsubscribe(subscription).await;
                            let _ = ctrl_tx
                                .send(Message::Text(Utf8Bytes::from(
                                    json!({"type": "unsubscribed", "handle": handle}).to_string(),
                                )))
                                .await;
                        }
                        None => {
                            let _ = ctrl_tx.send(error_frame("unknown handle")).await;
                        }
                    },
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = ctrl_tx.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("watch socket error: {}", e);
                break;
            }
        }
    }

    // Closing the socket releases all its subscriptions atomically.
    state.hub.drop_socket(hub_socket.id).await;
    hub_socket.close(CloseReason::WatchClosed);
    tracing::info!(socket = %hub_socket.id, "watch socket closed");
}

fn error_frame(message: &str) -> Message {
    Message::Text(Utf8Bytes::from(
        json!({"type": "error", "content": message}).to_string(),
    ))
}
