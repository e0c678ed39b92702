use std::sync::Arc;

use futures::StreamExt;
use kube::{
    Api, ResourceExt,
    api::{DynamicObject, WatchParams},
    core::WatchEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::kube_exec::LocalCluster;
use crate::proto::tunnel::{self as pb, agent_frame};

/// Serve one `WatchSubscribe`: stream local watch events to the server
/// under the subscription's correlation id until unsubscribed or the
/// session dies. Event order is whatever the local API delivers.
pub async fn run_watch(
    cluster: Arc<LocalCluster>,
    correlation_id: u64,
    resource: String,
    namespace: Option<String>,
    out_tx: mpsc::Sender<pb::AgentFrame>,
    cancel: CancellationToken,
) {
    let (ar, namespaced) = match cluster.resolve(&resource).await {
        Ok(hit) => hit,
        Err(e) => {
            tracing::warn!(%resource, error = %e, "cannot serve watch");
            return;
        }
    };
    let api: Api<DynamicObject> = match &namespace {
        Some(ns) if namespaced => Api::namespaced_with(cluster.client(), ns, &ar),
        _ => Api::all_with(cluster.client(), &ar),
    };

    let mut rv = String::from("0");
    loop {
        let mut stream = match api.watch(&WatchParams::default(), &rv).await {
            Ok(stream) => stream.boxed(),
            Err(e) => {
                tracing::warn!(%resource, error = %e, "watch failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => continue,
                }
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.next() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            tracing::debug!(%resource, error = %e, "watch stream error");
                            break;
                        }
                        None => break,
                    };
                    match event {
                        WatchEvent::Added(obj) => {
                            if let Some(v) = obj.resource_version() { rv = v; }
                            if !send_event(&out_tx, correlation_id, "ADDED", &obj).await { return; }
                        }
                        WatchEvent::Modified(obj) => {
                            if let Some(v) = obj.resource_version() { rv = v; }
                            if !send_event(&out_tx, correlation_id, "MODIFIED", &obj).await { return; }
                        }
                        WatchEvent::Deleted(obj) => {
                            if let Some(v) = obj.resource_version() { rv = v; }
                            if !send_event(&out_tx, correlation_id, "DELETED", &obj).await { return; }
                        }
                        WatchEvent::Bookmark(bookmark) => {
                            rv = bookmark.metadata.resource_version;
                        }
                        WatchEvent::Error(er) => {
                            // Stale resource version: restart from scratch.
                            if er.code == 410 {
                                rv = String::from("0");
                            } else {
                                tracing::warn!(%resource, code = er.code, "watch error from API");
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn send_event(
    out_tx: &mpsc::Sender<pb::AgentFrame>,
    correlation_id: u64,
    event_type: &str,
    obj: &DynamicObject,
) -> bool {
    let object = match serde_json::to_vec(obj) {
        Ok(object) => object,
        Err(e) => {
            tracing::warn!(error = %e, "unserializable watch object");
            return true;
        }
    };
    out_tx
        .send(pb::AgentFrame {
            kind: Some(agent_frame::Kind::WatchEvent(pb::WatchEvent {
                correlation_id,
                r#type: event_type.to_string(),
                object,
            })),
        })
        .await
        .is_ok()
}
