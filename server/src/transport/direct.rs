use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;
use http::header::CONTENT_TYPE;
use kube::{
    Api, Client, Config, ResourceExt,
    api::{DynamicObject, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, WatchEvent as KubeWatchEvent},
    discovery::{Discovery, Scope},
};
use tokio::sync::RwLock;

use super::{
    EventStream, K8sOp, K8sReply, Transport, TransportError, Verb, WatchEvent, WatchEventType,
};

/// Talks to a cluster API with stored credentials. The plaintext kubeconfig
/// exists only for the duration of `connect`; afterwards the kube client
/// holds its own connection material.
pub struct DirectTransport {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl DirectTransport {
    pub async fn connect(kubeconfig_yaml: &str) -> Result<Self, TransportError> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)
            .map_err(|e| TransportError::Unavailable(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| TransportError::Unavailable(format!("unusable kubeconfig: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| TransportError::Unavailable(format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            discovery: RwLock::new(None),
        })
    }

    /// Resolve a resource kind (plural or kind name) to its preferred
    /// group/version. Discovery is cached; a miss refreshes it once.
    async fn resolve(&self, resource: &str) -> Result<(ApiResource, bool), TransportError> {
        if let Some(discovery) = self.discovery.read().await.as_ref()
            && let Some(hit) = scan(discovery, resource)
        {
            return Ok(hit);
        }
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| TransportError::Unavailable(format!("discovery failed: {e}")))?;
        let hit = scan(&discovery, resource);
        *self.discovery.write().await = Some(Arc::new(discovery));
        hit.ok_or_else(|| TransportError::Upstream {
            status: 404,
            message: format!("unknown resource kind {resource:?}"),
        })
    }
}

fn scan(discovery: &Discovery, resource: &str) -> Option<(ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.plural == resource || ar.kind.eq_ignore_ascii_case(resource) {
                return Some((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    None
}

fn api_path(op: &K8sOp) -> String {
    let mut path = if op.group.is_empty() {
        format!("/api/{}", op.version)
    } else {
        format!("/apis/{}/{}", op.group, op.version)
    };
    if let Some(ns) = &op.namespace {
        path.push_str(&format!("/namespaces/{ns}"));
    }
    path.push_str(&format!("/{}", op.resource));
    if let Some(name) = &op.name {
        path.push_str(&format!("/{name}"));
    }
    path
}

#[async_trait::async_trait]
impl Transport for DirectTransport {
    async fn do_request(&self, op: K8sOp) -> Result<K8sReply, TransportError> {
        let method = match op.verb {
            Verb::Get | Verb::List => http::Method::GET,
            Verb::Create => http::Method::POST,
            Verb::Update => http::Method::PUT,
            Verb::Patch => http::Method::PATCH,
            Verb::Delete => http::Method::DELETE,
        };
        if matches!(op.verb, Verb::Get | Verb::Update | Verb::Patch) && op.name.is_none() {
            return Err(TransportError::Protocol(format!(
                "{} requires a resource name",
                op.verb.as_str()
            )));
        }
        let body = match &op.body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| TransportError::Protocol(format!("unserializable body: {e}")))?,
            None => Vec::new(),
        };
        let mut builder = http::Request::builder()
            .method(method)
            .uri(api_path(&op));
        if op.verb == Verb::Patch {
            builder = builder.header(CONTENT_TYPE, "application/merge-patch+json");
        } else if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(body)
            .map_err(|e| TransportError::Protocol(format!("invalid request: {e}")))?;

        match self.client.request_text(request).await {
            Ok(text) => Ok(K8sReply {
                status: 200,
                body: text.into_bytes().into(),
            }),
            // Preserve the upstream's own error status and body.
            Err(kube::Error::Api(er)) => {
                let body = serde_json::to_vec(&er)
                    .unwrap_or_else(|_| er.message.clone().into_bytes());
                Ok(K8sReply {
                    status: er.code,
                    body: body.into(),
                })
            }
            Err(e) => Err(TransportError::Unavailable(e.to_string())),
        }
    }

    async fn open_watch(
        &self,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<EventStream, TransportError> {
        let (ar, namespaced) = self.resolve(resource).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };

        let stream = try_stream! {
            let mut rv = String::from("0");
            loop {
                let mut watch = api
                    .watch(&WatchParams::default(), &rv)
                    .await
                    .map_err(|e| TransportError::Unavailable(e.to_string()))?
                    .boxed();
                while let Some(event) = watch.next().await {
                    let event = event.map_err(|e| TransportError::Unavailable(e.to_string()))?;
                    match event {
                        KubeWatchEvent::Added(obj) => {
                            if let Some(v) = obj.resource_version() {
                                rv = v;
                            }
                            yield encode(WatchEventType::Added, &obj)?;
                        }
                        KubeWatchEvent::Modified(obj) => {
                            if let Some(v) = obj.resource_version() {
                                rv = v;
                            }
                            yield encode(WatchEventType::Modified, &obj)?;
                        }
                        KubeWatchEvent::Deleted(obj) => {
                            if let Some(v) = obj.resource_version() {
                                rv = v;
                            }
                            yield encode(WatchEventType::Deleted, &obj)?;
                        }
                        KubeWatchEvent::Bookmark(bookmark) => {
                            rv = bookmark.metadata.resource_version;
                        }
                        // Stale resource version: restart from scratch. No
                        // replay is promised across the gap.
                        KubeWatchEvent::Error(er) if er.code == 410 => {
                            rv = String::from("0");
                            break;
                        }
                        KubeWatchEvent::Error(er) => {
                            Err(TransportError::Upstream {
                                status: er.code,
                                message: er.message,
                            })?;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

fn encode(event_type: WatchEventType, obj: &DynamicObject) -> Result<WatchEvent, TransportError> {
    let bytes = serde_json::to_vec(obj)
        .map_err(|e| TransportError::Protocol(format!("unserializable object: {e}")))?;
    Ok(WatchEvent {
        event_type,
        object: bytes.into(),
    })
}
