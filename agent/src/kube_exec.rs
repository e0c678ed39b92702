use std::sync::Arc;

use http::header::CONTENT_TYPE;
use kube::{
    Client,
    core::ApiResource,
    discovery::{Discovery, Scope},
};
use tokio::sync::RwLock;

use crate::proto::tunnel as pb;

/// The agent's view of the cluster it lives in: one service-account client
/// plus cached discovery for resolving watch targets.
pub struct LocalCluster {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl LocalCluster {
    pub async fn connect() -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("failed to build in-cluster client: {e}"))?;
        Ok(Self {
            client,
            discovery: RwLock::new(None),
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Execute a tunnel request against the local API and shape the reply.
    /// Every error becomes a response frame; the stream itself never dies
    /// over one bad request.
    pub async fn execute(&self, req: &pb::K8sRequest) -> pb::K8sResponse {
        let correlation_id = req.correlation_id;
        let method = match req.verb.as_str() {
            "get" | "list" => http::Method::GET,
            "create" => http::Method::POST,
            "update" => http::Method::PUT,
            "patch" => http::Method::PATCH,
            "delete" => http::Method::DELETE,
            other => {
                return error_response(correlation_id, 400, &format!("unknown verb {other:?}"));
            }
        };

        let mut builder = http::Request::builder().method(method).uri(request_path(req));
        if req.verb == "patch" {
            builder = builder.header(CONTENT_TYPE, "application/merge-patch+json");
        } else if !req.body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = match builder.body(req.body.clone()) {
            Ok(request) => request,
            Err(e) => return error_response(correlation_id, 400, &format!("invalid request: {e}")),
        };

        match self.client.request_text(request).await {
            Ok(text) => pb::K8sResponse {
                correlation_id,
                status_code: 200,
                body: text.into_bytes(),
                error: String::new(),
            },
            Err(kube::Error::Api(er)) => pb::K8sResponse {
                correlation_id,
                status_code: i32::from(er.code),
                body: serde_json::to_vec(&er).unwrap_or_default(),
                error: er.message,
            },
            Err(e) => error_response(correlation_id, 502, &e.to_string()),
        }
    }

    /// Resolve a resource kind (plural or kind name) against discovery,
    /// refreshing the cache once on a miss.
    pub async fn resolve(&self, resource: &str) -> anyhow::Result<(ApiResource, bool)> {
        if let Some(discovery) = self.discovery.read().await.as_ref()
            && let Some(hit) = scan(discovery, resource)
        {
            return Ok(hit);
        }
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| anyhow::anyhow!("discovery failed: {e}"))?;
        let hit = scan(&discovery, resource);
        *self.discovery.write().await = Some(Arc::new(discovery));
        hit.ok_or_else(|| anyhow::anyhow!("unknown resource kind {resource:?}"))
    }

    /// Gathered once at registration; the control plane shows it to users.
    pub async fn collect_info(&self) -> pb::ClusterInfo {
        let version = match self.client.apiserver_version().await {
            Ok(info) => info.git_version,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read apiserver version");
                String::new()
            }
        };
        let namespaces = self
            .list_names("/api/v1/namespaces")
            .await
            .unwrap_or_default();
        let node_count = self
            .list_names("/api/v1/nodes")
            .await
            .map(|nodes| nodes.len() as i32)
            .unwrap_or(0);
        let crds = self
            .list_names("/apis/apiextensions.k8s.io/v1/customresourcedefinitions")
            .await
            .unwrap_or_default();
        pb::ClusterInfo {
            version,
            node_count,
            namespaces,
            crds,
        }
    }

    async fn list_names(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let request = http::Request::get(path).body(Vec::new())?;
        let text = self.client.request_text(request).await?;
        let parsed: serde_json::Value = serde_json::from_str(&text)?;
        Ok(parsed["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.pointer("/metadata/name"))
                    .filter_map(|name| name.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
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

fn request_path(req: &pb::K8sRequest) -> String {
    let mut path = if req.group.is_empty() {
        format!("/api/{}", req.version)
    } else {
        format!("/apis/{}/{}", req.group, req.version)
    };
    if !req.namespace.is_empty() {
        path.push_str(&format!("/namespaces/{}", req.namespace));
    }
    path.push_str(&format!("/{}", req.resource));
    if !req.name.is_empty() {
        path.push_str(&format!("/{}", req.name));
    }
    path
}

fn error_response(correlation_id: u64, status_code: i32, message: &str) -> pb::K8sResponse {
    pb::K8sResponse {
        correlation_id,
        status_code,
        body: Vec::new(),
        error: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(group: &str, namespace: &str, name: &str) -> pb::K8sRequest {
        pb::K8sRequest {
            correlation_id: 1,
            verb: "get".into(),
            group: group.into(),
            version: "v1".into(),
            resource: "pods".into(),
            namespace: namespace.into(),
            name: name.into(),
            body: Vec::new(),
        }
    }

    #[test]
    fn paths_match_the_api_layout() {
        assert_eq!(
            request_path(&request("", "default", "web-1")),
            "/api/v1/namespaces/default/pods/web-1"
        );
        assert_eq!(request_path(&request("", "", "")), "/api/v1/pods");
        let mut r = request("apps", "prod", "");
        r.resource = "deployments".into();
        assert_eq!(
            request_path(&r),
            "/apis/apps/v1/namespaces/prod/deployments"
        );
    }
}
