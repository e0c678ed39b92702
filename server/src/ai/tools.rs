use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::ClusterRegistry;
use crate::transport::{K8sOp, K8sReply, TransportError, Verb};

use super::model::ModelTool;

/// What the model asked for, with the call id to echo in the result.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Cluster/namespace the chat is currently looking at; tools inherit it
/// unless their arguments say otherwise.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub cluster_id: Option<Uuid>,
    pub namespace: Option<String>,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    BadArguments(String),

    #[error("no cluster selected; set a cluster in the chat context")]
    NoCluster,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Tools with effects observable beyond this process require
    /// human-in-the-loop confirmation.
    pub destructive: bool,
    /// (resource, action) checked against the caller's permissions.
    pub permission: (&'static str, &'static str),
}

const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "list_resources",
        description: "List resources of a kind, optionally in one namespace.",
        destructive: false,
        permission: ("resources", "list"),
    },
    ToolSpec {
        name: "describe_resource",
        description: "Fetch one resource by name as full JSON.",
        destructive: false,
        permission: ("resources", "get"),
    },
    ToolSpec {
        name: "cluster_events",
        description: "Recent events, cluster-wide or for one namespace.",
        destructive: false,
        permission: ("resources", "list"),
    },
    ToolSpec {
        name: "pod_logs",
        description: "Fetch logs from a pod, optionally one container.",
        destructive: false,
        permission: ("resources", "get"),
    },
    ToolSpec {
        name: "apply_resource",
        description: "Create or update a resource from a full manifest.",
        destructive: true,
        permission: ("resources", "create"),
    },
    ToolSpec {
        name: "delete_resource",
        description: "Delete one resource by kind and name.",
        destructive: true,
        permission: ("resources", "delete"),
    },
    ToolSpec {
        name: "scale_workload",
        description: "Set the replica count of a workload.",
        destructive: true,
        permission: ("resources", "patch"),
    },
    ToolSpec {
        name: "restart_workload",
        description: "Trigger a rolling restart of a workload.",
        destructive: true,
        permission: ("resources", "patch"),
    },
];

/// Lookup is case-exact; unknown names produce a tool error upstream.
pub fn lookup(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|t| t.name == name)
}

pub fn model_tools() -> Vec<ModelTool> {
    TOOLS
        .iter()
        .map(|t| ModelTool {
            name: t.name.to_string(),
            description: t.description.to_string(),
            input_schema: input_schema(t.name),
        })
        .collect()
}

fn input_schema(name: &str) -> Value {
    let object = |properties: Value, required: &[&str]| {
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    };
    let resource_props = json!({
        "resource": {"type": "string", "description": "Resource kind, plural (e.g. pods, deployments)"},
        "group": {"type": "string", "description": "API group; omit for the core group"},
        "version": {"type": "string", "description": "API version, default v1"},
        "namespace": {"type": "string"},
        "cluster": {"type": "string", "description": "Cluster id; defaults to the current context"},
    });
    match name {
        "list_resources" => object(resource_props, &["resource"]),
        "describe_resource" => {
            let mut props = resource_props;
            props["name"] = json!({"type": "string"});
            object(props, &["resource", "name"])
        }
        "cluster_events" => object(
            json!({
                "namespace": {"type": "string"},
                "cluster": {"type": "string"},
            }),
            &[],
        ),
        "pod_logs" => object(
            json!({
                "name": {"type": "string"},
                "namespace": {"type": "string"},
                "container": {"type": "string"},
                "cluster": {"type": "string"},
            }),
            &["name", "namespace"],
        ),
        "apply_resource" => object(
            json!({
                "manifest": {"type": "object", "description": "Complete resource manifest"},
                "namespace": {"type": "string"},
                "cluster": {"type": "string"},
            }),
            &["manifest"],
        ),
        "delete_resource" => {
            let mut props = resource_props;
            props["name"] = json!({"type": "string"});
            object(props, &["resource", "name"])
        }
        "scale_workload" => object(
            json!({
                "resource": {"type": "string", "description": "Workload kind, default deployments"},
                "name": {"type": "string"},
                "namespace": {"type": "string"},
                "replicas": {"type": "integer"},
                "cluster": {"type": "string"},
            }),
            &["name", "namespace", "replicas"],
        ),
        "restart_workload" => object(
            json!({
                "resource": {"type": "string", "description": "Workload kind, default deployments"},
                "name": {"type": "string"},
                "namespace": {"type": "string"},
                "cluster": {"type": "string"},
            }),
            &["name", "namespace"],
        ),
        _ => object(json!({}), &[]),
    }
}

fn str_arg(input: &Value, key: &str) -> Option<String> {
    input.get(key).and_then(Value::as_str).map(str::to_string)
}

fn required_str(input: &Value, key: &str) -> Result<String, ToolError> {
    str_arg(input, key).ok_or_else(|| ToolError::BadArguments(format!("missing argument {key:?}")))
}

/// Resolve the target cluster: explicit argument first, chat context second.
pub fn target_cluster(input: &Value, context: &ChatContext) -> Result<Uuid, ToolError> {
    if let Some(cluster) = str_arg(input, "cluster") {
        return Uuid::parse_str(&cluster)
            .map_err(|_| ToolError::BadArguments(format!("invalid cluster id {cluster:?}")));
    }
    context.cluster_id.ok_or(ToolError::NoCluster)
}

fn target_namespace(input: &Value, context: &ChatContext) -> Option<String> {
    str_arg(input, "namespace").or_else(|| context.namespace.clone())
}

/// Translate the call into a `K8sOp` and run it on the cluster's transport.
/// Returns the result text handed back to the model.
pub async fn run_tool(
    spec: &ToolSpec,
    input: &Value,
    context: &ChatContext,
    registry: &ClusterRegistry,
) -> Result<String, ToolError> {
    let cluster_id = target_cluster(input, context)?;
    let transport = registry
        .get(cluster_id)
        .await
        .map_err(|e| ToolError::Failed(e.to_string()))?;

    let op = build_op(spec, input, context)?;
    let apply_fallback = spec.name == "apply_resource";
    let reply = transport.do_request(op.clone()).await?;

    // Apply means create-or-update: on a name conflict, replace.
    let reply = if apply_fallback && reply.status == 409 {
        let mut update = op;
        update.verb = Verb::Update;
        update.name = update
            .body
            .as_ref()
            .and_then(|m| m.pointer("/metadata/name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        transport.do_request(update).await?
    } else {
        reply
    };

    Ok(render_reply(&reply))
}

fn render_reply(reply: &K8sReply) -> String {
    let body = String::from_utf8_lossy(&reply.body);
    if (200..300).contains(&reply.status) {
        body.into_owned()
    } else {
        format!("upstream status {}: {}", reply.status, body)
    }
}

fn build_op(spec: &ToolSpec, input: &Value, context: &ChatContext) -> Result<K8sOp, ToolError> {
    let group = str_arg(input, "group").unwrap_or_default();
    let version = str_arg(input, "version").unwrap_or_else(|| "v1".to_string());
    let namespace = target_namespace(input, context);

    let op = match spec.name {
        "list_resources" => K8sOp {
            verb: Verb::List,
            group,
            version,
            resource: required_str(input, "resource")?,
            namespace,
            name: None,
            body: None,
        },
        "describe_resource" => K8sOp {
            verb: Verb::Get,
            group,
            version,
            resource: required_str(input, "resource")?,
            namespace,
            name: Some(required_str(input, "name")?),
            body: None,
        },
        "cluster_events" => K8sOp {
            verb: Verb::List,
            group: String::new(),
            version: "v1".into(),
            resource: "events".into(),
            namespace,
            name: None,
            body: None,
        },
        "pod_logs" => {
            let name = required_str(input, "name")?;
            let suffix = match str_arg(input, "container") {
                Some(container) => format!("{name}/log?container={container}"),
                None => format!("{name}/log"),
            };
            K8sOp {
                verb: Verb::Get,
                group: String::new(),
                version: "v1".into(),
                resource: "pods".into(),
                namespace: Some(required_str(input, "namespace")?),
                name: Some(suffix),
                body: None,
            }
        }
        "apply_resource" => {
            let manifest = input
                .get("manifest")
                .cloned()
                .ok_or_else(|| ToolError::BadArguments("missing argument \"manifest\"".into()))?;
            let (group, version, resource) = gvr_from_manifest(&manifest)?;
            K8sOp {
                verb: Verb::Create,
                group,
                version,
                resource,
                namespace: manifest
                    .pointer("/metadata/namespace")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(namespace),
                name: None,
                body: Some(manifest),
            }
        }
        "delete_resource" => K8sOp {
            verb: Verb::Delete,
            group,
            version,
            resource: required_str(input, "resource")?,
            namespace,
            name: Some(required_str(input, "name")?),
            body: None,
        },
        "scale_workload" => {
            let replicas = input
                .get("replicas")
                .and_then(Value::as_i64)
                .ok_or_else(|| ToolError::BadArguments("missing argument \"replicas\"".into()))?;
            K8sOp {
                verb: Verb::Patch,
                group: str_arg(input, "group").unwrap_or_else(|| "apps".to_string()),
                version,
                resource: str_arg(input, "resource").unwrap_or_else(|| "deployments".to_string()),
                namespace: Some(required_str(input, "namespace")?),
                name: Some(required_str(input, "name")?),
                body: Some(json!({"spec": {"replicas": replicas}})),
            }
        }
        "restart_workload" => K8sOp {
            verb: Verb::Patch,
            group: str_arg(input, "group").unwrap_or_else(|| "apps".to_string()),
            version,
            resource: str_arg(input, "resource").unwrap_or_else(|| "deployments".to_string()),
            namespace: Some(required_str(input, "namespace")?),
            name: Some(required_str(input, "name")?),
            body: Some(json!({
                "spec": {"template": {"metadata": {"annotations": {
                    "argus.dev/restarted-at": Utc::now().to_rfc3339(),
                }}}}
            })),
        },
        other => {
            return Err(ToolError::BadArguments(format!("unknown tool {other:?}")));
        }
    };
    Ok(op)
}

/// Derive (group, version, plural) from a manifest's apiVersion and kind.
/// The plural is the lowercased kind with a naive `s`; good enough for the
/// built-in workload kinds this tool targets.
fn gvr_from_manifest(manifest: &Value) -> Result<(String, String, String), ToolError> {
    let api_version = manifest
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::BadArguments("manifest is missing apiVersion".into()))?;
    let kind = manifest
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::BadArguments("manifest is missing kind".into()))?;
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    let lower = kind.to_lowercase();
    let plural = if lower.ends_with('s') {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    };
    Ok((group, version, plural))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_exact() {
        assert!(lookup("delete_resource").is_some());
        assert!(lookup("Delete_Resource").is_none());
        assert!(lookup("nonexistent").is_none());
    }

    #[test]
    fn read_only_and_mutating_grouping() {
        for name in ["list_resources", "describe_resource", "cluster_events", "pod_logs"] {
            assert!(!lookup(name).unwrap().destructive, "{name}");
        }
        for name in [
            "apply_resource",
            "delete_resource",
            "scale_workload",
            "restart_workload",
        ] {
            assert!(lookup(name).unwrap().destructive, "{name}");
        }
    }

    #[test]
    fn cluster_falls_back_to_context() {
        let id = Uuid::new_v4();
        let context = ChatContext {
            cluster_id: Some(id),
            namespace: Some("default".into()),
        };
        assert_eq!(target_cluster(&json!({}), &context).unwrap(), id);

        let explicit = Uuid::new_v4();
        assert_eq!(
            target_cluster(&json!({"cluster": explicit.to_string()}), &context).unwrap(),
            explicit
        );
        assert!(matches!(
            target_cluster(&json!({}), &ChatContext::default()),
            Err(ToolError::NoCluster)
        ));
    }

    #[test]
    fn scale_builds_a_merge_patch() {
        let spec = lookup("scale_workload").unwrap();
        let op = build_op(
            spec,
            &json!({"name": "web", "namespace": "prod", "replicas": 3}),
            &ChatContext::default(),
        )
        .unwrap();
        assert_eq!(op.verb, Verb::Patch);
        assert_eq!(op.group, "apps");
        assert_eq!(op.resource, "deployments");
        assert_eq!(op.body.unwrap()["spec"]["replicas"], 3);
    }

    #[test]
    fn apply_derives_group_version_plural() {
        let (group, version, plural) = gvr_from_manifest(&json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
        }))
        .unwrap();
        assert_eq!(group, "apps");
        assert_eq!(version, "v1");
        assert_eq!(plural, "deployments");

        let (group, version, plural) = gvr_from_manifest(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
        }))
        .unwrap();
        assert_eq!(group, "");
        assert_eq!(version, "v1");
        assert_eq!(plural, "configmaps");
    }

    #[test]
    fn missing_arguments_are_rejected() {
        let spec = lookup("describe_resource").unwrap();
        let err = build_op(spec, &json!({"resource": "pods"}), &ChatContext::default())
            .unwrap_err();
        assert!(matches!(err, ToolError::BadArguments(_)));
    }
}
