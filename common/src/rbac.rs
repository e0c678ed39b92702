use serde::{Deserialize, Serialize};

/// How far a permission reaches. `scope_value` is unused for `Global`,
/// a cluster id (or `*`) for `Cluster`, and `cluster/namespace` (either
/// component possibly `*`) for `Namespace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Cluster,
    Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
    pub scope: Scope,
    pub scope_value: String,
}

impl Permission {
    pub fn global(resource: &str, action: &str) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            scope: Scope::Global,
            scope_value: String::new(),
        }
    }

    pub fn cluster(resource: &str, action: &str, cluster: &str) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            scope: Scope::Cluster,
            scope_value: cluster.into(),
        }
    }

    pub fn namespace(resource: &str, action: &str, cluster: &str, namespace: &str) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            scope: Scope::Namespace,
            scope_value: format!("{cluster}/{namespace}"),
        }
    }
}

/// The thing a caller is trying to do, in evaluator terms.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub resource: &'a str,
    pub action: &'a str,
    pub cluster: Option<&'a str>,
    pub namespace: Option<&'a str>,
}

/// Pure evaluation: any matching permission grants access, absence denies.
pub fn authorize(permissions: &[Permission], req: &AccessRequest) -> bool {
    permissions.iter().any(|p| matches(p, req))
}

fn matches(p: &Permission, req: &AccessRequest) -> bool {
    if !glob_eq(&p.resource, req.resource) || !glob_eq(&p.action, req.action) {
        return false;
    }
    match p.scope {
        Scope::Global => true,
        Scope::Cluster => component_matches(&p.scope_value, req.cluster),
        Scope::Namespace => {
            let (cluster_pat, ns_pat) = p.scope_value.split_once('/').unwrap_or(("", ""));
            component_matches(cluster_pat, req.cluster) && component_matches(ns_pat, req.namespace)
        }
    }
}

fn glob_eq(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

/// A missing request component only matches the wildcard: a scoped
/// permission never widens to cover scope-less operations.
fn component_matches(pattern: &str, value: Option<&str>) -> bool {
    match value {
        Some(v) => glob_eq(pattern, v),
        None => pattern == "*",
    }
}

/// Built-in roles; bindings may narrow them to a cluster or namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    /// Expand to concrete permissions, rescoped to the binding's scope.
    pub fn permissions(&self, scope: Scope, scope_value: &str) -> Vec<Permission> {
        let rescope = |mut p: Permission| {
            if scope != Scope::Global {
                p.scope = scope;
                p.scope_value = scope_value.to_string();
            }
            p
        };
        match self {
            Role::Admin => vec![Permission::global("*", "*")],
            Role::Operator => vec![
                Permission::global("clusters", "*"),
                Permission::global("resources", "*"),
                Permission::global("ai", "*"),
            ],
            Role::Viewer => vec![
                Permission::global("clusters", "get"),
                Permission::global("clusters", "list"),
                Permission::global("resources", "get"),
                Permission::global("resources", "list"),
                Permission::global("resources", "watch"),
                Permission::global("ai", "chat"),
            ],
        }
        .into_iter()
        .map(rescope)
        .collect()
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            _ => Err(anyhow::anyhow!("unknown role: {}", s)),
        }
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req<'a>(
        resource: &'a str,
        action: &'a str,
        cluster: Option<&'a str>,
        namespace: Option<&'a str>,
    ) -> AccessRequest<'a> {
        AccessRequest {
            resource,
            action,
            cluster,
            namespace,
        }
    }

    #[test]
    fn global_wildcard_grants_everything() {
        let perms = [Permission::global("*", "*")];
        assert!(authorize(&perms, &req("resources", "delete", Some("c1"), Some("prod"))));
        assert!(authorize(&perms, &req("clusters", "create", None, None)));
    }

    #[test]
    fn resource_and_action_must_both_match() {
        let perms = [Permission::global("resources", "get")];
        assert!(authorize(&perms, &req("resources", "get", None, None)));
        assert!(!authorize(&perms, &req("resources", "delete", None, None)));
        assert!(!authorize(&perms, &req("clusters", "get", None, None)));
    }

    #[test]
    fn cluster_scope_binds_to_one_cluster() {
        let perms = [Permission::cluster("resources", "*", "c1")];
        assert!(authorize(&perms, &req("resources", "get", Some("c1"), None)));
        assert!(!authorize(&perms, &req("resources", "get", Some("c2"), None)));
        // A cluster-scoped grant does not cover scope-less operations.
        assert!(!authorize(&perms, &req("resources", "get", None, None)));
    }

    #[test]
    fn cluster_scope_wildcard_covers_any_cluster() {
        let perms = [Permission::cluster("resources", "*", "*")];
        assert!(authorize(&perms, &req("resources", "get", Some("c1"), None)));
        assert!(authorize(&perms, &req("resources", "get", None, None)));
    }

    #[test]
    fn namespace_scope_requires_both_components() {
        let perms = [Permission::namespace("resources", "*", "c1", "prod")];
        assert!(authorize(
            &perms,
            &req("resources", "delete", Some("c1"), Some("prod"))
        ));
        assert!(!authorize(
            &perms,
            &req("resources", "delete", Some("c1"), Some("dev"))
        ));
        assert!(!authorize(
            &perms,
            &req("resources", "delete", Some("c2"), Some("prod"))
        ));
        // Namespaced grant does not widen to a cluster-wide request.
        assert!(!authorize(
            &perms,
            &req("resources", "delete", Some("c1"), None)
        ));
    }

    #[test]
    fn namespace_wildcards() {
        let perms = [Permission::namespace("resources", "get", "c1", "*")];
        assert!(authorize(
            &perms,
            &req("resources", "get", Some("c1"), Some("anything"))
        ));
        assert!(authorize(&perms, &req("resources", "get", Some("c1"), None)));
    }

    #[test]
    fn absence_denies() {
        assert!(!authorize(&[], &req("resources", "get", None, None)));
    }

    #[test]
    fn viewer_cannot_mutate() {
        let perms = Role::Viewer.permissions(Scope::Global, "");
        assert!(authorize(&perms, &req("resources", "list", Some("c1"), None)));
        assert!(!authorize(
            &perms,
            &req("resources", "delete", Some("c1"), None)
        ));
        assert!(!authorize(&perms, &req("clusters", "create", None, None)));
    }

    #[test]
    fn operator_binding_rescoped_to_cluster() {
        let perms = Role::Operator.permissions(Scope::Cluster, "c1");
        assert!(authorize(
            &perms,
            &req("resources", "delete", Some("c1"), Some("prod"))
        ));
        assert!(!authorize(
            &perms,
            &req("resources", "delete", Some("c2"), Some("prod"))
        ));
    }
}
