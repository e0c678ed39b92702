use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use argus_common::rbac::{Permission, Role, Scope};

pub mod memory;
pub mod postgres;
pub mod seal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Direct,
    Agent,
}

/// Persistent half of a registered cluster. Liveness and the active
/// transport live in the registry, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: Uuid,
    pub name: String,
    pub connection_type: ConnectionType,
    pub api_server_url: Option<String>,
    /// Agent clusters: the long-lived principal the agent authenticates with
    pub agent_principal_id: Option<Uuid>,
    pub info: Option<ClusterInfo>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub version: String,
    pub node_count: i32,
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub crds: Vec<String>,
}

/// Single-use agent registration credential. Only the digest of the secret
/// is ever stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToken {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub cluster_name_hint: String,
    pub permissions_preset: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub cluster_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub name: String,
    pub kind: PrincipalKind,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBinding {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub role: Role,
    pub scope: Scope,
    pub scope_value: String,
}

impl RoleBinding {
    pub fn global(principal_id: Uuid, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal_id,
            role,
            scope: Scope::Global,
            scope_value: String::new(),
        }
    }
}

/// Append-only record of a mutating attempt; never amended after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target_cluster: Option<Uuid>,
    pub target_resource: Option<String>,
    pub outcome: String,
    pub request_digest: Option<String>,
}

impl AuditEntry {
    pub fn new(actor: &str, action: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            target_cluster: None,
            target_resource: None,
            outcome: String::new(),
            request_digest: None,
        }
    }

    pub fn cluster(mut self, cluster: Uuid) -> Self {
        self.target_cluster = Some(cluster);
        self
    }

    pub fn resource(mut self, resource: &str) -> Self {
        self.target_resource = Some(resource.to_string());
        self
    }

    pub fn outcome(mut self, outcome: &str) -> Self {
        self.outcome = outcome.to_string();
        self
    }

    pub fn digest(mut self, digest: &str) -> Self {
        self.request_digest = Some(digest.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub cluster: Option<Uuid>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRejection {
    /// No token matches the presented secret
    Unknown,
    /// Past `expires_at`
    Expired,
    /// Already consumed
    Reused,
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenRejection::Unknown => write!(f, "unknown"),
            TokenRejection::Expired => write!(f, "expired"),
            TokenRejection::Reused => write!(f, "reused"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("agent token rejected: {0}")]
    TokenRejected(TokenRejection),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence boundary for the control plane. Both backends implement
/// identical semantics, including the atomic token consume.
#[async_trait]
pub trait Store: Send + Sync {
    // Clusters. Credentials go in sealed and come out plaintext only via
    // `load_kubeconfig`, for immediate in-process use.
    async fn save_direct_cluster(
        &self,
        name: &str,
        api_server_url: &str,
        kubeconfig: &str,
    ) -> Result<ClusterRecord, StoreError>;
    async fn create_agent_cluster(
        &self,
        id: Uuid,
        name: &str,
        agent_principal_id: Uuid,
        info: ClusterInfo,
    ) -> Result<ClusterRecord, StoreError>;
    async fn get_cluster(&self, id: Uuid) -> Result<Option<ClusterRecord>, StoreError>;
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, StoreError>;
    async fn delete_cluster(&self, id: Uuid) -> Result<bool, StoreError>;
    async fn load_kubeconfig(&self, id: Uuid) -> Result<Option<String>, StoreError>;
    async fn update_cluster_info(&self, id: Uuid, info: ClusterInfo) -> Result<(), StoreError>;

    // Agent tokens
    async fn create_agent_token(&self, token: AgentToken) -> Result<(), StoreError>;
    async fn list_agent_tokens(&self) -> Result<Vec<AgentToken>, StoreError>;
    /// Atomic compare-exchange: at most one concurrent consumption of the
    /// same secret succeeds; the rest see `TokenRejected(Reused)`.
    async fn consume_agent_token(
        &self,
        secret_hash: &str,
        cluster_id: Uuid,
    ) -> Result<AgentToken, StoreError>;

    // Principals & role bindings
    async fn create_principal(&self, principal: Principal) -> Result<(), StoreError>;
    async fn get_principal(&self, id: Uuid) -> Result<Option<Principal>, StoreError>;
    async fn find_principal_by_name(&self, name: &str) -> Result<Option<Principal>, StoreError>;
    async fn has_admin(&self) -> Result<bool, StoreError>;
    async fn create_role_binding(&self, binding: RoleBinding) -> Result<(), StoreError>;
    async fn permissions_for(&self, principal_id: Uuid) -> Result<Vec<Permission>, StoreError>;

    // Audit
    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;
    async fn query_audit(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Generate a fresh agent registration secret. Returned once, stored hashed.
pub fn new_agent_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Expand a principal's role bindings into concrete permissions.
pub fn expand_bindings(bindings: &[RoleBinding]) -> Vec<Permission> {
    bindings
        .iter()
        .flat_map(|b| b.role.permissions(b.scope, &b.scope_value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_unique_and_hashes_stable() {
        let a = new_agent_secret();
        let b = new_agent_secret();
        assert_ne!(a, b);
        assert_eq!(hash_secret(&a), hash_secret(&a));
        assert_ne!(hash_secret(&a), hash_secret(&b));
    }

    #[test]
    fn bindings_expand_with_scope() {
        let principal = Uuid::new_v4();
        let bindings = vec![RoleBinding {
            id: Uuid::new_v4(),
            principal_id: principal,
            role: Role::Operator,
            scope: Scope::Cluster,
            scope_value: "c1".into(),
        }];
        let perms = expand_bindings(&bindings);
        assert!(perms.iter().all(|p| p.scope == Scope::Cluster));
        assert!(perms.iter().all(|p| p.scope_value == "c1"));
    }
}
