use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use argus_common::rbac::{Permission, Role};

use super::seal::Sealer;
use super::{
    AgentToken, AuditEntry, AuditQuery, ClusterInfo, ClusterRecord, ConnectionType, Principal,
    PrincipalKind, RoleBinding, Store, StoreError, TokenRejection, expand_bindings,
};

/// In-memory backend, selected with `--db memory`. Backs development runs
/// and every test that needs persistence. Credentials are sealed exactly as
/// in the Postgres backend.
pub struct MemoryStore {
    sealer: Sealer,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    clusters: HashMap<Uuid, ClusterRecord>,
    credentials: HashMap<Uuid, Vec<u8>>,
    tokens: HashMap<Uuid, AgentToken>,
    principals: HashMap<Uuid, Principal>,
    bindings: Vec<RoleBinding>,
    audit: Vec<AuditEntry>,
}

impl MemoryStore {
    pub fn new(sealer: Sealer) -> Self {
        Self {
            sealer,
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_direct_cluster(
        &self,
        name: &str,
        api_server_url: &str,
        kubeconfig: &str,
    ) -> Result<ClusterRecord, StoreError> {
        let sealed = self.sealer.seal(kubeconfig.as_bytes())?;
        let mut inner = self.inner.lock().await;
        if inner.clusters.values().any(|c| c.name == name) {
            return Err(StoreError::Conflict(format!(
                "cluster name {name:?} already registered"
            )));
        }
        let record = ClusterRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            connection_type: ConnectionType::Direct,
            api_server_url: Some(api_server_url.to_string()),
            agent_principal_id: None,
            info: None,
            created_at: Utc::now(),
        };
        inner.credentials.insert(record.id, sealed);
        inner.clusters.insert(record.id, record.clone());
        Ok(record)
    }

    async fn create_agent_cluster(
        &self,
        id: Uuid,
        name: &str,
        agent_principal_id: Uuid,
        info: ClusterInfo,
    ) -> Result<ClusterRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.clusters.values().any(|c| c.name == name) {
            return Err(StoreError::Conflict(format!(
                "cluster name {name:?} already registered"
            )));
        }
        let record = ClusterRecord {
            id,
            name: name.to_string(),
            connection_type: ConnectionType::Agent,
            api_server_url: None,
            agent_principal_id: Some(agent_principal_id),
            info: Some(info),
            created_at: Utc::now(),
        };
        inner.clusters.insert(id, record.clone());
        Ok(record)
    }

    async fn get_cluster(&self, id: Uuid) -> Result<Option<ClusterRecord>, StoreError> {
        Ok(self.inner.lock().await.clusters.get(&id).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut clusters: Vec<_> = inner.clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.created_at);
        Ok(clusters)
    }

    async fn delete_cluster(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.credentials.remove(&id);
        Ok(inner.clusters.remove(&id).is_some())
    }

    async fn load_kubeconfig(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(sealed) = inner.credentials.get(&id) else {
            return Ok(None);
        };
        let plaintext = self.sealer.unseal(sealed)?;
        let config = String::from_utf8(plaintext)
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("kubeconfig is not valid UTF-8")))?;
        Ok(Some(config))
    }

    async fn update_cluster_info(&self, id: Uuid, info: ClusterInfo) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let cluster = inner.clusters.get_mut(&id).ok_or(StoreError::NotFound)?;
        cluster.info = Some(info);
        Ok(())
    }

    async fn create_agent_token(&self, token: AgentToken) -> Result<(), StoreError> {
        self.inner.lock().await.tokens.insert(token.id, token);
        Ok(())
    }

    async fn list_agent_tokens(&self) -> Result<Vec<AgentToken>, StoreError> {
        let inner = self.inner.lock().await;
        let mut tokens: Vec<_> = inner.tokens.values().cloned().collect();
        tokens.sort_by_key(|t| t.created_at);
        Ok(tokens)
    }

    async fn consume_agent_token(
        &self,
        secret_hash: &str,
        cluster_id: Uuid,
    ) -> Result<AgentToken, StoreError> {
        let mut inner = self.inner.lock().await;
        let token = inner
            .tokens
            .values_mut()
            .find(|t| t.secret_hash == secret_hash)
            .ok_or(StoreError::TokenRejected(TokenRejection::Unknown))?;
        if token.used {
            return Err(StoreError::TokenRejected(TokenRejection::Reused));
        }
        if token.expires_at <= Utc::now() {
            return Err(StoreError::TokenRejected(TokenRejection::Expired));
        }
        token.used = true;
        token.used_at = Some(Utc::now());
        token.cluster_id = Some(cluster_id);
        Ok(token.clone())
    }

    async fn create_principal(&self, principal: Principal) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.principals.values().any(|p| p.name == principal.name) {
            return Err(StoreError::Conflict(format!(
                "principal {:?} already exists",
                principal.name
            )));
        }
        inner.principals.insert(principal.id, principal);
        Ok(())
    }

    async fn get_principal(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        Ok(self.inner.lock().await.principals.get(&id).cloned())
    }

    async fn find_principal_by_name(&self, name: &str) -> Result<Option<Principal>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.principals.values().find(|p| p.name == name).cloned())
    }

    async fn has_admin(&self) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.bindings.iter().any(|b| {
            b.role == Role::Admin
                && inner
                    .principals
                    .get(&b.principal_id)
                    .is_some_and(|p| p.kind == PrincipalKind::User)
        }))
    }

    async fn create_role_binding(&self, binding: RoleBinding) -> Result<(), StoreError> {
        self.inner.lock().await.bindings.push(binding);
        Ok(())
    }

    async fn permissions_for(&self, principal_id: Uuid) -> Result<Vec<Permission>, StoreError> {
        let inner = self.inner.lock().await;
        let bindings: Vec<_> = inner
            .bindings
            .iter()
            .filter(|b| b.principal_id == principal_id)
            .cloned()
            .collect();
        Ok(expand_bindings(&bindings))
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.inner.lock().await.audit.push(entry);
        Ok(())
    }

    async fn query_audit(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.inner.lock().await;
        let limit = query.limit.unwrap_or(500).max(0) as usize;
        let mut entries: Vec<_> = inner
            .audit
            .iter()
            .filter(|e| query.actor.as_deref().is_none_or(|a| e.actor == a))
            .filter(|e| query.cluster.is_none_or(|c| e.target_cluster == Some(c)))
            .filter(|e| query.action.as_deref().is_none_or(|a| e.action == a))
            .filter(|e| query.from.is_none_or(|t| e.timestamp >= t))
            .filter(|e| query.to.is_none_or(|t| e.timestamp <= t))
            .cloned()
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use chrono::Duration;

    use super::super::{hash_secret, new_agent_secret};
    use super::*;

    pub(crate) fn test_store() -> MemoryStore {
        MemoryStore::new(Sealer::from_base64(&BASE64.encode([1u8; 32])).unwrap())
    }

    fn token(secret: &str, ttl_secs: i64) -> AgentToken {
        AgentToken {
            id: Uuid::new_v4(),
            secret_hash: hash_secret(secret),
            cluster_name_hint: "prod".into(),
            permissions_preset: "operator".into(),
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
            used: false,
            used_at: None,
            cluster_id: None,
        }
    }

    #[tokio::test]
    async fn kubeconfig_round_trips_sealed() {
        let store = test_store();
        let record = store
            .save_direct_cluster("prod", "https://10.0.0.1:6443", "apiVersion: v1\nkind: Config")
            .await
            .unwrap();
        let config = store.load_kubeconfig(record.id).await.unwrap().unwrap();
        assert_eq!(config, "apiVersion: v1\nkind: Config");
    }

    #[tokio::test]
    async fn duplicate_cluster_name_conflicts() {
        let store = test_store();
        store
            .save_direct_cluster("prod", "https://a", "cfg")
            .await
            .unwrap();
        let err = store
            .save_direct_cluster("prod", "https://b", "cfg")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn concurrent_consume_has_exactly_one_winner() {
        let store = Arc::new(test_store());
        let secret = new_agent_secret();
        store.create_agent_token(token(&secret, 3600)).await.unwrap();

        let hash = hash_secret(&secret);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let hash = hash.clone();
            tasks.push(tokio::spawn(async move {
                store.consume_agent_token(&hash, Uuid::new_v4()).await
            }));
        }
        let mut successes = 0;
        let mut reused = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => successes += 1,
                Err(StoreError::TokenRejected(TokenRejection::Reused)) => reused += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(reused, 7);
    }

    #[tokio::test]
    async fn sequential_reuse_and_expiry_rejected() {
        let store = test_store();
        let secret = new_agent_secret();
        store.create_agent_token(token(&secret, 3600)).await.unwrap();
        let cluster = Uuid::new_v4();
        let consumed = store
            .consume_agent_token(&hash_secret(&secret), cluster)
            .await
            .unwrap();
        assert_eq!(consumed.cluster_id, Some(cluster));
        assert!(consumed.used);

        let err = store
            .consume_agent_token(&hash_secret(&secret), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::TokenRejected(TokenRejection::Reused)
        ));

        let expired_secret = new_agent_secret();
        store
            .create_agent_token(token(&expired_secret, -10))
            .await
            .unwrap();
        let err = store
            .consume_agent_token(&hash_secret(&expired_secret), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::TokenRejected(TokenRejection::Expired)
        ));
    }

    #[tokio::test]
    async fn unknown_secret_rejected() {
        let store = test_store();
        let err = store
            .consume_agent_token(&hash_secret("nope"), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::TokenRejected(TokenRejection::Unknown)
        ));
    }

    #[tokio::test]
    async fn admin_gate_flips_after_bootstrap() {
        let store = test_store();
        assert!(!store.has_admin().await.unwrap());

        let admin = Principal {
            id: Uuid::new_v4(),
            name: "admin".into(),
            kind: PrincipalKind::User,
            password_hash: Some("hash".into()),
            created_at: Utc::now(),
        };
        store.create_principal(admin.clone()).await.unwrap();
        store
            .create_role_binding(RoleBinding::global(admin.id, Role::Admin))
            .await
            .unwrap();
        assert!(store.has_admin().await.unwrap());
    }

    #[tokio::test]
    async fn audit_is_append_only_and_filterable() {
        let store = test_store();
        let cluster = Uuid::new_v4();
        store
            .append_audit(
                AuditEntry::new("alice", "delete")
                    .cluster(cluster)
                    .resource("pods/web-1")
                    .outcome("ok"),
            )
            .await
            .unwrap();
        store
            .append_audit(AuditEntry::new("bob", "apply").outcome("error"))
            .await
            .unwrap();

        let all = store.query_audit(AuditQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let alice = store
            .query_audit(AuditQuery {
                actor: Some("alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].target_cluster, Some(cluster));

        let by_cluster = store
            .query_audit(AuditQuery {
                cluster: Some(cluster),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_cluster.len(), 1);
    }
}
