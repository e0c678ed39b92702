use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use argus_common::rbac::{Permission, Role, Scope};

use super::seal::Sealer;
use super::{
    AgentToken, AuditEntry, AuditQuery, ClusterInfo, ClusterRecord, ConnectionType, Principal,
    PrincipalKind, RoleBinding, Store, StoreError, TokenRejection, expand_bindings,
};

pub struct PgStore {
    pool: Pool,
    sealer: Sealer,
}

impl PgStore {
    pub fn new(pool: Pool, sealer: Sealer) -> Self {
        Self { pool, sealer }
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        Ok(self
            .pool
            .get()
            .await
            .context("failed to get db connection")?)
    }
}

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> anyhow::Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                connection_type TEXT NOT NULL,
                api_server_url TEXT,
                sealed_kubeconfig BYTEA,
                agent_principal_id UUID,
                info JSONB,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create clusters table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS agent_tokens (
                id UUID PRIMARY KEY,
                secret_hash TEXT NOT NULL UNIQUE,
                cluster_name_hint TEXT NOT NULL,
                permissions_preset TEXT NOT NULL,
                created_by UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                used BOOLEAN NOT NULL DEFAULT FALSE,
                used_at TIMESTAMPTZ,
                cluster_id UUID
            )
            "#,
            &[],
        )
        .await
        .context("failed to create agent_tokens table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS principals (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                password_hash TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create principals table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS role_bindings (
                id UUID PRIMARY KEY,
                principal_id UUID NOT NULL REFERENCES principals(id) ON DELETE CASCADE,
                role_name TEXT NOT NULL,
                scope TEXT NOT NULL,
                scope_value TEXT NOT NULL DEFAULT ''
            )
            "#,
            &[],
        )
        .await
        .context("failed to create role_bindings table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id UUID PRIMARY KEY,
                ts TIMESTAMPTZ NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                target_cluster UUID,
                target_resource TEXT,
                outcome TEXT NOT NULL,
                request_digest TEXT
            )
            "#,
            &[],
        )
        .await
        .context("failed to create audit_log table")?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log (actor)",
        "CREATE INDEX IF NOT EXISTS idx_audit_cluster ON audit_log (target_cluster)",
        "CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log (ts)",
        "CREATE INDEX IF NOT EXISTS idx_role_bindings_principal ON role_bindings (principal_id)",
    ] {
        client.execute(ddl, &[]).await.context("failed to create index")?;
    }

    tracing::info!("database schema initialized");
    Ok(())
}

fn row_to_cluster(row: &Row) -> Result<ClusterRecord, StoreError> {
    let connection_type: String = row.get("connection_type");
    let connection_type = match connection_type.as_str() {
        "direct" => ConnectionType::Direct,
        "agent" => ConnectionType::Agent,
        other => {
            return Err(StoreError::Backend(anyhow!(
                "unknown connection type {other:?}"
            )));
        }
    };
    let info: Option<serde_json::Value> = row.get("info");
    let info = info
        .map(serde_json::from_value::<ClusterInfo>)
        .transpose()
        .context("failed to decode cluster info")?;
    Ok(ClusterRecord {
        id: row.get("id"),
        name: row.get("name"),
        connection_type,
        api_server_url: row.get("api_server_url"),
        agent_principal_id: row.get("agent_principal_id"),
        info,
        created_at: row.get("created_at"),
    })
}

fn row_to_token(row: &Row) -> AgentToken {
    AgentToken {
        id: row.get("id"),
        secret_hash: row.get("secret_hash"),
        cluster_name_hint: row.get("cluster_name_hint"),
        permissions_preset: row.get("permissions_preset"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        used: row.get("used"),
        used_at: row.get("used_at"),
        cluster_id: row.get("cluster_id"),
    }
}

fn row_to_principal(row: &Row) -> Result<Principal, StoreError> {
    let kind: String = row.get("kind");
    let kind = match kind.as_str() {
        "user" => PrincipalKind::User,
        "agent" => PrincipalKind::Agent,
        other => return Err(StoreError::Backend(anyhow!("unknown principal kind {other:?}"))),
    };
    Ok(Principal {
        id: row.get("id"),
        name: row.get("name"),
        kind,
        password_hash: row.get("password_hash"),
        created_at: row.get("created_at"),
    })
}

fn row_to_audit(row: &Row) -> AuditEntry {
    AuditEntry {
        id: row.get("id"),
        timestamp: row.get("ts"),
        actor: row.get("actor"),
        action: row.get("action"),
        target_cluster: row.get("target_cluster"),
        target_resource: row.get("target_resource"),
        outcome: row.get("outcome"),
        request_digest: row.get("request_digest"),
    }
}

fn scope_to_str(scope: Scope) -> &'static str {
    match scope {
        Scope::Global => "global",
        Scope::Cluster => "cluster",
        Scope::Namespace => "namespace",
    }
}

fn str_to_scope(s: &str) -> Result<Scope, StoreError> {
    match s {
        "global" => Ok(Scope::Global),
        "cluster" => Ok(Scope::Cluster),
        "namespace" => Ok(Scope::Namespace),
        other => Err(StoreError::Backend(anyhow!("unknown scope {other:?}"))),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_direct_cluster(
        &self,
        name: &str,
        api_server_url: &str,
        kubeconfig: &str,
    ) -> Result<ClusterRecord, StoreError> {
        let sealed = self.sealer.seal(kubeconfig.as_bytes())?;
        let client = self.client().await?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let row = client
            .query_opt(
                r#"
                INSERT INTO clusters (id, name, connection_type, api_server_url, sealed_kubeconfig, created_at)
                VALUES ($1, $2, 'direct', $3, $4, $5)
                ON CONFLICT (name) DO NOTHING
                RETURNING id, name, connection_type, api_server_url, agent_principal_id, info, created_at
                "#,
                &[&id, &name, &api_server_url, &sealed, &now],
            )
            .await
            .context("failed to save cluster")?;
        match row {
            Some(row) => row_to_cluster(&row),
            None => Err(StoreError::Conflict(format!(
                "cluster name {name:?} already registered"
            ))),
        }
    }

    async fn create_agent_cluster(
        &self,
        id: Uuid,
        name: &str,
        agent_principal_id: Uuid,
        info: ClusterInfo,
    ) -> Result<ClusterRecord, StoreError> {
        let client = self.client().await?;
        let now = Utc::now();
        let info_json = serde_json::to_value(&info).context("failed to encode cluster info")?;
        let row = client
            .query_opt(
                r#"
                INSERT INTO clusters (id, name, connection_type, agent_principal_id, info, created_at)
                VALUES ($1, $2, 'agent', $3, $4, $5)
                ON CONFLICT (name) DO NOTHING
                RETURNING id, name, connection_type, api_server_url, agent_principal_id, info, created_at
                "#,
                &[&id, &name, &agent_principal_id, &info_json, &now],
            )
            .await
            .context("failed to create agent cluster")?;
        match row {
            Some(row) => row_to_cluster(&row),
            None => Err(StoreError::Conflict(format!(
                "cluster name {name:?} already registered"
            ))),
        }
    }

    async fn get_cluster(&self, id: Uuid) -> Result<Option<ClusterRecord>, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                r#"
                SELECT id, name, connection_type, api_server_url, agent_principal_id, info, created_at
                FROM clusters WHERE id = $1
                "#,
                &[&id],
            )
            .await
            .context("failed to get cluster")?;
        row.as_ref().map(row_to_cluster).transpose()
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT id, name, connection_type, api_server_url, agent_principal_id, info, created_at
                FROM clusters ORDER BY created_at
                "#,
                &[],
            )
            .await
            .context("failed to list clusters")?;
        rows.iter().map(row_to_cluster).collect()
    }

    async fn delete_cluster(&self, id: Uuid) -> Result<bool, StoreError> {
        let client = self.client().await?;
        let deleted = client
            .execute("DELETE FROM clusters WHERE id = $1", &[&id])
            .await
            .context("failed to delete cluster")?;
        Ok(deleted > 0)
    }

    async fn load_kubeconfig(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT sealed_kubeconfig FROM clusters WHERE id = $1",
                &[&id],
            )
            .await
            .context("failed to load credentials")?;
        let Some(row) = row else { return Ok(None) };
        let Some(sealed) = row.get::<_, Option<Vec<u8>>>("sealed_kubeconfig") else {
            return Ok(None);
        };
        let plaintext = self.sealer.unseal(&sealed)?;
        let config = String::from_utf8(plaintext)
            .map_err(|_| StoreError::Backend(anyhow!("kubeconfig is not valid UTF-8")))?;
        Ok(Some(config))
    }

    async fn update_cluster_info(&self, id: Uuid, info: ClusterInfo) -> Result<(), StoreError> {
        let client = self.client().await?;
        let info_json = serde_json::to_value(&info).context("failed to encode cluster info")?;
        let updated = client
            .execute(
                "UPDATE clusters SET info = $2 WHERE id = $1",
                &[&id, &info_json],
            )
            .await
            .context("failed to update cluster info")?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_agent_token(&self, token: AgentToken) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO agent_tokens
                    (id, secret_hash, cluster_name_hint, permissions_preset, created_by, created_at, expires_at, used)
                VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
                "#,
                &[
                    &token.id,
                    &token.secret_hash,
                    &token.cluster_name_hint,
                    &token.permissions_preset,
                    &token.created_by,
                    &token.created_at,
                    &token.expires_at,
                ],
            )
            .await
            .context("failed to create agent token")?;
        Ok(())
    }

    async fn list_agent_tokens(&self) -> Result<Vec<AgentToken>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT * FROM agent_tokens ORDER BY created_at", &[])
            .await
            .context("failed to list agent tokens")?;
        Ok(rows.iter().map(row_to_token).collect())
    }

    async fn consume_agent_token(
        &self,
        secret_hash: &str,
        cluster_id: Uuid,
    ) -> Result<AgentToken, StoreError> {
        let client = self.client().await?;
        // The conditional UPDATE is the compare-exchange: under concurrency
        // exactly one caller flips `used` and the rest match zero rows.
        let row = client
            .query_opt(
                r#"
                UPDATE agent_tokens
                SET used = TRUE, used_at = NOW(), cluster_id = $2
                WHERE secret_hash = $1 AND used = FALSE AND expires_at > NOW()
                RETURNING *
                "#,
                &[&secret_hash, &cluster_id],
            )
            .await
            .context("failed to consume agent token")?;
        if let Some(row) = row {
            return Ok(row_to_token(&row));
        }
        // Losers learn why.
        let row = client
            .query_opt(
                "SELECT * FROM agent_tokens WHERE secret_hash = $1",
                &[&secret_hash],
            )
            .await
            .context("failed to inspect agent token")?;
        match row {
            None => Err(StoreError::TokenRejected(TokenRejection::Unknown)),
            Some(row) => {
                let token = row_to_token(&row);
                if token.used {
                    Err(StoreError::TokenRejected(TokenRejection::Reused))
                } else {
                    Err(StoreError::TokenRejected(TokenRejection::Expired))
                }
            }
        }
    }

    async fn create_principal(&self, principal: Principal) -> Result<(), StoreError> {
        let client = self.client().await?;
        let kind = match principal.kind {
            PrincipalKind::User => "user",
            PrincipalKind::Agent => "agent",
        };
        client
            .execute(
                r#"
                INSERT INTO principals (id, name, kind, password_hash, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                &[
                    &principal.id,
                    &principal.name,
                    &kind,
                    &principal.password_hash,
                    &principal.created_at,
                ],
            )
            .await
            .map_err(|_| {
                StoreError::Conflict(format!("principal {:?} already exists", principal.name))
            })?;
        Ok(())
    }

    async fn get_principal(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM principals WHERE id = $1", &[&id])
            .await
            .context("failed to get principal")?;
        row.as_ref().map(row_to_principal).transpose()
    }

    async fn find_principal_by_name(&self, name: &str) -> Result<Option<Principal>, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM principals WHERE name = $1", &[&name])
            .await
            .context("failed to find principal")?;
        row.as_ref().map(row_to_principal).transpose()
    }

    async fn has_admin(&self) -> Result<bool, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM role_bindings b
                    JOIN principals p ON p.id = b.principal_id
                    WHERE b.role_name = 'admin' AND p.kind = 'user'
                ) AS present
                "#,
                &[],
            )
            .await
            .context("failed to check for admin principal")?;
        Ok(row.get("present"))
    }

    async fn create_role_binding(&self, binding: RoleBinding) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO role_bindings (id, principal_id, role_name, scope, scope_value)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                &[
                    &binding.id,
                    &binding.principal_id,
                    &binding.role.as_str(),
                    &scope_to_str(binding.scope),
                    &binding.scope_value,
                ],
            )
            .await
            .context("failed to create role binding")?;
        Ok(())
    }

    async fn permissions_for(&self, principal_id: Uuid) -> Result<Vec<Permission>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM role_bindings WHERE principal_id = $1",
                &[&principal_id],
            )
            .await
            .context("failed to load role bindings")?;
        let bindings = rows
            .iter()
            .map(|row| {
                let role: String = row.get("role_name");
                let scope: String = row.get("scope");
                Ok(RoleBinding {
                    id: row.get("id"),
                    principal_id: row.get("principal_id"),
                    role: role
                        .parse::<Role>()
                        .map_err(|e| StoreError::Backend(anyhow!(e)))?,
                    scope: str_to_scope(&scope)?,
                    scope_value: row.get("scope_value"),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(expand_bindings(&bindings))
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .execute(
                r#"
                INSERT INTO audit_log
                    (id, ts, actor, action, target_cluster, target_resource, outcome, request_digest)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
                &[
                    &entry.id,
                    &entry.timestamp,
                    &entry.actor,
                    &entry.action,
                    &entry.target_cluster,
                    &entry.target_resource,
                    &entry.outcome,
                    &entry.request_digest,
                ],
            )
            .await
            .context("failed to append audit entry")?;
        Ok(())
    }

    async fn query_audit(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let client = self.client().await?;
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();

        if let Some(ref actor) = query.actor {
            params.push(actor);
            conditions.push(format!("actor = ${}", params.len()));
        }
        if let Some(ref cluster) = query.cluster {
            params.push(cluster);
            conditions.push(format!("target_cluster = ${}", params.len()));
        }
        if let Some(ref action) = query.action {
            params.push(action);
            conditions.push(format!("action = ${}", params.len()));
        }
        if let Some(ref from) = query.from {
            params.push(from);
            conditions.push(format!("ts >= ${}", params.len()));
        }
        if let Some(ref to) = query.to {
            params.push(to);
            conditions.push(format!("ts <= ${}", params.len()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit = query.limit.unwrap_or(500).clamp(0, 10_000);
        let sql = format!(
            "SELECT * FROM audit_log {where_clause} ORDER BY ts DESC LIMIT {limit}"
        );
        let rows = client
            .query(&sql, &params)
            .await
            .context("failed to query audit log")?;
        Ok(rows.iter().map(row_to_audit).collect())
    }
}
