use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, Request, State},
    http::{Method, StatusCode, header::CONTENT_TYPE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use argus_common::auth::{AuthPrincipal, Claims, TokenKind};
use argus_common::error::{ApiError, ApiResult};
use argus_common::rbac::{AccessRequest, Role, authorize};

use crate::audit::AuditTarget;
use crate::server::AppState;
use crate::store::{AuditQuery, Principal, PrincipalKind, RoleBinding, Store};
use crate::transport::{K8sOp, Verb};

pub async fn health() -> impl IntoResponse {
    "OK"
}

/// Admission layer 3: until an admin principal exists, every protected
/// endpoint answers 503. Consulted per request so bootstrap takes effect
/// immediately.
pub async fn setup_gate(
    State(store): State<Arc<dyn Store>>,
    req: Request,
    next: Next,
) -> Response {
    match store.has_admin().await {
        Ok(true) => next.run(req).await,
        Ok(false) => ApiError::Unavailable(
            "server is not set up; complete initial setup first".into(),
        )
        .into_response(),
        Err(e) => ApiError::Internal(anyhow::anyhow!(e)).into_response(),
    }
}

async fn require(
    state: &AppState,
    claims: &Claims,
    resource: &str,
    action: &str,
    cluster: Option<&str>,
    namespace: Option<&str>,
) -> Result<(), ApiError> {
    let permissions = state
        .store
        .permissions_for(claims.sub)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    let request = AccessRequest {
        resource,
        action,
        cluster,
        namespace,
    };
    if authorize(&permissions, &request) {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

// ---------------------------------------------------------------------------
// Auth

#[derive(Debug, Deserialize)]
pub struct CredentialsBody {
    pub username: String,
    pub password: String,
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to hash password: {e}")))
}

fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// One-time bootstrap: creates the admin principal and opens the setup
/// gate. Second calls conflict.
pub async fn setup(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> ApiResult<Response> {
    if body.username.trim().is_empty() || body.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "username required and password must be at least 8 characters".into(),
        ));
    }
    if state
        .store
        .has_admin()
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?
    {
        return Err(ApiError::Conflict("setup already completed".into()));
    }
    let principal = Principal {
        id: Uuid::new_v4(),
        name: body.username.trim().to_string(),
        kind: PrincipalKind::User,
        password_hash: Some(hash_password(&body.password)?),
        created_at: Utc::now(),
    };
    state
        .store
        .create_principal(principal.clone())
        .await
        .map_err(|e| match e {
            crate::store::StoreError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(anyhow::anyhow!(other)),
        })?;
    state
        .store
        .create_role_binding(RoleBinding::global(principal.id, Role::Admin))
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;

    let access_token = state.signer.mint_access(principal.id, &principal.name)?;
    let refresh_token = state.signer.mint_refresh(principal.id, &principal.name)?;
    tracing::info!(user = %principal.name, "initial setup completed");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "access_token": access_token,
            "refresh_token": refresh_token,
        })),
    )
        .into_response())
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> ApiResult<Response> {
    let invalid = || ApiError::AuthFailure("invalid username or password".into());
    let principal = state
        .store
        .find_principal_by_name(body.username.trim())
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?
        .ok_or_else(invalid)?;
    let stored = principal.password_hash.as_deref().ok_or_else(invalid)?;
    if !verify_password(&body.password, stored) {
        return Err(invalid());
    }
    let access_token = state.signer.mint_access(principal.id, &principal.name)?;
    let refresh_token = state.signer.mint_refresh(principal.id, &principal.name)?;
    Ok(Json(json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshBody>,
) -> ApiResult<Response> {
    let claims = state.signer.verify(&body.refresh_token, TokenKind::Refresh)?;
    // A deleted principal must not refresh forever.
    let principal = state
        .store
        .get_principal(claims.sub)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?
        .ok_or_else(|| ApiError::AuthFailure("invalid or expired token".into()))?;
    let access_token = state.signer.mint_access(principal.id, &principal.name)?;
    Ok(Json(json!({ "access_token": access_token })).into_response())
}

pub async fn me(AuthPrincipal(claims): AuthPrincipal) -> impl IntoResponse {
    Json(json!({ "id": claims.sub, "name": claims.name }))
}

pub async fn my_permissions(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
) -> ApiResult<Response> {
    let permissions = state
        .store
        .permissions_for(claims.sub)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    Ok(Json(permissions).into_response())
}

// ---------------------------------------------------------------------------
// Clusters

pub async fn list_clusters(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
) -> ApiResult<Response> {
    require(&state, &claims, "clusters", "list", None, None).await?;
    Ok(Json(state.registry.list().await).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CreateClusterBody {
    pub name: String,
    pub api_server_url: String,
    pub kubeconfig: String,
}

pub async fn create_cluster(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
    Json(body): Json<CreateClusterBody>,
) -> ApiResult<Response> {
    require(&state, &claims, "clusters", "create", None, None).await?;
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("cluster name required".into()));
    }
    let view = state
        .registry
        .register_direct(body.name.trim(), &body.api_server_url, &body.kubeconfig)
        .await?;
    let mut response = (StatusCode::CREATED, Json(&view)).into_response();
    response.extensions_mut().insert(AuditTarget {
        cluster: Some(view.record.id),
        resource: None,
    });
    Ok(response)
}

pub async fn delete_cluster(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    require(
        &state,
        &claims,
        "clusters",
        "delete",
        Some(&id.to_string()),
        None,
    )
    .await?;
    state.registry.delete(id).await?;
    let mut response = StatusCode::NO_CONTENT.into_response();
    response.extensions_mut().insert(AuditTarget {
        cluster: Some(id),
        resource: None,
    });
    Ok(response)
}

#[derive(Debug, Deserialize, Default)]
pub struct AgentTokenBody {
    #[serde(default)]
    pub cluster_name_hint: String,
    #[serde(default = "default_preset")]
    pub permissions_preset: String,
}

fn default_preset() -> String {
    "operator".into()
}

/// Mint a one-time registration secret. The secret appears in this response
/// and nowhere else; only its digest is stored.
pub async fn create_agent_token(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
    Json(body): Json<AgentTokenBody>,
) -> ApiResult<Response> {
    require(&state, &claims, "clusters", "create", None, None).await?;
    body.permissions_preset
        .parse::<Role>()
        .map_err(|_| ApiError::BadRequest("unknown permissions preset".into()))?;
    let (token, secret) = state
        .registry
        .register_agent(&body.cluster_name_hint, &body.permissions_preset, claims.sub)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token_id": token.id,
            "secret": secret,
            "expires_at": token.expires_at,
        })),
    )
        .into_response())
}

pub async fn list_agent_tokens(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
) -> ApiResult<Response> {
    require(&state, &claims, "clusters", "list", None, None).await?;
    let tokens = state
        .store
        .list_agent_tokens()
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    Ok(Json(tokens).into_response())
}

// ---------------------------------------------------------------------------
// Generic resource proxy

#[derive(Debug, Deserialize, Default)]
pub struct ProxyQuery {
    pub namespace: Option<String>,
}

fn proxy_verb(method: &Method, has_name: bool) -> Result<Verb, ApiError> {
    match (method.as_str(), has_name) {
        ("GET", true) => Ok(Verb::Get),
        ("GET", false) => Ok(Verb::List),
        ("POST", false) => Ok(Verb::Create),
        ("PUT", true) => Ok(Verb::Update),
        ("PATCH", true) => Ok(Verb::Patch),
        ("DELETE", true) => Ok(Verb::Delete),
        _ => Err(ApiError::BadRequest(format!(
            "unsupported method {method} for this path"
        ))),
    }
}

/// `{verb} /clusters/{id}/resources/{group}/{version}/{resource}[/{name}]`.
/// The core API group is encoded as `_`.
#[allow(clippy::too_many_arguments)]
async fn proxy(
    state: AppState,
    claims: Claims,
    cluster_id: Uuid,
    group: String,
    version: String,
    resource: String,
    name: Option<String>,
    query: ProxyQuery,
    method: Method,
    body: Option<serde_json::Value>,
) -> ApiResult<Response> {
    let verb = proxy_verb(&method, name.is_some())?;
    require(
        &state,
        &claims,
        "resources",
        verb.as_str(),
        Some(&cluster_id.to_string()),
        query.namespace.as_deref(),
    )
    .await?;

    let op = K8sOp {
        verb,
        group: if group == "_" { String::new() } else { group },
        version,
        resource: resource.clone(),
        namespace: query.namespace,
        name: name.clone(),
        body,
    };
    let transport = state.registry.get(cluster_id).await?;
    let reply = transport.do_request(op).await.map_err(ApiError::from)?;

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(reply.body))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    if verb.is_mutating() {
        let target = match &name {
            Some(name) => format!("{resource}/{name}"),
            None => resource,
        };
        response.extensions_mut().insert(AuditTarget {
            cluster: Some(cluster_id),
            resource: Some(target),
        });
    }
    Ok(response)
}

pub async fn proxy_collection(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
    Path((cluster_id, group, version, resource)): Path<(Uuid, String, String, String)>,
    Query(query): Query<ProxyQuery>,
    method: Method,
    body: Option<Json<serde_json::Value>>,
) -> ApiResult<Response> {
    proxy(
        state,
        claims,
        cluster_id,
        group,
        version,
        resource,
        None,
        query,
        method,
        body.map(|Json(v)| v),
    )
    .await
}

pub async fn proxy_item(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
    Path((cluster_id, group, version, resource, name)): Path<(Uuid, String, String, String, String)>,
    Query(query): Query<ProxyQuery>,
    method: Method,
    body: Option<Json<serde_json::Value>>,
) -> ApiResult<Response> {
    proxy(
        state,
        claims,
        cluster_id,
        group,
        version,
        resource,
        Some(name),
        query,
        method,
        body.map(|Json(v)| v),
    )
    .await
}

// ---------------------------------------------------------------------------
// Audit & confirmations

#[derive(Debug, Deserialize, Default)]
pub struct AuditQueryParams {
    pub actor: Option<String>,
    pub cluster: Option<Uuid>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn query_audit(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
    Query(params): Query<AuditQueryParams>,
) -> ApiResult<Response> {
    require(&state, &claims, "audit", "list", None, None).await?;
    let entries = state
        .store
        .query_audit(AuditQuery {
            actor: params.actor,
            cluster: params.cluster,
            action: params.action,
            from: params.from,
            to: params.to,
            limit: params.limit,
        })
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    Ok(Json(entries).into_response())
}

pub async fn list_confirmations(
    State(state): State<AppState>,
    AuthPrincipal(claims): AuthPrincipal,
) -> ApiResult<Response> {
    Ok(Json(state.broker.list_pending(claims.sub).await).into_response())
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::seal::Sealer;

    fn store() -> Arc<MemoryStore> {
        use base64::Engine;
        let key = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        Arc::new(MemoryStore::new(Sealer::from_base64(&key).unwrap()))
    }

    #[tokio::test]
    async fn setup_gate_blocks_until_bootstrap() {
        let store = store();
        let gate_store: Arc<dyn Store> = store.clone();
        let app = Router::new()
            .route("/protected", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(gate_store, setup_gate));

        let res = app
            .clone()
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let admin = Principal {
            id: Uuid::new_v4(),
            name: "admin".into(),
            kind: PrincipalKind::User,
            password_hash: Some(hash_password("correct horse").unwrap()),
            created_at: Utc::now(),
        };
        store.create_principal(admin.clone()).await.unwrap();
        store
            .create_role_binding(RoleBinding::global(admin.id, Role::Admin))
            .await
            .unwrap();

        let res = app
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test]
    fn password_hashing_round_trips() {
        let hash = hash_password("hunter22").unwrap();
        assert_ne!(hash, "hunter22");
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "not-a-phc-string"));
    }
}
