use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, RequestPartsExt,
    extract::{Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// Agent principals outlive any reasonable deployment; they are revoked by
/// deleting the cluster, not by expiry.
const AGENT_TOKEN_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id
    pub sub: Uuid,
    pub name: String,
    pub kind: TokenKind,
    /// Set on agent principals only: the cluster the session is bound to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<Uuid>,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn mint_access(&self, sub: Uuid, name: &str) -> Result<String, ApiError> {
        self.mint(sub, name, TokenKind::Access, None, self.access_ttl)
    }

    pub fn mint_refresh(&self, sub: Uuid, name: &str) -> Result<String, ApiError> {
        self.mint(sub, name, TokenKind::Refresh, None, self.refresh_ttl)
    }

    pub fn mint_agent(&self, sub: Uuid, name: &str, cluster_id: Uuid) -> Result<String, ApiError> {
        self.mint(sub, name, TokenKind::Agent, Some(cluster_id), AGENT_TOKEN_TTL)
    }

    fn mint(
        &self,
        sub: Uuid,
        name: &str,
        kind: TokenKind,
        cluster_id: Option<Uuid>,
        ttl: Duration,
    ) -> Result<String, ApiError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub,
            name: name.to_string(),
            kind,
            cluster_id,
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to sign token: {e}")))
    }

    /// Verify signature and expiry, then require the expected token kind.
    /// The error never contains the presented token.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| ApiError::AuthFailure("invalid or expired token".into()))?;
        if data.claims.kind != expected {
            return Err(ApiError::AuthFailure("invalid or expired token".into()));
        }
        Ok(data.claims)
    }
}

/// Extract the token from an `Authorization` header value. The scheme match
/// is case-insensitive; empty and whitespace-only tokens are rejected, as is
/// any non-Bearer scheme.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, rest) = header.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    (!token.is_empty()).then_some(token)
}

/// Admission layer 2: verify the bearer token and attach the verified
/// principal to the request. Runs after the rate limiter.
pub async fn require_bearer(
    State(signer): State<Arc<TokenSigner>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer);
    let Some(token) = token else {
        return ApiError::unauthorized().into_response();
    };
    match signer.verify(token, TokenKind::Access) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

/// Axum extractor usage: `AuthPrincipal(claims): AuthPrincipal`
pub struct AuthPrincipal(pub Claims);

impl std::ops::Deref for AuthPrincipal {
    type Target = Claims;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> axum::extract::FromRequestParts<S> for AuthPrincipal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Extension(claims) = parts
            .extract::<Extension<Claims>>()
            .await
            .map_err(|_| ApiError::unauthorized())?;
        Ok(AuthPrincipal(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(
            "test-secret",
            Duration::from_secs(900),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(parse_bearer("bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("BEARER abc"), Some("abc"));
    }

    #[test]
    fn empty_and_whitespace_tokens_are_rejected() {
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("Bearer    "), None);
        assert_eq!(parse_bearer("Bearer"), None);
    }

    #[test]
    fn non_bearer_schemes_are_rejected() {
        assert_eq!(parse_bearer("Basic dXNlcjpwYXNz"), None);
        assert_eq!(parse_bearer("Digest abc"), None);
    }

    #[test]
    fn round_trip_access_token() {
        let signer = signer();
        let id = Uuid::new_v4();
        let token = signer.mint_access(id, "alice").unwrap();
        let claims = signer.verify(&token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.name, "alice");
        assert!(claims.cluster_id.is_none());
    }

    #[test]
    fn kind_mismatch_fails_verification() {
        let signer = signer();
        let token = signer.mint_access(Uuid::new_v4(), "alice").unwrap();
        assert!(signer.verify(&token, TokenKind::Agent).is_err());
        assert!(signer.verify(&token, TokenKind::Refresh).is_err());
    }

    #[test]
    fn agent_token_carries_cluster_binding() {
        let signer = signer();
        let cluster = Uuid::new_v4();
        let token = signer.mint_agent(Uuid::new_v4(), "agent", cluster).unwrap();
        let claims = signer.verify(&token, TokenKind::Agent).unwrap();
        assert_eq!(claims.cluster_id, Some(cluster));
    }

    #[tokio::test]
    async fn bearer_layer_admits_and_rejects() {
        use axum::{Router, body::Body, http::Request, http::StatusCode, routing::get};
        use tower::ServiceExt;

        let signer = Arc::new(signer());
        let app = Router::new()
            .route("/protected", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                signer.clone(),
                require_bearer,
            ));
        let token = signer.mint_access(Uuid::new_v4(), "alice").unwrap();

        let cases = [
            (format!("bearer {token}"), StatusCode::OK),
            (format!("Bearer {token}"), StatusCode::OK),
            ("Bearer ".to_string(), StatusCode::UNAUTHORIZED),
            ("Basic dXNlcjpwYXNz".to_string(), StatusCode::UNAUTHORIZED),
        ];
        for (header, expected) in cases {
            let req = Request::get("/protected")
                .header("authorization", &header)
                .body(Body::empty())
                .unwrap();
            let res = app.clone().oneshot(req).await.unwrap();
            assert_eq!(res.status(), expected, "header {header:?}");
        }

        // No header at all.
        let req = Request::get("/protected").body(Body::empty()).unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn foreign_signature_fails() {
        let a = signer();
        let b = TokenSigner::new(
            "other-secret",
            Duration::from_secs(900),
            Duration::from_secs(3600),
        );
        let token = a.mint_access(Uuid::new_v4(), "alice").unwrap();
        assert!(b.verify(&token, TokenKind::Access).is_err());
    }
}
