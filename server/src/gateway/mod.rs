use std::{pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context as _, bail};
use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{
    Request, Response, Status, Streaming,
    transport::{Identity, Server, ServerTlsConfig},
};
use uuid::Uuid;

use argus_common::args::GatewayArgs;
use argus_common::auth::{TokenKind, TokenSigner, parse_bearer};
use argus_common::rbac::{Role, Scope};

use crate::audit::AuditSink;
use crate::proto::tunnel::{
    self as pb, agent_frame,
    agent_tunnel_server::{AgentTunnel, AgentTunnelServer},
};
use crate::registry::ClusterRegistry;
use crate::store::{
    AuditEntry, ClusterInfo, Principal, PrincipalKind, RoleBinding, Store, StoreError,
    TokenRejection, hash_secret,
};
use crate::transport::agent::AgentTransport;

use self::session::AgentSession;

pub mod session;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ping_interval: Duration,
    pub liveness_window: Duration,
}

impl From<&GatewayArgs> for GatewayConfig {
    fn from(args: &GatewayArgs) -> Self {
        Self {
            ping_interval: Duration::from_secs(args.ping_interval_secs),
            liveness_window: Duration::from_secs(args.liveness_window_secs),
        }
    }
}

/// Server side of the agent tunnel: unary registration plus one
/// bidirectional session stream per connected agent.
pub struct TunnelService {
    store: Arc<dyn Store>,
    registry: ClusterRegistry,
    signer: Arc<TokenSigner>,
    audit: AuditSink,
    config: GatewayConfig,
    cancel: CancellationToken,
}

impl TunnelService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ClusterRegistry,
        signer: Arc<TokenSigner>,
        audit: AuditSink,
        config: GatewayConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            signer,
            audit,
            config,
            cancel,
        }
    }
}

fn cluster_info_from_proto(info: Option<pb::ClusterInfo>) -> ClusterInfo {
    let info = info.unwrap_or_default();
    ClusterInfo {
        version: info.version,
        node_count: info.node_count,
        namespaces: info.namespaces,
        crds: info.crds,
    }
}

fn cluster_name(hint: &str, cluster_id: Uuid) -> String {
    let short = &cluster_id.simple().to_string()[..8];
    if hint.trim().is_empty() {
        format!("agent-{short}")
    } else {
        hint.trim().to_string()
    }
}

#[tonic::async_trait]
impl AgentTunnel for TunnelService {
    async fn register(
        &self,
        request: Request<pb::RegisterRequest>,
    ) -> Result<Response<pb::RegisterResponse>, Status> {
        let req = request.into_inner();
        let secret = req.secret.trim();
        if secret.is_empty() {
            return Err(Status::unauthenticated("missing registration secret"));
        }

        let cluster_id = Uuid::new_v4();
        let token = self
            .store
            .consume_agent_token(&hash_secret(secret), cluster_id)
            .await
            .map_err(|e| match e {
                StoreError::TokenRejected(TokenRejection::Unknown) => {
                    Status::unauthenticated("unknown registration secret")
                }
                StoreError::TokenRejected(TokenRejection::Expired) => {
                    Status::failed_precondition("registration token expired")
                }
                StoreError::TokenRejected(TokenRejection::Reused) => {
                    Status::already_exists("registration token already used")
                }
                other => {
                    tracing::error!(error = %other, "token consume failed");
                    Status::internal("storage failure")
                }
            })?;

        let name = cluster_name(&token.cluster_name_hint, cluster_id);
        let principal = Principal {
            id: Uuid::new_v4(),
            name: format!("agent:{name}"),
            kind: PrincipalKind::Agent,
            password_hash: None,
            created_at: Utc::now(),
        };
        self.store
            .create_principal(principal.clone())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to create agent principal");
                Status::internal("storage failure")
            })?;
        let role = token
            .permissions_preset
            .parse::<Role>()
            .unwrap_or(Role::Operator);
        self.store
            .create_role_binding(RoleBinding {
                id: Uuid::new_v4(),
                principal_id: principal.id,
                role,
                scope: Scope::Cluster,
                scope_value: cluster_id.to_string(),
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to bind agent role");
                Status::internal("storage failure")
            })?;

        let info = cluster_info_from_proto(req.info);
        let record = match self
            .store
            .create_agent_cluster(cluster_id, &name, principal.id, info.clone())
            .await
        {
            Ok(record) => record,
            // Hint collision: retry once with a uniquified name.
            Err(StoreError::Conflict(_)) => {
                let fallback = cluster_name("", cluster_id);
                self.store
                    .create_agent_cluster(cluster_id, &fallback, principal.id, info)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "failed to create agent cluster");
                        Status::internal("storage failure")
                    })?
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to create agent cluster");
                return Err(Status::internal("storage failure"));
            }
        };
        self.registry.track_agent_cluster(record).await;

        self.audit
            .append(
                AuditEntry::new(&principal.name, "agent.register")
                    .cluster(cluster_id)
                    .outcome("ok"),
            )
            .await;

        let agent_token = self
            .signer
            .mint_agent(principal.id, &principal.name, cluster_id)
            .map_err(|_| Status::internal("failed to mint agent principal"))?;

        tracing::info!(cluster = %cluster_id, name = %name, "agent registered");
        Ok(Response::new(pb::RegisterResponse {
            cluster_id: cluster_id.to_string(),
            agent_token,
        }))
    }

    type StreamStream = Pin<Box<dyn Stream<Item = Result<pb::ServerFrame, Status>> + Send>>;

    async fn stream(
        &self,
        request: Request<Streaming<pb::AgentFrame>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let token = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer)
            .ok_or_else(|| Status::unauthenticated("missing agent credentials"))?;
        let claims = self
            .signer
            .verify(token, TokenKind::Agent)
            .map_err(|_| Status::unauthenticated("invalid agent credentials"))?;
        let cluster_id = claims
            .cluster_id
            .ok_or_else(|| Status::unauthenticated("agent token not bound to a cluster"))?;
        let record = self
            .store
            .get_cluster(cluster_id)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "cluster lookup failed");
                Status::internal("storage failure")
            })?
            .ok_or_else(|| Status::not_found("cluster no longer registered"))?;

        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<pb::ServerFrame>(128);
        let cancel = self.cancel.child_token();
        let session = AgentSession::new(cluster_id, tx, cancel.clone());
        let transport = Arc::new(AgentTransport::new(session.clone()));
        self.registry
            .adopt_agent_session(record, transport, cancel.clone())
            .await;
        tracing::info!(cluster = %cluster_id, "agent session established");

        // Inbound reader: routes frames until the agent goes away.
        {
            let session = session.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                let cancel_token = session.cancel_token();
                loop {
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        msg = inbound.message() => match msg {
                            Ok(Some(frame)) => handle_agent_frame(&session, frame).await,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::debug!(cluster = %cluster_id, error = %e, "agent stream error");
                                break;
                            }
                        }
                    }
                }
                if !session.is_closed() {
                    session.teardown("agent disconnected").await;
                    registry.mark_reconnecting(cluster_id).await;
                    tracing::info!(cluster = %cluster_id, "agent session ended");
                }
            });
        }

        // Liveness: ping on an interval, tear down when the window lapses.
        {
            let session = session.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.ping_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut nonce = 0u64;
                let cancel_token = session.cancel_token();
                loop {
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = ticker.tick() => {
                            if session.since_last_pong() > config.liveness_window {
                                tracing::warn!(cluster = %cluster_id, "agent liveness window lapsed");
                                session.teardown("agent unhealthy; liveness window lapsed").await;
                                registry.mark_reconnecting(cluster_id).await;
                                break;
                            }
                            nonce += 1;
                            if !session.send_ping(nonce).await {
                                break;
                            }
                        }
                    }
                }
            });
        }

        metrics::gauge!("argus_agent_sessions").increment(1.0);
        let cancel_for_gauge = cancel.clone();
        tokio::spawn(async move {
            cancel_for_gauge.cancelled().await;
            metrics::gauge!("argus_agent_sessions").decrement(1.0);
        });

        let outbound = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(outbound)))
    }
}

async fn handle_agent_frame(session: &Arc<AgentSession>, frame: pb::AgentFrame) {
    match frame.kind {
        Some(agent_frame::Kind::Response(resp)) => session.route_response(resp).await,
        Some(agent_frame::Kind::WatchEvent(event)) => session.route_watch_event(event).await,
        Some(agent_frame::Kind::Ping(ping)) => {
            let _ = session.send_pong(ping.nonce).await;
        }
        Some(agent_frame::Kind::Pong(_)) => session.note_pong(),
        None => {
            tracing::warn!(cluster = %session.cluster_id(), "empty frame from agent");
        }
    }
}

/// Run the tunnel gRPC server. TLS is required whenever material is
/// configured; a half-configured pair is a startup error rather than a
/// silent plaintext listener.
pub async fn run_gateway(
    service: TunnelService,
    args: &GatewayArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", args.gateway_port)
        .parse()
        .context("invalid gateway address")?;
    let mut builder = Server::builder();
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = tokio::fs::read(cert_path)
                .await
                .context("failed to read gateway TLS certificate")?;
            let key = tokio::fs::read(key_path)
                .await
                .context("failed to read gateway TLS key")?;
            builder = builder
                .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
                .context("invalid gateway TLS configuration")?;
            tracing::info!(%addr, "agent gateway listening (TLS)");
        }
        (None, None) => {
            tracing::warn!(%addr, "agent gateway listening without TLS");
        }
        _ => bail!("gateway TLS requires both --tls-cert and --tls-key"),
    }

    builder
        .add_service(AgentTunnelServer::new(service))
        .serve_with_shutdown(addr, async move {
            cancel.cancelled().await;
        })
        .await
        .context("agent gateway exited with error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_names_fall_back_to_short_id() {
        let id = Uuid::new_v4();
        assert_eq!(cluster_name("prod-east", id), "prod-east");
        let generated = cluster_name("  ", id);
        assert!(generated.starts_with("agent-"));
        assert_eq!(generated.len(), "agent-".len() + 8);
    }
}
