use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use axum::{
    Router, middleware,
    routing::{any, delete, get, post},
};
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use argus_common::auth::TokenSigner;
use argus_common::rate_limit::{RateLimiter, RateLimiterConfig, middleware::RateLimitLayer};
use argus_common::{access_log, cors, shutdown::shutdown_signal};

use crate::ai::model::{AnthropicClient, ModelClient};
use crate::ai::orchestrator::Orchestrator;
use crate::args::ServerArgs;
use crate::audit::{AuditSink, audit_mutations};
use crate::chat;
use crate::confirm::ConfirmationBroker;
use crate::gateway::{GatewayConfig, TunnelService, run_gateway};
use crate::http;
use crate::hub::{HubConfig, WatchHub};
use crate::registry::ClusterRegistry;
use crate::store::memory::MemoryStore;
use crate::store::postgres::{PgStore, init_schema};
use crate::store::seal::Sealer;
use crate::store::Store;
use crate::ws;

/// Everything a handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: ClusterRegistry,
    pub hub: WatchHub,
    pub broker: ConfirmationBroker,
    pub orchestrator: Orchestrator,
    pub signer: Arc<TokenSigner>,
    pub audit: AuditSink,
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }
    argus_common::metrics::maybe_spawn_metrics_server();

    let sealer = Sealer::from_base64(&args.seal.credential_seal_key)
        .context("invalid credential seal key")?;
    let store: Arc<dyn Store> = match args.database.db.as_str() {
        "memory" => {
            tracing::warn!("using in-memory storage; state is lost on restart");
            Arc::new(MemoryStore::new(sealer))
        }
        "postgres" => {
            let pool = argus_common::postgres::create_pool(args.database.postgres.clone()).await?;
            init_schema(&pool).await?;
            Arc::new(PgStore::new(pool, sealer))
        }
        other => bail!("unknown storage backend {other:?} (expected postgres or memory)"),
    };

    let signer = Arc::new(TokenSigner::new(
        &args.auth.signing_secret,
        Duration::from_secs(args.auth.access_ttl_secs),
        Duration::from_secs(args.auth.refresh_ttl_secs),
    ));
    let registry = ClusterRegistry::new(store.clone(), cancel.child_token());
    registry
        .load_existing()
        .await
        .context("failed to load registered clusters")?;
    let audit = AuditSink::new(store.clone());
    let hub = WatchHub::new(registry.clone(), HubConfig::from(&args.hub), cancel.child_token());
    let broker = ConfirmationBroker::from_args(&args.broker, cancel.child_token());
    let model: Arc<dyn ModelClient> = Arc::new(AnthropicClient::new(&args.model));
    let orchestrator = Orchestrator::new(
        model,
        registry.clone(),
        broker.clone(),
        audit.clone(),
        store.clone(),
        args.model.max_tool_iterations,
    );
    let state = AppState {
        store: store.clone(),
        registry: registry.clone(),
        hub,
        broker,
        orchestrator,
        signer: signer.clone(),
        audit: audit.clone(),
    };

    let general_limiter = RateLimiter::new(RateLimiterConfig::general(&args.rate));
    general_limiter.spawn_sweeper(cancel.child_token());
    let auth_limiter = RateLimiter::new(RateLimiterConfig::auth(&args.rate));
    auth_limiter.spawn_sweeper(cancel.child_token());

    // Agent tunnel
    let tunnel = TunnelService::new(
        store.clone(),
        registry.clone(),
        signer.clone(),
        audit.clone(),
        GatewayConfig::from(&args.gateway),
        cancel.child_token(),
    );
    let gateway_args = args.gateway.clone();
    let gateway_cancel = cancel.clone();
    let gateway = tokio::spawn(async move {
        if let Err(e) = run_gateway(tunnel, &gateway_args, gateway_cancel.clone()).await {
            tracing::error!(error = %e, "agent gateway failed");
            gateway_cancel.cancel();
        }
    });

    // Health stays outside every admission layer.
    let health = Router::new().route("/healthz", get(http::health));

    // Authentication endpoints sit outside the bearer check but behind the
    // stricter rate bucket.
    let public = Router::new()
        .route("/auth/setup", post(http::setup))
        .route("/auth/login", post(http::login))
        .route("/auth/refresh", post(http::refresh))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            audit.clone(),
            audit_mutations,
        ))
        .layer(RateLimitLayer::new(auth_limiter));

    // Admission order, outermost first: rate limit, bearer, setup gate,
    // audit capture, handler.
    let protected = Router::new()
        .route("/auth/me", get(http::me))
        .route("/auth/permissions", get(http::my_permissions))
        .route("/clusters", get(http::list_clusters).post(http::create_cluster))
        .route(
            "/clusters/agent-token",
            get(http::list_agent_tokens).post(http::create_agent_token),
        )
        .route("/clusters/{id}", delete(http::delete_cluster))
        .route(
            "/clusters/{id}/resources/{group}/{version}/{resource}",
            any(http::proxy_collection),
        )
        .route(
            "/clusters/{id}/resources/{group}/{version}/{resource}/{name}",
            any(http::proxy_item),
        )
        .route("/audit", get(http::query_audit))
        .route("/ai/confirmations", get(http::list_confirmations))
        .route("/ws", get(ws::ws_handler))
        .route("/ws/ai/chat", get(chat::chat_handler))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            audit.clone(),
            audit_mutations,
        ))
        .layer(middleware::from_fn_with_state(
            store.clone(),
            http::setup_gate,
        ))
        .layer(middleware::from_fn_with_state(
            signer.clone(),
            argus_common::auth::require_bearer,
        ))
        .layer(RateLimitLayer::new(general_limiter));

    let app = health
        .merge(public)
        .merge(protected)
        .layer(middleware::from_fn(access_log::public))
        .layer(cors::dev());

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind server to {addr}"))?;
    println!(
        "{}{}",
        "🚀 Starting control plane • port=".green(),
        format!("{}", args.port).green().dimmed()
    );
    argus_common::signal_ready();

    let serve_cancel = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        serve_cancel.cancelled().await;
    })
    .await
    .context("server exited with error")?;

    cancel.cancel();
    let _ = gateway.await;
    println!("{}", "🛑 Control plane stopped gracefully.".red());
    Ok(())
}
