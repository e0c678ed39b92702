use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{
    Request,
    metadata::MetadataValue,
    transport::{Certificate, Channel, ClientTlsConfig},
};

use crate::args::RunArgs;
use crate::kube_exec::LocalCluster;
use crate::proto::tunnel::{
    self as pb, agent_frame, agent_tunnel_client::AgentTunnelClient, server_frame,
};
use crate::watch;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

async fn connect(args: &RunArgs) -> Result<AgentTunnelClient<Channel>> {
    let mut endpoint = Channel::from_shared(args.server_url.clone())
        .context("invalid server URL")?
        .keep_alive_while_idle(true);
    if args.server_url.starts_with("https://") {
        let mut tls = ClientTlsConfig::new().with_enabled_roots();
        if let Some(ca_path) = &args.ca_cert {
            let pem = tokio::fs::read(ca_path)
                .await
                .context("failed to read CA certificate")?;
            tls = tls.ca_certificate(Certificate::from_pem(pem));
        }
        endpoint = endpoint.tls_config(tls).context("invalid TLS config")?;
    }
    let channel = endpoint
        .connect()
        .await
        .context("failed to reach the gateway")?;
    Ok(AgentTunnelClient::new(channel))
}

/// Exchange the one-time secret for the long-lived agent token and persist
/// it. The secret is spent whether or not persistence succeeds, so failing
/// to write the token file is fatal and loud.
async fn register(args: &RunArgs, cluster: &LocalCluster) -> Result<String> {
    let Some(secret) = args
        .registration_secret
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        bail!("no agent token and no registration secret; set ARGUS_REGISTRATION_SECRET");
    };
    let info = cluster.collect_info().await;
    let mut client = connect(args).await?;
    let response = client
        .register(Request::new(pb::RegisterRequest {
            secret: secret.to_string(),
            info: Some(info),
        }))
        .await
        .context("registration rejected")?
        .into_inner();
    tracing::info!(cluster_id = %response.cluster_id, "registered with control plane");

    if let Some(parent) = std::path::Path::new(&args.token_file).parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(&args.token_file, &response.agent_token)
        .await
        .with_context(|| format!("failed to persist agent token to {}", args.token_file))?;
    Ok(response.agent_token)
}

async fn load_token(args: &RunArgs) -> Option<String> {
    if let Some(token) = &args.agent_token {
        return Some(token.clone());
    }
    match tokio::fs::read_to_string(&args.token_file).await {
        Ok(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
        _ => None,
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let cluster = Arc::new(LocalCluster::connect().await?);

    let token = match load_token(&args).await {
        Some(token) => token,
        None => register(&args, &cluster).await?,
    };

    let mut backoff = RECONNECT_MIN;
    loop {
        match run_session(&args, &token, cluster.clone()).await {
            Ok(()) => {
                tracing::info!("session closed by server");
                backoff = RECONNECT_MIN;
            }
            Err(e) => {
                tracing::warn!(error = %e, "session failed");
            }
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..500));
        let wait = backoff + jitter;
        tracing::info!(?wait, "reconnecting");
        tokio::time::sleep(wait).await;
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// One tunnel session: execute requests, serve watches, answer pings.
async fn run_session(args: &RunArgs, token: &str, cluster: Arc<LocalCluster>) -> Result<()> {
    let mut client = connect(args).await?;
    let (out_tx, out_rx) = mpsc::channel::<pb::AgentFrame>(128);

    let mut request = Request::new(ReceiverStream::new(out_rx));
    let bearer: MetadataValue<_> = format!("Bearer {token}")
        .parse()
        .context("agent token is not header-safe")?;
    request.metadata_mut().insert("authorization", bearer);

    let mut inbound = client
        .stream(request)
        .await
        .context("stream rejected")?
        .into_inner();
    tracing::info!("tunnel session established");

    let session_cancel = CancellationToken::new();
    let mut watches: HashMap<u64, CancellationToken> = HashMap::new();

    let result = loop {
        let frame = match inbound.message().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(anyhow::anyhow!("stream error: {e}")),
        };
        let Some(kind) = frame.kind else { continue };
        match kind {
            server_frame::Kind::Request(req) => {
                let cluster = cluster.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = cluster.execute(&req).await;
                    let _ = out_tx
                        .send(pb::AgentFrame {
                            kind: Some(agent_frame::Kind::Response(response)),
                        })
                        .await;
                });
            }
            server_frame::Kind::WatchSubscribe(sub) => {
                let cancel = session_cancel.child_token();
                watches.insert(sub.correlation_id, cancel.clone());
                let namespace = (!sub.namespace.is_empty()).then(|| sub.namespace.clone());
                tokio::spawn(watch::run_watch(
                    cluster.clone(),
                    sub.correlation_id,
                    sub.resource,
                    namespace,
                    out_tx.clone(),
                    cancel,
                ));
            }
            server_frame::Kind::WatchUnsubscribe(unsub) => {
                if let Some(cancel) = watches.remove(&unsub.correlation_id) {
                    cancel.cancel();
                }
            }
            server_frame::Kind::Ping(ping) => {
                let _ = out_tx
                    .send(pb::AgentFrame {
                        kind: Some(agent_frame::Kind::Pong(pb::Pong { nonce: ping.nonce })),
                    })
                    .await;
            }
            server_frame::Kind::Pong(_) => {}
        }
    };

    session_cancel.cancel();
    result
}
