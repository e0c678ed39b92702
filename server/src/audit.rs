use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use argus_common::auth::Claims;

use crate::store::{AuditEntry, Store};

const APPEND_ATTEMPTS: u32 = 3;

/// Append-only sink over the store's audit log. Failure to record never
/// drops the mutation's effect; the append is retried with bounded effort
/// and the failure itself is logged.
#[derive(Clone)]
pub struct AuditSink {
    store: Arc<dyn Store>,
}

impl AuditSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn append(&self, entry: AuditEntry) {
        for attempt in 1..=APPEND_ATTEMPTS {
            match self.store.append_audit(entry.clone()).await {
                Ok(()) => {
                    metrics::counter!("argus_audit_entries_total").increment(1);
                    return;
                }
                Err(e) if attempt < APPEND_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt, "audit append failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    metrics::counter!("argus_audit_failures_total").increment(1);
                    tracing::error!(
                        error = %e,
                        action = %entry.action,
                        actor = %entry.actor,
                        "failed to record audit entry after retries"
                    );
                }
            }
        }
    }
}

/// Handlers attach this as a response extension when they know the target;
/// the middleware folds it into the entry it writes after the handler
/// returns.
#[derive(Debug, Clone, Default)]
pub struct AuditTarget {
    pub cluster: Option<Uuid>,
    pub resource: Option<String>,
}

/// Admission layer 4: one audit entry per state-changing request, appended
/// after the handler returns, outcome included.
pub async fn audit_mutations(
    State(sink): State<AuditSink>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method();
    let mutating = method == Method::POST
        || method == Method::PUT
        || method == Method::PATCH
        || method == Method::DELETE;
    if !mutating {
        return next.run(req).await;
    }
    let action = format!("{} {}", req.method(), req.uri().path());
    let actor = req
        .extensions()
        .get::<Claims>()
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    let response = next.run(req).await;

    let target = response
        .extensions()
        .get::<AuditTarget>()
        .cloned()
        .unwrap_or_default();
    let mut entry = AuditEntry::new(&actor, &action).outcome(&response.status().as_u16().to_string());
    entry.target_cluster = target.cluster;
    entry.target_resource = target.resource;
    sink.append(entry).await;

    response
}
