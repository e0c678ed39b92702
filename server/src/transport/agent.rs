use std::sync::Arc;

use crate::gateway::session::AgentSession;

use super::{EventStream, K8sOp, K8sReply, Transport, TransportError};

/// Routes cluster operations over a live agent tunnel session. The session
/// owns correlation routing; this is the `Transport` face of it.
pub struct AgentTransport {
    session: Arc<AgentSession>,
}

impl AgentTransport {
    pub fn new(session: Arc<AgentSession>) -> Self {
        Self { session }
    }
}

#[async_trait::async_trait]
impl Transport for AgentTransport {
    async fn do_request(&self, op: K8sOp) -> Result<K8sReply, TransportError> {
        self.session.request(op).await
    }

    async fn open_watch(
        &self,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<EventStream, TransportError> {
        self.session.open_watch(resource, namespace).await
    }
}
