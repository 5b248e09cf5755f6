// Approval broker
// Outstanding approval requests with watch-channel waiters. A reply that
// names no request id resolves the most recent outstanding request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use ensemble_orchestrator::{ApprovalChannel, ApprovalRequest};
use ensemble_types::ServerFrame;

use crate::SessionOutput;

#[derive(Default)]
pub struct ApprovalBroker {
    waiters: Mutex<HashMap<String, watch::Sender<Option<bool>>>>,
    /// Outstanding request ids, oldest first.
    order: Mutex<Vec<String>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outstanding request; returns its id and a receiver
    /// for the eventual reply.
    pub async fn register(&self) -> (String, watch::Receiver<Option<bool>>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(None);
        self.waiters.lock().await.insert(id.clone(), tx);
        self.order.lock().await.push(id.clone());
        (id, rx)
    }

    /// Resolve a request. `id = None` targets the most recent outstanding
    /// request. Returns false when nothing matched.
    pub async fn resolve(&self, id: Option<&str>, approved: bool) -> bool {
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                let order = self.order.lock().await;
                match order.last() {
                    Some(id) => id.clone(),
                    None => return false,
                }
            }
        };

        self.order.lock().await.retain(|entry| *entry != id);
        match self.waiters.lock().await.get(&id) {
            Some(tx) => {
                let _ = tx.send(Some(approved));
                true
            }
            None => false,
        }
    }

    /// Bounded wait for the reply to `id`. `None` means the wait timed out.
    pub async fn wait(
        &self,
        id: &str,
        mut rx: watch::Receiver<Option<bool>>,
        timeout: Duration,
    ) -> Option<bool> {
        let reply = tokio::time::timeout(timeout, async {
            loop {
                if let Some(reply) = *rx.borrow() {
                    return Some(reply);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten();

        self.waiters.lock().await.remove(id);
        self.order.lock().await.retain(|entry| entry != id);
        reply
    }

    pub async fn outstanding(&self) -> usize {
        self.order.lock().await.len()
    }
}

/// Approval channel that sends `approval_request` frames over the session
/// socket and waits, bounded, for the correlated reply. Timeout denies.
pub struct WsApprovalChannel {
    broker: Arc<ApprovalBroker>,
    out: mpsc::UnboundedSender<SessionOutput>,
    timeout: Duration,
}

impl WsApprovalChannel {
    pub fn new(
        broker: Arc<ApprovalBroker>,
        out: mpsc::UnboundedSender<SessionOutput>,
        timeout: Duration,
    ) -> Self {
        Self {
            broker,
            out,
            timeout,
        }
    }
}

#[async_trait]
impl ApprovalChannel for WsApprovalChannel {
    async fn request_approval(&self, request: ApprovalRequest) -> bool {
        let (id, rx) = self.broker.register().await;
        let frame = ServerFrame::ApprovalRequest {
            approval_id: id.clone(),
            agent: request.agent.as_str().to_string(),
            mode: request.mode.clone(),
            description: request.description.clone(),
            risk_level: request.risk_level,
        };
        if self.out.send(SessionOutput::Frame(frame)).is_err() {
            // Client is gone; nobody can approve.
            tracing::warn!("approval channel closed, denying");
            return false;
        }

        match self.broker.wait(&id, rx, self.timeout).await {
            Some(approved) => approved,
            None => {
                tracing::warn!(approval_id = %id, "approval timed out, denying");
                false
            }
        }
    }
}
