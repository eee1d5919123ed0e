use crate::domain::approval::{ApprovalRequest, DecisionOutcome};
use crate::domain::session::SessionId;
use hive_protocol::RequestId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no pending approval {request_id} for session {session_id}")]
    NotFound {
        session_id: SessionId,
        request_id: RequestId,
    },
    #[error("approval {request_id} is already pending for session {session_id}")]
    Duplicate {
        session_id: SessionId,
        request_id: RequestId,
    },
}

struct PendingEntry {
    request: ApprovalRequest,
    order: u64,
    responder: oneshot::Sender<DecisionOutcome>,
}

type PendingKey = (SessionId, RequestId);

/// Pending decision requests keyed by session and request id. Each entry
/// holds the channel that unblocks the agent-side waiter.
#[derive(Default)]
pub struct ApprovalGate {
    pending: RwLock<HashMap<PendingKey, PendingEntry>>,
    next_order: AtomicU64,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns the receiver its waiter blocks on.
    /// The first registration of a request id wins.
    pub fn register(
        &self,
        request: ApprovalRequest,
    ) -> Result<oneshot::Receiver<DecisionOutcome>, ApprovalError> {
        let key = (request.session_id.clone(), request.request_id.clone());
        let mut pending = self.pending.write();
        if pending.contains_key(&key) {
            return Err(ApprovalError::Duplicate {
                session_id: key.0,
                request_id: key.1,
            });
        }
        let (responder, receiver) = oneshot::channel();
        debug!(
            session_id = %request.session_id,
            request_id = %request.request_id,
            method = %request.method,
            "approval pending"
        );
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        pending.insert(
            key,
            PendingEntry {
                request,
                order,
                responder,
            },
        );
        Ok(receiver)
    }

    /// Pending requests for one session, oldest first.
    pub fn list(&self, session_id: &SessionId) -> Vec<ApprovalRequest> {
        let pending = self.pending.read();
        let mut entries: Vec<_> = pending
            .iter()
            .filter(|((owner, _), _)| owner == session_id)
            .map(|(_, entry)| (entry.order, entry.request.clone()))
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, request)| request).collect()
    }

    /// Resolves a pending request. Unknown and already-answered ids are
    /// `NotFound` so racing clients can tell they lost.
    pub fn decide(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
        outcome: DecisionOutcome,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let entry = self
            .pending
            .write()
            .remove(&(session_id.clone(), request_id.clone()))
            .ok_or_else(|| ApprovalError::NotFound {
                session_id: session_id.clone(),
                request_id: request_id.clone(),
            })?;
        if entry.responder.send(outcome).is_err() {
            warn!(
                %session_id,
                %request_id,
                "approval waiter already gone; decision not delivered"
            );
        }
        Ok(entry.request)
    }

    /// Drops every pending request of a terminated session. Their waiters see
    /// a closed channel and give up.
    pub fn clear_session(&self, session_id: &SessionId) -> usize {
        let mut pending = self.pending.write();
        let before = pending.len();
        pending.retain(|(owner, _), _| owner != session_id);
        before - pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }
}
