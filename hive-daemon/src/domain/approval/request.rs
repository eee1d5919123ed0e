use crate::domain::session::SessionId;
use chrono::{DateTime, Utc};
use hive_protocol::{Decision, PendingApproval, RequestId};
use serde_json::{json, Map, Value};

/// Generic gate used by guided workflows; answered like any approval.
pub const WORKFLOW_CHECKPOINT_METHOD: &str = "workflow/checkpoint";

/// Agent requests that block until a human or automation answers them.
pub fn is_decision_method(method: &str) -> bool {
    method.ends_with("requestApproval")
        || method.ends_with("requestUserInput")
        || method == WORKFLOW_CHECKPOINT_METHOD
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApprovalRequest {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub method: String,
    pub params: Value,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(session_id: SessionId, request_id: RequestId, method: String, params: Value) -> Self {
        Self {
            session_id,
            request_id,
            method,
            params,
            created_at: Utc::now(),
        }
    }

    pub fn to_pending(&self) -> PendingApproval {
        PendingApproval {
            session_id: self.session_id.to_string(),
            request_id: self.request_id.clone(),
            method: self.method.clone(),
            params: self.params.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub responses: Option<Value>,
}

impl DecisionOutcome {
    /// JSON-RPC response line written back to the agent's stdin.
    pub fn response_for(&self, request_id: &RequestId) -> Value {
        let mut result = Map::new();
        result.insert("decision".into(), json!(self.decision));
        if let Some(responses) = &self.responses {
            result.insert("responses".into(), responses.clone());
        }
        json!({ "id": request_id, "result": Value::Object(result) })
    }
}
