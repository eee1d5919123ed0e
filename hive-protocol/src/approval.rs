use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// JSON-RPC request identifier as emitted by the agent. Echoed back verbatim
/// in the response, so numbers stay numbers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Str(String),
}

impl RequestId {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(RequestId::Number),
            Value::String(text) => Some(RequestId::Str(text.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(number) => write!(f, "{number}"),
            RequestId::Str(text) => f.write_str(text),
        }
    }
}

impl FromStr for RequestId {
    type Err = String;

    /// Numeric text becomes a numeric id, anything else a string id.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err("request id must be non-empty".into());
        }
        Ok(value
            .parse::<i64>()
            .map(RequestId::Number)
            .unwrap_or_else(|_| RequestId::Str(value.to_string())))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    Accept,
    AcceptForSession,
    Decline,
    Cancel,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::AcceptForSession => "acceptForSession",
            Decision::Decline => "decline",
            Decision::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "accept" | "approve" | "yes" => Ok(Decision::Accept),
            "acceptforsession" => Ok(Decision::AcceptForSession),
            "decline" | "deny" | "no" => Ok(Decision::Decline),
            "cancel" => Ok(Decision::Cancel),
            other => Err(format!(
                "unknown decision '{other}' (expected accept, acceptForSession, decline or cancel)"
            )),
        }
    }
}

/// A decision request the agent is blocked on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub session_id: String,
    pub request_id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalsResponse {
    pub approvals: Vec<PendingApproval>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecideRequest {
    pub request_id: RequestId,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Value>,
}
