//! JSON shapes exchanged over the hive control API, plus the on-disk layout
//! both sides agree on.

pub mod approval;
pub mod events;
pub mod paths;
pub mod session;

pub use approval::{ApprovalsResponse, DecideRequest, Decision, PendingApproval, RequestId};
pub use events::{AgentEvent, ItemEvent, LogEvent, LogStream, StreamFilter};
pub use paths::HivePaths;
pub use session::{
    ExitRequest, OrphanReason, SendMessageRequest, SessionSnapshot, SessionStatus,
    SessionsResponse, StartSessionRequest,
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7717";
pub const ADDR_ENV: &str = "HIVE_ADDR";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub version: String,
    pub pid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}
