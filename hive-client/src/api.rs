use crate::error::ClientError;
use async_trait::async_trait;
use futures::Stream;
use hive_protocol::{
    AgentEvent, DecideRequest, HealthResponse, ItemEvent, LogEvent, PendingApproval,
    SessionSnapshot, StartSessionRequest, StreamFilter,
};
use std::pin::Pin;

pub type ClientResult<T> = Result<T, ClientError>;

/// Live feed decoded from a follow endpoint. Ends when the session's feed
/// closes on the daemon side.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = ClientResult<T>> + Send>>;

/// Liveness and lifecycle of the daemon itself. This is all the ensure-daemon
/// bootstrap needs.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    async fn health(&self) -> ClientResult<HealthResponse>;
    async fn shutdown(&self) -> ClientResult<()>;
}

/// Everything a client can ask of a running daemon.
#[async_trait]
pub trait DaemonApi: DaemonControl {
    async fn list_sessions(&self) -> ClientResult<Vec<SessionSnapshot>>;
    async fn start_session(&self, request: &StartSessionRequest) -> ClientResult<SessionSnapshot>;
    async fn get_session(&self, id: &str) -> ClientResult<SessionSnapshot>;
    async fn kill_session(&self, id: &str) -> ClientResult<SessionSnapshot>;
    async fn interrupt_session(&self, id: &str) -> ClientResult<()>;
    async fn mark_exited(&self, id: &str, exit_code: Option<i32>) -> ClientResult<SessionSnapshot>;
    async fn send_message(&self, id: &str, text: &str) -> ClientResult<()>;

    async fn tail(&self, id: &str, lines: usize, stream: StreamFilter)
        -> ClientResult<Vec<LogEvent>>;
    /// Follows new log lines after replaying `backlog` recent ones.
    async fn stream_tail(
        &self,
        id: &str,
        backlog: usize,
        stream: StreamFilter,
    ) -> ClientResult<EventStream<LogEvent>>;
    async fn events(&self, id: &str, limit: usize) -> ClientResult<Vec<AgentEvent>>;
    async fn stream_events(&self, id: &str, backlog: usize)
        -> ClientResult<EventStream<AgentEvent>>;
    async fn items(&self, id: &str, limit: usize) -> ClientResult<Vec<ItemEvent>>;
    async fn stream_items(&self, id: &str, backlog: usize) -> ClientResult<EventStream<ItemEvent>>;

    async fn list_approvals(&self, id: &str) -> ClientResult<Vec<PendingApproval>>;
    async fn decide_approval(&self, id: &str, request: &DecideRequest) -> ClientResult<()>;
}
