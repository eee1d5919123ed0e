use super::hub::EventHub;
use super::service::SupervisorConfig;
use crate::domain::session::{
    Session, SessionEventEnvelope, SessionId, SessionTransitionError,
};
use chrono::Utc;
use hive_protocol::{
    AgentEvent, ItemEvent, LogEvent, LogStream, RequestId, SessionSnapshot, SessionStatus,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Notify;

/// Live state of one session: the aggregate, its three feeds and the pipe
/// into the agent.
pub struct SessionHandle {
    id: SessionId,
    state: Mutex<Session>,
    pub(super) logs: EventHub<LogEvent>,
    pub(super) events: EventHub<AgentEvent>,
    pub(super) items: EventHub<ItemEvent>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill_requested: Notify,
    attached: AtomicBool,
}

impl SessionHandle {
    pub fn new(session: Session, config: &SupervisorConfig) -> Self {
        Self {
            id: session.id(),
            state: Mutex::new(session),
            logs: EventHub::new(config.subscriber_capacity, config.history_limit),
            events: EventHub::new(config.subscriber_capacity, config.history_limit),
            items: EventHub::new(config.subscriber_capacity, config.history_limit),
            stdin: tokio::sync::Mutex::new(None),
            kill_requested: Notify::new(),
            attached: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().to_snapshot()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Applies a transition and publishes its lifecycle event while the state
    /// lock is held, so the event feed sees transitions in order.
    pub fn transition(
        &self,
        apply: impl FnOnce(&mut Session) -> Result<SessionEventEnvelope, SessionTransitionError>,
    ) -> Result<SessionEventEnvelope, SessionTransitionError> {
        let mut state = self.state.lock();
        let envelope = apply(&mut state)?;
        self.publish_lifecycle(&envelope);
        Ok(envelope)
    }

    /// Runs `inspect` against the current state without changing it.
    pub fn with_state<R>(&self, inspect: impl FnOnce(&Session) -> R) -> R {
        inspect(&self.state.lock())
    }

    /// Locks the state for a check-then-transition sequence that must not
    /// interleave with other transitions.
    pub(super) fn lock_state(&self) -> parking_lot::MutexGuard<'_, Session> {
        self.state.lock()
    }

    pub fn publish_lifecycle(&self, envelope: &SessionEventEnvelope) {
        self.publish_agent(SessionEventEnvelope::METHOD, None, envelope.params());
    }

    pub fn publish_log(&self, stream: LogStream, text: String) {
        let session_id = self.id.to_string();
        self.logs.publish(|seq| LogEvent {
            seq,
            session_id,
            stream,
            text,
            at: Utc::now(),
        });
    }

    pub fn publish_agent(&self, method: &str, request_id: Option<RequestId>, params: Value) {
        let session_id = self.id.to_string();
        self.events.publish(|seq| AgentEvent {
            seq,
            session_id,
            method: method.to_string(),
            request_id,
            params,
            at: Utc::now(),
        });
    }

    pub fn publish_item(&self, kind: &str, item: Value) {
        let session_id = self.id.to_string();
        self.items.publish(|seq| ItemEvent {
            seq,
            session_id,
            kind: kind.to_string(),
            item,
            at: Utc::now(),
        });
    }

    /// Ends all follow streams for this session.
    pub fn close_feeds(&self) {
        self.logs.close();
        self.events.close();
        self.items.close();
    }

    pub async fn attach_stdin(&self, stdin: Option<ChildStdin>) {
        self.attached.store(true, Ordering::SeqCst);
        *self.stdin.lock().await = stdin;
    }

    pub async fn detach_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Whether this daemon spawned the process (as opposed to adopting it
    /// after a restart).
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Writes one newline-terminated line to the agent's stdin.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "session stdin is not attached")
        })?;
        pipe.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            pipe.write_all(b"\n").await?;
        }
        pipe.flush().await
    }

    pub fn request_kill_escalation(&self) {
        self.kill_requested.notify_one();
    }

    pub async fn kill_escalation_requested(&self) {
        self.kill_requested.notified().await
    }
}
