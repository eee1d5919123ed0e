//! In-memory daemon used by the command tests.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream;
use hive_client::{ClientError, ClientResult, DaemonApi, DaemonControl, EventStream};
use hive_protocol::{
    AgentEvent, DecideRequest, HealthResponse, ItemEvent, LogEvent, LogStream, PendingApproval,
    RequestId, SessionSnapshot, SessionStatus, StartSessionRequest, StreamFilter,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Default)]
pub struct FakeApi {
    pub sessions: Mutex<Vec<SessionSnapshot>>,
    pub logs: Mutex<Vec<LogEvent>>,
    pub approvals: Mutex<Vec<PendingApproval>>,
    pub started: Mutex<Vec<StartSessionRequest>>,
    pub decided: Mutex<Vec<(String, DecideRequest)>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub interrupted: Mutex<Vec<String>>,
}

pub fn snapshot(id: &str, status: SessionStatus) -> SessionSnapshot {
    SessionSnapshot {
        id: id.to_string(),
        provider: "codex".into(),
        command: "codex".into(),
        args: vec![],
        env: BTreeMap::new(),
        cwd: PathBuf::from("/tmp"),
        status,
        pid: (status == SessionStatus::Running).then_some(4242),
        exit_code: None,
        created_at: Utc::now() - ChronoDuration::seconds(90),
        started_at: None,
        exited_at: None,
        title: None,
        tags: vec![],
        failure: None,
        orphan_reason: None,
        process_start_ticks: None,
    }
}

impl FakeApi {
    pub fn with_session(self, session: SessionSnapshot) -> Self {
        self.sessions.lock().push(session);
        self
    }

    pub fn with_log_lines(self, id: &str, count: u64) -> Self {
        {
            let mut logs = self.logs.lock();
            for n in 1..=count {
                logs.push(LogEvent {
                    seq: n,
                    session_id: id.to_string(),
                    stream: if n % 2 == 0 {
                        LogStream::Stderr
                    } else {
                        LogStream::Stdout
                    },
                    text: format!("line {n}"),
                    at: Utc::now(),
                });
            }
        }
        self
    }

    pub fn with_approval(self, id: &str, request_id: RequestId, method: &str) -> Self {
        self.approvals.lock().push(PendingApproval {
            session_id: id.to_string(),
            request_id,
            method: method.to_string(),
            params: json!({"command": "rm -rf build"}),
            created_at: Utc::now(),
        });
        self
    }

    fn require(&self, id: &str) -> ClientResult<()> {
        if self.sessions.lock().iter().any(|session| session.id == id) {
            Ok(())
        } else {
            Err(ClientError::NotFound(format!("session {id} not found")))
        }
    }

    fn logs_for(&self, id: &str, stream: StreamFilter) -> Vec<LogEvent> {
        self.logs
            .lock()
            .iter()
            .filter(|event| event.session_id == id && stream.matches(event.stream))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DaemonControl for FakeApi {
    async fn health(&self) -> ClientResult<HealthResponse> {
        Ok(HealthResponse {
            ok: true,
            version: hive_version::hive_version().to_string(),
            pid: 1,
        })
    }

    async fn shutdown(&self) -> ClientResult<()> {
        Ok(())
    }
}

#[async_trait]
impl DaemonApi for FakeApi {
    async fn list_sessions(&self) -> ClientResult<Vec<SessionSnapshot>> {
        Ok(self.sessions.lock().clone())
    }

    async fn start_session(&self, request: &StartSessionRequest) -> ClientResult<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        let mut session = snapshot(&format!("s{}", sessions.len() + 1), SessionStatus::Starting);
        session.provider = request.provider.clone();
        session.title = request.title.clone();
        session.tags = request.tags.clone();
        if let Some(cwd) = &request.cwd {
            session.cwd = cwd.clone();
        }
        sessions.push(session.clone());
        self.started.lock().push(request.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> ClientResult<SessionSnapshot> {
        self.sessions
            .lock()
            .iter()
            .find(|session| session.id == id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("session {id} not found")))
    }

    async fn kill_session(&self, id: &str) -> ClientResult<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or_else(|| ClientError::NotFound(format!("session {id} not found")))?;
        if !session.status.is_terminal() {
            session.status = SessionStatus::Killed;
            session.pid = None;
        }
        Ok(session.clone())
    }

    async fn interrupt_session(&self, id: &str) -> ClientResult<()> {
        self.require(id)?;
        self.interrupted.lock().push(id.to_string());
        Ok(())
    }

    async fn mark_exited(&self, id: &str, exit_code: Option<i32>) -> ClientResult<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or_else(|| ClientError::NotFound(format!("session {id} not found")))?;
        session.status = SessionStatus::Exited;
        session.exit_code = exit_code;
        Ok(session.clone())
    }

    async fn send_message(&self, id: &str, text: &str) -> ClientResult<()> {
        self.require(id)?;
        self.sent.lock().push((id.to_string(), text.to_string()));
        Ok(())
    }

    async fn tail(
        &self,
        id: &str,
        lines: usize,
        stream: StreamFilter,
    ) -> ClientResult<Vec<LogEvent>> {
        self.require(id)?;
        let logs = self.logs_for(id, stream);
        let skip = logs.len().saturating_sub(lines);
        Ok(logs.into_iter().skip(skip).collect())
    }

    async fn stream_tail(
        &self,
        id: &str,
        backlog: usize,
        stream: StreamFilter,
    ) -> ClientResult<EventStream<LogEvent>> {
        let events = self.tail(id, backlog, stream).await?;
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }

    async fn events(&self, id: &str, _limit: usize) -> ClientResult<Vec<AgentEvent>> {
        self.require(id)?;
        Ok(Vec::new())
    }

    async fn stream_events(
        &self,
        id: &str,
        _backlog: usize,
    ) -> ClientResult<EventStream<AgentEvent>> {
        self.require(id)?;
        Ok(Box::pin(stream::empty()))
    }

    async fn items(&self, id: &str, _limit: usize) -> ClientResult<Vec<ItemEvent>> {
        self.require(id)?;
        Ok(Vec::new())
    }

    async fn stream_items(&self, id: &str, _backlog: usize) -> ClientResult<EventStream<ItemEvent>> {
        self.require(id)?;
        Ok(Box::pin(stream::empty()))
    }

    async fn list_approvals(&self, id: &str) -> ClientResult<Vec<PendingApproval>> {
        self.require(id)?;
        Ok(self
            .approvals
            .lock()
            .iter()
            .filter(|approval| approval.session_id == id)
            .cloned()
            .collect())
    }

    async fn decide_approval(&self, id: &str, request: &DecideRequest) -> ClientResult<()> {
        self.require(id)?;
        let mut approvals = self.approvals.lock();
        let before = approvals.len();
        approvals.retain(|approval| {
            !(approval.session_id == id && approval.request_id == request.request_id)
        });
        if approvals.len() == before {
            return Err(ClientError::NotFound(format!(
                "no pending approval {} on session {id}",
                request.request_id
            )));
        }
        self.decided.lock().push((id.to_string(), request.clone()));
        Ok(())
    }
}
