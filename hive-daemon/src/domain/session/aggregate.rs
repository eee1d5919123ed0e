use super::events::{SessionDomainEvent, SessionEventEnvelope};
use super::value_object::{LaunchSpec, ProviderName, SessionId};
use chrono::{DateTime, Utc};
use hive_protocol::{OrphanReason, SessionSnapshot, SessionStatus};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionTransitionError {
    #[error("session {id} is already {status}")]
    AlreadyTerminal { id: SessionId, status: SessionStatus },
    #[error("session {id} cannot move from {from} to {to}")]
    Invalid {
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
}

pub type TransitionResult = Result<SessionEventEnvelope, SessionTransitionError>;

/// A supervised subprocess. Status only ever moves forward; every transition
/// returns the event describing it.
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    launch: LaunchSpec,
    status: SessionStatus,
    pid: Option<u32>,
    start_ticks: Option<u64>,
    exit_code: Option<i32>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    exited_at: Option<DateTime<Utc>>,
    failure: Option<String>,
    orphan_reason: Option<OrphanReason>,
}

impl Session {
    pub fn create(launch: LaunchSpec) -> (Self, SessionEventEnvelope) {
        let id = SessionId::new();
        let event = SessionEventEnvelope::new(
            id.clone(),
            SessionDomainEvent::Created {
                provider: launch.provider.clone(),
            },
        );
        let session = Self {
            id,
            launch,
            status: SessionStatus::Created,
            pid: None,
            start_ticks: None,
            exit_code: None,
            created_at: event.occurred_at,
            started_at: None,
            exited_at: None,
            failure: None,
            orphan_reason: None,
        };
        (session, event)
    }

    pub fn begin_start(&mut self) -> TransitionResult {
        self.expect(SessionStatus::Created, SessionStatus::Starting)?;
        self.status = SessionStatus::Starting;
        Ok(self.envelope(SessionDomainEvent::Starting))
    }

    pub fn mark_running(&mut self, pid: u32, start_ticks: Option<u64>) -> TransitionResult {
        self.expect(SessionStatus::Starting, SessionStatus::Running)?;
        self.status = SessionStatus::Running;
        self.pid = Some(pid);
        self.start_ticks = start_ticks;
        self.started_at = Some(Utc::now());
        Ok(self.envelope(SessionDomainEvent::Running { pid }))
    }

    pub fn mark_spawn_failed(&mut self, reason: impl Into<String>) -> TransitionResult {
        self.expect(SessionStatus::Starting, SessionStatus::Failed)?;
        let reason = reason.into();
        self.finish(SessionStatus::Failed, None);
        self.failure = Some(reason.clone());
        Ok(self.envelope(SessionDomainEvent::Failed {
            exit_code: None,
            reason,
        }))
    }

    /// Records a normal exit: zero or unknown means `exited`, anything else
    /// `failed`.
    pub fn record_exit(&mut self, exit_code: Option<i32>) -> TransitionResult {
        match exit_code {
            None | Some(0) => {
                self.expect(SessionStatus::Running, SessionStatus::Exited)?;
                self.finish(SessionStatus::Exited, exit_code);
                Ok(self.envelope(SessionDomainEvent::Exited { exit_code }))
            }
            Some(code) => self.record_failure(Some(code), format!("exit code {code}")),
        }
    }

    pub fn record_failure(
        &mut self,
        exit_code: Option<i32>,
        reason: impl Into<String>,
    ) -> TransitionResult {
        self.expect(SessionStatus::Running, SessionStatus::Failed)?;
        let reason = reason.into();
        self.finish(SessionStatus::Failed, exit_code);
        self.failure = Some(reason.clone());
        Ok(self.envelope(SessionDomainEvent::Failed { exit_code, reason }))
    }

    pub fn mark_killed(&mut self) -> TransitionResult {
        self.ensure_live()?;
        self.finish(SessionStatus::Killed, None);
        Ok(self.envelope(SessionDomainEvent::Killed))
    }

    pub fn mark_orphaned(&mut self, reason: OrphanReason) -> TransitionResult {
        self.ensure_live()?;
        self.finish(SessionStatus::Orphaned, None);
        self.orphan_reason = Some(reason);
        Ok(self.envelope(SessionDomainEvent::Orphaned { reason }))
    }

    pub fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.to_string(),
            provider: self.launch.provider.to_string(),
            command: self.launch.program.clone(),
            args: self.launch.args.clone(),
            env: self.launch.env.clone(),
            cwd: self.launch.cwd.clone(),
            status: self.status,
            pid: self.pid,
            exit_code: self.exit_code,
            created_at: self.created_at,
            started_at: self.started_at,
            exited_at: self.exited_at,
            title: self.launch.title.clone(),
            tags: self.launch.tags.clone(),
            failure: self.failure.clone(),
            orphan_reason: self.orphan_reason,
            process_start_ticks: self.start_ticks,
        }
    }

    pub fn from_snapshot(snapshot: SessionSnapshot) -> Result<Self, String> {
        let id: SessionId = snapshot.id.parse()?;
        let provider = ProviderName::new(&snapshot.provider)?;
        Ok(Self {
            id,
            launch: LaunchSpec {
                provider,
                program: snapshot.command,
                args: snapshot.args,
                env: snapshot.env,
                cwd: snapshot.cwd,
                title: snapshot.title,
                tags: snapshot.tags,
            },
            status: snapshot.status,
            pid: snapshot.pid,
            start_ticks: snapshot.process_start_ticks,
            exit_code: snapshot.exit_code,
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            exited_at: snapshot.exited_at,
            failure: snapshot.failure,
            orphan_reason: snapshot.orphan_reason,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id.clone()
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn start_ticks(&self) -> Option<u64> {
        self.start_ticks
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn expect(&self, from: SessionStatus, to: SessionStatus) -> Result<(), SessionTransitionError> {
        self.ensure_live()?;
        if self.status != from {
            return Err(SessionTransitionError::Invalid {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), SessionTransitionError> {
        if self.status.is_terminal() {
            return Err(SessionTransitionError::AlreadyTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn finish(&mut self, status: SessionStatus, exit_code: Option<i32>) {
        self.status = status;
        self.exit_code = exit_code;
        self.pid = None;
        self.exited_at = Some(Utc::now());
    }

    fn envelope(&self, event: SessionDomainEvent) -> SessionEventEnvelope {
        SessionEventEnvelope::new(self.id.clone(), event)
    }
}
