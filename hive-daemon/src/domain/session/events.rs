use super::value_object::{ProviderName, SessionId};
use chrono::{DateTime, Utc};
use hive_protocol::{OrphanReason, SessionStatus};
use serde_json::{json, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionDomainEvent {
    Created { provider: ProviderName },
    Starting,
    Running { pid: u32 },
    Exited { exit_code: Option<i32> },
    Failed { exit_code: Option<i32>, reason: String },
    Killed,
    Orphaned { reason: OrphanReason },
}

impl SessionDomainEvent {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionDomainEvent::Created { .. } => SessionStatus::Created,
            SessionDomainEvent::Starting => SessionStatus::Starting,
            SessionDomainEvent::Running { .. } => SessionStatus::Running,
            SessionDomainEvent::Exited { .. } => SessionStatus::Exited,
            SessionDomainEvent::Failed { .. } => SessionStatus::Failed,
            SessionDomainEvent::Killed => SessionStatus::Killed,
            SessionDomainEvent::Orphaned { .. } => SessionStatus::Orphaned,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEventEnvelope {
    pub session_id: SessionId,
    pub occurred_at: DateTime<Utc>,
    pub event: SessionDomainEvent,
}

impl SessionEventEnvelope {
    pub const METHOD: &'static str = "session/statusChanged";

    pub fn new(session_id: SessionId, event: SessionDomainEvent) -> Self {
        Self {
            session_id,
            occurred_at: Utc::now(),
            event,
        }
    }

    /// Payload published on the structured event feed.
    pub fn params(&self) -> Value {
        let mut params = json!({
            "status": self.event.status(),
            "at": self.occurred_at,
        });
        match &self.event {
            SessionDomainEvent::Created { provider } => {
                params["provider"] = json!(provider.as_str());
            }
            SessionDomainEvent::Running { pid } => {
                params["pid"] = json!(pid);
            }
            SessionDomainEvent::Exited { exit_code } => {
                params["exit_code"] = json!(exit_code);
            }
            SessionDomainEvent::Failed { exit_code, reason } => {
                params["exit_code"] = json!(exit_code);
                params["reason"] = json!(reason);
            }
            SessionDomainEvent::Orphaned { reason } => {
                params["reason"] = json!(reason);
            }
            SessionDomainEvent::Starting | SessionDomainEvent::Killed => {}
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_records_timestamp() {
        let id = SessionId::new();
        let envelope = SessionEventEnvelope::new(id.clone(), SessionDomainEvent::Killed);
        assert_eq!(id, envelope.session_id);
        assert!(envelope.occurred_at <= Utc::now());
        assert_eq!(envelope.params()["status"], "killed");
    }

    #[test]
    fn failure_params_carry_reason() {
        let envelope = SessionEventEnvelope::new(
            SessionId::new(),
            SessionDomainEvent::Failed {
                exit_code: Some(2),
                reason: "exit code 2".into(),
            },
        );
        let params = envelope.params();
        assert_eq!(params["exit_code"], 2);
        assert_eq!(params["reason"], "exit code 2");
    }
}
