use super::handle::SessionHandle;
use super::hub::{EventFilter, Subscription};
use super::process::{self, ChildOutcome, ReaderResult};
use super::providers::ProviderRegistry;
use super::reconcile::{classify, Verdict};
use crate::app::approvals::{ApprovalError, ApprovalGate};
use crate::domain::approval::DecisionOutcome;
use crate::domain::session::{
    LaunchSpec, ProviderName, Session, SessionId, SessionTransitionError,
};
use crate::ports::{ProcessControl, SessionStore, Signal};
use anyhow::Context;
use hive_protocol::{
    AgentEvent, DecideRequest, ItemEvent, LogEvent, OrphanReason, PendingApproval,
    SessionSnapshot, SessionStatus, StartSessionRequest, StreamFilter,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{0}")]
    Invalid(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] SessionTransitionError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error("session {id} failed to start: {message}")]
    Spawn { id: SessionId, message: String },
    #[error("{0}")]
    Internal(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Queue depth of every live subscriber.
    pub subscriber_capacity: usize,
    /// Events retained per feed for tail and backlog.
    pub history_limit: usize,
    /// Time a killed process gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Poll period for processes adopted after a restart.
    pub liveness_interval: Duration,
    /// Working directory for start requests without `cwd`. Defaults to the
    /// daemon's own.
    pub default_cwd: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            history_limit: 5000,
            kill_grace: Duration::from_secs(3),
            liveness_interval: Duration::from_secs(2),
            default_cwd: None,
        }
    }
}

/// Counts from reconciling the persisted session index at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub adopted: usize,
    pub orphaned: usize,
    pub terminal: usize,
    pub skipped: usize,
}

/// Owns every session of the daemon: spawning, output capture, lifecycle and
/// the persisted index.
pub struct SessionSupervisor {
    store: Arc<dyn SessionStore>,
    processes: Arc<dyn ProcessControl>,
    approvals: Arc<ApprovalGate>,
    providers: ProviderRegistry,
    config: SupervisorConfig,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    persist_lock: Mutex<()>,
}

impl SessionSupervisor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        processes: Arc<dyn ProcessControl>,
        approvals: Arc<ApprovalGate>,
        providers: ProviderRegistry,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            processes,
            approvals,
            providers,
            config,
            sessions: RwLock::new(HashMap::new()),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub async fn start(
        self: &Arc<Self>,
        request: StartSessionRequest,
    ) -> SupervisorResult<SessionSnapshot> {
        let launch = self.resolve_launch(request)?;
        let (mut session, created) = Session::create(launch.clone());
        let starting = session.begin_start()?;
        let handle = Arc::new(SessionHandle::new(session, &self.config));
        let id = handle.id();
        handle.publish_lifecycle(&created);
        handle.publish_lifecycle(&starting);
        self.sessions.write().await.insert(id.clone(), handle.clone());
        info!(
            session_id = %id,
            provider = %launch.provider,
            command = %launch.command_line(),
            cwd = %launch.cwd.display(),
            "starting session"
        );

        let mut child = match build_command(&launch).spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = format!("spawning {}: {err}", launch.program);
                return Err(self.fail_start(&handle, message).await);
            }
        };
        let Some(pid) = child.id() else {
            let message = format!("{} exited before its pid was read", launch.program);
            return Err(self.fail_start(&handle, message).await);
        };

        let start_ticks = self.processes.start_ticks(pid);
        if let Err(err) = handle.transition(|session| session.mark_running(pid, start_ticks)) {
            warn!(session_id = %id, error = %err, "session ended while starting; stopping process");
            if let Err(err) = child.start_kill() {
                warn!(session_id = %id, error = %err, "failed to stop process");
            }
        } else {
            info!(session_id = %id, pid, "session running");
        }

        handle.attach_stdin(child.stdin.take()).await;
        let readers = process::spawn_readers(&handle, &mut child, &self.approvals);
        tokio::spawn(self.clone().supervise_child(handle.clone(), child, readers));

        self.persist_logged().await;
        Ok(handle.snapshot())
    }

    async fn fail_start(&self, handle: &Arc<SessionHandle>, message: String) -> SupervisorError {
        warn!(session_id = %handle.id(), error = %message, "session failed to start");
        if let Err(err) = handle.transition(|session| session.mark_spawn_failed(message.clone())) {
            debug!(session_id = %handle.id(), error = %err, "spawn failure not recorded");
        }
        self.finish_session(handle).await;
        SupervisorError::Spawn {
            id: handle.id(),
            message,
        }
    }

    fn resolve_launch(&self, request: StartSessionRequest) -> SupervisorResult<LaunchSpec> {
        let provider = ProviderName::new(&request.provider).map_err(SupervisorError::Invalid)?;
        let default_command = self.providers.command_for(&provider).ok_or_else(|| {
            SupervisorError::Invalid(format!(
                "unknown provider '{provider}' (known: {})",
                self.providers.names().join(", ")
            ))
        })?;

        let cwd = match request.cwd.or_else(|| self.config.default_cwd.clone()) {
            Some(cwd) => cwd,
            None => std::env::current_dir()
                .map_err(|err| SupervisorError::Internal(format!("reading current dir: {err}")))?,
        };
        if !cwd.is_dir() {
            return Err(SupervisorError::Invalid(format!(
                "working directory {} does not exist or is not a directory",
                cwd.display()
            )));
        }

        let command_line = request
            .cmd
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or(default_command);
        let mut words = shell_words::split(command_line).map_err(|err| {
            SupervisorError::Invalid(format!("invalid command '{command_line}': {err}"))
        })?;
        if words.is_empty() {
            return Err(SupervisorError::Invalid("command is empty".into()));
        }
        let program = resolve_program(&words.remove(0), &cwd)?;
        words.extend(request.args);

        Ok(LaunchSpec {
            provider,
            program,
            args: words,
            env: request.env,
            cwd,
            title: request.title.filter(|title| !title.trim().is_empty()),
            tags: request.tags,
        })
    }

    /// Waits for a spawned process and records how it ended.
    async fn supervise_child(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        mut child: Child,
        readers: Vec<JoinHandle<ReaderResult>>,
    ) {
        let outcome = process::wait_for_child(
            &handle,
            &mut child,
            self.config.kill_grace,
            self.processes.as_ref(),
        )
        .await;
        let read_failure = process::drain_readers(readers).await;
        let recorded = match (outcome, read_failure) {
            (ChildOutcome::Exited(code), None) => {
                handle.transition(|session| session.record_exit(code))
            }
            (ChildOutcome::Exited(code), Some(reason)) => {
                handle.transition(|session| session.record_failure(code, reason))
            }
            (ChildOutcome::Signalled(reason) | ChildOutcome::WaitFailed(reason), _) => {
                handle.transition(|session| session.record_failure(None, reason))
            }
        };
        match recorded {
            Ok(envelope) => info!(
                session_id = %handle.id(),
                status = %envelope.event.status(),
                exit_code = ?handle.with_state(|session| session.exit_code()),
                "session ended"
            ),
            Err(SessionTransitionError::AlreadyTerminal { status, .. }) => {
                debug!(session_id = %handle.id(), %status, "process exit after terminal status")
            }
            Err(err) => warn!(session_id = %handle.id(), error = %err, "exit not recorded"),
        }
        self.finish_session(&handle).await;
    }

    /// Releases everything a terminal session holds and persists the index.
    async fn finish_session(&self, handle: &SessionHandle) {
        let cleared = self.approvals.clear_session(&handle.id());
        if cleared > 0 {
            debug!(session_id = %handle.id(), cleared, "dropped pending approvals");
        }
        handle.close_feeds();
        handle.detach_stdin().await;
        self.persist_logged().await;
    }

    /// SIGTERM, then `killed`. The process gets the grace period before
    /// SIGKILL. Killing a terminal session changes nothing.
    pub async fn kill(&self, id: &SessionId) -> SupervisorResult<SessionSnapshot> {
        let handle = self.handle(id).await?;
        let target = {
            let mut session = handle.lock_state();
            if session.is_terminal() {
                return Ok(session.to_snapshot());
            }
            let target = session.pid().map(|pid| (pid, session.start_ticks()));
            if let Some((pid, _)) = target {
                self.processes
                    .signal(pid, Signal::Terminate)
                    .map_err(|err| SupervisorError::Internal(format!("signalling pid {pid}: {err}")))?;
            }
            let envelope = session.mark_killed()?;
            handle.publish_lifecycle(&envelope);
            target
        };
        info!(session_id = %id, pid = ?target.map(|(pid, _)| pid), "session killed");

        if handle.is_attached() {
            handle.request_kill_escalation();
        } else if let Some((pid, ticks)) = target {
            let processes = self.processes.clone();
            let grace = self.config.kill_grace;
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if classify(Some(pid), ticks, processes.as_ref()) == Verdict::Adopt(pid) {
                    warn!(session_id = %id, pid, "adopted process ignored SIGTERM; killing");
                    if let Err(err) = processes.signal(pid, Signal::Kill) {
                        warn!(session_id = %id, pid, error = %err, "force kill failed");
                    }
                }
            });
        }

        self.finish_session(&handle).await;
        Ok(handle.snapshot())
    }

    /// SIGINT without a lifecycle change.
    pub async fn interrupt(&self, id: &SessionId) -> SupervisorResult<()> {
        let handle = self.handle(id).await?;
        let pid = handle.with_state(|session| {
            if session.is_terminal() {
                None
            } else {
                session.pid()
            }
        });
        if let Some(pid) = pid {
            self.processes
                .signal(pid, Signal::Interrupt)
                .map_err(|err| SupervisorError::Internal(format!("signalling pid {pid}: {err}")))?;
            info!(session_id = %id, pid, "session interrupted");
        }
        Ok(())
    }

    /// Records an exit observed outside the daemon.
    pub async fn mark_exited(
        &self,
        id: &SessionId,
        exit_code: Option<i32>,
    ) -> SupervisorResult<SessionSnapshot> {
        let handle = self.handle(id).await?;
        let recorded = {
            let mut session = handle.lock_state();
            if session.is_terminal() {
                return Ok(session.to_snapshot());
            }
            let envelope = match session.status() {
                SessionStatus::Running => session.record_exit(exit_code)?,
                _ => session.mark_spawn_failed(match exit_code {
                    Some(code) => format!("exited with code {code} while starting"),
                    None => "exited while starting".to_string(),
                })?,
            };
            handle.publish_lifecycle(&envelope);
            envelope
        };
        info!(
            session_id = %id,
            exit_code = ?exit_code,
            status = %recorded.event.status(),
            "session exit recorded"
        );
        self.finish_session(&handle).await;
        Ok(handle.snapshot())
    }

    /// Writes one line to the agent's stdin.
    pub async fn send_message(&self, id: &SessionId, text: &str) -> SupervisorResult<()> {
        let handle = self.handle(id).await?;
        let status = handle.status();
        if status != SessionStatus::Running {
            return Err(SupervisorError::Invalid(format!(
                "session {id} is {status}, not running"
            )));
        }
        handle.write_line(text).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotConnected => SupervisorError::Invalid(format!(
                "session {id} has no attached stdin (adopted after a daemon restart)"
            )),
            _ => SupervisorError::Internal(format!("writing to session {id}: {err}")),
        })?;
        debug!(session_id = %id, bytes = text.len(), "message sent");
        Ok(())
    }

    /// All sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut snapshots: Vec<_> = sessions.values().map(|handle| handle.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub async fn get(&self, id: &SessionId) -> SupervisorResult<SessionSnapshot> {
        Ok(self.handle(id).await?.snapshot())
    }

    /// Most recent `lines` output lines of `stream`, oldest first.
    pub async fn tail(
        &self,
        id: &SessionId,
        lines: usize,
        stream: StreamFilter,
    ) -> SupervisorResult<Vec<LogEvent>> {
        let handle = self.handle(id).await?;
        Ok(handle.logs.recent(lines, log_filter(stream).as_ref()))
    }

    pub async fn subscribe_logs(
        &self,
        id: &SessionId,
        stream: StreamFilter,
        backlog: usize,
    ) -> SupervisorResult<Subscription<LogEvent>> {
        let handle = self.handle(id).await?;
        Ok(handle.logs.subscribe(backlog, log_filter(stream)))
    }

    pub async fn events(&self, id: &SessionId, limit: usize) -> SupervisorResult<Vec<AgentEvent>> {
        Ok(self.handle(id).await?.events.recent(limit, None))
    }

    pub async fn subscribe_events(
        &self,
        id: &SessionId,
        backlog: usize,
    ) -> SupervisorResult<Subscription<AgentEvent>> {
        Ok(self.handle(id).await?.events.subscribe(backlog, None))
    }

    pub async fn items(&self, id: &SessionId, limit: usize) -> SupervisorResult<Vec<ItemEvent>> {
        Ok(self.handle(id).await?.items.recent(limit, None))
    }

    pub async fn subscribe_items(
        &self,
        id: &SessionId,
        backlog: usize,
    ) -> SupervisorResult<Subscription<ItemEvent>> {
        Ok(self.handle(id).await?.items.subscribe(backlog, None))
    }

    pub async fn list_approvals(&self, id: &SessionId) -> SupervisorResult<Vec<PendingApproval>> {
        self.handle(id).await?;
        Ok(self
            .approvals
            .list(id)
            .iter()
            .map(|request| request.to_pending())
            .collect())
    }

    pub async fn decide_approval(
        &self,
        id: &SessionId,
        request: DecideRequest,
    ) -> SupervisorResult<PendingApproval> {
        self.handle(id).await?;
        let resolved = self.approvals.decide(
            id,
            &request.request_id,
            DecisionOutcome {
                decision: request.decision,
                responses: request.responses,
            },
        )?;
        info!(
            session_id = %id,
            request_id = %resolved.request_id,
            decision = request.decision.as_str(),
            "approval decided"
        );
        Ok(resolved.to_pending())
    }

    /// Loads the persisted index and reconciles every live record against the
    /// process table. Fails only when the index cannot be loaded.
    pub async fn restore(self: &Arc<Self>) -> anyhow::Result<RestoreReport> {
        let snapshots = self
            .store
            .load()
            .await
            .context("loading session index")?;
        let mut report = RestoreReport::default();
        let mut adopted = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            for snapshot in snapshots {
                let record_id = snapshot.id.clone();
                let session = match Session::from_snapshot(snapshot) {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(session_id = %record_id, error = %err, "skipping unreadable session record");
                        report.skipped += 1;
                        continue;
                    }
                };
                let handle = Arc::new(SessionHandle::new(session, &self.config));
                if handle.is_terminal() {
                    handle.close_feeds();
                    report.terminal += 1;
                } else {
                    let (pid, ticks) =
                        handle.with_state(|session| (session.pid(), session.start_ticks()));
                    match classify(pid, ticks, self.processes.as_ref()) {
                        Verdict::Adopt(pid) => {
                            info!(session_id = %handle.id(), pid, "adopted running session");
                            report.adopted += 1;
                            adopted.push(handle.clone());
                        }
                        Verdict::Orphan(reason) => {
                            self.orphan(&handle, reason);
                            report.orphaned += 1;
                        }
                    }
                }
                sessions.insert(handle.id(), handle);
            }
        }
        for handle in adopted {
            tokio::spawn(self.clone().watch_adopted(handle));
        }
        self.persist_logged().await;
        info!(
            adopted = report.adopted,
            orphaned = report.orphaned,
            terminal = report.terminal,
            skipped = report.skipped,
            "session index restored"
        );
        Ok(report)
    }

    fn orphan(&self, handle: &SessionHandle, reason: OrphanReason) {
        match handle.transition(|session| session.mark_orphaned(reason)) {
            Ok(_) => info!(session_id = %handle.id(), %reason, "session orphaned"),
            Err(err) => debug!(session_id = %handle.id(), error = %err, "orphan not recorded"),
        }
        self.approvals.clear_session(&handle.id());
        handle.close_feeds();
    }

    /// Polls an adopted process until it disappears or the session ends some
    /// other way.
    async fn watch_adopted(self: Arc<Self>, handle: Arc<SessionHandle>) {
        let mut ticker = tokio::time::interval(self.config.liveness_interval);
        loop {
            ticker.tick().await;
            let Some((pid, ticks)) = handle.with_state(|session| {
                (!session.is_terminal()).then(|| (session.pid(), session.start_ticks()))
            }) else {
                return;
            };
            if let Verdict::Orphan(reason) = classify(pid, ticks, self.processes.as_ref()) {
                // Whatever ended the process, we did not see its exit status.
                let reason = match reason {
                    OrphanReason::PidReused => OrphanReason::PidReused,
                    _ => OrphanReason::ProcessMissing,
                };
                self.orphan(&handle, reason);
                self.persist_logged().await;
                return;
            }
        }
    }

    /// Flushes the session index. Supervised processes keep running.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.persist().await?;
        info!("session index flushed");
        Ok(())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshots = self.list().await;
        self.store
            .save(&snapshots)
            .await
            .context("saving session index")
    }

    async fn persist_logged(&self) {
        if let Err(err) = self.persist().await {
            warn!("Failed to persist session index: {err:#}");
        }
    }

    async fn handle(&self, id: &SessionId) -> SupervisorResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }
}

fn log_filter(stream: StreamFilter) -> Option<EventFilter<LogEvent>> {
    match stream {
        StreamFilter::Combined => None,
        _ => Some(Arc::new(move |event: &LogEvent| stream.matches(event.stream))),
    }
}

fn build_command(launch: &LaunchSpec) -> Command {
    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .envs(&launch.env)
        .current_dir(&launch.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// Paths are taken as given (relative to `cwd`); bare names go through PATH.
fn resolve_program(program: &str, cwd: &Path) -> SupervisorResult<String> {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        let path = cwd.join(program);
        if path.is_file() {
            return Ok(path.to_string_lossy().into_owned());
        }
        return Err(SupervisorError::Invalid(format!(
            "command '{program}' does not exist"
        )));
    }
    which::which(program)
        .map(|path| path.to_string_lossy().into_owned())
        .map_err(|_| SupervisorError::Invalid(format!("command '{program}' not found on PATH")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::process::OsProcessControl;
    use crate::adapters::stores::InMemorySessionStore;
    use crate::app::supervisor::reconcile::fake::FakeProcesses;
    use chrono::Utc;
    use hive_protocol::{Decision, LogStream, RequestId};
    use serde_json::json;
    use tempfile::TempDir;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            kill_grace: Duration::from_millis(300),
            liveness_interval: Duration::from_millis(20),
            ..SupervisorConfig::default()
        }
    }

    fn supervisor_with(
        store: Arc<InMemorySessionStore>,
        processes: Arc<dyn ProcessControl>,
    ) -> Arc<SessionSupervisor> {
        let mut providers = ProviderRegistry::with_defaults();
        providers.register(ProviderName::new("sh").unwrap(), "sh");
        Arc::new(SessionSupervisor::new(
            store,
            processes,
            Arc::new(ApprovalGate::new()),
            providers,
            config(),
        ))
    }

    fn supervisor() -> (Arc<SessionSupervisor>, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        (supervisor_with(store.clone(), Arc::new(OsProcessControl::new())), store)
    }

    fn script(cwd: &Path, body: &str) -> StartSessionRequest {
        StartSessionRequest {
            provider: "sh".into(),
            cwd: Some(cwd.to_path_buf()),
            args: vec!["-c".into(), body.into()],
            ..StartSessionRequest::default()
        }
    }

    async fn wait_until(
        supervisor: &SessionSupervisor,
        id: &SessionId,
        done: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        for _ in 0..200 {
            let snapshot = supervisor.get(id).await.unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("session {id} never reached the expected state");
    }

    fn id_of(snapshot: &SessionSnapshot) -> SessionId {
        snapshot.id.parse().unwrap()
    }

    #[tokio::test]
    async fn start_validates_request() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();

        let missing = StartSessionRequest::default();
        assert!(matches!(
            supervisor.start(missing).await,
            Err(SupervisorError::Invalid(message)) if message.contains("provider is required")
        ));

        let unknown = StartSessionRequest {
            provider: "nope".into(),
            ..script(dir.path(), "true")
        };
        assert!(matches!(
            supervisor.start(unknown).await,
            Err(SupervisorError::Invalid(_))
        ));

        let bad_cwd = script(&dir.path().join("missing"), "true");
        assert!(matches!(
            supervisor.start(bad_cwd).await,
            Err(SupervisorError::Invalid(_))
        ));

        let bad_cmd = StartSessionRequest {
            cmd: Some("definitely-not-a-real-binary-7717".into()),
            ..script(dir.path(), "true")
        };
        assert!(matches!(
            supervisor.start(bad_cmd).await,
            Err(SupervisorError::Invalid(_))
        ));
        assert!(supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn clean_exit_captures_both_streams() {
        let (supervisor, store) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor
            .start(script(dir.path(), "echo hello; echo oops >&2"))
            .await
            .unwrap();
        assert!(!started.id.is_empty());
        let id = id_of(&started);

        let ended = wait_until(&supervisor, &id, SessionSnapshot::is_terminal).await;
        assert_eq!(ended.status, SessionStatus::Exited);
        assert_eq!(ended.exit_code, Some(0));
        assert_eq!(ended.pid, None);

        let combined = supervisor.tail(&id, 50, StreamFilter::Combined).await.unwrap();
        let texts: Vec<_> = combined.iter().map(|event| event.text.as_str()).collect();
        assert!(texts.contains(&"hello") && texts.contains(&"oops"));
        let stdout = supervisor.tail(&id, 50, StreamFilter::Stdout).await.unwrap();
        assert_eq!(stdout.len(), 1);
        assert_eq!(stdout[0].stream, LogStream::Stdout);

        let persisted = store.snapshot().await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].status, SessionStatus::Exited);
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_session() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor.start(script(dir.path(), "exit 3")).await.unwrap();
        let ended = wait_until(&supervisor, &id_of(&started), SessionSnapshot::is_terminal).await;
        assert_eq!(ended.status, SessionStatus::Failed);
        assert_eq!(ended.exit_code, Some(3));
        assert_eq!(ended.failure.as_deref(), Some("exit code 3"));
    }

    #[tokio::test]
    async fn tail_returns_the_newest_lines_oldest_first() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor
            .start(script(dir.path(), "for i in 1 2 3 4 5 6 7 8 9 10; do echo line$i; done"))
            .await
            .unwrap();
        let id = id_of(&started);
        wait_until(&supervisor, &id, SessionSnapshot::is_terminal).await;

        let all = supervisor.tail(&id, 50, StreamFilter::Combined).await.unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].text, "line1");
        assert_eq!(all[9].text, "line10");
        let last = supervisor.tail(&id, 3, StreamFilter::Combined).await.unwrap();
        let texts: Vec<_> = last.iter().map(|event| event.text.as_str()).collect();
        assert_eq!(texts, vec!["line8", "line9", "line10"]);
    }

    #[tokio::test]
    async fn kill_records_killed_and_is_idempotent() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor.start(script(dir.path(), "exec sleep 30")).await.unwrap();
        assert_eq!(started.status, SessionStatus::Running);
        assert!(started.pid.is_some());
        let id = id_of(&started);

        let killed = supervisor.kill(&id).await.unwrap();
        assert_eq!(killed.status, SessionStatus::Killed);
        assert_eq!(killed.pid, None);

        let again = supervisor.kill(&id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Killed);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.get(&id).await.unwrap().status, SessionStatus::Killed);
    }

    #[tokio::test]
    async fn kill_leaves_finished_sessions_untouched() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        for (body, status, code) in [
            ("exit 0", SessionStatus::Exited, Some(0)),
            ("exit 3", SessionStatus::Failed, Some(3)),
        ] {
            let started = supervisor.start(script(dir.path(), body)).await.unwrap();
            let id = id_of(&started);
            let ended = wait_until(&supervisor, &id, SessionSnapshot::is_terminal).await;
            assert_eq!(ended.status, status, "{body}");

            let killed = supervisor.kill(&id).await.unwrap();
            assert_eq!(killed.status, status, "{body}");
            assert_eq!(killed.exit_code, code, "{body}");
            assert_eq!(killed.failure, ended.failure, "{body}");
            assert_eq!(supervisor.get(&id).await.unwrap().status, status);
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_stops_helpers_spawned_by_the_agent() {
        use crate::adapters::process::still_running;

        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor
            .start(script(dir.path(), "sleep 30 & echo $!; wait"))
            .await
            .unwrap();
        let id = id_of(&started);

        let mut helper = None;
        for _ in 0..200 {
            let lines = supervisor.tail(&id, 1, StreamFilter::Stdout).await.unwrap();
            if let Some(line) = lines.first() {
                helper = Some(line.text.trim().parse::<u32>().unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let helper = helper.expect("agent never printed its helper pid");
        assert!(still_running(helper));

        supervisor.kill(&id).await.unwrap();
        for _ in 0..200 {
            if !still_running(helper) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("helper {helper} outlived its killed session");
    }

    #[tokio::test]
    async fn terminal_sessions_ignore_exit_marks_and_interrupts() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor.start(script(dir.path(), "exit 0")).await.unwrap();
        let id = id_of(&started);
        wait_until(&supervisor, &id, SessionSnapshot::is_terminal).await;

        let marked = supervisor.mark_exited(&id, Some(9)).await.unwrap();
        assert_eq!(marked.status, SessionStatus::Exited);
        supervisor.interrupt(&id).await.unwrap();
        assert!(matches!(
            supervisor.send_message(&id, "hi").await,
            Err(SupervisorError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn mark_exited_with_code_fails_running_session() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor.start(script(dir.path(), "exec sleep 30")).await.unwrap();
        let id = id_of(&started);
        let marked = supervisor.mark_exited(&id, Some(2)).await.unwrap();
        assert_eq!(marked.status, SessionStatus::Failed);
        assert_eq!(marked.exit_code, Some(2));
        supervisor.kill(&id).await.unwrap();
        if let Some(pid) = started.pid {
            OsProcessControl::new().signal(pid, Signal::Kill).unwrap();
        }
    }

    #[tokio::test]
    async fn send_message_reaches_stdin() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor
            .start(script(dir.path(), "read line; echo \"echo:$line\""))
            .await
            .unwrap();
        let id = id_of(&started);
        supervisor.send_message(&id, "hi there").await.unwrap();
        wait_until(&supervisor, &id, SessionSnapshot::is_terminal).await;
        let lines = supervisor.tail(&id, 10, StreamFilter::Stdout).await.unwrap();
        assert_eq!(lines.last().map(|event| event.text.as_str()), Some("echo:hi there"));
    }

    #[tokio::test]
    async fn approval_round_trip_unblocks_the_agent() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let request =
            r#"{"id":7,"method":"item/commandExecution/requestApproval","params":{"command":"ls"}}"#;
        let started = supervisor
            .start(script(
                dir.path(),
                &format!("echo '{request}'; read reply; echo \"got:$reply\""),
            ))
            .await
            .unwrap();
        let id = id_of(&started);

        let mut pending = Vec::new();
        for _ in 0..200 {
            pending = supervisor.list_approvals(&id).await.unwrap();
            if !pending.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, RequestId::Number(7));
        assert_eq!(pending[0].params, json!({"command": "ls"}));

        let decide = DecideRequest {
            request_id: RequestId::Number(7),
            decision: Decision::Accept,
            responses: None,
        };
        supervisor.decide_approval(&id, decide.clone()).await.unwrap();
        assert!(matches!(
            supervisor.decide_approval(&id, decide).await,
            Err(SupervisorError::Approval(ApprovalError::NotFound { .. }))
        ));

        wait_until(&supervisor, &id, SessionSnapshot::is_terminal).await;
        let lines = supervisor.tail(&id, 10, StreamFilter::Stdout).await.unwrap();
        let reply = lines
            .iter()
            .find_map(|event| event.text.strip_prefix("got:"))
            .unwrap();
        let reply: serde_json::Value = serde_json::from_str(reply).unwrap();
        assert_eq!(reply, json!({"id": 7, "result": {"decision": "accept"}}));
        assert!(supervisor.items(&id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn item_notifications_feed_the_item_stream() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let line = r#"{"method":"item/completed","params":{"item":{"type":"agentMessage"}}}"#;
        let started = supervisor
            .start(script(dir.path(), &format!("echo '{line}'")))
            .await
            .unwrap();
        let id = id_of(&started);
        wait_until(&supervisor, &id, SessionSnapshot::is_terminal).await;

        let items = supervisor.items(&id, 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, "completed");
        assert_eq!(items[0].item, json!({"type": "agentMessage"}));

        let methods: Vec<_> = supervisor
            .events(&id, 50)
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.method)
            .collect();
        assert!(methods.contains(&"item/completed".to_string()));
        assert_eq!(methods[0], "session/statusChanged");
    }

    #[tokio::test]
    async fn follow_ends_when_session_ends() {
        let (supervisor, _) = supervisor();
        let dir = TempDir::new().unwrap();
        let started = supervisor
            .start(script(dir.path(), "sleep 0.2; echo done"))
            .await
            .unwrap();
        let id = id_of(&started);
        let mut subscription = supervisor
            .subscribe_logs(&id, StreamFilter::Combined, 0)
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(5), subscription.recv())
                .await
                .unwrap()
        {
            seen.push(event.text);
        }
        assert_eq!(seen, vec!["done"]);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (supervisor, _) = supervisor();
        let id = SessionId::new();
        assert!(matches!(supervisor.get(&id).await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(supervisor.kill(&id).await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(
            supervisor.tail(&id, 5, StreamFilter::Combined).await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    fn persisted(status: SessionStatus, pid: Option<u32>, ticks: Option<u64>) -> SessionSnapshot {
        SessionSnapshot {
            id: SessionId::new().to_string(),
            provider: "codex".into(),
            command: "/usr/bin/codex".into(),
            args: vec!["app-server".into()],
            env: Default::default(),
            cwd: PathBuf::from("/tmp"),
            status,
            pid,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            exited_at: None,
            title: None,
            tags: Vec::new(),
            failure: None,
            orphan_reason: None,
            process_start_ticks: ticks,
        }
    }

    #[tokio::test]
    async fn restore_applies_orphan_policy() {
        let adopted = persisted(SessionStatus::Running, Some(10), Some(500));
        let gone = persisted(SessionStatus::Running, Some(11), Some(600));
        let reused = persisted(SessionStatus::Running, Some(12), Some(700));
        let starting = persisted(SessionStatus::Starting, None, None);
        let finished = persisted(SessionStatus::Exited, None, None);
        let mut broken = persisted(SessionStatus::Running, Some(13), None);
        broken.id = "not-a-uuid".into();

        let processes = FakeProcesses::with(10, Some(500));
        processes.live.lock().insert(12, Some(9999));
        let store = Arc::new(InMemorySessionStore::with_sessions(vec![
            adopted.clone(),
            gone.clone(),
            reused.clone(),
            starting.clone(),
            finished.clone(),
            broken,
        ]));
        let supervisor = supervisor_with(store.clone(), Arc::new(processes));

        let report = supervisor.restore().await.unwrap();
        assert_eq!(
            report,
            RestoreReport {
                adopted: 1,
                orphaned: 3,
                terminal: 1,
                skipped: 1,
            }
        );

        let status = |snapshot: &SessionSnapshot| {
            let id: SessionId = snapshot.id.parse().unwrap();
            let supervisor = supervisor.clone();
            async move { supervisor.get(&id).await.unwrap() }
        };
        let adopted_now = status(&adopted).await;
        assert_eq!(adopted_now.status, SessionStatus::Running);
        assert_eq!(adopted_now.pid, Some(10));
        assert_eq!(
            status(&gone).await.orphan_reason,
            Some(OrphanReason::ProcessMissing)
        );
        assert_eq!(
            status(&reused).await.orphan_reason,
            Some(OrphanReason::PidReused)
        );
        assert_eq!(status(&starting).await.status, SessionStatus::Orphaned);
        assert_eq!(status(&finished).await.status, SessionStatus::Exited);
        assert_eq!(store.snapshot().await.len(), 5);
    }

    #[tokio::test]
    async fn adopted_session_can_be_killed() {
        let adopted = persisted(SessionStatus::Running, Some(10), Some(500));
        let processes = Arc::new(FakeProcesses::with(10, Some(500)));
        let supervisor = supervisor_with(
            Arc::new(InMemorySessionStore::with_sessions(vec![adopted.clone()])),
            processes.clone(),
        );
        supervisor.restore().await.unwrap();

        let id = id_of(&adopted);
        assert!(matches!(
            supervisor.send_message(&id, "hello").await,
            Err(SupervisorError::Invalid(_))
        ));
        let killed = supervisor.kill(&id).await.unwrap();
        assert_eq!(killed.status, SessionStatus::Killed);
        assert_eq!(processes.signals.lock().as_slice(), &[(10, Signal::Terminate)]);
    }

    #[tokio::test]
    async fn adopted_session_is_orphaned_when_its_process_disappears() {
        let adopted = persisted(SessionStatus::Running, Some(10), Some(500));
        let processes = Arc::new(FakeProcesses::with(10, Some(500)));
        let supervisor = supervisor_with(
            Arc::new(InMemorySessionStore::with_sessions(vec![adopted.clone()])),
            processes.clone(),
        );
        supervisor.restore().await.unwrap();
        let id = id_of(&adopted);
        assert_eq!(supervisor.get(&id).await.unwrap().status, SessionStatus::Running);

        processes.live.lock().remove(&10);
        let ended = wait_until(&supervisor, &id, SessionSnapshot::is_terminal).await;
        assert_eq!(ended.status, SessionStatus::Orphaned);
        assert_eq!(ended.orphan_reason, Some(OrphanReason::ProcessMissing));
    }

    #[tokio::test]
    async fn adopted_session_accepts_external_exit() {
        let adopted = persisted(SessionStatus::Running, Some(10), Some(500));
        let supervisor = supervisor_with(
            Arc::new(InMemorySessionStore::with_sessions(vec![adopted.clone()])),
            Arc::new(FakeProcesses::with(10, Some(500))),
        );
        supervisor.restore().await.unwrap();
        let marked = supervisor.mark_exited(&id_of(&adopted), None).await.unwrap();
        assert_eq!(marked.status, SessionStatus::Exited);
    }
}
