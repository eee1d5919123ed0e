use super::handle::SessionHandle;
use crate::app::approvals::{ApprovalError, ApprovalGate};
use crate::domain::approval::{is_decision_method, ApprovalRequest};
use crate::ports::process::{ProcessControl, Signal};
use hive_protocol::{LogStream, RequestId};
use serde_json::Value;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How the output readers ended. A read error fails the session.
pub(super) type ReaderResult = Result<(), String>;

/// Starts one reader per captured pipe.
pub(super) fn spawn_readers(
    handle: &Arc<SessionHandle>,
    child: &mut Child,
    approvals: &Arc<ApprovalGate>,
) -> Vec<JoinHandle<ReaderResult>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        let handle = handle.clone();
        let approvals = approvals.clone();
        readers.push(tokio::spawn(async move {
            read_lines(BufReader::new(stdout), |line| {
                handle_stdout_line(&handle, &approvals, line)
            })
            .await
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let handle = handle.clone();
        readers.push(tokio::spawn(async move {
            read_lines(BufReader::new(stderr), |line| {
                handle.publish_log(LogStream::Stderr, line)
            })
            .await
        }));
    }
    readers
}

async fn read_lines<R>(mut reader: R, mut on_line: impl FnMut(String)) -> ReaderResult
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return Ok(()),
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                on_line(text.trim_end_matches(['\r', '\n']).to_string());
            }
            Err(err) => return Err(format!("reading output: {err}")),
        }
    }
}

/// Every stdout line is a log line. Lines that are JSON objects with a
/// `method` additionally feed the structured stream, the item stream, or the
/// approval gate.
pub(super) fn handle_stdout_line(
    handle: &Arc<SessionHandle>,
    approvals: &Arc<ApprovalGate>,
    line: String,
) {
    let message = parse_agent_message(&line);
    handle.publish_log(LogStream::Stdout, line);
    let Some(AgentMessage {
        method,
        request_id,
        params,
    }) = message
    else {
        return;
    };

    handle.publish_agent(&method, request_id.clone(), params.clone());

    if is_decision_method(&method) {
        match request_id {
            Some(request_id) => {
                let request = ApprovalRequest::new(handle.id(), request_id, method, params);
                await_decision(handle, approvals, request);
            }
            None => debug!(
                session_id = %handle.id(),
                %method,
                "decision request without id ignored"
            ),
        }
    } else if let Some(kind) = method.strip_prefix("item/") {
        let item = params.get("item").cloned().unwrap_or(params);
        handle.publish_item(kind, item);
    }
}

struct AgentMessage {
    method: String,
    request_id: Option<RequestId>,
    params: Value,
}

fn parse_agent_message(line: &str) -> Option<AgentMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let Value::Object(mut object) = serde_json::from_str::<Value>(trimmed).ok()? else {
        return None;
    };
    let method = object.get("method")?.as_str()?.to_string();
    let request_id = object.get("id").and_then(RequestId::from_json);
    let params = object.remove("params").unwrap_or(Value::Null);
    Some(AgentMessage {
        method,
        request_id,
        params,
    })
}

/// Registers the request with the gate and parks a task that writes the
/// decision back to the agent once one arrives.
fn await_decision(
    handle: &Arc<SessionHandle>,
    approvals: &Arc<ApprovalGate>,
    request: ApprovalRequest,
) {
    let request_id = request.request_id.clone();
    let receiver = match approvals.register(request) {
        Ok(receiver) => receiver,
        Err(ApprovalError::Duplicate { .. }) => {
            warn!(session_id = %handle.id(), %request_id, "duplicate approval request ignored");
            return;
        }
        Err(err) => {
            warn!(session_id = %handle.id(), error = %err, "failed to register approval");
            return;
        }
    };
    let handle = handle.clone();
    tokio::spawn(async move {
        let Ok(outcome) = receiver.await else {
            debug!(session_id = %handle.id(), %request_id, "approval dropped without decision");
            return;
        };
        let response = outcome.response_for(&request_id).to_string();
        match handle.write_line(&response).await {
            Ok(()) => info!(
                session_id = %handle.id(),
                %request_id,
                decision = outcome.decision.as_str(),
                "approval answered"
            ),
            Err(err) => warn!(
                session_id = %handle.id(),
                %request_id,
                error = %err,
                "failed to deliver approval decision"
            ),
        }
    });
}

/// Final observation of a spawned process.
pub(super) enum ChildOutcome {
    Exited(Option<i32>),
    Signalled(String),
    WaitFailed(String),
}

/// Waits for the child to exit. Once a kill has been requested the process
/// gets `grace` to go away before its process group is force-killed.
pub(super) async fn wait_for_child(
    handle: &SessionHandle,
    child: &mut Child,
    grace: Duration,
    processes: &dyn ProcessControl,
) -> ChildOutcome {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = handle.kill_escalation_requested() => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(session_id = %handle.id(), "process ignored SIGTERM; killing");
                    if let Some(pid) = child.id() {
                        if let Err(err) = processes.signal(pid, Signal::Kill) {
                            warn!(session_id = %handle.id(), pid, error = %err, "group kill failed");
                        }
                    }
                    if let Err(err) = child.start_kill() {
                        warn!(session_id = %handle.id(), error = %err, "force kill failed");
                    }
                    child.wait().await
                }
            }
        }
    };
    match status {
        Ok(status) => classify_exit(status),
        Err(err) => ChildOutcome::WaitFailed(format!("waiting for process: {err}")),
    }
}

fn classify_exit(status: ExitStatus) -> ChildOutcome {
    if let Some(code) = status.code() {
        return ChildOutcome::Exited(Some(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ChildOutcome::Signalled(format!("terminated by signal {signal}"));
        }
    }
    ChildOutcome::Exited(None)
}

/// Waits for the readers to hit EOF so the last lines land before the session
/// turns terminal. Returns the first read error, if any.
pub(super) async fn drain_readers(readers: Vec<JoinHandle<ReaderResult>>) -> Option<String> {
    let mut failure = None;
    for reader in readers {
        match tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                failure.get_or_insert(err);
            }
            Ok(Err(join)) => {
                failure.get_or_insert(format!("output reader panicked: {join}"));
            }
            Err(_) => debug!("output reader still open after exit; leaving it detached"),
        }
    }
    failure
}
