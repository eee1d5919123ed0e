use crate::cli::{parse_env, resolve_relative_cwd};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueHint};
use hive_client::DaemonApi;
use hive_protocol::{SessionSnapshot, StartSessionRequest};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
pub struct PsCommand {
    /// Hide sessions that have already ended.
    #[arg(long)]
    active: bool,

    /// Print the session list as JSON.
    #[arg(long)]
    json: bool,
}

impl PsCommand {
    pub async fn run(self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        let mut sessions = api.list_sessions().await?;
        if self.active {
            sessions.retain(|session| !session.is_terminal());
        }
        if self.json {
            writeln!(out, "{}", serde_json::to_string_pretty(&sessions)?)?;
        } else {
            write!(out, "{}", render_sessions(&sessions, Some(Utc::now())))?;
        }
        Ok(())
    }
}

/// Fixed-width session table. The age column is left out when `now` is
/// `None`, which keeps the output stable between refreshes.
pub fn render_sessions(sessions: &[SessionSnapshot], now: Option<DateTime<Utc>>) -> String {
    if sessions.is_empty() {
        return "no sessions\n".to_string();
    }
    let mut table = String::new();
    let header = match now {
        Some(_) => format!(
            "{:<36}  {:<9}  {:>7}  {:<10}  {:>5}  TITLE\n",
            "ID", "STATUS", "PID", "PROVIDER", "AGE"
        ),
        None => format!(
            "{:<36}  {:<9}  {:>7}  {:<10}  TITLE\n",
            "ID", "STATUS", "PID", "PROVIDER"
        ),
    };
    table.push_str(&header);
    for session in sessions {
        let pid = session
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut title = session.title.clone().unwrap_or_default();
        if let Some(reason) = session.orphan_reason {
            title = format!("{title} ({reason})").trim().to_string();
        } else if let Some(failure) = &session.failure {
            title = format!("{title} ({failure})").trim().to_string();
        }
        let row = match now {
            Some(now) => format!(
                "{:<36}  {:<9}  {:>7}  {:<10}  {:>5}  {}\n",
                session.id,
                session.status,
                pid,
                session.provider,
                format_age(now, session.created_at),
                title
            ),
            None => format!(
                "{:<36}  {:<9}  {:>7}  {:<10}  {}\n",
                session.id, session.status, pid, session.provider, title
            ),
        };
        table.push_str(&row);
    }
    table
}

fn format_age(now: DateTime<Utc>, since: DateTime<Utc>) -> String {
    let seconds = (now - since).num_seconds().max(0);
    match seconds {
        0..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m", seconds / 60),
        3600..=86399 => format!("{}h", seconds / 3600),
        _ => format!("{}d", seconds / 86400),
    }
}

#[derive(Debug, Parser, Clone)]
pub struct StartCommand {
    /// Provider name (for example codex or claude).
    #[arg(long)]
    provider: String,

    /// Working directory for the session; defaults to the daemon's.
    #[arg(long, value_hint = ValueHint::DirPath)]
    cwd: Option<PathBuf>,

    /// Command line to run instead of the provider's default.
    #[arg(long)]
    cmd: Option<String>,

    /// Human-readable title shown by ps.
    #[arg(long)]
    title: Option<String>,

    /// Tag the session; may be repeated.
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Environment variables (KEY=VALUE).
    #[arg(long = "env", value_parser = parse_env, value_name = "KEY=VALUE")]
    env: Vec<(String, String)>,

    /// Extra arguments appended to the command line.
    #[arg(last = true, value_hint = ValueHint::CommandWithArguments)]
    args: Vec<String>,
}

impl StartCommand {
    pub async fn run(self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        let provider = self.provider.trim().to_string();
        if provider.is_empty() {
            return Err(anyhow!("--provider must not be empty"));
        }
        let request = StartSessionRequest {
            provider,
            cwd: resolve_relative_cwd(self.cwd)?,
            cmd: self.cmd,
            args: self.args,
            env: self.env.into_iter().collect(),
            title: self.title,
            tags: self.tags,
        };
        let session = api.start_session(&request).await?;
        writeln!(out, "{}", session.id)?;
        Ok(())
    }
}

#[derive(Debug, Parser, Clone)]
pub struct KillCommand {
    /// Session to kill.
    id: String,
}

impl KillCommand {
    pub async fn run(self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        let session = api.kill_session(&self.id).await?;
        writeln!(out, "{} {}", session.id, session.status)?;
        Ok(())
    }
}

#[derive(Debug, Parser, Clone)]
pub struct InterruptCommand {
    /// Session to interrupt.
    id: String,
}

impl InterruptCommand {
    pub async fn run(self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        api.interrupt_session(&self.id).await?;
        writeln!(out, "interrupt sent to {}", self.id)?;
        Ok(())
    }
}

#[derive(Debug, Parser, Clone)]
pub struct SendCommand {
    /// Target session.
    id: String,

    /// Message text; multiple words are joined with spaces.
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
}

impl SendCommand {
    pub async fn run(self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        let text = self.text.join(" ");
        api.send_message(&self.id, &text).await?;
        writeln!(out, "sent {} bytes to {}", text.len(), self.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::fake::{snapshot, FakeApi};
    use crate::cli::{Cli, Command};
    use hive_protocol::SessionStatus;

    fn parse(args: &[&str]) -> Command {
        let mut argv = vec!["hive"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().command
    }

    #[tokio::test]
    async fn start_then_ps_shows_the_session() {
        let api = FakeApi::default();
        let Command::Start(start) = parse(&[
            "start",
            "--provider",
            "codex",
            "--cwd",
            "/tmp/p",
            "--title",
            "demo",
            "--tag",
            "a",
            "--tag",
            "b",
            "--env",
            "K=V",
            "--",
            "--model",
            "o3",
        ]) else {
            panic!("expected start");
        };
        let mut buf: Vec<u8> = Vec::new();
        start.run(&api, &mut buf).await.unwrap();
        let id = String::from_utf8(buf).unwrap().trim().to_string();
        assert!(!id.is_empty());

        let request = api.started.lock()[0].clone();
        assert_eq!(request.provider, "codex");
        assert_eq!(request.cwd, Some(PathBuf::from("/tmp/p")));
        assert_eq!(request.title.as_deref(), Some("demo"));
        assert_eq!(request.tags, vec!["a", "b"]);
        assert_eq!(request.env.get("K").map(String::as_str), Some("V"));
        assert_eq!(request.args, vec!["--model", "o3"]);

        let mut buf: Vec<u8> = Vec::new();
        PsCommand {
            active: false,
            json: false,
        }
        .run(&api, &mut buf)
        .await
        .unwrap();
        let table = String::from_utf8(buf).unwrap();
        let row = table.lines().find(|line| line.starts_with(&id)).unwrap();
        assert!(row.contains("starting") || row.contains("running"), "{row}");
        assert!(row.contains("demo"));
    }

    #[tokio::test]
    async fn killed_session_has_no_pid() {
        let api = FakeApi::default().with_session(snapshot("s1", SessionStatus::Running));
        let mut buf: Vec<u8> = Vec::new();
        KillCommand { id: "s1".into() }
            .run(&api, &mut buf)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "s1 killed\n");

        let mut buf: Vec<u8> = Vec::new();
        PsCommand {
            active: false,
            json: false,
        }
        .run(&api, &mut buf)
        .await
        .unwrap();
        let table = String::from_utf8(buf).unwrap();
        let columns: Vec<&str> = table
            .lines()
            .find(|line| line.starts_with("s1"))
            .unwrap()
            .split_whitespace()
            .collect();
        assert_eq!(columns[1], "killed");
        assert_eq!(columns[2], "-");
    }

    #[tokio::test]
    async fn active_filter_and_json() {
        let api = FakeApi::default()
            .with_session(snapshot("s1", SessionStatus::Exited))
            .with_session(snapshot("s2", SessionStatus::Running));
        let mut buf: Vec<u8> = Vec::new();
        PsCommand {
            active: true,
            json: true,
        }
        .run(&api, &mut buf)
        .await
        .unwrap();
        let listed: Vec<SessionSnapshot> = serde_json::from_slice(&buf).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "s2");
    }

    #[tokio::test]
    async fn empty_provider_is_rejected_before_any_call() {
        let api = FakeApi::default();
        let Command::Start(start) = parse(&["start", "--provider", " "]) else {
            panic!("expected start");
        };
        let err = start.run(&api, &mut Vec::<u8>::new()).await.unwrap_err();
        assert!(err.to_string().contains("provider"));
        assert!(api.started.lock().is_empty());
    }

    #[test]
    fn malformed_env_is_a_usage_error() {
        let err = Cli::try_parse_from(["hive", "start", "--provider", "codex", "--env", "oops"])
            .unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }

    #[tokio::test]
    async fn send_joins_words_and_unknown_session_fails() {
        let api = FakeApi::default().with_session(snapshot("s1", SessionStatus::Running));
        let Command::Send(send) = parse(&["send", "s1", "hello", "there"]) else {
            panic!("expected send");
        };
        send.run(&api, &mut Vec::<u8>::new()).await.unwrap();
        assert_eq!(
            api.sent.lock().clone(),
            vec![("s1".to_string(), "hello there".to_string())]
        );

        let err = InterruptCommand { id: "nope".into() }
            .run(&api, &mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn table_marks_orphans_and_ages() {
        let mut orphan = snapshot("s9", SessionStatus::Orphaned);
        orphan.orphan_reason = Some(hive_protocol::OrphanReason::PidReused);
        let now = orphan.created_at + chrono::Duration::seconds(125);
        let table = render_sessions(&[orphan], Some(now));
        let row = table.lines().nth(1).unwrap();
        assert!(row.contains("orphaned"));
        assert!(row.contains("2m"));
        assert!(row.contains("(pid_reused)"));
        assert_eq!(render_sessions(&[], None), "no sessions\n");
    }
}
