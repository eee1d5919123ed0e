use anyhow::{anyhow, Context as _, Result};
use clap::builder::FalseyValueParser;
use clap::{Parser, Subcommand};
use hive_client::{
    load_token, ClientError, DaemonBootstrap, DetachedLauncher, HttpDaemonClient, OsSignaller,
    StreamDebugLog,
};
use hive_daemon::telemetry::{init_logging, LogDestination};
use hive_daemon::token::TokenStore;
use hive_protocol::paths::HOME_ENV;
use hive_protocol::{HivePaths, ADDR_ENV, DEFAULT_LISTEN};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

mod approvals;
mod daemon;
#[cfg(test)]
mod fake;
mod sessions;
mod tail;
mod ui;

use approvals::{ApprovalsCommand, ApproveCommand};
use daemon::DaemonCommand;
use sessions::{InterruptCommand, KillCommand, PsCommand, SendCommand, StartCommand};
use tail::TailCommand;
use ui::UiCommand;

pub const STREAM_DEBUG_ENV: &str = "HIVE_STREAM_DEBUG";

#[derive(Debug, Parser)]
#[command(
    name = "hive",
    version = hive_version::hive_version(),
    about = "Run and supervise long-lived agent sessions through a background daemon"
)]
pub struct Cli {
    /// Daemon listen address (host:port).
    #[arg(long, global = true, env = ADDR_ENV, default_value = DEFAULT_LISTEN)]
    pub addr: String,

    /// State directory holding the token, logs and session index.
    #[arg(long, global = true, env = HOME_ENV, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Record raw stream traffic in stream-debug.log under the state directory.
    #[arg(
        long,
        global = true,
        env = STREAM_DEBUG_ENV,
        value_parser = FalseyValueParser::new()
    )]
    pub stream_debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the session daemon, or manage a background one.
    Daemon(DaemonCommand),
    /// List sessions.
    Ps(PsCommand),
    /// Start a new session.
    Start(StartCommand),
    /// Kill a session.
    Kill(KillCommand),
    /// Send an interrupt (SIGINT) to a session.
    Interrupt(InterruptCommand),
    /// Write a message line to a session's stdin.
    Send(SendCommand),
    /// Print or follow a session's output.
    Tail(TailCommand),
    /// List decision requests a session is waiting on.
    Approvals(ApprovalsCommand),
    /// Answer a pending decision request.
    Approve(ApproveCommand),
    /// Line-oriented live monitor of all sessions.
    Ui(UiCommand),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Daemon(_) => "daemon",
            Command::Ps(_) => "ps",
            Command::Start(_) => "start",
            Command::Kill(_) => "kill",
            Command::Interrupt(_) => "interrupt",
            Command::Send(_) => "send",
            Command::Tail(_) => "tail",
            Command::Approvals(_) => "approvals",
            Command::Approve(_) => "approve",
            Command::Ui(_) => "ui",
        }
    }
}

/// Resolved global options shared by every command.
#[derive(Clone, Debug)]
pub struct Context {
    addr: String,
    paths: HivePaths,
    stream_debug: bool,
}

impl Context {
    pub fn new(addr: &str, home: Option<PathBuf>, stream_debug: bool) -> Result<Self> {
        let paths = HivePaths::resolve(home)
            .ok_or_else(|| anyhow!("cannot determine a data directory; pass --home"))?;
        Ok(Self {
            addr: addr.trim().to_string(),
            paths,
            stream_debug,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn paths(&self) -> &HivePaths {
        &self.paths
    }

    fn debug_log(&self) -> Result<StreamDebugLog> {
        if !self.stream_debug {
            return Ok(StreamDebugLog::disabled());
        }
        let path = self.paths.stream_debug_log();
        StreamDebugLog::open(&path).with_context(|| format!("opening {}", path.display()))
    }

    /// Client for the configured address, authenticated when a token already
    /// exists. No daemon is started.
    pub fn client(&self) -> Result<HttpDaemonClient> {
        let token = load_token(&self.paths.token())?;
        Ok(HttpDaemonClient::new(&self.addr, token)?.with_debug_log(self.debug_log()?))
    }

    pub fn bootstrap(&self, launcher: DetachedLauncher) -> DaemonBootstrap {
        DaemonBootstrap::new(Arc::new(launcher), Arc::new(OsSignaller))
    }

    /// Makes sure a daemon of this build is running, then returns an
    /// authenticated client for it.
    pub async fn connect(&self, allow_restart: bool) -> Result<HttpDaemonClient> {
        let client = self.client()?;
        let launcher = DetachedLauncher::current_exe(&self.addr, self.paths.root())?;
        self.bootstrap(launcher)
            .ensure(&client, hive_version::hive_version(), allow_restart)
            .await
            .map_err(mismatch_hint)?;
        let token = TokenStore::load(&self.paths.token())?;
        Ok(client.with_token(Some(token.as_str().to_string())))
    }
}

pub(crate) fn mismatch_hint(err: ClientError) -> anyhow::Error {
    match err {
        err @ ClientError::VersionMismatch { .. } => {
            anyhow!("{err}; replace it with `hive daemon --background --force`")
        }
        err => err.into(),
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = Context::new(&cli.addr, cli.home, cli.stream_debug)?;
    match cli.command {
        Command::Daemon(cmd) => cmd.run(&context).await,
        Command::Ui(cmd) => {
            init_logging(LogDestination::File(context.paths().ui_log()), "info")?;
            cmd.run(&context).await
        }
        command => {
            init_logging(LogDestination::Stderr, "warn")?;
            let client = context.connect(false).await?;
            let mut out = io::stdout().lock();
            match command {
                Command::Ps(cmd) => cmd.run(&client, &mut out).await,
                Command::Start(cmd) => cmd.run(&client, &mut out).await,
                Command::Kill(cmd) => cmd.run(&client, &mut out).await,
                Command::Interrupt(cmd) => cmd.run(&client, &mut out).await,
                Command::Send(cmd) => cmd.run(&client, &mut out).await,
                Command::Tail(cmd) => cmd.run(&client, &mut out).await,
                Command::Approvals(cmd) => cmd.run(&client, &mut out).await,
                Command::Approve(cmd) => cmd.run(&client, &mut out).await,
                Command::Daemon(_) | Command::Ui(_) => Ok(()),
            }
        }
    }
}

/// Relative `--cwd` values are taken relative to the caller, not the daemon.
pub fn resolve_relative_cwd(cwd: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match cwd {
        Some(path) if path.is_relative() => {
            let here = std::env::current_dir().context("resolving current directory")?;
            Ok(Some(here.join(path)))
        }
        other => Ok(other),
    }
}

pub fn parse_env(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE"))?;
    if key.is_empty() {
        return Err(anyhow!("expected KEY=VALUE"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn parse_json(s: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s).context("invalid JSON payload")
}
