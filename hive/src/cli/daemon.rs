use crate::cli::{mismatch_hint, Context};
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use hive_client::{DaemonBootstrap, DaemonControl, DetachedLauncher, KillOutcome};
use hive_daemon::telemetry::{init_logging, LogDestination};
use hive_daemon::Settings;
use std::ffi::OsString;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const STOP_POLL_ATTEMPTS: u32 = 20;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Parser, Clone)]
pub struct DaemonCommand {
    /// Start the daemon in the background and return once it answers.
    #[arg(long, conflicts_with = "kill")]
    background: bool,

    /// Stop the running daemon.
    #[arg(long)]
    kill: bool,

    /// Replace a daemon that is already running.
    #[arg(long, conflicts_with = "kill")]
    force: bool,

    /// Provider override as NAME=COMMAND; may be repeated. HIVE_PROVIDERS
    /// takes a ';'-separated list.
    #[arg(
        long = "provider",
        env = "HIVE_PROVIDERS",
        value_delimiter = ';',
        value_name = "NAME=COMMAND"
    )]
    providers: Vec<String>,

    /// Events buffered per live subscriber before new ones are dropped.
    #[arg(long, env = "HIVE_SUBSCRIBER_CAPACITY")]
    subscriber_capacity: Option<usize>,

    /// Output lines kept per session for tail.
    #[arg(long)]
    history_limit: Option<usize>,

    /// Milliseconds between SIGTERM and SIGKILL when killing a session.
    #[arg(long)]
    kill_grace_ms: Option<u64>,

    /// Append logs to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

impl DaemonCommand {
    pub async fn run(self, context: &Context) -> Result<()> {
        if self.kill {
            init_logging(LogDestination::Stderr, "warn")?;
            let bootstrap = self.bootstrap(context)?;
            let client = context.client()?;
            return self
                .stop(&bootstrap, &client, &mut io::stdout().lock())
                .await;
        }
        if self.background {
            init_logging(LogDestination::Stderr, "warn")?;
            return self.start_background(context).await;
        }
        self.run_foreground(context).await
    }

    fn settings(&self, context: &Context) -> Result<Settings> {
        let listen: SocketAddr = context
            .addr()
            .parse()
            .with_context(|| format!("--addr must be IP:PORT, got {:?}", context.addr()))?;
        let mut settings = Settings {
            listen,
            home: context.paths().root().to_path_buf(),
            providers: self.providers.clone(),
            ..Settings::default()
        };
        if let Some(capacity) = self.subscriber_capacity {
            settings.subscriber_capacity = capacity.max(1);
        }
        if let Some(limit) = self.history_limit {
            settings.history_limit = limit.max(1);
        }
        if let Some(grace) = self.kill_grace_ms {
            settings.kill_grace = Duration::from_millis(grace);
        }
        Ok(settings)
    }

    /// Daemon options to hand to a background instance.
    fn forwarded_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        for provider in &self.providers {
            args.push(OsString::from("--provider"));
            args.push(OsString::from(provider));
        }
        let numbers = [
            ("--subscriber-capacity", self.subscriber_capacity.map(|v| v as u64)),
            ("--history-limit", self.history_limit.map(|v| v as u64)),
            ("--kill-grace-ms", self.kill_grace_ms),
        ];
        for (flag, value) in numbers {
            if let Some(value) = value {
                args.push(OsString::from(flag));
                args.push(OsString::from(value.to_string()));
            }
        }
        args
    }

    fn bootstrap(&self, context: &Context) -> Result<DaemonBootstrap> {
        let launcher = DetachedLauncher::current_exe(context.addr(), context.paths().root())?
            .with_extra_args(self.forwarded_args());
        Ok(context.bootstrap(launcher))
    }

    async fn stop(
        &self,
        bootstrap: &DaemonBootstrap,
        api: &dyn DaemonControl,
        out: &mut dyn Write,
    ) -> Result<()> {
        match bootstrap.kill_daemon(api).await? {
            KillOutcome::ShutdownRequested => writeln!(out, "daemon shutting down")?,
            KillOutcome::Signalled(pid) => writeln!(out, "sent SIGTERM to daemon pid {pid}")?,
            KillOutcome::NotRunning => writeln!(out, "daemon not running")?,
        }
        Ok(())
    }

    async fn start_background(&self, context: &Context) -> Result<()> {
        let client = context.client()?;
        let health = self
            .bootstrap(context)?
            .ensure(&client, hive_version::hive_version(), self.force)
            .await
            .map_err(mismatch_hint)?;
        println!(
            "daemon running at {} (pid {}, version {})",
            context.addr(),
            health.pid,
            health.version
        );
        Ok(())
    }

    async fn run_foreground(&self, context: &Context) -> Result<()> {
        let destination = match &self.log_file {
            Some(path) => LogDestination::File(path.clone()),
            None => LogDestination::Stderr,
        };
        let log = init_logging(destination, "info")?;
        let settings = self.settings(context)?;

        let client = context.client()?;
        match client.health().await {
            Ok(health) if self.force => {
                info!(pid = health.pid, version = %health.version, "replacing running daemon");
                self.bootstrap(context)?.kill_daemon(&client).await?;
                wait_until_down(&client).await?;
            }
            Ok(health) => bail!(
                "a daemon is already running at {} (pid {}, version {}); use --force to replace it",
                context.addr(),
                health.pid,
                health.version
            ),
            Err(err) if err.is_daemon_unavailable() => {}
            Err(err) => return Err(err.into()),
        }

        hive_daemon::run(settings, &log).await
    }
}

async fn wait_until_down(api: &dyn DaemonControl) -> Result<()> {
    for _ in 0..STOP_POLL_ATTEMPTS {
        match api.health().await {
            Err(err) if err.is_daemon_unavailable() => return Ok(()),
            _ => tokio::time::sleep(STOP_POLL_INTERVAL).await,
        }
    }
    bail!("the running daemon did not stop")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::fake::FakeApi;
    use crate::cli::{Cli, Command};
    use hive_client::OsSignaller;
    use std::sync::Arc;

    fn daemon(args: &[&str]) -> DaemonCommand {
        let mut argv = vec!["hive", "daemon"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Daemon(cmd) => cmd,
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn context() -> Context {
        Context::new("127.0.0.1:7799", Some(PathBuf::from("/tmp/hive-cli-test")), false).unwrap()
    }

    #[test]
    fn flags_map_onto_settings() {
        let cmd = daemon(&[
            "--provider",
            "codex=sh -c 'echo hi'",
            "--subscriber-capacity",
            "8",
            "--kill-grace-ms",
            "250",
        ]);
        let settings = cmd.settings(&context()).unwrap();
        assert_eq!(settings.listen, "127.0.0.1:7799".parse::<SocketAddr>().unwrap());
        assert_eq!(settings.home, PathBuf::from("/tmp/hive-cli-test"));
        assert_eq!(settings.providers, vec!["codex=sh -c 'echo hi'"]);
        assert_eq!(settings.subscriber_capacity, 8);
        assert_eq!(settings.kill_grace, Duration::from_millis(250));
        assert_eq!(settings.history_limit, Settings::default().history_limit);

        let forwarded = cmd.forwarded_args();
        assert_eq!(forwarded[0], "--provider");
        assert_eq!(forwarded[1], "codex=sh -c 'echo hi'");
        assert!(forwarded.contains(&OsString::from("--subscriber-capacity")));
        assert!(!forwarded.contains(&OsString::from("--history-limit")));
    }

    #[test]
    fn hostname_address_is_rejected() {
        let context =
            Context::new("localhost:7717", Some(PathBuf::from("/tmp/hive-cli-test")), false)
                .unwrap();
        let err = daemon(&[]).settings(&context).unwrap_err();
        assert!(err.to_string().contains("IP:PORT"));
    }

    #[test]
    fn kill_conflicts_with_background() {
        assert!(Cli::try_parse_from(["hive", "daemon", "--kill", "--background"]).is_err());
    }

    #[tokio::test]
    async fn kill_reports_graceful_shutdown() {
        let cmd = daemon(&["--kill"]);
        let launcher = DetachedLauncher::new(
            PathBuf::from("/nonexistent/hive"),
            Vec::new(),
            PathBuf::from("/tmp/hive-cli-test/daemon.log"),
        );
        let bootstrap = DaemonBootstrap::new(Arc::new(launcher), Arc::new(OsSignaller));
        let mut buf: Vec<u8> = Vec::new();
        cmd.stop(&bootstrap, &FakeApi::default(), &mut buf)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "daemon shutting down\n");
    }
}
