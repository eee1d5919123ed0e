//! Ensure-daemon protocol: make sure a reachable, version-compatible daemon
//! is running before the caller issues any other request.

use crate::api::{ClientResult, DaemonControl};
use crate::error::ClientError;
use hive_protocol::{HealthResponse, HivePaths};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Starts a daemon that outlives the caller.
pub trait DaemonLauncher: Send + Sync {
    fn launch(&self) -> ClientResult<()>;
}

/// Delivers a termination signal to a daemon that cannot be asked to stop.
pub trait ProcessSignaller: Send + Sync {
    fn terminate(&self, pid: u32) -> ClientResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Health probes after a launch.
    pub attempts: u32,
    /// Probes while waiting for a stopped daemon to go away.
    pub stop_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            stop_attempts: 10,
            interval: Duration::from_millis(150),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillOutcome {
    ShutdownRequested,
    Signalled(u32),
    NotRunning,
}

fn version_matches(expected: &str, actual: &str) -> bool {
    expected.trim().is_empty() || expected == actual
}

pub struct DaemonBootstrap {
    launcher: Arc<dyn DaemonLauncher>,
    signaller: Arc<dyn ProcessSignaller>,
    policy: PollPolicy,
}

impl DaemonBootstrap {
    pub fn new(launcher: Arc<dyn DaemonLauncher>, signaller: Arc<dyn ProcessSignaller>) -> Self {
        Self {
            launcher,
            signaller,
            policy: PollPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the health of a compatible daemon, starting one if needed. A
    /// stale daemon is replaced only when `allow_restart` is set.
    pub async fn ensure<A>(
        &self,
        api: &A,
        expected_version: &str,
        allow_restart: bool,
    ) -> ClientResult<HealthResponse>
    where
        A: DaemonControl + ?Sized,
    {
        match api.health().await {
            Ok(health) if version_matches(expected_version, &health.version) => {
                return Ok(health);
            }
            Ok(health) => {
                if !allow_restart {
                    return Err(ClientError::VersionMismatch {
                        expected: expected_version.to_string(),
                        actual: health.version,
                    });
                }
                info!(
                    running = %health.version,
                    expected = %expected_version,
                    pid = health.pid,
                    "replacing daemon with mismatched version"
                );
                self.stop_running(api, health.pid).await?;
            }
            Err(err) if err.is_daemon_unavailable() => {
                debug!(error = %err, "no daemon answered; launching one");
            }
            Err(err) => return Err(err),
        }

        self.launcher.launch()?;
        self.wait_until_healthy(api, expected_version).await
    }

    /// Stops whatever daemon answers: gracefully when it supports
    /// `/shutdown`, by signal otherwise.
    pub async fn kill_daemon<A>(&self, api: &A) -> ClientResult<KillOutcome>
    where
        A: DaemonControl + ?Sized,
    {
        match api.shutdown().await {
            Ok(()) => Ok(KillOutcome::ShutdownRequested),
            Err(err) if err.is_daemon_unavailable() => Ok(KillOutcome::NotRunning),
            Err(err) if err.is_not_found() => match api.health().await {
                Ok(health) => {
                    self.signaller.terminate(health.pid)?;
                    Ok(KillOutcome::Signalled(health.pid))
                }
                Err(err) if err.is_daemon_unavailable() || err.is_not_found() => {
                    Ok(KillOutcome::NotRunning)
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    async fn stop_running<A>(&self, api: &A, pid: u32) -> ClientResult<()>
    where
        A: DaemonControl + ?Sized,
    {
        match api.shutdown().await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!(pid, "daemon has no shutdown endpoint; signalling it");
                self.signaller.terminate(pid)?;
            }
            Err(err) if err.is_daemon_unavailable() => return Ok(()),
            Err(err) => return Err(err),
        }
        for _ in 0..self.policy.stop_attempts {
            tokio::time::sleep(self.policy.interval).await;
            match api.health().await {
                Err(err) if err.is_daemon_unavailable() => return Ok(()),
                _ => continue,
            }
        }
        warn!(pid, "old daemon did not confirm shutdown; starting a new one anyway");
        Ok(())
    }

    async fn wait_until_healthy<A>(
        &self,
        api: &A,
        expected_version: &str,
    ) -> ClientResult<HealthResponse>
    where
        A: DaemonControl + ?Sized,
    {
        let mut last_error = None;
        for _ in 0..self.policy.attempts {
            tokio::time::sleep(self.policy.interval).await;
            match api.health().await {
                Ok(health) if version_matches(expected_version, &health.version) => {
                    info!(pid = health.pid, version = %health.version, "daemon is up");
                    return Ok(health);
                }
                Ok(health) => {
                    debug!(version = %health.version, "daemon answered with another version");
                    last_error = None;
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or(ClientError::NotHealthy))
    }
}

/// Re-executes the current binary as `daemon` in a new session, without a
/// controlling terminal, with output appended to the daemon log.
#[derive(Clone, Debug)]
pub struct DetachedLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    log_path: PathBuf,
}

impl DetachedLauncher {
    pub fn new(program: PathBuf, args: Vec<OsString>, log_path: PathBuf) -> Self {
        Self {
            program,
            args,
            log_path,
        }
    }

    /// Appends arguments after the `daemon` subcommand options.
    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = OsString>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn current_exe(addr: &str, home: &Path) -> ClientResult<Self> {
        let program = std::env::current_exe()?;
        let args = vec![
            OsString::from("daemon"),
            OsString::from("--addr"),
            OsString::from(addr),
            OsString::from("--home"),
            home.as_os_str().to_owned(),
        ];
        Ok(Self::new(
            program,
            args,
            HivePaths::new(home).daemon_log(),
        ))
    }
}

impl DaemonLauncher for DetachedLauncher {
    fn launch(&self) -> ClientResult<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let stderr = stdout.try_clone()?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: the hook only calls setsid(2), which is async-signal-safe.
            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        let child = command.spawn()?;
        info!(
            pid = child.id(),
            log = %self.log_path.display(),
            "launched background daemon"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsSignaller;

impl ProcessSignaller for OsSignaller {
    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> ClientResult<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| ClientError::Validation(format!("invalid pid {pid}")))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err.into())
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> ClientResult<()> {
        Err(ClientError::Validation(format!(
            "cannot signal pid {pid} on this platform"
        )))
    }
}
