use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Where formatted log lines go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogDestination {
    Stderr,
    /// Append-mode file, without ANSI colours.
    File(PathBuf),
}

/// Proof that logging is configured. Built once at process start and handed
/// to whoever needs to know where logs end up.
#[derive(Clone, Debug)]
pub struct LogHandle {
    destination: LogDestination,
}

impl LogHandle {
    pub fn destination(&self) -> &LogDestination {
        &self.destination
    }

    /// Handle for code paths that run without installing a subscriber, such as
    /// tests.
    pub fn detached() -> Self {
        Self {
            destination: LogDestination::Stderr,
        }
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides
/// `default_directive`.
pub fn init_logging(destination: LogDestination, default_directive: &str) -> Result<LogHandle> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();

    let installed = match &destination {
        LogDestination::Stderr => builder.with_writer(std::io::stderr).try_init(),
        LogDestination::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
    };
    installed.map_err(|err| anyhow!("installing log subscriber: {err}"))?;
    Ok(LogHandle { destination })
}
