use crate::cli::sessions::render_sessions;
use crate::cli::Context;
use anyhow::Result;
use clap::Parser;
use hive_client::DaemonApi;
use hive_protocol::SessionStatus;
use std::io::{self, Write};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser, Clone)]
pub struct UiCommand {
    /// Replace a running daemon that was built from a different version.
    #[arg(long)]
    restart_daemon: bool,

    /// Seconds between refreshes.
    #[arg(long, default_value_t = 2)]
    interval: u64,

    /// Print a single frame and exit.
    #[arg(long)]
    once: bool,
}

impl UiCommand {
    pub async fn run(self, context: &Context) -> Result<()> {
        let client = context.connect(self.restart_daemon).await?;
        info!(daemon = %client.base(), "monitor connected");
        let mut out = io::stdout().lock();
        self.monitor(&client, &mut out).await
    }

    /// Redraws whenever the session table or the pending approvals change.
    async fn monitor(&self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval.max(1)));
        let mut last = String::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
            let frame = render_frame(api).await?;
            if frame != last {
                write!(out, "{frame}")?;
                out.flush()?;
                last = frame;
            }
            if self.once {
                return Ok(());
            }
        }
    }
}

async fn render_frame(api: &dyn DaemonApi) -> Result<String> {
    let sessions = api.list_sessions().await?;
    let running = sessions
        .iter()
        .filter(|session| session.status == SessionStatus::Running)
        .count();
    let mut frame = format!("== {} sessions, {} running ==\n", sessions.len(), running);
    frame.push_str(&render_sessions(&sessions, None));
    for session in &sessions {
        if session.status != SessionStatus::Running {
            continue;
        }
        for approval in api.list_approvals(&session.id).await? {
            frame.push_str(&format!(
                "! {} waits on {} (request {})\n",
                session.id, approval.method, approval.request_id
            ));
        }
    }
    Ok(frame)
}
