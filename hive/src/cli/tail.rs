use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use hive_client::DaemonApi;
use hive_protocol::{LogEvent, LogStream, StreamFilter};
use std::io::Write;

const DEFAULT_LINES: usize = 100;

#[derive(Debug, Parser, Clone)]
pub struct TailCommand {
    /// Session to read.
    id: String,

    /// Number of recent lines. Defaults to 100, or 0 when following.
    #[arg(long, short = 'n')]
    lines: Option<usize>,

    /// Keep streaming new lines until the session ends.
    #[arg(long, short = 'f')]
    follow: bool,

    /// stdout, stderr or combined.
    #[arg(long, default_value = "combined")]
    stream: StreamFilter,

    /// Prefix each line with its stream name.
    #[arg(long)]
    label: bool,
}

impl TailCommand {
    pub async fn run(self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        if !self.follow {
            let events = api
                .tail(&self.id, self.lines.unwrap_or(DEFAULT_LINES), self.stream)
                .await?;
            for event in &events {
                self.print(out, event)?;
            }
            return Ok(());
        }

        let mut events = api
            .stream_tail(&self.id, self.lines.unwrap_or(0), self.stream)
            .await?;
        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(event) => {
                        self.print(out, &event?)?;
                        out.flush()?;
                    }
                    None => return Ok(()),
                },
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }

    fn print(&self, out: &mut dyn Write, event: &LogEvent) -> Result<()> {
        if self.label {
            let label = match event.stream {
                LogStream::Stdout => "out",
                LogStream::Stderr => "err",
            };
            writeln!(out, "[{label}] {}", event.text)?;
        } else {
            writeln!(out, "{}", event.text)?;
        }
        Ok(())
    }
}
