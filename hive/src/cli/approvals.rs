use crate::cli::parse_json;
use anyhow::Result;
use clap::Parser;
use hive_client::DaemonApi;
use hive_protocol::{DecideRequest, Decision, PendingApproval, RequestId};
use serde_json::Value;
use std::io::Write;

const PARAMS_PREVIEW: usize = 120;

#[derive(Debug, Parser, Clone)]
pub struct ApprovalsCommand {
    /// Session whose pending requests to list.
    id: String,

    /// Print the full requests as JSON.
    #[arg(long)]
    json: bool,
}

impl ApprovalsCommand {
    pub async fn run(self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        let approvals = api.list_approvals(&self.id).await?;
        if self.json {
            writeln!(out, "{}", serde_json::to_string_pretty(&approvals)?)?;
            return Ok(());
        }
        if approvals.is_empty() {
            writeln!(out, "no pending approvals")?;
            return Ok(());
        }
        for approval in &approvals {
            writeln!(out, "{}", describe(approval))?;
        }
        Ok(())
    }
}

fn describe(approval: &PendingApproval) -> String {
    let mut params = approval.params.to_string();
    if params.chars().count() > PARAMS_PREVIEW {
        params = params.chars().take(PARAMS_PREVIEW).collect::<String>() + "...";
    }
    format!(
        "{}  {}  {}  {}",
        approval.request_id,
        approval.method,
        approval.created_at.format("%H:%M:%S"),
        params
    )
}

#[derive(Debug, Parser, Clone)]
pub struct ApproveCommand {
    /// Session that asked.
    id: String,

    /// Request id as listed by `hive approvals`.
    request_id: RequestId,

    /// accept, acceptForSession, decline or cancel.
    #[arg(long, default_value = "accept")]
    decision: Decision,

    /// JSON answers for user-input requests.
    #[arg(long, value_parser = parse_json)]
    responses: Option<Value>,
}

impl ApproveCommand {
    pub async fn run(self, api: &dyn DaemonApi, out: &mut dyn Write) -> Result<()> {
        let request = DecideRequest {
            request_id: self.request_id.clone(),
            decision: self.decision,
            responses: self.responses,
        };
        api.decide_approval(&self.id, &request).await?;
        writeln!(
            out,
            "{} request {} on {}",
            self.decision, self.request_id, self.id
        )?;
        Ok(())
    }
}
