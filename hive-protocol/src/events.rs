use crate::approval::RequestId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Stream selector for tail and follow requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFilter {
    Stdout,
    Stderr,
    #[default]
    Combined,
}

impl StreamFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFilter::Stdout => "stdout",
            StreamFilter::Stderr => "stderr",
            StreamFilter::Combined => "combined",
        }
    }

    pub fn matches(&self, stream: LogStream) -> bool {
        match self {
            StreamFilter::Combined => true,
            StreamFilter::Stdout => stream == LogStream::Stdout,
            StreamFilter::Stderr => stream == LogStream::Stderr,
        }
    }
}

impl fmt::Display for StreamFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdout" | "out" => Ok(StreamFilter::Stdout),
            "stderr" | "err" => Ok(StreamFilter::Stderr),
            "combined" | "all" | "" => Ok(StreamFilter::Combined),
            other => Err(format!(
                "unknown stream '{other}' (expected stdout, stderr or combined)"
            )),
        }
    }
}

/// One line of subprocess output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub seq: u64,
    pub session_id: String,
    pub stream: LogStream,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// A structured protocol message from the agent, or a daemon lifecycle notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub seq: u64,
    pub session_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub params: Value,
    pub at: DateTime<Utc>,
}

/// Higher-level conversation item derived from `item/*` agent messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemEvent {
    pub seq: u64,
    pub session_id: String,
    pub kind: String,
    #[serde(default)]
    pub item: Value,
    pub at: DateTime<Utc>,
}
