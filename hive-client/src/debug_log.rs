use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Optional JSON-lines trace of raw stream traffic, for diagnosing frames
/// that the consumer skips.
#[derive(Clone, Debug, Default)]
pub struct StreamDebugLog {
    file: Option<Arc<Mutex<File>>>,
}

impl StreamDebugLog {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    pub fn record(&self, kind: &str, detail: Value) {
        let Some(file) = &self.file else {
            return;
        };
        let entry = json!({
            "at": Utc::now().to_rfc3339(),
            "kind": kind,
            "detail": detail,
        });
        let mut line = entry.to_string();
        line.push('\n');
        if let Err(err) = file.lock().write_all(line.as_bytes()) {
            debug!(error = %err, "stream debug log write failed");
        }
    }
}
