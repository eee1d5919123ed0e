use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "HIVE_HOME";

/// Well-known files shared by the daemon and its clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HivePaths {
    root: PathBuf,
}

impl HivePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$HIVE_HOME` when set, else `<data dir>/hive`.
    pub fn resolve(home: Option<PathBuf>) -> Option<Self> {
        home.filter(|path| !path.as_os_str().is_empty())
            .or_else(|| dirs::data_dir().map(|dir| dir.join("hive")))
            .map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn token(&self) -> PathBuf {
        self.root.join("token")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.root.join("daemon.log")
    }

    pub fn ui_log(&self) -> PathBuf {
        self.root.join("ui.log")
    }

    pub fn stream_debug_log(&self) -> PathBuf {
        self.root.join("stream-debug.log")
    }

    pub fn sessions(&self) -> PathBuf {
        self.root.join("sessions.json")
    }
}
