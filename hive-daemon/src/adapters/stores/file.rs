use crate::ports::stores::SessionStore;
use anyhow::Context;
use async_trait::async_trait;
use hive_protocol::SessionSnapshot;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const TMP_SUFFIX: &str = ".tmp";
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Session index kept as a pretty-printed JSON array, replaced atomically on
/// every save.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where [`Self::quarantine`] moves an index that could not be loaded.
    pub fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(CORRUPT_SUFFIX);
        PathBuf::from(name)
    }

    /// Moves the current index aside so the next save cannot overwrite
    /// records that failed to load. Replaces an earlier quarantined copy.
    pub async fn quarantine(&self) -> anyhow::Result<PathBuf> {
        let target = self.corrupt_path();
        fs::rename(&self.path, &target).await.with_context(|| {
            format!(
                "moving session index {} to {}",
                self.path.display(),
                target.display()
            )
        })?;
        Ok(target)
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension(format!(
            "{}{}",
            self.path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("json"),
            TMP_SUFFIX
        ))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> anyhow::Result<Vec<SessionSnapshot>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let data = fs::read(&self.path)
            .await
            .with_context(|| format!("reading session index {}", self.path.display()))?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing session index {}", self.path.display()))
    }

    async fn save(&self, sessions: &[SessionSnapshot]) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(sessions)?;
        let tmp_path = self.tmp_path();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("creating temp session index {}", tmp_path.display()))?;
        file.write_all(&json)
            .await
            .with_context(|| format!("writing temp session index {}", tmp_path.display()))?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming session index to {}", self.path.display()))?;
        Ok(())
    }
}
