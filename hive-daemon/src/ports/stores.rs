use async_trait::async_trait;
use hive_protocol::SessionSnapshot;

/// Durable session index. The supervisor loads it once at startup and
/// rewrites it after every lifecycle change.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<SessionSnapshot>>;
    async fn save(&self, sessions: &[SessionSnapshot]) -> anyhow::Result<()>;
}
