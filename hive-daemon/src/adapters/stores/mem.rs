use crate::ports::stores::SessionStore;
use anyhow::Result;
use async_trait::async_trait;
use hive_protocol::SessionSnapshot;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<Vec<SessionSnapshot>>,
    saves: RwLock<usize>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: Vec<SessionSnapshot>) -> Self {
        Self {
            sessions: RwLock::new(sessions),
            saves: RwLock::new(0),
        }
    }

    pub async fn save_count(&self) -> usize {
        *self.saves.read().await
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions.read().await.clone()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self) -> Result<Vec<SessionSnapshot>> {
        Ok(self.sessions.read().await.clone())
    }

    async fn save(&self, sessions: &[SessionSnapshot]) -> Result<()> {
        *self.sessions.write().await = sessions.to_vec();
        *self.saves.write().await += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_roundtrip() {
        let store = InMemorySessionStore::new();
        assert!(store.load().await.unwrap().is_empty());
        store.save(&[]).await.unwrap();
        assert_eq!(store.save_count().await, 1);
    }
}
