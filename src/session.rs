//! Bookkeeping for live proxy sessions, used for log correlation and for
//! draining on shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

/// One accepted, authenticated connection with an established tunnel.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_addr: SocketAddr,
    pub username: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(client_addr: SocketAddr, username: impl Into<String>, target: impl Into<String>) -> Self {
        SessionInfo {
            client_addr,
            username: username.into(),
            target: target.into(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SessionTracker {
    active: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        SessionTracker::default()
    }

    pub async fn register(&self, info: SessionInfo) -> Uuid {
        let id = Uuid::new_v4();
        self.active.write().await.insert(id, info);
        id
    }

    pub async fn finish(&self, id: Uuid) {
        self.active.write().await.remove(&id);
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Waits for all sessions to end, giving up after `grace`. Returns
    /// whether the tracker drained completely.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.active.read().await.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SessionInfo {
        SessionInfo::new("127.0.0.1:50000".parse().unwrap(), "alice", "example.com:80")
    }

    #[tokio::test]
    async fn register_and_finish_track_the_count() {
        let tracker = SessionTracker::new();
        assert_eq!(tracker.active_count().await, 0);

        let a = tracker.register(info()).await;
        let b = tracker.register(info()).await;
        assert_eq!(tracker.active_count().await, 2);

        tracker.finish(a).await;
        assert_eq!(tracker.active_count().await, 1);
        tracker.finish(b).await;
        assert!(tracker.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn drain_gives_up_after_the_grace_period() {
        let tracker = SessionTracker::new();
        let _id = tracker.register(info()).await;
        assert!(!tracker.drain(Duration::from_millis(50)).await);
    }
}
