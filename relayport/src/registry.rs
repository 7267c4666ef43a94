//! In-memory registry of live tunnel sessions.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{RegistryError, TunnelError};
use crate::session::{SessionId, SessionState, TunnelSession};

/// Snapshot of one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub subdomain: String,
    pub target_port: u16,
    pub relay_host: String,
    pub relay_port: u16,
    pub ingress_port: Option<u16>,
    pub state: SessionState,
}

impl SessionInfo {
    fn of(session: &TunnelSession) -> Self {
        let config = session.config();
        Self {
            id: session.id().clone(),
            subdomain: session.subdomain().to_string(),
            target_port: config.target_port(),
            relay_host: config.relay_host().to_string(),
            relay_port: config.relay_port(),
            ingress_port: session.ingress_port(),
            state: session.state(),
        }
    }
}

type Sessions = Arc<Mutex<HashMap<SessionId, Arc<TunnelSession>>>>;

/// Owned by whoever issues lifecycle commands; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Sessions,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `session` until it stops, by any path.
    pub async fn add(&self, session: Arc<TunnelSession>) -> Result<SessionId, RegistryError> {
        let id = session.id().clone();
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&id) {
                return Err(RegistryError::DuplicateId(id));
            }
            sessions.insert(id.clone(), session.clone());
        }

        tokio::spawn(forget_when_stopped(self.sessions.clone(), session));
        debug!("Registered session {}", id);
        Ok(id)
    }

    /// Detaches and stops the session. Unknown ids are ignored.
    pub async fn remove(&self, id: &SessionId) -> Result<(), TunnelError> {
        let session = self.sessions.lock().await.remove(id);
        match session {
            Some(session) => session.stop().await,
            None => Ok(()),
        }
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<TunnelSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| SessionInfo::of(s)).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops every session concurrently and waits for all of them. One
    /// failure does not prevent the others from stopping.
    pub async fn stop_all(&self) -> Vec<(SessionId, TunnelError)> {
        let drained: Vec<Arc<TunnelSession>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        info!("Stopping {} tunnel(s)", drained.len());

        let results = join_all(drained.iter().map(|session| session.stop())).await;
        drained
            .iter()
            .zip(results)
            .filter_map(|(session, result)| result.err().map(|e| (session.id().clone(), e)))
            .collect()
    }
}

async fn forget_when_stopped(sessions: Sessions, session: Arc<TunnelSession>) {
    session.stopped().await;

    let mut sessions = sessions.lock().await;
    let still_ours = sessions
        .get(session.id())
        .is_some_and(|tracked| Arc::ptr_eq(tracked, &session));
    if still_ours {
        sessions.remove(session.id());
        debug!("Session {} stopped; removed from registry", session.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;

    fn session(id: &str, port: u16) -> Arc<TunnelSession> {
        let config = TunnelConfig::new(port, Some(format!("app-{port}")), "relay.test", 8080).unwrap();
        TunnelSession::with_id(id.into(), config).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let registry = SessionRegistry::new();
        registry.add(session("b", 3001)).await.unwrap();
        registry.add(session("a", 3000)).await.unwrap();

        let list = registry.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id.as_str(), "a");
        assert_eq!(list[0].subdomain, "app-3000");
        assert_eq!(list[0].target_port, 3000);
        assert_eq!(list[0].relay_host, "relay.test");
        assert_eq!(list[1].id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let registry = SessionRegistry::new();
        registry.add(session("same", 3000)).await.unwrap();
        let err = registry.add(session("same", 3001)).await.unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId("same".into()));

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].target_port, 3000);
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let registry = SessionRegistry::new();
        registry.add(session("a", 3000)).await.unwrap();
        let snapshot = registry.list().await;

        registry.remove(&"a".into()).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_stops_session_and_ignores_unknown() {
        let registry = SessionRegistry::new();
        let s = session("a", 3000);
        registry.add(s.clone()).await.unwrap();

        registry.remove(&"missing".into()).await.unwrap();
        assert_eq!(registry.len().await, 1);

        registry.remove(&"a".into()).await.unwrap();
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(registry.get(&"a".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let registry = SessionRegistry::new();
        let sessions: Vec<_> = (0..5).map(|i| session(&format!("s{i}"), 3000 + i)).collect();
        for s in &sessions {
            registry.add(s.clone()).await.unwrap();
        }

        let failures = registry.stop_all().await;
        assert!(failures.is_empty());
        assert!(registry.is_empty().await);
        assert!(sessions.iter().all(|s| s.state() == SessionState::Stopped));
    }

    #[tokio::test]
    async fn test_stopped_sessions_leave_the_registry() {
        let registry = SessionRegistry::new();
        let s = session("a", 3000);
        registry.add(s.clone()).await.unwrap();

        s.stop().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !registry.is_empty().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
