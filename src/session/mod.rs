// Connection/session model.
//
// Sessions carry the auto-commit flag, per-session isolation and read-only
// defaults, and the current (possibly distributed) transaction. Idle
// sessions past the timeout are reaped and their in-flight transactions
// aborted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::common::TransactionId;
use crate::error::{DbError, Result};
use crate::transaction::{IsolationLevel, TransactionManager};

pub type SessionId = u64;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
    pub database: String,
    pub auto_commit: bool,
    pub current_txn: Option<TransactionId>,
    /// Set when the current transaction spans multiple storage engines.
    pub distributed: bool,
    pub isolation_default: Option<IsolationLevel>,
    pub read_only_default: bool,
    pub last_activity: Instant,
}

impl Session {
    fn new(id: SessionId, user: &str, database: &str) -> Self {
        Self {
            id,
            user: user.to_string(),
            database: database.to_string(),
            auto_commit: true,
            current_txn: None,
            distributed: false,
            isolation_default: None,
            read_only_default: false,
            last_activity: Instant::now(),
        }
    }
}

pub struct SessionManager {
    sessions: DashMap<SessionId, Session>,
    next_id: AtomicU64,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            idle_timeout,
        }
    }

    pub fn create(&self, user: &str, database: &str) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(id, Session::new(id, user, database));
        id
    }

    pub fn get(&self, id: SessionId) -> Result<Session> {
        self.sessions
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| DbError::NotFound(format!("session {} does not exist", id)))
    }

    pub fn touch(&self, id: SessionId) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.last_activity = Instant::now();
        }
    }

    pub fn set_txn(&self, id: SessionId, txn: Option<TransactionId>, distributed: bool) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.current_txn = txn;
            session.distributed = distributed;
            session.last_activity = Instant::now();
        }
    }

    pub fn set_defaults(
        &self,
        id: SessionId,
        isolation: Option<IsolationLevel>,
        read_only: Option<bool>,
    ) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            if isolation.is_some() {
                session.isolation_default = isolation;
            }
            if let Some(ro) = read_only {
                session.read_only_default = ro;
            }
        }
    }

    pub fn close(&self, id: SessionId, txn_manager: &TransactionManager) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            if let Some(txn) = session.current_txn {
                let _ = txn_manager.abort(txn);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions idle beyond the timeout, aborting their in-flight
    /// transactions. Returns the reaped session ids.
    pub fn reap_idle(&self, txn_manager: &TransactionManager) -> Vec<SessionId> {
        let idle: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| s.last_activity.elapsed() >= self.idle_timeout)
            .map(|s| s.id)
            .collect();
        for id in &idle {
            tracing::info!(session = id, "reaping idle session");
            self.close(*id, txn_manager);
        }
        idle
    }

    /// Periodic reaper task on the engine runtime.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        txn_manager: Arc<TransactionManager>,
        handle: &tokio::runtime::Handle,
        period: Duration,
    ) {
        let sessions = Arc::clone(self);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sessions.reap_idle(&txn_manager);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::storage::AdapterRegistry;
    use crate::transaction::wal::{SyncMode, WalConfig, WalManager};
    use crate::transaction::LockManager;
    use tempfile::TempDir;

    fn txn_manager() -> (TempDir, TransactionManager) {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(
            WalManager::open(WalConfig {
                dir: dir.path().join("wal"),
                segment_size: 64 * 1024 * 1024,
                sync_mode: SyncMode::GroupSync,
                sync_interval: Duration::from_millis(10),
            })
            .unwrap(),
        );
        let catalog = Arc::new(Catalog::new());
        let adapters = Arc::new(AdapterRegistry::new(Arc::clone(&catalog)));
        let tm = TransactionManager::new(
            wal,
            Arc::new(LockManager::new(Duration::from_millis(100))),
            adapters,
            catalog,
            Duration::from_millis(100),
            Duration::from_secs(60),
            IsolationLevel::ReadCommitted,
        );
        (dir, tm)
    }

    #[test]
    fn test_session_lifecycle() {
        let (_dir, tm) = txn_manager();
        let sessions = SessionManager::new(Duration::from_secs(60));
        let id = sessions.create("app", "main");
        assert_eq!(sessions.count(), 1);

        let txn = tm.begin(None, false).unwrap();
        sessions.set_txn(id, Some(txn), false);
        assert_eq!(sessions.get(id).unwrap().current_txn, Some(txn));

        sessions.close(id, &tm);
        assert_eq!(sessions.count(), 0);
        assert!(!tm.is_active(txn));
    }

    #[test]
    fn test_missing_session_errors() {
        let sessions = SessionManager::new(Duration::from_secs(60));
        assert!(matches!(sessions.get(42), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_reap_idle_aborts_transaction() {
        let (_dir, tm) = txn_manager();
        let sessions = SessionManager::new(Duration::from_millis(10));
        let id = sessions.create("app", "main");
        let txn = tm.begin(None, false).unwrap();
        sessions.set_txn(id, Some(txn), false);

        std::thread::sleep(Duration::from_millis(30));
        let reaped = sessions.reap_idle(&tm);
        assert_eq!(reaped, vec![id]);
        assert!(!tm.is_active(txn));
        assert_eq!(sessions.count(), 0);
    }

    #[test]
    fn test_session_defaults() {
        let sessions = SessionManager::new(Duration::from_secs(60));
        let id = sessions.create("app", "main");
        sessions.set_defaults(id, Some(IsolationLevel::Serializable), Some(true));
        let session = sessions.get(id).unwrap();
        assert_eq!(session.isolation_default, Some(IsolationLevel::Serializable));
        assert!(session.read_only_default);
    }
}
