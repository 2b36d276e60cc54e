use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use serde::Serialize;

use crate::skein::relay::table::{StreamSnapshot, StreamTable};
use crate::skein::telemetry::now_unix_ms;

/// Registry of live relay sessions. Enforces the process-wide session limit
/// at registration time, before the WebSocket upgrade is accepted.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionHandle>,
    seq: AtomicU64,
    max_sessions: usize,
}

#[derive(Debug)]
struct SessionHandle {
    client: String,
    started_at_unix_ms: u64,
    table: Arc<StreamTable>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub client: String,
    pub started_at_unix_ms: u64,
    pub open_streams: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub streams: Vec<StreamSnapshot>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            seq: AtomicU64::new(1),
            max_sessions,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_streams(&self) -> usize {
        self.sessions.iter().map(|s| s.table.len()).sum()
    }

    /// Registers a session, or returns `None` when the limit is reached. The
    /// guard deregisters on drop, so an aborted upgrade or a panicking session
    /// task still releases its slot.
    pub fn try_register(
        self: &Arc<Self>,
        client: String,
        table: Arc<StreamTable>,
    ) -> Option<SessionGuard> {
        // Reserve first, then check: two racing registrations at the limit
        // must not both win.
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            SessionHandle {
                client,
                started_at_unix_ms: now_unix_ms(),
                table,
            },
        );
        if self.sessions.len() > self.max_sessions {
            self.sessions.remove(&id);
            return None;
        }
        Some(SessionGuard {
            registry: self.clone(),
            id,
        })
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter() {
            let (bytes_in, bytes_out) = s.table.total_bytes();
            out.push(SessionSnapshot {
                id: *s.key(),
                client: s.client.clone(),
                started_at_unix_ms: s.started_at_unix_ms,
                open_streams: s.table.len(),
                bytes_in,
                bytes_out,
                streams: s.table.snapshot(),
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }
}

/// RAII registration: dropping the guard removes the session from the
/// registry.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: u64,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<StreamTable> {
        Arc::new(StreamTable::new(8))
    }

    #[tokio::test]
    async fn limit_is_enforced_and_slots_are_released() {
        let reg = Arc::new(SessionRegistry::new(2));

        let a = reg.try_register("1.2.3.4:1000".into(), table()).unwrap();
        let _b = reg.try_register("1.2.3.4:1001".into(), table()).unwrap();
        assert!(reg
            .try_register("1.2.3.4:1002".into(), table())
            .is_none());
        assert_eq!(reg.len(), 2);

        drop(a);
        assert_eq!(reg.len(), 1);
        assert!(reg.try_register("1.2.3.4:1003".into(), table()).is_some());
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let reg = Arc::new(SessionRegistry::new(8));
        let a = reg.try_register("a".into(), table()).unwrap();
        let b = reg.try_register("b".into(), table()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn snapshot_reports_live_sessions() {
        let reg = Arc::new(SessionRegistry::new(8));
        let _a = reg.try_register("10.0.0.1:5000".into(), table()).unwrap();

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].client, "10.0.0.1:5000");
        assert_eq!(snap[0].open_streams, 0);
    }
}
