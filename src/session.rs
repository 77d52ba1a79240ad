//! Receiver-side transfer sessions
//!
//! Two-tier locking: the store's id → session map sits behind one `RwLock`
//! that is held only for lookup/insert/remove, and each session guards its
//! chunk map with its own `Mutex`. Different transfers never contend, while
//! concurrent Data deliveries for the same transfer are serialized.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("sequence {seq} outside 1..={total}")]
    SequenceOutOfRange { seq: u32, total: u32 },
}

struct ChunkState {
    chunks: HashMap<u32, Vec<u8>>,
    updated_at: Instant,
}

/// One in-flight transfer
pub struct Session {
    id: String,
    filename: String,
    salt: Vec<u8>,
    total: u32,
    created_at: Instant,
    state: Mutex<ChunkState>,
}

impl Session {
    pub fn new(id: impl Into<String>, filename: impl Into<String>, salt: Vec<u8>, total: u32) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            filename: filename.into(),
            salt,
            total,
            created_at: now,
            state: Mutex::new(ChunkState {
                chunks: HashMap::new(),
                updated_at: now,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Store one chunk. A re-sent sequence replaces the earlier copy.
    ///
    /// Sequences outside `1..=total` are rejected; accepting them would leave
    /// an entry that can never count toward completeness.
    pub async fn store_chunk(&self, seq: u32, data: Vec<u8>) -> Result<(), StoreError> {
        if seq == 0 || seq > self.total {
            return Err(StoreError::SequenceOutOfRange {
                seq,
                total: self.total,
            });
        }

        let mut state = self.state.lock().await;
        state.chunks.insert(seq, data);
        state.updated_at = Instant::now();
        Ok(())
    }

    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.chunks.len() == self.total as usize
    }

    pub async fn received(&self) -> usize {
        self.state.lock().await.chunks.len()
    }

    /// Absent sequence numbers, ascending
    pub async fn missing(&self) -> Vec<u32> {
        let state = self.state.lock().await;
        (1..=self.total)
            .filter(|seq| !state.chunks.contains_key(seq))
            .collect()
    }

    pub async fn chunk(&self, seq: u32) -> Option<Vec<u8>> {
        self.state.lock().await.chunks.get(&seq).cloned()
    }

    /// Concatenate chunks `1..=total` in order.
    ///
    /// Callers must check [`Session::is_complete`] first: gaps are skipped,
    /// which yields shifted, truncated output.
    pub async fn reassemble(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let mut out = Vec::with_capacity(state.chunks.values().map(Vec::len).sum());
        for seq in 1..=self.total {
            if let Some(chunk) = state.chunks.get(&seq) {
                out.extend_from_slice(chunk);
            }
        }
        out
    }
}

/// Id → session map shared by the dispatcher and the idle sweep
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Insert `session`, replacing any session with the same id.
    ///
    /// Replacement is what makes a retried Init idempotent.
    pub async fn create(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let previous = self
            .sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::clone(&session));

        if previous.is_some() {
            debug!("[{}] Session replaced by a new Init", session.id);
        }
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove `session` only if it is still the one stored under its id.
    ///
    /// A session replaced by a fresh Init in the meantime stays.
    pub async fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop every session idle for longer than the timeout as of `now`.
    ///
    /// A session an in-progress request holds a handle to, or whose lock is
    /// held, is not idle and is left alone. Check and removal happen under the
    /// store lock, so no new handle can be taken meanwhile.
    pub async fn evict_idle(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|id, session| {
            if Arc::strong_count(session) > 1 {
                return true;
            }

            let state = match session.state.try_lock() {
                Ok(state) => state,
                Err(_) => return true,
            };

            let idle = now.saturating_duration_since(state.updated_at);
            if idle <= self.timeout {
                return true;
            }

            warn!(
                "[{}] Session evicted after {:?} idle ({}/{} chunks)",
                id,
                idle,
                state.chunks.len(),
                session.total
            );
            false
        });

        before - sessions.len()
    }

    /// Run [`SessionStore::evict_idle`] every `interval` until `shutdown` fires
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Session sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle(Instant::now()).await;
                        if evicted > 0 {
                            debug!("Sweep evicted {} idle session(s)", evicted);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u32) -> Session {
        Session::new("abcd1234", "file.bin", vec![7u8; 16], total)
    }

    #[tokio::test]
    async fn test_complete_regardless_of_order() {
        let s = session(4);
        for seq in [3, 1, 4] {
            s.store_chunk(seq, vec![seq as u8]).await.unwrap();
            assert!(!s.is_complete().await);
        }
        assert_eq!(s.missing().await, vec![2]);

        s.store_chunk(2, vec![2]).await.unwrap();
        assert!(s.is_complete().await);
        assert!(s.missing().await.is_empty());
        assert_eq!(s.reassemble().await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_missing_is_ascending() {
        let s = session(6);
        s.store_chunk(5, vec![0]).await.unwrap();
        s.store_chunk(2, vec![0]).await.unwrap();
        assert_eq!(s.missing().await, vec![1, 3, 4, 6]);
        assert_eq!(s.received().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_deduplicated() {
        let s = session(2);
        s.store_chunk(1, b"ab".to_vec()).await.unwrap();
        s.store_chunk(1, b"ab".to_vec()).await.unwrap();
        assert_eq!(s.received().await, 1);
        assert!(!s.is_complete().await);
    }

    #[tokio::test]
    async fn test_out_of_range_sequence_rejected() {
        let s = session(2);
        assert_eq!(
            s.store_chunk(0, vec![1]).await,
            Err(StoreError::SequenceOutOfRange { seq: 0, total: 2 })
        );
        assert_eq!(
            s.store_chunk(3, vec![1]).await,
            Err(StoreError::SequenceOutOfRange { seq: 3, total: 2 })
        );
        s.store_chunk(1, vec![1]).await.unwrap();
        s.store_chunk(2, vec![2]).await.unwrap();
        assert!(s.is_complete().await);
    }

    #[tokio::test]
    async fn test_zero_total_is_immediately_complete() {
        let s = session(0);
        assert!(s.is_complete().await);
        assert!(s.reassemble().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_overwrites() {
        let store = SessionStore::new(Duration::from_secs(60));
        let first = store.create(session(3)).await;
        first.store_chunk(1, vec![1]).await.unwrap();

        store.create(session(3)).await;
        let current = store.get("abcd1234").await.unwrap();
        assert_eq!(current.received().await, 0);
        assert_eq!(store.len().await, 1);

        assert!(store.remove_if_same(&current).await);
        assert!(store.get("abcd1234").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.create(session(1)).await;
        store
            .create(Session::new("00000001", "other", vec![1; 16], 1))
            .await;

        let now = Instant::now();
        assert_eq!(store.evict_idle(now).await, 0);
        assert_eq!(store.evict_idle(now + Duration::from_secs(61)).await, 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_skips_busy_session() {
        let store = SessionStore::new(Duration::from_secs(1));
        let s = store.create(session(1)).await;

        let guard = s.state.lock().await;
        assert_eq!(store.evict_idle(Instant::now() + Duration::from_secs(5)).await, 0);
        drop(guard);
        drop(s);

        assert_eq!(store.evict_idle(Instant::now() + Duration::from_secs(5)).await, 1);
    }

    #[tokio::test]
    async fn test_evict_skips_session_with_outstanding_handle() {
        let store = SessionStore::new(Duration::from_secs(1));
        store.create(session(2)).await;

        let handle = store.get("abcd1234").await.unwrap();
        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(store.evict_idle(later).await, 0);

        handle.store_chunk(1, vec![1]).await.unwrap();
        let current = store.get("abcd1234").await.unwrap();
        assert!(Arc::ptr_eq(&current, &handle));
        assert_eq!(current.received().await, 1);

        drop(current);
        drop(handle);
        let much_later = Instant::now() + Duration::from_secs(10);
        assert_eq!(store.evict_idle(much_later).await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_if_same_keeps_replacement() {
        let store = SessionStore::new(Duration::from_secs(60));
        let old = store.create(session(1)).await;
        let fresh = store.create(session(1)).await;

        assert!(!store.remove_if_same(&old).await);
        let current = store.get("abcd1234").await.unwrap();
        assert!(Arc::ptr_eq(&current, &fresh));

        assert!(store.remove_if_same(&fresh).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_activity_refreshes_idle_clock() {
        let store = SessionStore::new(Duration::from_millis(100));
        let s = store.create(session(2)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        s.store_chunk(1, vec![1]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // 120ms since creation, 60ms since the last chunk
        assert_eq!(store.evict_idle(Instant::now()).await, 0);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_and_stops() {
        let store = Arc::new(SessionStore::new(Duration::from_millis(20)));
        store.create(session(1)).await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = Arc::clone(&store).spawn_sweeper(Duration::from_millis(10), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.is_empty().await);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop on shutdown")
            .unwrap();
    }
}
