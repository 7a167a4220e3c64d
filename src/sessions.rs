/// Session Registry
///
/// Per-client BDV state: registered wallets, paging cursors, last-seen
/// version map and a bounded outbound notification queue. A central
/// observer map keyed by scripthash holds per-session reference counts, so
/// the same scripthash registered under two wallets costs one index entry
/// and unregistration stays safe when shared. Teardown decrements counts
/// explicitly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::notifications::Notification;
use crate::types::ScriptHash;

pub type SessionId = u64;

/// Outbound queue bound; overflow sheds Progress events first, then
/// collapses adjacent zc balance deltas.
const QUEUE_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: String,
    pub scripthashes: HashSet<ScriptHash>,
}

#[derive(Default)]
struct SessionInner {
    wallets: HashMap<String, Wallet>,
    /// Paging cursor per wallet id, plus the "all wallets" view under "".
    cursors: HashMap<String, u32>,
    last_seen_versions: HashMap<ScriptHash, u64>,
    queue: VecDeque<Notification>,
    online: bool,
}

pub struct Session {
    pub id: SessionId,
    inner: Mutex<SessionInner>,
    wakeup: Notify,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner::default()),
            wakeup: Notify::new(),
        }
    }

    pub fn set_online(&self) {
        self.inner.lock().unwrap().online = true;
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().unwrap().online
    }

    pub fn wallet_scripthashes(&self, wallet_id: &str) -> Option<Vec<ScriptHash>> {
        let inner = self.inner.lock().unwrap();
        inner
            .wallets
            .get(wallet_id)
            .map(|w| w.scripthashes.iter().cloned().collect())
    }

    /// Scripthashes across all wallets (the "all" view).
    pub fn all_scripthashes(&self) -> Vec<ScriptHash> {
        let inner = self.inner.lock().unwrap();
        let mut set = HashSet::new();
        for wallet in inner.wallets.values() {
            set.extend(wallet.scripthashes.iter().cloned());
        }
        set.into_iter().collect()
    }

    pub fn wallet_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().wallets.keys().cloned().collect()
    }

    pub fn cursor(&self, view: &str) -> u32 {
        *self.inner.lock().unwrap().cursors.get(view).unwrap_or(&0)
    }

    pub fn set_cursor(&self, view: &str, page: u32) {
        self.inner.lock().unwrap().cursors.insert(view.to_string(), page);
    }

    pub fn last_seen_version(&self, scripthash: &ScriptHash) -> u64 {
        *self
            .inner
            .lock()
            .unwrap()
            .last_seen_versions
            .get(scripthash)
            .unwrap_or(&0)
    }

    pub fn last_seen_snapshot(&self) -> HashMap<ScriptHash, u64> {
        self.inner.lock().unwrap().last_seen_versions.clone()
    }

    pub fn mark_seen(&self, scripthash: &ScriptHash, version: u64) {
        let mut inner = self.inner.lock().unwrap();
        let seen = inner.last_seen_versions.entry(scripthash.clone()).or_insert(0);
        if version > *seen {
            *seen = version;
        }
    }

    /// Enqueue an outbound notification, shedding per the overflow policy.
    pub fn push(&self, notification: Notification) {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= QUEUE_LIMIT {
            // Oldest Progress events go first.
            if let Some(pos) = inner
                .queue
                .iter()
                .position(|n| matches!(n, Notification::Progress { .. }))
            {
                inner.queue.remove(pos);
            } else if let Some(pos) = find_collapsible_zc(&inner.queue) {
                // Merge the older delta into the newer one.
                let older = inner.queue.remove(pos).unwrap();
                if let (
                    Notification::Zc {
                        entries: old_entries,
                        ..
                    },
                    Some(Notification::Zc { entries, .. }),
                ) = (older, inner.queue.get_mut(pos))
                {
                    let mut merged = old_entries;
                    merged.extend(entries.drain(..));
                    *entries = merged;
                }
            } else {
                inner.queue.pop_front();
            }
        }
        inner.queue.push_back(notification);
        drop(inner);
        self.wakeup.notify_one();
    }

    pub fn pop(&self) -> Option<Notification> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Await the next queued notification.
    pub async fn next_notification(&self) -> Notification {
        loop {
            if let Some(n) = self.pop() {
                return n;
            }
            self.wakeup.notified().await;
        }
    }
}

/// Adjacent zc notifications touching the same scripthash set collapse.
fn find_collapsible_zc(queue: &VecDeque<Notification>) -> Option<usize> {
    for i in 0..queue.len().saturating_sub(1) {
        if let (
            Notification::Zc {
                scripthashes: a, ..
            },
            Notification::Zc {
                scripthashes: b, ..
            },
        ) = (&queue[i], &queue[i + 1])
        {
            if a == b {
                return Some(i);
            }
        }
    }
    None
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    /// scripthash -> session -> observer refcount.
    observers: Mutex<HashMap<ScriptHash, HashMap<SessionId, usize>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn create_session(&self) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id));
        self.sessions.lock().unwrap().insert(id, session.clone());
        crate::metrics::SESSIONS_CONNECTED.inc();
        debug!(session = id, "created bdv session");
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Deterministic teardown on transport closure: every observer count
    /// this session holds is released.
    pub fn drop_session(&self, id: SessionId) {
        let Some(session) = self.sessions.lock().unwrap().remove(&id) else {
            return;
        };
        let inner = session.inner.lock().unwrap();
        let mut observers = self.observers.lock().unwrap();
        for wallet in inner.wallets.values() {
            for scripthash in &wallet.scripthashes {
                release_observer(&mut observers, scripthash, id);
            }
        }
        crate::metrics::SESSIONS_CONNECTED.dec();
        debug!(session = id, "dropped bdv session");
    }

    /// Register (or extend) a wallet. Idempotent per (wallet_id,
    /// scripthash); returns the scripthashes that are new to this session.
    pub fn register_wallet(
        &self,
        session: &Arc<Session>,
        wallet_id: &str,
        scripthashes: Vec<ScriptHash>,
    ) -> Vec<ScriptHash> {
        let mut inner = session.inner.lock().unwrap();
        let mut observers = self.observers.lock().unwrap();

        let wallet = inner
            .wallets
            .entry(wallet_id.to_string())
            .or_insert_with(|| Wallet {
                id: wallet_id.to_string(),
                scripthashes: HashSet::new(),
            });

        let mut added = Vec::new();
        for scripthash in scripthashes {
            if !wallet.scripthashes.insert(scripthash.clone()) {
                continue; // already in this wallet
            }
            let counts = observers.entry(scripthash.clone()).or_default();
            let count = counts.entry(session.id).or_insert(0);
            *count += 1;
            if *count == 1 {
                added.push(scripthash);
            }
        }
        added
    }

    pub fn unregister_wallet(&self, session: &Arc<Session>, wallet_id: &str) {
        let mut inner = session.inner.lock().unwrap();
        let Some(wallet) = inner.wallets.remove(wallet_id) else {
            return;
        };
        let mut observers = self.observers.lock().unwrap();
        for scripthash in &wallet.scripthashes {
            release_observer(&mut observers, scripthash, session.id);
        }
    }

    pub fn unregister_scripthashes(&self, session: &Arc<Session>, scripthashes: &[ScriptHash]) {
        let mut inner = session.inner.lock().unwrap();
        let mut observers = self.observers.lock().unwrap();
        for wallet in inner.wallets.values_mut() {
            for scripthash in scripthashes {
                if wallet.scripthashes.remove(scripthash) {
                    release_observer(&mut observers, scripthash, session.id);
                }
            }
        }
    }

    /// Sessions observing any of the given scripthashes.
    pub fn observers_of(&self, scripthashes: &[ScriptHash]) -> Vec<Arc<Session>> {
        let observers = self.observers.lock().unwrap();
        let sessions = self.sessions.lock().unwrap();
        let mut ids = HashSet::new();
        for scripthash in scripthashes {
            if let Some(counts) = observers.get(scripthash) {
                ids.extend(counts.keys().copied());
            }
        }
        ids.into_iter().filter_map(|id| sessions.get(&id).cloned()).collect()
    }

    /// Fan one notification out: scoped events reach observers, global
    /// events reach every online session.
    pub fn fan_out(&self, notification: &Notification) {
        let targets = match notification.touched() {
            Some(scripthashes) => self.observers_of(scripthashes),
            None => self.sessions.lock().unwrap().values().cloned().collect(),
        };
        for session in targets {
            if session.is_online() {
                session.push(notification.clone());
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn release_observer(
    observers: &mut HashMap<ScriptHash, HashMap<SessionId, usize>>,
    scripthash: &ScriptHash,
    session_id: SessionId,
) {
    if let Some(counts) = observers.get_mut(scripthash) {
        if let Some(count) = counts.get_mut(&session_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&session_id);
            }
        }
        if counts.is_empty() {
            observers.remove(scripthash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(byte: u8) -> ScriptHash {
        vec![byte; 21]
    }

    #[test]
    fn test_registration_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry.create_session();

        let added = registry.register_wallet(&session, "w1", vec![sh(1), sh(2)]);
        assert_eq!(added.len(), 2);

        // Same pair again: nothing new.
        let added = registry.register_wallet(&session, "w1", vec![sh(1)]);
        assert!(added.is_empty());

        // Same scripthash under another wallet: refcounted, not re-added.
        let added = registry.register_wallet(&session, "w2", vec![sh(1)]);
        assert!(added.is_empty());
    }

    #[test]
    fn test_shared_scripthash_survives_one_unregister() {
        let registry = SessionRegistry::new();
        let session = registry.create_session();
        session.set_online();
        registry.register_wallet(&session, "w1", vec![sh(1)]);
        registry.register_wallet(&session, "w2", vec![sh(1)]);

        registry.unregister_wallet(&session, "w1");
        assert_eq!(registry.observers_of(&[sh(1)]).len(), 1);

        registry.unregister_wallet(&session, "w2");
        assert!(registry.observers_of(&[sh(1)]).is_empty());
    }

    #[test]
    fn test_fan_out_scopes_zc_to_observers() {
        let registry = SessionRegistry::new();
        let watching = registry.create_session();
        let other = registry.create_session();
        watching.set_online();
        other.set_online();
        registry.register_wallet(&watching, "w1", vec![sh(7)]);

        registry.fan_out(&Notification::Zc {
            entries: vec![],
            scripthashes: vec![sh(7)],
            broadcast_id: None,
        });

        assert_eq!(watching.queue_len(), 1);
        assert_eq!(other.queue_len(), 0);

        // Global events reach everyone online.
        registry.fan_out(&Notification::NewBlock {
            top_height: 1,
            branch_point: None,
        });
        assert_eq!(watching.queue_len(), 2);
        assert_eq!(other.queue_len(), 1);
    }

    #[test]
    fn test_offline_sessions_get_nothing() {
        let registry = SessionRegistry::new();
        let session = registry.create_session();
        registry.register_wallet(&session, "w1", vec![sh(3)]);

        registry.fan_out(&Notification::NewBlock {
            top_height: 1,
            branch_point: None,
        });
        assert_eq!(session.queue_len(), 0);
    }

    #[test]
    fn test_teardown_releases_observers() {
        let registry = SessionRegistry::new();
        let session = registry.create_session();
        registry.register_wallet(&session, "w1", vec![sh(1), sh(2)]);

        registry.drop_session(session.id);
        assert!(registry.observers_of(&[sh(1), sh(2)]).is_empty());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_queue_overflow_sheds_progress_first() {
        let registry = SessionRegistry::new();
        let session = registry.create_session();
        session.set_online();

        session.push(Notification::Progress {
            phase: crate::notifications::ScanPhase::BlockData,
            progress_pct: 10.0,
            eta_secs: 5,
            wallet_ids: vec![],
        });
        for i in 0..QUEUE_LIMIT {
            session.push(Notification::NewBlock {
                top_height: i as u32,
                branch_point: None,
            });
        }
        // The progress event was shed to make room.
        assert_eq!(session.queue_len(), QUEUE_LIMIT);
        assert!(matches!(
            session.pop().unwrap(),
            Notification::NewBlock { top_height: 0, .. }
        ));
    }

    #[test]
    fn test_queue_overflow_collapses_zc_deltas() {
        let registry = SessionRegistry::new();
        let session = registry.create_session();
        session.set_online();

        let zc = |height: u32| Notification::Zc {
            entries: vec![crate::ledger::LedgerEntry {
                tx_hash: [height as u8; 32],
                value: 1,
                height: None,
                tx_index: 0,
                zc_index: Some(height as u64),
                flags: Default::default(),
            }],
            scripthashes: vec![sh(9)],
            broadcast_id: None,
        };
        session.push(zc(1));
        session.push(zc(2));
        for i in 0..QUEUE_LIMIT - 1 {
            session.push(Notification::NewBlock {
                top_height: i as u32,
                branch_point: None,
            });
        }

        // The two zc notifications merged into one.
        match session.pop().unwrap() {
            Notification::Zc { entries, .. } => assert_eq!(entries.len(), 2),
            other => panic!("expected merged zc, got {:?}", other),
        }
    }

    #[test]
    fn test_last_seen_versions_monotonic() {
        let registry = SessionRegistry::new();
        let session = registry.create_session();
        session.mark_seen(&sh(1), 5);
        session.mark_seen(&sh(1), 3);
        assert_eq!(session.last_seen_version(&sh(1)), 5);
    }
}
