//! In-memory session state with write-through persistence.
//!
//! [`SessionHandle`] is a small state machine over a [`SlotStore`] slot:
//!
//! - **Initializing**: `loading=true`, no value. Entry state; a background
//!   thread reads the persisted slot.
//! - **Ready**: `loading=false`, value is whatever the slot held (possibly
//!   nothing). Entered exactly once per handle.
//!
//! [`SessionHandle::set`] replaces the in-memory value synchronously and
//! issues a best-effort background write of the serialized form. Callers
//! observe the new value immediately; a failed write is logged, never
//! rolled back. Ordering is last-write-wins: an explicit `set` that races
//! the initial read always wins, and the stale read result is discarded.
//!
//! Storage and parse failures never escape this module. A corrupt slot or
//! an unreachable backend degrades to the signed-out state with a log line.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::store::SlotStore;

/// Interval between polls while waiting for state to settle.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The logged-in user's session record, absent when signed out.
///
/// Opaque to the persistence layer beyond (de)serialization; stored as its
/// `serde_json` string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Access token for the authentication backend.
    pub token: String,
    /// Server-side user id, when the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// Username the session was created for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Session {
    /// Convenience constructor for a bare token session.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: None,
            username: None,
        }
    }
}

#[derive(Debug)]
struct State {
    loading: bool,
    session: Option<Session>,
    /// Bumped on every explicit `set`. The initial read only applies while
    /// this is still zero, so an explicit set always wins the race.
    generation: u64,
}

/// Shared handle to the session state machine.
///
/// Cheap to clone; all clones observe the same state. Dropping every clone
/// while the initial read is still pending simply discards its result.
#[derive(Clone)]
pub struct SessionHandle {
    store: Arc<dyn SlotStore>,
    key: String,
    state: Arc<Mutex<State>>,
    pending_writes: Arc<AtomicUsize>,
    /// Highest generation already persisted. Writers serialize on this lock
    /// and skip when at or below the watermark, so racing writes cannot
    /// land in the slot out of order.
    persisted_gen: Arc<Mutex<u64>>,
}

impl SessionHandle {
    /// Creates a handle in the Initializing state and starts the background
    /// read of the persisted slot.
    ///
    /// The handle reports `loading=true` until the read resolves; it flips
    /// to `false` exactly once, whether the slot held a value, was empty,
    /// was corrupt, or the backend failed.
    pub fn load(store: Arc<dyn SlotStore>, key: &str) -> Self {
        let handle = Self {
            store: Arc::clone(&store),
            key: key.to_string(),
            state: Arc::new(Mutex::new(State {
                loading: true,
                session: None,
                generation: 0,
            })),
            pending_writes: Arc::new(AtomicUsize::new(0)),
            persisted_gen: Arc::new(Mutex::new(0)),
        };

        let state = Arc::clone(&handle.state);
        let key = handle.key.clone();
        thread::spawn(move || {
            let loaded = match store.read(&key) {
                Ok(raw) => raw.and_then(|raw| parse_session(&key, &raw)),
                Err(e) => {
                    log::warn!("Reading persisted session '{}' failed, treating as signed out: {}", key, e);
                    None
                }
            };

            let mut state = state.lock().expect("session state mutex poisoned");
            if state.generation > 0 {
                // An explicit set won the race; this result is stale
                log::debug!("Discarding stale initial read for '{}'", key);
                return;
            }
            state.session = loaded;
            state.loading = false;
        });

        handle
    }

    /// Current `(loading, session)` snapshot. Non-blocking.
    pub fn snapshot(&self) -> (bool, Option<Session>) {
        let state = self.state.lock().expect("session state mutex poisoned");
        (state.loading, state.session.clone())
    }

    /// Returns `true` until the initial read has resolved.
    pub fn is_loading(&self) -> bool {
        self.snapshot().0
    }

    /// The current session, or `None` when signed out or not yet loaded.
    pub fn session(&self) -> Option<Session> {
        self.snapshot().1
    }

    /// Replaces the session wholesale and persists it write-through.
    ///
    /// The in-memory value updates synchronously; callers observe it before
    /// the persistence write settles. `None` signs out and deletes the
    /// persisted slot. The write itself runs as a best-effort background
    /// task; failure is logged and the in-memory value stands.
    pub fn set(&self, session: Option<Session>) {
        let generation = {
            let mut state = self.state.lock().expect("session state mutex poisoned");
            state.generation += 1;
            state.session = session.clone();
            state.loading = false;
            state.generation
        };

        let raw = match &session {
            Some(session) => match serde_json::to_string(session) {
                Ok(raw) => Some(raw),
                Err(e) => {
                    log::error!("Serializing session for '{}' failed, skipping persistence: {}", self.key, e);
                    return;
                }
            },
            None => None,
        };

        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let pending = Arc::clone(&self.pending_writes);
        let persisted_gen = Arc::clone(&self.persisted_gen);
        pending.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            {
                // The watermark lock both serializes slot writes and lets a
                // superseded writer bail out, so the slot converges on the
                // newest set even when writers are scheduled out of order.
                let mut persisted = persisted_gen
                    .lock()
                    .expect("session write watermark mutex poisoned");
                if generation <= *persisted {
                    log::debug!("Skipping superseded session write for '{}'", key);
                } else {
                    if let Err(e) = store.write(&key, raw.as_deref()) {
                        log::warn!("Best-effort session write for '{}' failed: {}", key, e);
                    }
                    // Advance even on failure so an older pending write
                    // cannot land on top of this one afterwards
                    *persisted = generation;
                }
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Waits until the initial read has resolved.
    ///
    /// Returns `false` on timeout. The snapshot accessors stay non-blocking;
    /// this exists for callers (the CLI, tests) that need a settled state
    /// before proceeding.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_loading() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(SETTLE_POLL_INTERVAL);
        }
        true
    }

    /// Waits for pending background persistence writes to settle.
    ///
    /// Returns `false` on timeout. Called before process exit so a
    /// sign-in/sign-out actually reaches the slot store.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending_writes.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                log::warn!("Timed out waiting for session writes to '{}' to settle", self.key);
                return false;
            }
            thread::sleep(SETTLE_POLL_INTERVAL);
        }
        true
    }

    /// The slot key this handle persists under.
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn parse_session(key: &str, raw: &str) -> Option<Session> {
    match serde_json::from_str(raw) {
        Ok(session) => Some(session),
        Err(e) => {
            log::warn!("Persisted session '{}' is corrupt, treating as signed out: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, StoreError};
    use std::sync::mpsc;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn file_store(dir: &TempDir) -> Arc<FileStore> {
        Arc::new(FileStore::new(dir.path()))
    }

    /// Store whose reads block until the test releases them, for driving
    /// the set-vs-initial-read race deterministically.
    struct GatedStore {
        inner: FileStore,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl GatedStore {
        fn new(dir: &TempDir) -> (Arc<Self>, mpsc::Sender<()>) {
            let (tx, rx) = mpsc::channel();
            let store = Arc::new(Self {
                inner: FileStore::new(dir.path()),
                gate: Mutex::new(rx),
            });
            (store, tx)
        }
    }

    impl SlotStore for GatedStore {
        fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.gate
                .lock()
                .unwrap()
                .recv()
                .map_err(|e| StoreError::Other(e.to_string()))?;
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
            self.inner.write(key, value)
        }

        fn name(&self) -> &'static str {
            "gated"
        }
    }

    /// Store whose first write stalls, for driving write races: a stalled
    /// older write must never overwrite a newer one in the slot.
    struct SlowFirstWriteStore {
        inner: FileStore,
        first_write_done: std::sync::atomic::AtomicBool,
        delay: Duration,
    }

    impl SlowFirstWriteStore {
        fn new(dir: &TempDir, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                inner: FileStore::new(dir.path()),
                first_write_done: std::sync::atomic::AtomicBool::new(false),
                delay,
            })
        }
    }

    impl SlotStore for SlowFirstWriteStore {
        fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
            if !self.first_write_done.swap(true, Ordering::SeqCst) {
                thread::sleep(self.delay);
            }
            self.inner.write(key, value)
        }

        fn name(&self) -> &'static str {
            "slow-first-write"
        }
    }

    /// Store that always fails, for the degradation paths.
    struct BrokenStore;

    impl SlotStore for BrokenStore {
        fn read(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("backend offline".to_string()))
        }

        fn write(&self, _key: &str, _value: Option<&str>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("backend offline".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_empty_slot_loads_to_ready_absent() {
        let dir = TempDir::new().unwrap();
        let handle = SessionHandle::load(file_store(&dir), "session_token");

        assert!(handle.wait_ready(TIMEOUT));
        assert_eq!(handle.snapshot(), (false, None));
    }

    #[test]
    fn test_stored_session_loads() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);
        store
            .write("session_token", Some(r#"{"token":"abc"}"#))
            .unwrap();

        let handle = SessionHandle::load(store, "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        let (loading, session) = handle.snapshot();
        assert!(!loading);
        assert_eq!(session, Some(Session::with_token("abc")));
    }

    #[test]
    fn test_corrupt_slot_loads_to_ready_absent() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);
        store.write("session_token", Some("not json {{")).unwrap();

        let handle = SessionHandle::load(store, "session_token");
        assert!(handle.wait_ready(TIMEOUT));
        assert_eq!(handle.snapshot(), (false, None));
    }

    #[test]
    fn test_failing_store_loads_to_ready_absent() {
        let handle = SessionHandle::load(Arc::new(BrokenStore), "session_token");
        assert!(handle.wait_ready(TIMEOUT));
        assert_eq!(handle.snapshot(), (false, None));
    }

    #[test]
    fn test_loading_starts_true() {
        let dir = TempDir::new().unwrap();
        let (store, _gate) = GatedStore::new(&dir);
        let handle = SessionHandle::load(store, "session_token");

        // Gate still closed: the initial read cannot have resolved
        assert!(handle.is_loading());
        assert_eq!(handle.session(), None);
    }

    #[test]
    fn test_set_updates_snapshot_synchronously() {
        let dir = TempDir::new().unwrap();
        let handle = SessionHandle::load(file_store(&dir), "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        let session = Session::with_token("xyz");
        handle.set(Some(session.clone()));

        // Observable immediately, before the background write settles
        assert_eq!(handle.snapshot(), (false, Some(session)));
    }

    #[test]
    fn test_set_persists_write_through() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);
        let handle = SessionHandle::load(Arc::clone(&store) as Arc<dyn SlotStore>, "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        let session = Session::with_token("xyz");
        handle.set(Some(session.clone()));
        assert!(handle.flush(TIMEOUT));

        let raw = store.read("session_token").unwrap().unwrap();
        let stored: Session = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, session);
    }

    #[test]
    fn test_set_none_deletes_slot() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);
        store
            .write("session_token", Some(r#"{"token":"abc"}"#))
            .unwrap();

        let handle = SessionHandle::load(Arc::clone(&store) as Arc<dyn SlotStore>, "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        handle.set(None);
        assert!(handle.flush(TIMEOUT));

        // Slot deleted, not a stored null literal
        assert_eq!(store.read("session_token").unwrap(), None);
        assert_eq!(handle.snapshot(), (false, None));
    }

    #[test]
    fn test_set_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);
        let handle = SessionHandle::load(Arc::clone(&store) as Arc<dyn SlotStore>, "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        let session = Session::with_token("abc");
        handle.set(Some(session.clone()));
        assert!(handle.flush(TIMEOUT));
        let first_raw = store.read("session_token").unwrap();

        handle.set(Some(session.clone()));
        assert!(handle.flush(TIMEOUT));

        assert_eq!(handle.snapshot(), (false, Some(session)));
        assert_eq!(store.read("session_token").unwrap(), first_raw);
    }

    #[test]
    fn test_set_before_initial_read_wins() {
        let dir = TempDir::new().unwrap();
        let store_for_seed = FileStore::new(dir.path());
        store_for_seed
            .write("session_token", Some(r#"{"token":"stale"}"#))
            .unwrap();

        let (store, gate) = GatedStore::new(&dir);
        let handle = SessionHandle::load(store, "session_token");

        // Explicit set while the initial read is still blocked
        assert!(handle.is_loading());
        let session = Session::with_token("fresh");
        handle.set(Some(session.clone()));
        assert_eq!(handle.snapshot(), (false, Some(session.clone())));

        // Release the read; its stale result must be discarded
        gate.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.snapshot(), (false, Some(session)));
    }

    #[test]
    fn test_rapid_sets_persist_the_newest_value() {
        let dir = TempDir::new().unwrap();
        let store = SlowFirstWriteStore::new(&dir, Duration::from_millis(300));
        let handle =
            SessionHandle::load(Arc::clone(&store) as Arc<dyn SlotStore>, "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        // The first write stalls mid-flight while the second one races it
        handle.set(Some(Session::with_token("old")));
        let newest = Session::with_token("new");
        handle.set(Some(newest.clone()));
        assert!(handle.flush(TIMEOUT));

        // The slot must match memory, whichever writer ran first
        assert_eq!(handle.snapshot(), (false, Some(newest.clone())));
        let raw = store.read("session_token").unwrap().expect("slot written");
        let stored: Session = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, newest);
    }

    #[test]
    fn test_stalled_sign_out_does_not_resurrect_the_token() {
        let dir = TempDir::new().unwrap();
        let store = SlowFirstWriteStore::new(&dir, Duration::from_millis(300));
        let handle =
            SessionHandle::load(Arc::clone(&store) as Arc<dyn SlotStore>, "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        // Stalled sign-in write racing an immediate sign-out
        handle.set(Some(Session::with_token("abc")));
        handle.set(None);
        assert!(handle.flush(TIMEOUT));

        assert_eq!(handle.snapshot(), (false, None));
        assert_eq!(store.read("session_token").unwrap(), None);
    }

    #[test]
    fn test_flush_reports_timeout_while_write_is_stalled() {
        let dir = TempDir::new().unwrap();
        let store = SlowFirstWriteStore::new(&dir, Duration::from_millis(500));
        let handle = SessionHandle::load(store, "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        handle.set(Some(Session::with_token("abc")));
        assert!(!handle.flush(Duration::from_millis(50)));

        // Given time, the write still settles
        assert!(handle.flush(TIMEOUT));
    }

    #[test]
    fn test_set_with_failing_store_keeps_memory_value() {
        let handle = SessionHandle::load(Arc::new(BrokenStore), "session_token");
        assert!(handle.wait_ready(TIMEOUT));

        let session = Session::with_token("abc");
        handle.set(Some(session.clone()));
        assert!(handle.flush(TIMEOUT));

        // Write failed and was logged; the in-memory value stands
        assert_eq!(handle.snapshot(), (false, Some(session)));
    }

    #[test]
    fn test_session_serialization_skips_absent_fields() {
        let session = Session::with_token("abc");
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("user_id"));
        assert!(!json.contains("username"));

        let full = Session {
            token: "abc".to_string(),
            user_id: Some(7),
            username: Some("ada".to_string()),
        };
        let json = serde_json::to_string(&full).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, full);
    }
}
