//! Per-connection bookkeeping of live subscription sessions.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct Entry {
    serial: u64,
    token: CancellationToken,
}

/// Identifies one registration of a session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    id: String,
    serial: u64,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Maps session ids to the tokens that cancel them.
///
/// Registering an id that is already live cancels the earlier session
/// and replaces it, so at most one session per id is ever cancelable.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<FxHashMap<String, Entry>>,
    next_serial: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, Entry>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stores `token` under `id`, cancelling any prior session with that id.
    pub fn register(&self, id: impl Into<String>, token: CancellationToken) -> SessionHandle {
        let id = id.into();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let prior = self.lock().insert(id.clone(), Entry { serial, token });
        if let Some(prior) = prior {
            tracing::debug!(id = %id, "replacing live session");
            prior.token.cancel();
        }
        SessionHandle { id, serial }
    }

    /// Cancels and removes the session for `id`. Returns false if none was live.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Finishes the session `handle` refers to.
    ///
    /// The entry is only removed while it still belongs to `handle`; a
    /// replacement registered under the same id is left alone.
    pub fn complete(&self, handle: &SessionHandle) {
        let removed = {
            let mut sessions = self.lock();
            match sessions.get(&handle.id) {
                Some(entry) if entry.serial == handle.serial => sessions.remove(&handle.id),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            entry.token.cancel();
        }
    }

    /// Cancels every live session and empties the registry.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.token.cancel();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_and_cancel() {
        let registry = SessionRegistry::new();
        let token = CancellationToken::new();
        registry.register("1", token.clone());

        assert!(registry.contains("1"));
        assert!(registry.cancel("1"));
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let registry = SessionRegistry::new();
        assert!(!registry.cancel("missing"));
        assert!(!registry.cancel("missing"));
    }

    #[test]
    fn test_duplicate_id_replaces_prior() {
        let registry = SessionRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        let first_handle = registry.register("1", first.clone());
        let second_handle = registry.register("1", second.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);

        // The finished prior session must not evict its replacement.
        registry.complete(&first_handle);
        assert!(registry.contains("1"));
        assert!(!second.is_cancelled());

        registry.complete(&second_handle);
        assert!(second.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_all_drains() {
        let registry = SessionRegistry::new();
        let tokens: Vec<_> = (0..4).map(|_| CancellationToken::new()).collect();
        for (i, token) in tokens.iter().enumerate() {
            registry.register(i.to_string(), token.clone());
        }

        assert_eq!(registry.cancel_all(), 4);
        assert!(registry.is_empty());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn test_concurrent_access() {
        let registry = Arc::new(SessionRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{t}-{i}");
                        let handle = registry.register(id.clone(), CancellationToken::new());
                        if i % 2 == 0 {
                            registry.cancel(&id);
                        } else {
                            registry.complete(&handle);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
