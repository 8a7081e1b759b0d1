// Registry of in-flight searches, used to honour ABANDON requests.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one client connection for the lifetime of the process.
pub type ConnectionId = u64;

#[derive(Debug)]
struct ActiveSearch {
    id: Uuid,
    abandon: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
pub struct SearchManager {
    searches: DashMap<(ConnectionId, i32), ActiveSearch>,
}

impl SearchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a search under (connection, message id). The returned guard
    /// removes the registration when dropped.
    pub fn register(self: &Arc<Self>, connection: ConnectionId, message_id: i32) -> SearchRegistration {
        let id = Uuid::new_v4();
        let abandon = Arc::new(AtomicBool::new(false));
        let previous = self.searches.insert(
            (connection, message_id),
            ActiveSearch {
                id,
                abandon: Arc::clone(&abandon),
            },
        );
        if let Some(previous) = previous {
            // message id reused while the old search still runs
            warn!(
                "Connection {} reused message id {} of running search {}, abandoning it",
                connection, message_id, previous.id
            );
            previous.abandon.store(true, Ordering::SeqCst);
        }
        debug!("Registered search {} for connection {} message {}", id, connection, message_id);

        SearchRegistration {
            manager: Arc::clone(self),
            connection,
            message_id,
            id,
            abandon,
        }
    }

    /// Flags the search for abandonment. Returns false when no such search
    /// is running.
    pub fn abandon(&self, connection: ConnectionId, message_id: i32) -> bool {
        match self.searches.get(&(connection, message_id)) {
            Some(search) => {
                debug!("Abandoning search {} (connection {} message {})", search.id, connection, message_id);
                search.abandon.store(true, Ordering::SeqCst);
                true
            }
            None => {
                debug!("No running search for connection {} message {}", connection, message_id);
                false
            }
        }
    }

    /// Abandons every search of a closing connection.
    pub fn cancel_all(&self, connection: ConnectionId) -> usize {
        let mut cancelled = 0;
        for search in self.searches.iter().filter(|s| s.key().0 == connection) {
            search.abandon.store(true, Ordering::SeqCst);
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!("Cancelled {} searches of connection {}", cancelled, connection);
        }
        cancelled
    }

    pub fn active_count(&self) -> usize {
        self.searches.len()
    }

    fn complete(&self, connection: ConnectionId, message_id: i32, id: Uuid) {
        let removed = self
            .searches
            .remove_if(&(connection, message_id), |_, search| search.id == id);
        if removed.is_some() {
            debug!("Search {} finished", id);
        }
    }
}

/// Handle of a registered search. Carries the abandon flag the search polls.
#[derive(Debug)]
pub struct SearchRegistration {
    manager: Arc<SearchManager>,
    connection: ConnectionId,
    message_id: i32,
    id: Uuid,
    abandon: Arc<AtomicBool>,
}

impl SearchRegistration {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandon.load(Ordering::SeqCst)
    }
}

impl Drop for SearchRegistration {
    fn drop(&mut self) {
        self.manager.complete(self.connection, self.message_id, self.id);
    }
}
