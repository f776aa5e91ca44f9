use super::connection::Connection;
use crate::errors::HostError;
use crate::services::logger::Logger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Bounded map of host id to pooled connection.
///
/// Every mutation happens under one lock with no await inside, so the
/// decision to evict and the insertion are a single step. Evicted
/// connections are marked disconnected immediately and handed back to the
/// caller to close.
#[derive(Clone)]
pub struct ConnectionPool {
    max_size: usize,
    entries: Arc<Mutex<HashMap<String, Connection>>>,
    logger: Logger,
}

impl ConnectionPool {
    pub fn new(max_size: usize, logger: Logger) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: Arc::new(Mutex::new(HashMap::new())),
            logger: logger.child("pool"),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Connection>> {
        self.entries.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Returns the pooled connection for `host_id` if it is still live.
    pub fn get(&self, host_id: &str) -> Option<Connection> {
        let entries = self.lock_entries();
        entries
            .get(host_id)
            .filter(|conn| conn.is_connected())
            .cloned()
    }

    /// Inserts `conn`, returning the connections it displaced and that are
    /// now the caller's to close: a previous entry for the same host and,
    /// when the pool is full, the oldest entries by `connected_at`.
    ///
    /// Eviction passes over jump hosts that `conn` or another pooled entry
    /// is tunneled through. If only such hops are left, the oldest leaves the
    /// pool but stays open for its dependents (see [`ConnectionPool::needs`]).
    pub fn insert(&self, conn: Connection) -> Vec<Connection> {
        let mut entries = self.lock_entries();
        let mut displaced = Vec::new();
        if let Some(previous) = entries.remove(conn.host_id()) {
            if !in_use(&entries, &conn, &previous) {
                previous.mark_disconnected();
                displaced.push(previous);
            }
        }
        while entries.len() >= self.max_size {
            let victim = entries
                .values()
                .min_by(|a, b| {
                    in_use(&entries, &conn, a)
                        .cmp(&in_use(&entries, &conn, b))
                        .then_with(|| a.connected_at().cmp(&b.connected_at()))
                        .then_with(|| a.host_id().cmp(b.host_id()))
                })
                .map(|c| c.host_id().to_string());
            let Some(evicted) = victim.and_then(|id| entries.remove(&id)) else {
                break;
            };
            let full = HostError::capacity(format!(
                "Connection pool is full ({} connections)",
                self.max_size
            ));
            let meta = serde_json::json!({
                "host": evicted.host_id(),
                "code": full.code,
                "reason": full.message,
                "connected_at": evicted.connected_at().to_rfc3339(),
                "max_pool_size": self.max_size,
            });
            if in_use(&entries, &conn, &evicted) {
                self.logger
                    .info("Pool full, jump host left the pool but stays open", Some(&meta));
            } else {
                self.logger.info("Pool full, evicting oldest connection", Some(&meta));
                evicted.mark_disconnected();
                displaced.push(evicted);
            }
        }
        entries.insert(conn.host_id().to_string(), conn);
        displaced
    }

    /// True while `conn` is pooled itself or a pooled entry is tunneled
    /// through it; closing it then would cut a live connection.
    pub fn needs(&self, conn: &Connection) -> bool {
        let entries = self.lock_entries();
        entries
            .values()
            .any(|entry| entry.same_as(conn) || entry.routes_through(conn))
    }

    pub fn remove(&self, host_id: &str) -> Option<Connection> {
        self.lock_entries().remove(host_id)
    }

    pub fn drain(&self) -> Vec<Connection> {
        self.lock_entries().drain().map(|(_, conn)| conn).collect()
    }

    /// True when the pool holds a live connection for `host_id`.
    pub fn is_connected(&self, host_id: &str) -> bool {
        self.get(host_id).is_some()
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.lock_entries().contains_key(host_id)
    }

    pub fn host_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

/// Whether `hop` carries the tunnel of the incoming connection or of an
/// entry still in the pool.
fn in_use(entries: &HashMap<String, Connection>, incoming: &Connection, hop: &Connection) -> bool {
    incoming.routes_through(hop) || entries.values().any(|entry| entry.routes_through(hop))
}
