// ABOUTME: Per-server connection pool with hit/miss/eviction accounting
//
// acquire() hands out a healthy idle connection (hit) or opens a new one
// while the server is below max_size (miss); otherwise it reports
// exhaustion as Ok(None) without waiting. release() returns a connection to
// idle; cleanup() evicts idle entries past the idle timeout and is driven
// by the host, not by a timer.
//
// Pool bookkeeping sits behind a std Mutex that is never held across an
// await, so the health-check-then-promote step is atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use super::client::{McpClient, Operation};
use super::config::PoolSettings;
use super::connection::Connection;
use super::error::{McpError, McpResult};
use super::protocol::Response;

/// Usage state of a pool entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Active,
    Idle,
}

#[derive(Debug)]
struct PoolEntry {
    connection: Arc<tokio::sync::Mutex<Connection>>,
    state: EntryState,
    ref_count: u32,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct ServerPool {
    entries: HashMap<u64, PoolEntry>,
    /// Slots reserved by acquires that are still connecting
    pending: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    creates: u64,
    destroys: u64,
}

/// Pool counters for one server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub server: String,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub creates: u64,
    pub destroys: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
}

/// A connection checked out of the pool; hand it back with `release`
#[derive(Debug)]
pub struct PooledConnection {
    server: String,
    entry_id: u64,
    connection: Arc<tokio::sync::Mutex<Connection>>,
}

impl PooledConnection {
    /// Server the connection belongs to
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Pool entry id, stable while the entry lives
    #[must_use]
    pub const fn entry_id(&self) -> u64 {
        self.entry_id
    }

    /// The underlying connection
    #[must_use]
    pub const fn connection(&self) -> &Arc<tokio::sync::Mutex<Connection>> {
        &self.connection
    }
}

/// Connection pool over the servers of one client
pub struct ConnectionPool {
    client: Arc<McpClient>,
    settings: PoolSettings,
    pools: Mutex<HashMap<String, ServerPool>>,
    next_entry_id: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("total_connections", &self.total_connections())
            .finish_non_exhaustive()
    }
}

/// Releases a reserved slot if the connecting acquire is dropped or fails
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    server: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.lock().get_mut(self.server) {
            pool.pending = pool.pending.saturating_sub(1);
        }
    }
}

impl ConnectionPool {
    /// Pool with `settings` over the servers registered in `client`
    #[must_use]
    pub fn new(client: Arc<McpClient>, settings: PoolSettings) -> Self {
        info!(max_size = settings.max_size, idle_timeout_secs = settings.idle_timeout.as_secs(), "Connection pool created");
        Self {
            client,
            settings,
            pools: Mutex::new(HashMap::new()),
            next_entry_id: AtomicU64::new(1),
        }
    }

    /// Pool using the client's configured pool settings
    #[must_use]
    pub fn from_client(client: Arc<McpClient>) -> Self {
        let settings = client.config().pool.clone();
        Self::new(client, settings)
    }

    /// Pool limits
    #[must_use]
    pub const fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServerPool>> {
        self.pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Check out a connection for `server`
    ///
    /// Returns `Ok(None)` when the server already has `max_size` entries
    /// and none of the idle ones is healthy.
    ///
    /// # Errors
    /// `ServerNotFound` for unknown servers; connection failures when a new
    /// connection had to be opened
    pub async fn acquire(&self, server: &str) -> McpResult<Option<PooledConnection>> {
        if !self.client.has_server(server) {
            return Err(McpError::ServerNotFound(server.to_string()));
        }

        let (claim, discarded) = self.take_idle_or_reserve(server);
        close_all(discarded);

        match claim {
            Claim::Reused(handle) => return Ok(Some(handle)),
            Claim::Exhausted => return Ok(None),
            Claim::Reserved => {}
        }

        let reservation = Reservation { pool: self, server };
        let conn = self.client.open_connection(server).await?;

        let entry_id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(tokio::sync::Mutex::new(conn));
        {
            let mut pools = self.lock();
            let pool = pools.entry(server.to_string()).or_default();
            pool.entries.insert(
                entry_id,
                PoolEntry {
                    connection: Arc::clone(&connection),
                    state: EntryState::Active,
                    ref_count: 1,
                    last_used: Instant::now(),
                },
            );
            pool.creates += 1;
        }
        drop(reservation);

        debug!(server = %server, entry = entry_id, "Pool created connection");
        Ok(Some(PooledConnection {
            server: server.to_string(),
            entry_id,
            connection,
        }))
    }

    fn take_idle_or_reserve(&self, server: &str) -> (Claim, Vec<Arc<tokio::sync::Mutex<Connection>>>) {
        let mut pools = self.lock();
        let pool = pools.entry(server.to_string()).or_default();
        let mut discarded = Vec::new();

        let mut idle: Vec<(u64, Instant)> = pool
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Idle)
            .map(|(id, e)| (*id, e.last_used))
            .collect();
        // Most recently used first
        idle.sort_by(|a, b| b.1.cmp(&a.1));

        for (id, _) in idle {
            let Some(entry) = pool.entries.get_mut(&id) else {
                continue;
            };
            let healthy = match entry.connection.try_lock() {
                Ok(mut conn) => conn.is_healthy(self.settings.idle_timeout),
                // Still held by its previous user; leave it alone
                Err(_) => continue,
            };

            if healthy {
                entry.state = EntryState::Active;
                entry.ref_count = 1;
                entry.last_used = Instant::now();
                pool.hits += 1;
                let handle = PooledConnection {
                    server: server.to_string(),
                    entry_id: id,
                    connection: Arc::clone(&entry.connection),
                };
                return (Claim::Reused(handle), discarded);
            }

            if let Some(entry) = pool.entries.remove(&id) {
                debug!(server = %server, entry = id, "Discarding unhealthy pooled connection");
                pool.destroys += 1;
                discarded.push(entry.connection);
            }
        }

        pool.misses += 1;
        if pool.entries.len() + pool.pending >= self.settings.max_size {
            debug!(server = %server, max = self.settings.max_size, "Connection pool exhausted");
            return (Claim::Exhausted, discarded);
        }

        pool.pending += 1;
        (Claim::Reserved, discarded)
    }

    /// Return a connection; at zero references the entry becomes idle
    pub fn release(&self, handle: PooledConnection) {
        let mut pools = self.lock();
        let Some(entry) = pools
            .get_mut(&handle.server)
            .and_then(|pool| pool.entries.get_mut(&handle.entry_id))
        else {
            debug!(server = %handle.server, entry = handle.entry_id, "Released connection no longer pooled");
            return;
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 {
            entry.state = EntryState::Idle;
            entry.last_used = Instant::now();
        }
    }

    /// Remove a connection from the pool and close it
    pub fn discard(&self, handle: PooledConnection) {
        let removed = {
            let mut pools = self.lock();
            pools.get_mut(&handle.server).and_then(|pool| {
                let entry = pool.entries.remove(&handle.entry_id);
                if entry.is_some() {
                    pool.destroys += 1;
                }
                entry
            })
        };

        if let Some(entry) = removed {
            debug!(server = %handle.server, entry = handle.entry_id, "Discarded pooled connection");
            close_all(vec![entry.connection]);
        }
    }

    /// Evict idle entries idle for at least the idle timeout, for one
    /// server or all of them. Returns the number evicted.
    pub fn cleanup(&self, server: Option<&str>) -> usize {
        let mut evicted = Vec::new();
        {
            let mut pools = self.lock();
            for (name, pool) in pools.iter_mut() {
                if server.is_some_and(|s| s != name) {
                    continue;
                }

                let expired: Vec<u64> = pool
                    .entries
                    .iter()
                    .filter(|(_, e)| {
                        e.state == EntryState::Idle && e.last_used.elapsed() >= self.settings.idle_timeout
                    })
                    .map(|(id, _)| *id)
                    .collect();

                for id in expired {
                    if let Some(entry) = pool.entries.remove(&id) {
                        pool.evictions += 1;
                        evicted.push(entry.connection);
                    }
                }
            }
        }

        let count = evicted.len();
        if count > 0 {
            info!(count, "Evicted idle pooled connections");
        }
        close_all(evicted);
        count
    }

    /// Counters for one server
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self, server: &str) -> Option<PoolStats> {
        let pools = self.lock();
        let pool = pools.get(server)?;

        let active = pool
            .entries
            .values()
            .filter(|e| e.state == EntryState::Active)
            .count();
        let lookups = pool.hits + pool.misses;

        Some(PoolStats {
            server: server.to_string(),
            total: pool.entries.len(),
            active,
            idle: pool.entries.len() - active,
            max_size: self.settings.max_size,
            hits: pool.hits,
            misses: pool.misses,
            evictions: pool.evictions,
            creates: pool.creates,
            destroys: pool.destroys,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                pool.hits as f64 / lookups as f64
            },
        })
    }

    /// Pooled connections across all servers
    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.lock().values().map(|p| p.entries.len()).sum()
    }

    /// Run one operation on a pooled connection
    ///
    /// # Errors
    /// `PoolExhausted` when no connection is available, otherwise the
    /// call's own error. Connections that fail at the transport level are
    /// discarded rather than returned.
    pub async fn invoke(&self, server: &str, operation: &Operation) -> McpResult<Response> {
        let handle = self
            .acquire(server)
            .await?
            .ok_or_else(|| McpError::PoolExhausted(server.to_string()))?;

        let result = {
            let mut conn = handle.connection().lock().await;
            let timeout = self.client.config().receive_timeout;
            self.client.execute(&mut conn, operation, timeout, || {}).await
        };

        match &result {
            Err(e) if e.is_transport_failure() => self.discard(handle),
            _ => self.release(handle),
        }
        result
    }

    /// Close and forget every pooled connection
    pub fn close(&self) {
        let drained: Vec<_> = self
            .lock()
            .values_mut()
            .flat_map(|pool| {
                pool.destroys += pool.entries.len() as u64;
                pool.entries.drain().map(|(_, e)| e.connection)
            })
            .collect();
        close_all(drained);
    }
}

enum Claim {
    Reused(PooledConnection),
    Reserved,
    Exhausted,
}

fn close_all(connections: Vec<Arc<tokio::sync::Mutex<Connection>>>) {
    for connection in connections {
        // A busy connection closes when its last holder drops it
        if let Ok(mut conn) = connection.try_lock() {
            conn.disconnect();
        }
    }
}
