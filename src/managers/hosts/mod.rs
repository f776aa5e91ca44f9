pub mod connection;
pub mod connector;
pub mod host_lock;
pub mod limiter;
pub mod pool;
pub mod probe;
pub mod tunnel;

use crate::constants::network::TIMEOUT_HOST_LOCK_WAIT_MS;
use crate::errors::HostError;
use crate::managers::exec::{CommandExecutor, ExecDefaults, ExecOptions, ExecOutput};
use crate::managers::stream::{Launch, StreamOptions, StreamRegistry, StreamSession};
use crate::services::host_registry::{HostRegistry, HostType};
use crate::services::logger::Logger;
use crate::services::status_cache::{StatusCache, StatusEntry};
use crate::transport::{Ssh2Transport, Transport};
use crate::utils::paths::{resolve_hosts_path, resolve_status_path};
use connection::Connection;
use connector::RetryingConnector;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt};
use host_lock::HostLockTable;
use limiter::ConnectionLimiter;
use pool::ConnectionPool;
use probe::{ProbeDeduplicator, StatusResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Create a throwaway connection the caller closes after use.
    pub bypass_pool: bool,
}

impl ConnectOptions {
    pub fn pooled() -> Self {
        Self { bypass_pool: false }
    }

    pub fn bypass() -> Self {
        Self { bypass_pool: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Reachable,
    Unreachable,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub host_type: HostType,
    pub connection_status: ConnectionStatus,
    pub is_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<StatusEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub active_connections: usize,
    pub max_concurrent_connections: usize,
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub queue_length: usize,
    pub active_stream_sessions: usize,
}

/// Entry point for everything that talks to hosts.
///
/// A connect takes, in order: the jump chain (recursively, each hop under
/// its own lock), the target's host lock, then a global slot. Both guards
/// are dropped as soon as the handshake settles, success or not.
#[derive(Clone)]
pub struct HostManager {
    registry: Arc<HostRegistry>,
    limiter: ConnectionLimiter,
    locks: HostLockTable,
    pool: ConnectionPool,
    connector: RetryingConnector,
    executor: CommandExecutor,
    streams: StreamRegistry,
    status: StatusCache,
    probes: ProbeDeduplicator,
    keepalives: Arc<DashMap<String, AbortHandle>>,
    lock_wait: Duration,
    logger: Logger,
}

impl HostManager {
    pub fn new(
        registry: HostRegistry,
        transport: Arc<dyn Transport>,
        status: StatusCache,
        logger: Logger,
    ) -> Self {
        let settings = registry.settings().clone();
        let connector = RetryingConnector::new(transport, &registry, logger.clone());
        Self {
            limiter: ConnectionLimiter::new(settings.max_concurrent_connections),
            locks: HostLockTable::new(),
            pool: ConnectionPool::new(settings.connection_pool_size, logger.clone()),
            connector,
            executor: CommandExecutor::new(ExecDefaults::from_env(), logger.clone()),
            streams: StreamRegistry::new(),
            status,
            probes: ProbeDeduplicator::new(),
            keepalives: Arc::new(DashMap::new()),
            lock_wait: Duration::from_millis(TIMEOUT_HOST_LOCK_WAIT_MS),
            registry: Arc::new(registry),
            logger: logger.child("hosts"),
        }
    }

    /// Builds a manager from the hosts file and status cache locations
    /// resolved from the environment, using the libssh2 transport.
    pub fn from_env() -> Result<Self, HostError> {
        let logger = Logger::new("hostlink");
        let registry = HostRegistry::load(resolve_hosts_path())?;
        let status = StatusCache::open(resolve_status_path(), logger.clone());
        let transport: Arc<dyn Transport> = Arc::new(Ssh2Transport::new(logger.clone()));
        Ok(Self::new(registry, transport, status, logger))
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn status_cache(&self) -> &StatusCache {
        &self.status
    }

    pub fn default_host(&self) -> Option<&str> {
        self.registry.default_host()
    }

    pub async fn connect(
        &self,
        host_id: &str,
        options: ConnectOptions,
    ) -> Result<Connection, HostError> {
        self.connect_chain(host_id.to_string(), options.bypass_pool, Vec::new())
            .await
    }

    fn connect_chain(
        &self,
        host_id: String,
        bypass: bool,
        mut chain: Vec<String>,
    ) -> BoxFuture<'_, Result<Connection, HostError>> {
        async move {
            let host = self.registry.get(&host_id)?;
            if chain.contains(&host_id) {
                chain.push(host_id);
                return Err(HostError::config(format!(
                    "Jump host cycle detected: {}",
                    chain.join(" -> ")
                )));
            }
            chain.push(host_id.clone());

            if host.is_local() {
                return Ok(Connection::local(host));
            }
            if !bypass {
                if let Some(conn) = self.pool.get(&host_id) {
                    return Ok(conn);
                }
            }

            let jump = match host.jump_host.as_deref() {
                Some(jump_id) => Some(
                    self.connect_chain(jump_id.to_string(), false, chain.clone())
                        .await?,
                ),
                None => None,
            };

            let lock = self.locks.acquire_timeout(&host_id, self.lock_wait).await?;
            let slot = self.limiter.wait_for_slot().await;
            if !bypass {
                // Another caller may have connected while we queued.
                if let Some(conn) = self.pool.get(&host_id) {
                    return Ok(conn);
                }
            }

            let started = Instant::now();
            let result = self.connector.connect(&host, jump.as_ref(), !bypass).await;
            // Pool before releasing the lock so queued callers find it.
            let displaced = match &result {
                Ok(conn) if !bypass => self.pool.insert(conn.clone()),
                _ => Vec::new(),
            };
            slot.release();
            lock.release();

            match result {
                Ok(conn) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.status
                        .update(&host_id, StatusEntry::reachable(latency_ms, "Connected"));
                    if !bypass {
                        self.retire(displaced).await;
                        self.start_keepalive(&conn);
                    }
                    Ok(conn)
                }
                Err(err) => {
                    self.status
                        .update(&host_id, StatusEntry::unreachable(err.to_string()));
                    Err(err)
                }
            }
        }
        .boxed()
    }

    /// Closes connections the pool displaced.
    async fn retire(&self, displaced: Vec<Connection>) {
        for old in displaced {
            if let Some((_, handle)) = self.keepalives.remove(old.host_id()) {
                handle.abort();
            }
            self.close_chain(old).await;
        }
    }

    /// Closes `conn`, then every hop behind it that no pooled connection
    /// still needs.
    async fn close_chain(&self, conn: Connection) {
        conn.close().await;
        let mut hop = conn.via().cloned();
        while let Some(current) = hop {
            if self.pool.needs(&current) {
                break;
            }
            current.close().await;
            hop = current.via().cloned();
        }
    }

    fn start_keepalive(&self, conn: &Connection) {
        let Ok(session) = conn.remote() else {
            return;
        };
        let interval = conn.host().keep_alive_interval();
        if interval.is_zero() {
            return;
        }
        let logger = self.logger.child("keepalive");
        let task = tokio::spawn({
            let conn = conn.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !conn.is_connected() {
                        break;
                    }
                    if let Err(err) = session.keepalive().await {
                        logger.warn(
                            "Keep-alive failed, marking connection down",
                            Some(&serde_json::json!({
                                "host": conn.host_id(),
                                "error": err.message,
                            })),
                        );
                        conn.mark_disconnected();
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self
            .keepalives
            .insert(conn.host_id().to_string(), task.abort_handle())
        {
            previous.abort();
        }
    }

    /// Runs `command` to completion. Uses a throwaway connection unless the
    /// configuration enables pooling for one-shot commands.
    pub async fn execute(
        &self,
        host_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecOutput, HostError> {
        let bypass = !self.registry.settings().use_pool;
        let conn = self
            .connect(host_id, ConnectOptions { bypass_pool: bypass })
            .await?;
        let result = self.executor.execute(&conn, command, &options).await;
        if bypass {
            conn.close().await;
        }
        result
    }

    /// Prepares a long-lived session. Nothing runs until `start()`.
    pub async fn create_stream_session(
        &self,
        host_id: &str,
        command: &str,
        options: StreamOptions,
    ) -> Result<StreamSession, HostError> {
        let host = self.registry.get(host_id)?;
        if host.is_local() {
            return Ok(self.streams.open(
                host_id,
                command,
                Launch::Local,
                None,
                &options,
                &self.logger,
            ));
        }

        let bypass = !self.registry.settings().use_pool;
        let conn = self
            .connect(host_id, ConnectOptions { bypass_pool: bypass })
            .await?;
        let shell = match conn.remote() {
            Ok(session) => session.shell(options.pty).await,
            Err(err) => Err(err),
        };
        match shell {
            Ok(channel) => Ok(self.streams.open(
                host_id,
                command,
                Launch::Shell(channel),
                bypass.then_some(conn),
                &options,
                &self.logger,
            )),
            Err(err) => {
                if bypass {
                    conn.close().await;
                }
                Err(err)
            }
        }
    }

    pub fn stream_session(&self, session_id: &str) -> Option<StreamSession> {
        self.streams.get(session_id)
    }

    /// Probes `host_id` with a bare handshake. Concurrent calls share one
    /// probe; the result never fails, failures are reported inside it.
    pub async fn test_connection(&self, host_id: &str) -> StatusResult {
        let manager = self.clone();
        let id = host_id.to_string();
        self.probes
            .run(host_id, move || async move { manager.probe(&id).await })
            .await
    }

    async fn probe(&self, host_id: &str) -> StatusResult {
        let started = Instant::now();
        match self.connect(host_id, ConnectOptions::bypass()).await {
            Ok(conn) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                conn.close().await;
                let result = StatusResult::reachable(host_id, latency_ms);
                self.status.update(
                    host_id,
                    StatusEntry::reachable(latency_ms, result.message.clone()),
                );
                result
            }
            Err(err) => {
                self.status
                    .update(host_id, StatusEntry::unreachable(err.to_string()));
                StatusResult::unreachable(host_id, err.to_string())
            }
        }
    }

    pub async fn refresh_all_statuses(&self) -> Vec<StatusResult> {
        let ids: Vec<String> = self
            .registry
            .enabled_hosts()
            .map(|host| host.id.clone())
            .collect();
        join_all(ids.iter().map(|id| self.test_connection(id))).await
    }

    /// Drops the pooled connection for `host_id`. Returns whether one existed.
    pub async fn disconnect(&self, host_id: &str) -> bool {
        if let Some((_, handle)) = self.keepalives.remove(host_id) {
            handle.abort();
        }
        match self.pool.remove(host_id) {
            Some(conn) => {
                self.close_chain(conn).await;
                self.logger.info(
                    "Disconnected",
                    Some(&serde_json::json!({ "host": host_id })),
                );
                true
            }
            None => false,
        }
    }

    /// Tears everything down: stream sessions, pooled connections and
    /// keep-alive tasks. Pending status writes are flushed.
    pub async fn disconnect_all(&self) {
        self.streams.destroy_all().await;
        let keepalive_hosts: Vec<String> =
            self.keepalives.iter().map(|entry| entry.key().clone()).collect();
        for host_id in keepalive_hosts {
            if let Some((_, handle)) = self.keepalives.remove(&host_id) {
                handle.abort();
            }
        }
        let drained = self.pool.drain();
        let count = drained.len();
        for conn in drained {
            self.close_chain(conn).await;
        }
        self.status.flush().await;
        self.logger.info(
            "All connections closed",
            Some(&serde_json::json!({ "connections": count })),
        );
    }

    pub fn get_status(&self) -> BTreeMap<String, HostStatus> {
        self.registry
            .hosts()
            .map(|host| {
                let is_connected = host.is_local() || self.pool.is_connected(&host.id);
                let last_check = self.status.get(&host.id);
                let connection_status = if self.pool.is_connected(&host.id) {
                    ConnectionStatus::Connected
                } else {
                    match &last_check {
                        Some(entry) if entry.success => ConnectionStatus::Reachable,
                        Some(_) => ConnectionStatus::Unreachable,
                        None if host.is_local() => ConnectionStatus::Reachable,
                        None => ConnectionStatus::Unknown,
                    }
                };
                (
                    host.id.clone(),
                    HostStatus {
                        name: host.name.clone(),
                        enabled: host.enabled,
                        host_type: host.host_type,
                        connection_status,
                        is_connected,
                        last_check,
                    },
                )
            })
            .collect()
    }

    pub fn get_pool_stats(&self) -> PoolStats {
        PoolStats {
            active_connections: self.limiter.active(),
            max_concurrent_connections: self.limiter.max(),
            pool_size: self.pool.len(),
            max_pool_size: self.pool.max_size(),
            queue_length: self.limiter.queue_length(),
            active_stream_sessions: self.streams.active_count(),
        }
    }

    pub fn pooled_hosts(&self) -> Vec<String> {
        self.pool.host_ids()
    }
}
