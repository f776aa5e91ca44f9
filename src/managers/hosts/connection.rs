use crate::errors::HostError;
use crate::services::host_registry::HostConfig;
use crate::transport::RemoteSession;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub enum ConnectionHandle {
    Local,
    Remote(Arc<dyn RemoteSession>),
}

struct ConnectionInner {
    host: Arc<HostConfig>,
    handle: ConnectionHandle,
    connected: AtomicBool,
    pooled: bool,
    connected_at: DateTime<Utc>,
    via: Option<Connection>,
}

/// A live link to one host. Cloning shares the underlying transport.
///
/// Pooled connections are owned by the pool; bypass connections belong to
/// the caller that created them and must be closed by it. A connection
/// tunneled through a jump host keeps that hop's connection alongside it and
/// goes down with it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(
        host: Arc<HostConfig>,
        handle: ConnectionHandle,
        pooled: bool,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self::routed(host, handle, pooled, connected_at, None)
    }

    /// Like `new`, for a connection whose transport runs through `via`.
    pub fn routed(
        host: Arc<HostConfig>,
        handle: ConnectionHandle,
        pooled: bool,
        connected_at: DateTime<Utc>,
        via: Option<Connection>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                host,
                handle,
                connected: AtomicBool::new(true),
                pooled,
                connected_at,
                via,
            }),
        }
    }

    pub fn local(host: Arc<HostConfig>) -> Self {
        Self::new(host, ConnectionHandle::Local, false, Utc::now())
    }

    pub fn host_id(&self) -> &str {
        &self.inner.host.id
    }

    pub fn host(&self) -> &Arc<HostConfig> {
        &self.inner.host
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.inner.handle
    }

    pub fn is_local(&self) -> bool {
        matches!(self.inner.handle, ConnectionHandle::Local)
    }

    pub fn remote(&self) -> Result<Arc<dyn RemoteSession>, HostError> {
        match &self.inner.handle {
            ConnectionHandle::Remote(session) => Ok(session.clone()),
            ConnectionHandle::Local => Err(HostError::exec(format!(
                "Host '{}' is local and has no remote transport",
                self.host_id()
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return false;
        }
        let alive = match &self.inner.handle {
            ConnectionHandle::Local => true,
            ConnectionHandle::Remote(session) => session.is_alive(),
        };
        alive && self.via().map_or(true, Connection::is_connected)
    }

    /// The jump host connection this one is tunneled through.
    pub fn via(&self) -> Option<&Connection> {
        self.inner.via.as_ref()
    }

    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True when `hop` is anywhere on this connection's tunnel chain.
    pub fn routes_through(&self, hop: &Connection) -> bool {
        std::iter::successors(self.via(), |conn| conn.via()).any(|conn| conn.same_as(hop))
    }

    pub fn is_pooled(&self) -> bool {
        self.inner.pooled
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn mark_disconnected(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    pub async fn close(&self) {
        self.mark_disconnected();
        if let ConnectionHandle::Remote(session) = &self.inner.handle {
            session.close().await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host_id", &self.host_id())
            .field("local", &self.is_local())
            .field("connected", &self.is_connected())
            .field("pooled", &self.inner.pooled)
            .field("via", &self.via().map(|hop| hop.host_id().to_string()))
            .field("connected_at", &self.inner.connected_at)
            .finish()
    }
}
