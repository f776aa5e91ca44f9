//! Transport seam between the connection manager and the secure-shell library.
//!
//! Everything above this module talks to remote hosts through
//! [`Transport`] and [`RemoteSession`]; command and shell channels are
//! exposed as a [`ChannelStream`] (an event receiver plus a control sender)
//! so the executor and stream sessions never see library-specific types.

pub mod ssh;

use crate::constants::limits::CHANNEL_EVENT_CAPACITY;
use crate::errors::HostError;
use crate::services::host_registry::HostConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use ssh::Ssh2Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelControl {
    Input(Bytes),
    Interrupt,
    Close,
}

/// Consumer side of an exec/shell channel. The channel is closed once
/// `events` yields `None`.
#[derive(Debug)]
pub struct ChannelStream {
    pub events: mpsc::Receiver<ChannelEvent>,
    pub control: mpsc::Sender<ChannelControl>,
}

/// Producer side of an exec/shell channel, held by the pump driving the
/// underlying process or remote channel.
#[derive(Debug)]
pub struct ChannelEnds {
    pub events: mpsc::Sender<ChannelEvent>,
    pub control: mpsc::Receiver<ChannelControl>,
}

pub fn channel_pair() -> (ChannelStream, ChannelEnds) {
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_EVENT_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(CHANNEL_EVENT_CAPACITY);
    (
        ChannelStream {
            events: event_rx,
            control: control_tx,
        },
        ChannelEnds {
            events: event_tx,
            control: control_rx,
        },
    )
}

impl ChannelStream {
    /// Asks the producer to close and waits (up to `grace`) until it has
    /// dropped its event sender, draining anything still in flight.
    pub async fn terminate(&mut self, grace: Duration) -> bool {
        let _ = self.control.send(ChannelControl::Close).await;
        let drained = tokio::time::timeout(grace, async {
            while self.events.recv().await.is_some() {}
        })
        .await;
        drained.is_ok()
    }
}

/// A byte pipe standing in for the TCP socket of a handshake that is routed
/// through a jump host.
#[derive(Debug)]
pub struct TunnelSocket {
    pub stream: TcpStream,
    pub target: String,
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ChannelStream, HostError>;

    async fn shell(&self, pty: bool) -> Result<ChannelStream, HostError>;

    /// Opens a forwarded channel from this host to `host:port`.
    async fn forward(&self, host: &str, port: u16) -> Result<TunnelSocket, HostError>;

    async fn keepalive(&self) -> Result<(), HostError>;

    fn is_alive(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a single handshake + authentication attempt. When `tunnel`
    /// is set it replaces the direct TCP connection to `host.address()`.
    ///
    /// The whole attempt is bounded by `host.timeout()`, and the call must not
    /// return while work for the attempt is still running: the caller
    /// releases the host lock and its connection slot as soon as it does.
    async fn handshake(
        &self,
        host: &HostConfig,
        tunnel: Option<TunnelSocket>,
    ) -> Result<Arc<dyn RemoteSession>, HostError>;
}
