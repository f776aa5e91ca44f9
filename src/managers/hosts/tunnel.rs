use super::connection::{Connection, ConnectionHandle};
use crate::constants::network::TIMEOUT_TUNNEL_OPEN_MS;
use crate::errors::HostError;
use crate::services::host_registry::HostConfig;
use crate::services::logger::Logger;
use crate::transport::TunnelSocket;
use std::time::Duration;

/// Opens the forwarded channel a target handshake runs over when the target
/// sits behind a jump host.
#[derive(Clone)]
pub struct TunnelForwarder {
    logger: Logger,
    open_timeout: Duration,
}

impl TunnelForwarder {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("tunnel"),
            open_timeout: Duration::from_millis(TIMEOUT_TUNNEL_OPEN_MS),
        }
    }

    /// Returns `None` when the target is dialed directly: either no jump
    /// connection was resolved or the jump host is the local pseudo-host.
    pub async fn open(
        &self,
        jump: Option<&Connection>,
        target: &HostConfig,
    ) -> Result<Option<TunnelSocket>, HostError> {
        let Some(jump) = jump else {
            return Ok(None);
        };
        let session = match jump.handle() {
            ConnectionHandle::Local => {
                self.logger.debug(
                    "Jump host is local, dialing target directly",
                    Some(&serde_json::json!({ "target": target.id, "jump": jump.host_id() })),
                );
                return Ok(None);
            }
            ConnectionHandle::Remote(session) => session.clone(),
        };
        if !jump.is_connected() {
            return Err(HostError::network(format!(
                "Jump host '{}' is no longer connected",
                jump.host_id()
            )));
        }

        let socket = tokio::time::timeout(self.open_timeout, session.forward(&target.host, target.port))
            .await
            .map_err(|_| {
                HostError::timeout(format!(
                    "Timed out after {}ms opening a tunnel through '{}' to {}",
                    self.open_timeout.as_millis(),
                    jump.host_id(),
                    target.address()
                ))
            })??;
        self.logger.debug(
            "Tunnel opened",
            Some(&serde_json::json!({
                "target": target.id,
                "jump": jump.host_id(),
                "address": socket.target,
            })),
        );
        Ok(Some(socket))
    }
}
