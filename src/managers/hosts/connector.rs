use super::connection::{Connection, ConnectionHandle};
use super::tunnel::TunnelForwarder;
use crate::constants::network;
use crate::errors::{ErrorKind, HostError};
use crate::services::host_registry::{AuthMethod, HostConfig, HostRegistry};
use crate::services::logger::Logger;
use crate::transport::{RemoteSession, Transport};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Drives handshake attempts for one host, sleeping `delay` between
/// failures. Intermediate failures are logged; only the last one reaches
/// the caller.
#[derive(Clone)]
pub struct RetryingConnector {
    transport: Arc<dyn Transport>,
    tunnels: TunnelForwarder,
    attempts: usize,
    delay: Duration,
    logger: Logger,
}

impl RetryingConnector {
    pub fn new(transport: Arc<dyn Transport>, registry: &HostRegistry, logger: Logger) -> Self {
        let settings = registry.settings();
        let logger = logger.child("connector");
        Self {
            transport,
            tunnels: TunnelForwarder::new(logger.clone()),
            attempts: settings.retry_attempts.max(1),
            delay: Duration::from_millis(settings.retry_delay),
            logger,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Establishes a connection to `host`, routed through `jump` when given.
    /// The caller must already hold the host lock and a global slot.
    pub async fn connect(
        &self,
        host: &Arc<HostConfig>,
        jump: Option<&Connection>,
        pooled: bool,
    ) -> Result<Connection, HostError> {
        if host.is_local() {
            return Ok(Connection::new(
                host.clone(),
                ConnectionHandle::Local,
                pooled,
                Utc::now(),
            ));
        }

        let mut last_error = None;
        let mut made = 0;
        for attempt in 1..=self.attempts {
            made = attempt;
            let started = Instant::now();
            match self.attempt(host, jump).await {
                Ok(session) => {
                    self.logger.info(
                        "Connected",
                        Some(&serde_json::json!({
                            "host": host.id,
                            "attempt": attempt,
                            "via": jump.map(|j| j.host_id()),
                            "latency_ms": started.elapsed().as_millis() as u64,
                        })),
                    );
                    return Ok(Connection::routed(
                        host.clone(),
                        ConnectionHandle::Remote(session),
                        pooled,
                        Utc::now(),
                        jump.cloned(),
                    ));
                }
                Err(err) => {
                    self.logger.warn(
                        "Connection attempt failed",
                        Some(&serde_json::json!({
                            "host": host.id,
                            "attempt": attempt,
                            "max_attempts": self.attempts,
                            "code": err.code,
                            "error": err.message,
                        })),
                    );
                    // Nothing a retry can fix.
                    let fatal = err.kind == ErrorKind::Config;
                    last_error = Some(err);
                    if fatal {
                        break;
                    }
                    if attempt < self.attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            HostError::network(format!("No connection attempt made for '{}'", host.id))
        });
        Err(annotate(err, host, made))
    }

    async fn attempt(
        &self,
        host: &HostConfig,
        jump: Option<&Connection>,
    ) -> Result<Arc<dyn RemoteSession>, HostError> {
        let tunnel = self.tunnels.open(jump, host).await?;
        let timeout = host.timeout();
        let timed_out = || {
            HostError::timeout(format!(
                "Handshake with '{}' ({}) timed out after {}ms",
                host.id,
                host.address(),
                timeout.as_millis()
            ))
        };
        // Transports bound their own work by `timeout` and only return once
        // it has stopped; the settle window is a backstop for ones that don't.
        let started = Instant::now();
        let settle = Duration::from_millis(network::TIMEOUT_HANDSHAKE_SETTLE_MS);
        let session = tokio::time::timeout(timeout + settle, self.transport.handshake(host, tunnel))
            .await
            .map_err(|_| timed_out())??;
        if started.elapsed() > timeout {
            session.close().await;
            return Err(timed_out());
        }
        Ok(session)
    }
}

fn annotate(err: HostError, host: &HostConfig, attempts: usize) -> HostError {
    let hint = err.hint.clone().unwrap_or_else(|| diagnostic_hint(&err, host));
    let message = format!(
        "Failed to connect to '{}' after {} attempt(s): {}",
        host.id, attempts, err.message
    );
    HostError {
        message,
        hint: Some(hint),
        details: Some(serde_json::json!({
            "host": host.id,
            "address": host.address(),
            "jump_host": host.jump_host,
            "attempts": attempts,
        })),
        ..err
    }
}

fn diagnostic_hint(err: &HostError, host: &HostConfig) -> String {
    match err.kind {
        ErrorKind::Network | ErrorKind::Timeout => format!(
            "Check that {} is reachable and that port {} is open through any firewall; confirm sshd is running there.",
            host.host, host.port
        ),
        ErrorKind::Auth => match host.auth_method() {
            AuthMethod::Key => format!(
                "Verify that the key {} is authorized for '{}' and is not group/world readable (chmod 600).",
                host.private_key_path.as_deref().unwrap_or("<unset>"),
                host.username
            ),
            AuthMethod::Password => format!("Verify the password for '{}'.", host.username),
        },
        ErrorKind::Protocol => format!(
            "The service on {} did not complete an SSH handshake; confirm sshd listens on that port.",
            host.address()
        ),
        _ => "Review the host configuration.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotate_keeps_kind_and_adds_hint() {
        let host = HostConfig::ssh("web", "10.0.0.5", "deploy");
        let err = annotate(HostError::network("Connection refused"), &host, 3);
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.retryable);
        assert!(err.message.contains("after 3 attempt(s)"));
        assert!(err.hint.as_deref().unwrap_or("").contains("port 22"));
        assert_eq!(err.details.as_ref().unwrap()["attempts"], 3);
    }

    #[test]
    fn annotate_preserves_existing_hint() {
        let host = HostConfig::ssh("web", "10.0.0.5", "deploy");
        let err = annotate(HostError::auth("denied").with_hint("rotate key"), &host, 1);
        assert_eq!(err.hint.as_deref(), Some("rotate key"));
    }
}
