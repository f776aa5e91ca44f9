pub mod capture;
pub mod local;

use crate::constants::{limits, network};
use crate::errors::HostError;
use crate::managers::hosts::connection::{Connection, ConnectionHandle};
use crate::services::logger::Logger;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub max_output_length: Option<usize>,
}

impl ExecOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_length = Some(bytes);
        self
    }
}

/// Process-wide fallbacks for [`ExecOptions`], read once from the
/// environment.
#[derive(Debug, Clone, Copy)]
pub struct ExecDefaults {
    pub timeout: Duration,
    pub max_output_length: usize,
    pub kill_grace: Duration,
}

fn read_positive_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

impl ExecDefaults {
    pub fn from_env() -> Self {
        Self {
            timeout: Duration::from_millis(
                read_positive_env("HOSTLINK_EXEC_TIMEOUT_MS")
                    .unwrap_or(network::TIMEOUT_EXEC_DEFAULT_MS),
            ),
            max_output_length: read_positive_env("HOSTLINK_MAX_OUTPUT_BYTES")
                .map(|v| v as usize)
                .unwrap_or(limits::MAX_OUTPUT_BYTES),
            kill_grace: Duration::from_millis(network::TIMEOUT_EXEC_KILL_GRACE_MS),
        }
    }
}

impl Default for ExecDefaults {
    fn default() -> Self {
        Self::from_env()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub host_id: String,
    pub execution_type: ExecutionType,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// One-shot command execution over a resolved connection.
#[derive(Clone)]
pub struct CommandExecutor {
    defaults: ExecDefaults,
    logger: Logger,
}

impl CommandExecutor {
    pub fn new(defaults: ExecDefaults, logger: Logger) -> Self {
        Self {
            defaults,
            logger: logger.child("exec"),
        }
    }

    pub async fn execute(
        &self,
        conn: &Connection,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecOutput, HostError> {
        let timeout = options.timeout.unwrap_or(self.defaults.timeout);
        let max_output = options
            .max_output_length
            .unwrap_or(self.defaults.max_output_length);
        let started = Instant::now();

        let (stream, execution_type) = match conn.handle() {
            ConnectionHandle::Local => (local::spawn(command, false)?, ExecutionType::Local),
            ConnectionHandle::Remote(session) => {
                (session.exec(command).await?, ExecutionType::Remote)
            }
        };
        self.logger.debug(
            "Executing command",
            Some(&serde_json::json!({
                "host": conn.host_id(),
                "type": execution_type,
                "timeout_ms": timeout.as_millis() as u64,
            })),
        );

        let collected = match capture::collect(
            stream,
            timeout,
            self.defaults.kill_grace,
            max_output,
        )
        .await
        {
            Ok(collected) => collected,
            Err(err) => {
                self.logger.warn(
                    "Command failed",
                    Some(&serde_json::json!({ "host": conn.host_id(), "error": err.message })),
                );
                return Err(err);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout_truncated = collected.stdout.is_truncated();
        let stderr_truncated = collected.stderr.is_truncated();
        self.logger.debug(
            "Command finished",
            Some(&serde_json::json!({
                "host": conn.host_id(),
                "exit_code": collected.exit_code,
                "duration_ms": duration_ms,
            })),
        );
        Ok(ExecOutput {
            stdout: collected.stdout.into_text(),
            stderr: collected.stderr.into_text(),
            exit_code: collected.exit_code,
            signal: collected.signal,
            host_id: conn.host_id().to_string(),
            execution_type,
            duration_ms,
            stdout_truncated,
            stderr_truncated,
        })
    }
}
