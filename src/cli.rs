use crate::errors::HostError;
use crate::managers::exec::ExecOptions;
use crate::managers::hosts::HostManager;
use crate::managers::stream::{StreamEvent, StreamOptions, StreamSession};
use crate::services::host_registry::HostRegistry;
use crate::services::logger::Logger;
use crate::services::status_cache::StatusCache;
use crate::transport::{Ssh2Transport, Transport};
use crate::utils::paths::{resolve_hosts_path, resolve_status_path};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "hostlink",
    version,
    about = "Pooled SSH and local command execution across configured hosts",
    after_help = "EXAMPLES:\n  Probe every enabled host:   hostlink refresh\n  Run a command:              hostlink exec web-1 \"uptime\" --timeout 5000\n  Follow a log for a minute:  hostlink stream web-1 \"tail -f /var/log/syslog\" --duration 60000"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        help = "Hosts configuration file [default: $HOSTLINK_HOSTS_PATH or <state dir>/hosts.json]"
    )]
    pub hosts: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Status cache file [default: $HOSTLINK_STATUS_PATH or <state dir>/status.json]"
    )]
    pub status_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show configured hosts with their last known status")]
    Status,

    #[command(about = "Show connection limiter and pool counters")]
    Stats,

    #[command(about = "Probe one host (the default host when omitted)")]
    Test { host: Option<String> },

    #[command(about = "Probe every enabled host in parallel")]
    Refresh,

    #[command(about = "Run a command to completion and print its output")]
    Exec {
        host: String,
        command: String,
        #[arg(long, help = "Timeout in milliseconds")]
        timeout: Option<u64>,
        #[arg(long, help = "Per-stream output cap in bytes")]
        max_output: Option<usize>,
    },

    #[command(about = "Start a long-running command and print its output line by line")]
    Stream {
        host: String,
        command: String,
        #[arg(long, help = "Stop the session after this many milliseconds")]
        duration: Option<u64>,
    },
}

fn print_json(value: &impl Serialize) -> Result<(), HostError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| HostError::exec(format!("Failed to render output: {}", err)))?;
    println!("{}", text);
    Ok(())
}

fn build_manager(cli: &Cli) -> Result<HostManager, HostError> {
    let logger = Logger::new("hostlink");
    let hosts_path = cli.hosts.clone().unwrap_or_else(resolve_hosts_path);
    let status_path = cli.status_file.clone().unwrap_or_else(resolve_status_path);
    let registry = HostRegistry::load(&hosts_path)?;
    let status = StatusCache::open(status_path, logger.clone());
    let transport: Arc<dyn Transport> = Arc::new(Ssh2Transport::new(logger.clone()));
    Ok(HostManager::new(registry, transport, status, logger))
}

/// Runs one subcommand and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32, HostError> {
    let manager = build_manager(&cli)?;
    let outcome = dispatch(&manager, cli.command).await;
    manager.disconnect_all().await;
    outcome
}

async fn dispatch(manager: &HostManager, command: Commands) -> Result<i32, HostError> {
    match command {
        Commands::Status => {
            print_json(&manager.get_status())?;
            Ok(0)
        }
        Commands::Stats => {
            print_json(&manager.get_pool_stats())?;
            Ok(0)
        }
        Commands::Test { host } => {
            let host = match host.or_else(|| manager.default_host().map(str::to_string)) {
                Some(host) => host,
                None => {
                    return Err(HostError::config("No host given and no defaultHost configured")
                        .with_hint("Pass a host id: hostlink test <HOST>"))
                }
            };
            let result = manager.test_connection(&host).await;
            print_json(&result)?;
            Ok(if result.success { 0 } else { 1 })
        }
        Commands::Refresh => {
            let results = manager.refresh_all_statuses().await;
            print_json(&results)?;
            Ok(if results.iter().all(|r| r.success) { 0 } else { 1 })
        }
        Commands::Exec {
            host,
            command,
            timeout,
            max_output,
        } => {
            let mut options = ExecOptions::default();
            if let Some(ms) = timeout {
                options = options.with_timeout(Duration::from_millis(ms));
            }
            if let Some(bytes) = max_output {
                options = options.with_max_output(bytes);
            }
            let output = manager.execute(&host, &command, options).await?;
            print_json(&output)?;
            Ok(output.exit_code.unwrap_or(1))
        }
        Commands::Stream {
            host,
            command,
            duration,
        } => stream(manager, &host, &command, duration).await,
    }
}

// Keeps the event loop draining while the session winds down.
fn stop_in_background(session: &StreamSession) {
    let session = session.clone();
    tokio::spawn(async move { session.stop_default().await });
}

async fn stream(
    manager: &HostManager,
    host: &str,
    command: &str,
    duration: Option<u64>,
) -> Result<i32, HostError> {
    let session = manager
        .create_stream_session(host, command, StreamOptions::default())
        .await?;
    let mut events = session
        .events()
        .ok_or_else(|| HostError::exec("Stream events already taken"))?;
    session.start().await?;

    let deadline = async {
        match duration {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut stopping = false;
    let mut exit_code = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StreamEvent::Line(line)) => println!("{}", line),
                Some(StreamEvent::Stderr(chunk)) => eprint!("{}", String::from_utf8_lossy(&chunk)),
                Some(StreamEvent::Closed { exit_code: code, .. }) => {
                    exit_code = code;
                    break;
                }
                Some(StreamEvent::Data(_)) => {}
                None => break,
            },
            _ = &mut deadline, if !stopping => {
                stopping = true;
                stop_in_background(&session);
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                stop_in_background(&session);
            }
        }
    }
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&session.stats()).unwrap_or_default()
    );
    Ok(exit_code.unwrap_or(if stopping { 0 } else { 1 }))
}
