#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hostlink::errors::HostError;
use hostlink::managers::hosts::HostManager;
use hostlink::services::host_registry::{HostConfig, HostRegistry};
use hostlink::services::logger::{LogLevel, Logger};
use hostlink::services::status_cache::StatusCache;
use hostlink::transport::{
    channel_pair, ChannelEnds, ChannelEvent, ChannelStream, RemoteSession, Transport,
    TunnelSocket,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub static ENV_LOCK: Lazy<AsyncMutex<()>> = Lazy::new(|| AsyncMutex::new(()));

pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hostlink-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn quiet_logger() -> Logger {
    Logger::new("test").with_level(LogLevel::Error)
}

pub fn ssh_host(address: &str) -> Value {
    serde_json::json!({
        "type": "ssh",
        "host": address,
        "username": "deploy",
        "authMethod": "password",
        "password": "secret",
    })
}

pub fn registry(hosts: Value, settings: Value) -> HostRegistry {
    let document = serde_json::json!({ "hosts": hosts, "globalSettings": settings });
    HostRegistry::from_json(&document.to_string()).expect("valid hosts document")
}

pub struct Harness {
    pub manager: HostManager,
    pub transport: Arc<FakeTransport>,
    pub dir: PathBuf,
}

impl Harness {
    pub fn new(registry: HostRegistry, transport: Arc<FakeTransport>) -> Self {
        let dir = temp_dir("harness");
        let logger = quiet_logger();
        let status = StatusCache::open(dir.join("status.json"), logger.clone());
        let manager = HostManager::new(
            registry,
            transport.clone() as Arc<dyn Transport>,
            status,
            logger,
        );
        Self {
            manager,
            transport,
            dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[derive(Default)]
struct Gauge {
    current: usize,
    peak: usize,
}

impl Gauge {
    fn enter(&mut self) {
        self.current += 1;
        self.peak = self.peak.max(self.current);
    }

    fn leave(&mut self) {
        self.current -= 1;
    }
}

/// Scripted transport: every handshake takes `delay`, hosts can be told to
/// fail their first N attempts, and in-flight handshakes are measured
/// globally and per host.
pub struct FakeTransport {
    delay: Duration,
    attempts: AtomicUsize,
    per_host: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, usize>>,
    global: Mutex<Gauge>,
    hosts: Mutex<HashMap<String, Gauge>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeTransport {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            attempts: AtomicUsize::new(0),
            per_host: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            global: Mutex::new(Gauge::default()),
            hosts: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_first(&self, host_id: &str, count: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(host_id.to_string(), count);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempts_for(&self, host_id: &str) -> usize {
        self.per_host
            .lock()
            .unwrap()
            .get(host_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.global.lock().unwrap().peak
    }

    pub fn peak_in_flight_for(&self, host_id: &str) -> usize {
        self.hosts
            .lock()
            .unwrap()
            .get(host_id)
            .map(|gauge| gauge.peak)
            .unwrap_or(0)
    }

    pub fn sessions_for(&self, host_id: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|session| session.host_id == host_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn handshake(
        &self,
        host: &HostConfig,
        tunnel: Option<TunnelSocket>,
    ) -> Result<Arc<dyn RemoteSession>, HostError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self
            .per_host
            .lock()
            .unwrap()
            .entry(host.id.clone())
            .or_default() += 1;
        self.global.lock().unwrap().enter();
        self.hosts
            .lock()
            .unwrap()
            .entry(host.id.clone())
            .or_default()
            .enter();

        tokio::time::sleep(self.delay).await;

        self.global.lock().unwrap().leave();
        self.hosts
            .lock()
            .unwrap()
            .entry(host.id.clone())
            .or_default()
            .leave();

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&host.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(HostError::timeout("simulated handshake timeout"));
                }
            }
        }

        let session = Arc::new(FakeSession::new(
            &host.id,
            tunnel.map(|socket| socket.target),
        ));
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct FakeSession {
    pub host_id: String,
    pub via_tunnel: Option<String>,
    alive: AtomicBool,
    closed: AtomicBool,
    commands: Mutex<Vec<String>>,
    shells: Mutex<Vec<ChannelEnds>>,
    forwards: Mutex<Vec<String>>,
    tunnel_peers: Mutex<Vec<TcpStream>>,
}

impl FakeSession {
    fn new(host_id: &str, via_tunnel: Option<String>) -> Self {
        Self {
            host_id: host_id.to_string(),
            via_tunnel,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            shells: Mutex::new(Vec::new()),
            forwards: Mutex::new(Vec::new()),
            tunnel_peers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn forwards(&self) -> Vec<String> {
        self.forwards.lock().unwrap().clone()
    }

    /// Producer side of the most recently opened shell.
    pub fn take_shell(&self) -> Option<ChannelEnds> {
        self.shells.lock().unwrap().pop()
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<ChannelStream, HostError> {
        self.commands.lock().unwrap().push(command.to_string());
        let (stream, ends) = channel_pair();
        let output = format!("ran: {}\n", command);
        tokio::spawn(async move {
            let _ = ends
                .events
                .send(ChannelEvent::Stdout(Bytes::from(output)))
                .await;
            let _ = ends
                .events
                .send(ChannelEvent::Exit {
                    code: Some(0),
                    signal: None,
                })
                .await;
        });
        Ok(stream)
    }

    async fn shell(&self, _pty: bool) -> Result<ChannelStream, HostError> {
        let (stream, ends) = channel_pair();
        self.shells.lock().unwrap().push(ends);
        Ok(stream)
    }

    async fn forward(&self, host: &str, port: u16) -> Result<TunnelSocket, HostError> {
        let target = format!("{}:{}", host, port);
        self.forwards.lock().unwrap().push(target.clone());
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let stream = TcpStream::connect(listener.local_addr()?)?;
        let (peer, _) = listener.accept()?;
        self.tunnel_peers.lock().unwrap().push(peer);
        Ok(TunnelSocket { stream, target })
    }

    async fn keepalive(&self) -> Result<(), HostError> {
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}
