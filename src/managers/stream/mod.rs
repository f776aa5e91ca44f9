pub mod line_buffer;

use crate::constants::{limits, stream as stream_consts};
use crate::errors::HostError;
use crate::managers::exec::local;
use crate::managers::hosts::connection::Connection;
use crate::services::logger::Logger;
use crate::transport::{ChannelControl, ChannelEvent, ChannelStream};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use line_buffer::LineBuffer;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Raw stdout bytes, exactly as received.
    Data(Bytes),
    Stderr(Bytes),
    /// A complete stdout line, trimmed and never empty.
    Line(String),
    Closed {
        exit_code: Option<i32>,
        signal: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub max_line_buffer: usize,
    /// Remote sessions only: request a PTY so an interrupt byte becomes
    /// SIGINT on the far side.
    pub pty: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_line_buffer: limits::MAX_LINE_BUFFER_BYTES,
            pty: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub session_id: String,
    pub host_id: String,
    pub command: String,
    pub is_active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub lines_processed: u64,
    pub bytes_received: u64,
    /// Data/stderr chunks skipped because the consumer fell behind.
    pub dropped_chunks: u64,
}

/// How the session's process comes to life on `start`.
pub enum Launch {
    /// Remote shell channel opened at creation; the command is typed into it.
    Shell(ChannelStream),
    /// Local subprocess spawned at start.
    Local,
}

#[derive(Default)]
struct Counters {
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    ended: Option<Instant>,
    lines: u64,
    bytes: u64,
    dropped: u64,
}

struct StreamShared {
    id: String,
    host_id: String,
    command: String,
    max_line_buffer: usize,
    counters: Mutex<Counters>,
    active: watch::Sender<bool>,
    finished: AtomicBool,
    attached: AtomicBool,
    launch: Mutex<Option<Launch>>,
    control: Mutex<Option<mpsc::Sender<ChannelControl>>>,
    sink: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    events: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    owned: Mutex<Option<Connection>>,
    registry: StreamRegistry,
    logger: Logger,
}

/// Handle to one long-lived command. Clones refer to the same session.
#[derive(Clone)]
pub struct StreamSession {
    shared: Arc<StreamShared>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

impl StreamSession {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn host_id(&self) -> &str {
        &self.shared.host_id
    }

    pub fn command(&self) -> &str {
        &self.shared.command
    }

    pub fn is_active(&self) -> bool {
        *self.shared.active.borrow()
    }

    /// Takes the event receiver. Only the first caller gets it; until then
    /// output is counted but not queued.
    pub fn events(&self) -> Option<mpsc::Receiver<StreamEvent>> {
        let events = lock(&self.shared.events).take();
        if events.is_some() {
            self.shared.attached.store(true, Ordering::SeqCst);
        }
        events
    }

    pub async fn start(&self) -> Result<(), HostError> {
        let launch = lock(&self.shared.launch).take().ok_or_else(|| {
            HostError::exec(format!("Stream session {} was already started", self.id()))
        })?;
        let channel = match launch {
            Launch::Shell(channel) => {
                let line = format!("{}\n", self.shared.command);
                channel
                    .control
                    .send(ChannelControl::Input(Bytes::from(line)))
                    .await
                    .map_err(|_| {
                        HostError::exec(format!(
                            "Shell channel for stream {} closed before start",
                            self.id()
                        ))
                    })?;
                channel
            }
            Launch::Local => local::spawn(&self.shared.command, true)?,
        };
        let Some(sink) = lock(&self.shared.sink).take() else {
            return Err(HostError::exec(format!(
                "Stream session {} is already closed",
                self.id()
            )));
        };

        let ChannelStream { events, control } = channel;
        *lock(&self.shared.control) = Some(control);
        {
            let mut counters = lock(&self.shared.counters);
            counters.started_at = Some(Utc::now());
            counters.started = Some(Instant::now());
        }
        self.shared.active.send_replace(true);
        self.shared.logger.info(
            "Stream session started",
            Some(&serde_json::json!({
                "session": self.id(),
                "host": self.host_id(),
            })),
        );
        tokio::spawn(drive(self.shared.clone(), events, sink));
        Ok(())
    }

    pub async fn write(&self, input: impl Into<Bytes>) -> Result<(), HostError> {
        let control = lock(&self.shared.control).clone();
        let Some(control) = control else {
            return Err(HostError::exec(format!(
                "Stream session {} is not running",
                self.id()
            )));
        };
        control
            .send(ChannelControl::Input(input.into()))
            .await
            .map_err(|_| HostError::exec(format!("Stream session {} has ended", self.id())))
    }

    /// Sends an interrupt and waits `grace` for the process to end on its
    /// own before destroying the session.
    pub async fn stop(&self, grace: Duration) {
        if !self.is_active() {
            self.destroy().await;
            return;
        }
        let control = lock(&self.shared.control).clone();
        if let Some(control) = control {
            let _ = control.send(ChannelControl::Interrupt).await;
        }
        let mut active = self.shared.active.subscribe();
        let ended = tokio::time::timeout(grace, wait_until_inactive(&mut active)).await;
        if ended.is_err() {
            self.destroy().await;
        }
    }

    pub async fn stop_default(&self) {
        self.stop(Duration::from_millis(stream_consts::STOP_GRACE_MS))
            .await;
    }

    /// Terminates the session immediately.
    pub async fn destroy(&self) {
        let control = lock(&self.shared.control).take();
        if let Some(control) = control {
            let _ = control.send(ChannelControl::Close).await;
        }
        let pending = lock(&self.shared.launch).take();
        if let Some(Launch::Shell(channel)) = pending {
            let _ = channel.control.send(ChannelControl::Close).await;
        }
        // A session that never started has no driver to emit the close.
        let sink = lock(&self.shared.sink).take();
        if let Some(sink) = sink {
            let _ = sink.try_send(StreamEvent::Closed {
                exit_code: None,
                signal: None,
            });
        }
        self.shared.finish().await;
    }

    pub fn stats(&self) -> StreamStats {
        let counters = lock(&self.shared.counters);
        let duration_ms = match (counters.started, counters.ended) {
            (Some(start), Some(end)) => end.duration_since(start).as_millis() as u64,
            (Some(start), None) => start.elapsed().as_millis() as u64,
            _ => 0,
        };
        StreamStats {
            session_id: self.shared.id.clone(),
            host_id: self.shared.host_id.clone(),
            command: self.shared.command.clone(),
            is_active: self.is_active(),
            started_at: counters.started_at,
            duration_ms,
            lines_processed: counters.lines,
            bytes_received: counters.bytes,
            dropped_chunks: counters.dropped,
        }
    }
}

impl StreamShared {
    fn record_bytes(&self, n: usize) {
        lock(&self.counters).bytes += n as u64;
    }

    fn record_line(&self) {
        lock(&self.counters).lines += 1;
    }

    fn has_consumer(&self, sink: &mpsc::Sender<StreamEvent>) -> bool {
        self.attached.load(Ordering::SeqCst) && !sink.is_closed()
    }

    /// Queues a raw chunk if there is room; a full queue drops it.
    fn offer(&self, sink: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
        if !self.has_consumer(sink) {
            return;
        }
        if let Err(TrySendError::Full(_)) = sink.try_send(event) {
            lock(&self.counters).dropped += 1;
        }
    }

    /// Waits for room for a line or close event, unless the session is torn
    /// down first.
    async fn deliver(
        &self,
        sink: &mpsc::Sender<StreamEvent>,
        active: &mut watch::Receiver<bool>,
        event: StreamEvent,
    ) {
        if !self.has_consumer(sink) {
            return;
        }
        tokio::select! {
            _ = sink.send(event) => {}
            _ = wait_until_inactive(active) => {}
        }
    }

    /// Idempotent teardown shared by the driver and `destroy`.
    async fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut counters = lock(&self.counters);
            if counters.started.is_some() {
                counters.ended = Some(Instant::now());
            }
        }
        self.active.send_replace(false);
        lock(&self.control).take();
        self.registry.unregister(&self.id);
        let owned = lock(&self.owned).take();
        if let Some(conn) = owned {
            conn.close().await;
        }
        self.logger.info(
            "Stream session closed",
            Some(&serde_json::json!({ "session": self.id, "host": self.host_id })),
        );
    }
}

async fn wait_until_inactive(active: &mut watch::Receiver<bool>) {
    loop {
        let running = *active.borrow_and_update();
        if !running || active.changed().await.is_err() {
            return;
        }
    }
}

async fn drive(
    shared: Arc<StreamShared>,
    mut events: mpsc::Receiver<ChannelEvent>,
    sink: mpsc::Sender<StreamEvent>,
) {
    let mut lines = LineBuffer::new(shared.max_line_buffer);
    let mut active = shared.active.subscribe();
    let (mut exit_code, mut signal) = (None, None);
    // The channel is always drained; a missing or slow consumer never stalls
    // the command.
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Stdout(chunk) => {
                shared.record_bytes(chunk.len());
                let framed = lines.push(&chunk);
                shared.offer(&sink, StreamEvent::Data(chunk));
                for line in framed {
                    shared.record_line();
                    shared
                        .deliver(&sink, &mut active, StreamEvent::Line(line))
                        .await;
                }
            }
            ChannelEvent::Stderr(chunk) => {
                shared.record_bytes(chunk.len());
                shared.offer(&sink, StreamEvent::Stderr(chunk));
            }
            ChannelEvent::Exit {
                code,
                signal: exit_signal,
            } => {
                exit_code = code;
                signal = exit_signal;
            }
        }
    }
    if let Some(line) = lines.flush() {
        shared.record_line();
        shared
            .deliver(&sink, &mut active, StreamEvent::Line(line))
            .await;
    }
    shared.finish().await;
    if shared.has_consumer(&sink) {
        let _ = sink.send(StreamEvent::Closed { exit_code, signal }).await;
    }
}

/// Tracks every stream session that has not closed yet.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    sessions: Arc<DashMap<String, StreamSession>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new, not yet started session. `owned` is a bypass
    /// connection closed together with the session.
    pub fn open(
        &self,
        host_id: &str,
        command: &str,
        launch: Launch,
        owned: Option<Connection>,
        options: &StreamOptions,
        logger: &Logger,
    ) -> StreamSession {
        let (sink, events) = mpsc::channel(limits::CHANNEL_EVENT_CAPACITY);
        let (active, _) = watch::channel(false);
        let session = StreamSession {
            shared: Arc::new(StreamShared {
                id: uuid::Uuid::new_v4().to_string(),
                host_id: host_id.to_string(),
                command: command.to_string(),
                max_line_buffer: options.max_line_buffer,
                counters: Mutex::new(Counters::default()),
                active,
                finished: AtomicBool::new(false),
                attached: AtomicBool::new(false),
                launch: Mutex::new(Some(launch)),
                control: Mutex::new(None),
                sink: Mutex::new(Some(sink)),
                events: Mutex::new(Some(events)),
                owned: Mutex::new(owned),
                registry: self.clone(),
                logger: logger.child("stream"),
            }),
        };
        self.sessions
            .insert(session.id().to_string(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<StreamSession> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    fn unregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions whose process is currently running.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    pub async fn destroy_all(&self) {
        let sessions: Vec<StreamSession> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.destroy().await;
        }
    }
}
