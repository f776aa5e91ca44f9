use super::{
    channel_pair, ChannelControl, ChannelEnds, ChannelEvent, ChannelStream, RemoteSession,
    TunnelSocket, Transport,
};
use crate::constants::limits::READ_CHUNK_BYTES;
use crate::constants::network::CHANNEL_POLL_IDLE_MS;
use crate::constants::stream::INTERRUPT;
use crate::errors::HostError;
use crate::services::host_registry::{AuthMethod, HostConfig};
use crate::services::logger::Logger;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use ssh2::{Channel, Session};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// libssh2-backed transport. All libssh2 calls run on blocking threads.
#[derive(Clone)]
pub struct Ssh2Transport {
    logger: Logger,
}

impl Ssh2Transport {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("ssh"),
        }
    }
}

#[async_trait]
impl Transport for Ssh2Transport {
    async fn handshake(
        &self,
        host: &HostConfig,
        tunnel: Option<TunnelSocket>,
    ) -> Result<Arc<dyn RemoteSession>, HostError> {
        let config = host.clone();
        let via_tunnel = tunnel.as_ref().map(|t| t.target.clone());
        self.logger.debug(
            "handshake",
            Some(&serde_json::json!({
                "host": config.id,
                "address": config.address(),
                "tunnel": via_tunnel,
            })),
        );
        let deadline = Instant::now() + host.timeout();
        let abort = HandshakeAbort::default();
        let mut guard = AbortOnDrop(Some(abort.clone()));
        let mut worker = {
            let abort = abort.clone();
            tokio::task::spawn_blocking(move || connect_session(&config, tunnel, deadline, &abort))
        };
        let joined = tokio::select! {
            joined = &mut worker => joined,
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                abort.abort();
                // The worker fails fast once its socket is shut down.
                let _ = worker.await;
                guard.disarm();
                return Err(HostError::timeout(format!(
                    "SSH handshake with {} exceeded {}ms",
                    host.address(),
                    host.timeout().as_millis()
                )));
            }
        };
        guard.disarm();
        let session = joined.map_err(|_| HostError::protocol("SSH handshake task failed"))??;
        Ok(Arc::new(Ssh2Session {
            session: Arc::new(session),
            alive: Arc::new(AtomicBool::new(true)),
            op_timeout: host.timeout(),
            host_id: host.id.clone(),
        }))
    }
}

struct Ssh2Session {
    session: Arc<Session>,
    alive: Arc<AtomicBool>,
    op_timeout: Duration,
    host_id: String,
}

impl Ssh2Session {
    async fn open_channel<F>(&self, setup: F) -> Result<ChannelStream, HostError>
    where
        F: FnOnce(&mut Channel, Instant) -> Result<(), HostError> + Send + 'static,
    {
        let session = self.session.clone();
        let alive = self.alive.clone();
        let deadline = Instant::now() + self.op_timeout;
        let host_id = self.host_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut channel = retry_eagain(deadline, || session.channel_session())
                .map_err(|err| mark_dead(&alive, err))?;
            setup(&mut channel, deadline)?;
            let (stream, ends) = channel_pair();
            std::thread::Builder::new()
                .name(format!("hostlink-ch-{}", host_id))
                .spawn(move || pump_channel(channel, ends))
                .map_err(|err| HostError::exec(format!("Failed to start channel pump: {}", err)))?;
            Ok(stream)
        })
        .await
        .map_err(|_| HostError::exec("SSH channel task failed"))?
    }
}

#[async_trait]
impl RemoteSession for Ssh2Session {
    async fn exec(&self, command: &str) -> Result<ChannelStream, HostError> {
        let command = command.to_string();
        self.open_channel(move |channel, deadline| {
            retry_eagain(deadline, || channel.exec(&command))
        })
        .await
    }

    async fn shell(&self, pty: bool) -> Result<ChannelStream, HostError> {
        self.open_channel(move |channel, deadline| {
            if pty {
                retry_eagain(deadline, || channel.request_pty("xterm", None, None))?;
            }
            retry_eagain(deadline, || channel.shell())
        })
        .await
    }

    async fn forward(&self, host: &str, port: u16) -> Result<TunnelSocket, HostError> {
        let session = self.session.clone();
        let alive = self.alive.clone();
        let deadline = Instant::now() + self.op_timeout;
        let target_host = host.to_string();
        tokio::task::spawn_blocking(move || {
            let channel = retry_eagain(deadline, || {
                session.channel_direct_tcpip(&target_host, port, None)
            })
            .map_err(|err| mark_dead(&alive, err))?;
            let listener = TcpListener::bind(("127.0.0.1", 0))?;
            let client = TcpStream::connect(listener.local_addr()?)?;
            let (server, _) = listener.accept()?;
            let target = format!("{}:{}", target_host, port);
            std::thread::Builder::new()
                .name(format!("hostlink-tunnel-{}", target))
                .spawn(move || pump_tunnel(channel, server))?;
            Ok(TunnelSocket {
                stream: client,
                target,
            })
        })
        .await
        .map_err(|_| HostError::protocol("SSH tunnel task failed"))?
    }

    async fn keepalive(&self) -> Result<(), HostError> {
        let session = self.session.clone();
        let alive = self.alive.clone();
        let deadline = Instant::now() + self.op_timeout;
        tokio::task::spawn_blocking(move || {
            retry_eagain(deadline, || session.keepalive_send())
                .map(|_| ())
                .map_err(|err| mark_dead(&alive, err))
        })
        .await
        .map_err(|_| HostError::protocol("SSH keepalive task failed"))?
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let session = self.session.clone();
        let deadline = Instant::now() + self.op_timeout;
        let _ = tokio::task::spawn_blocking(move || {
            let _ = retry_eagain(deadline, || {
                session.disconnect(None, "connection closed by hostlink", None)
            });
        })
        .await;
    }
}

fn mark_dead(alive: &AtomicBool, err: HostError) -> HostError {
    if !err.is_timeout() {
        alive.store(false, Ordering::SeqCst);
    }
    err
}

fn connect_tcp(host: &HostConfig, timeout: Duration) -> Result<TcpStream, HostError> {
    let addrs = (host.host.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|err| {
            HostError::network(format!("Failed to resolve {}: {}", host.address(), err))
        })?;
    let mut last_err: Option<io::Error> = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    let err = last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"));
    if err.kind() == io::ErrorKind::TimedOut {
        return Err(HostError::timeout(format!(
            "Timed out connecting to {} after {}ms",
            host.address(),
            timeout.as_millis()
        )));
    }
    Err(HostError::network(format!(
        "Failed to connect to {}: {}",
        host.address(),
        err
    )))
}

/// Socket of an in-flight handshake, shared with the async side so it can be
/// shut down once the handshake budget is spent.
#[derive(Clone, Default)]
struct HandshakeAbort {
    state: Arc<Mutex<AbortState>>,
}

#[derive(Default)]
struct AbortState {
    aborted: bool,
    socket: Option<TcpStream>,
}

impl HandshakeAbort {
    fn attach(&self, tcp: &TcpStream) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if state.aborted {
            let _ = tcp.shutdown(std::net::Shutdown::Both);
            return Err(HostError::timeout("SSH handshake aborted"));
        }
        state.socket = tcp.try_clone().ok();
        Ok(())
    }

    fn detach(&self) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.socket = None;
        if state.aborted {
            return Err(HostError::timeout("SSH handshake aborted"));
        }
        Ok(())
    }

    fn abort(&self) {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.aborted = true;
        if let Some(socket) = state.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Cuts the handshake socket if the handshake future is dropped mid-flight.
struct AbortOnDrop(Option<HandshakeAbort>);

impl AbortOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(abort) = self.0.take() {
            abort.abort();
        }
    }
}

/// Time left before `deadline`, or a timeout naming the phase that ran out.
fn remaining_budget(deadline: Instant, phase: &str) -> Result<Duration, HostError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(HostError::timeout(format!(
            "SSH {} ran out of handshake budget",
            phase
        )));
    }
    Ok(left)
}

fn libssh2_timeout(budget: Duration) -> u32 {
    budget.as_millis().clamp(1, u32::MAX as u128) as u32
}

fn connect_session(
    host: &HostConfig,
    tunnel: Option<TunnelSocket>,
    deadline: Instant,
    abort: &HandshakeAbort,
) -> Result<Session, HostError> {
    let tcp = match tunnel {
        Some(tunnel) => tunnel.stream,
        None => connect_tcp(host, remaining_budget(deadline, "connect")?)?,
    };
    abort.attach(&tcp)?;
    let budget = remaining_budget(deadline, "handshake")?;
    tcp.set_read_timeout(Some(budget)).ok();
    tcp.set_write_timeout(Some(budget)).ok();

    let mut session =
        Session::new().map_err(|_| HostError::protocol("Failed to create SSH session"))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(libssh2_timeout(budget));
    session
        .handshake()
        .map_err(|err| map_ssh_error(err, "SSH handshake failed"))?;

    verify_host_key(&session, host)?;
    session.set_timeout(libssh2_timeout(remaining_budget(deadline, "authentication")?));
    authenticate(&session, host)?;
    abort.detach()?;

    let interval = std::cmp::max(1, host.keep_alive_interval().as_secs()) as u32;
    session.set_keepalive(true, interval);
    session.set_blocking(false);
    Ok(session)
}

fn authenticate(session: &Session, host: &HostConfig) -> Result<(), HostError> {
    let result = match host.auth_method() {
        AuthMethod::Key => {
            let key = host.load_private_key()?;
            session.userauth_pubkey_memory(&host.username, None, &key, host.passphrase.as_deref())
        }
        AuthMethod::Password => {
            let password = host.password.as_deref().unwrap_or("");
            session.userauth_password(&host.username, password)
        }
    };
    if let Err(err) = result {
        let mapped = map_ssh_error(err, "SSH authentication failed");
        if mapped.is_timeout() {
            return Err(mapped);
        }
        return Err(HostError::auth(format!(
            "Authentication as '{}' on {} failed: {}",
            host.username,
            host.address(),
            mapped.message
        )));
    }
    if !session.authenticated() {
        return Err(HostError::auth(format!(
            "Authentication as '{}' on {} was rejected",
            host.username,
            host.address()
        )));
    }
    Ok(())
}

fn normalize_fingerprint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('=');
    match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => {
            format!("SHA256:{}", trimmed[7..].trim())
        }
        _ => format!("SHA256:{}", trimmed),
    }
}

fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

fn verify_host_key(session: &Session, host: &HostConfig) -> Result<(), HostError> {
    let Some(expected) = host.host_key_fingerprint.as_deref() else {
        return Ok(());
    };
    let expected = normalize_fingerprint(expected);
    let observed = fingerprint_host_key_sha256(session);
    if observed.as_deref() != Some(expected.as_str()) {
        return Err(HostError::auth(format!(
            "Host key mismatch for {} (expected {}, got {})",
            host.address(),
            expected,
            observed.unwrap_or_else(|| "unknown".to_string())
        )));
    }
    Ok(())
}

fn map_ssh_error(err: ssh2::Error, context: &str) -> HostError {
    let io_err: io::Error = err.into();
    match io_err.kind() {
        io::ErrorKind::TimedOut => HostError::timeout(format!("{}: operation timed out", context)),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => HostError::network(format!("{}: {}", context, io_err)),
        _ => HostError::protocol(format!("{}: {}", context, io_err)),
    }
}

fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Drives a libssh2 call on a non-blocking session until it stops
/// returning EAGAIN or `deadline` passes.
fn retry_eagain<T>(
    deadline: Instant,
    mut op: impl FnMut() -> Result<T, ssh2::Error>,
) -> Result<T, HostError> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if would_block(&err) => {
                if Instant::now() >= deadline {
                    return Err(HostError::timeout("SSH channel operation timed out"));
                }
                std::thread::sleep(Duration::from_millis(CHANNEL_POLL_IDLE_MS));
            }
            Err(err) => return Err(map_ssh_error(err, "SSH channel error")),
        }
    }
}

fn write_all_nonblocking(writer: &mut impl Write, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(CHANNEL_POLL_IDLE_MS));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

enum ReadOutcome {
    Data(usize),
    Idle,
    Closed,
}

fn read_nonblocking(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    match reader.read(buf) {
        Ok(0) => ReadOutcome::Idle,
        Ok(n) => ReadOutcome::Data(n),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Idle,
        Err(_) => ReadOutcome::Closed,
    }
}

fn close_channel(channel: &mut Channel) {
    let deadline = Instant::now() + Duration::from_millis(500);
    let _ = retry_eagain(deadline, || channel.close());
}

enum Offer {
    Sent,
    Full,
    Gone,
}

/// Hands `pending` to the consumer without blocking; a full queue leaves it
/// in place for the next round.
fn offer(events: &mpsc::Sender<ChannelEvent>, pending: &mut Option<ChannelEvent>) -> Offer {
    let Some(event) = pending.take() else {
        return Offer::Sent;
    };
    match events.try_send(event) {
        Ok(()) => Offer::Sent,
        Err(TrySendError::Full(event)) => {
            *pending = Some(event);
            Offer::Full
        }
        Err(TrySendError::Closed(_)) => Offer::Gone,
    }
}

fn read_event(
    reader: &mut impl Read,
    buf: &mut [u8],
    wrap: fn(Bytes) -> ChannelEvent,
) -> Result<Option<ChannelEvent>, ()> {
    match read_nonblocking(reader, buf) {
        ReadOutcome::Data(n) => Ok(Some(wrap(Bytes::copy_from_slice(&buf[..n])))),
        ReadOutcome::Idle => Ok(None),
        ReadOutcome::Closed => Err(()),
    }
}

/// Applies queued control messages. Returns false once the channel must close.
fn apply_control(channel: &mut Channel, control: &mut mpsc::Receiver<ChannelControl>) -> bool {
    loop {
        match control.try_recv() {
            Ok(ChannelControl::Input(bytes)) => {
                let _ = write_all_nonblocking(channel, &bytes);
            }
            Ok(ChannelControl::Interrupt) => {
                let _ = write_all_nonblocking(channel, INTERRUPT);
            }
            Ok(ChannelControl::Close) | Err(TryRecvError::Disconnected) => return false,
            Err(TryRecvError::Empty) => return true,
        }
    }
}

fn pump_channel(mut channel: Channel, ends: ChannelEnds) {
    let ChannelEnds {
        events,
        mut control,
    } = ends;
    let mut stderr = channel.stderr();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    // At most one event waits for queue space; nothing more is read meanwhile.
    let mut pending: Option<ChannelEvent> = None;

    loop {
        if !apply_control(&mut channel, &mut control) {
            close_channel(&mut channel);
            return;
        }

        let mut progressed = false;
        let mut ended = false;
        for source in 0..2 {
            if pending.is_none() {
                let read = if source == 0 {
                    read_event(&mut channel, &mut buf, ChannelEvent::Stdout)
                } else {
                    read_event(&mut stderr, &mut buf, ChannelEvent::Stderr)
                };
                match read {
                    Ok(event) => pending = event,
                    Err(()) => ended = true,
                }
            }
            let had_event = pending.is_some();
            match offer(&events, &mut pending) {
                Offer::Sent => progressed |= had_event,
                Offer::Full => {}
                Offer::Gone => {
                    close_channel(&mut channel);
                    return;
                }
            }
        }

        if pending.is_none() && (ended || (channel.eof() && !progressed)) {
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(CHANNEL_POLL_IDLE_MS));
        }
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    let _ = retry_eagain(deadline, || channel.wait_close());
    let code = channel.exit_status().ok();
    let signal = channel.exit_signal().ok().and_then(|sig| sig.exit_signal);
    pending = Some(ChannelEvent::Exit { code, signal });
    loop {
        match offer(&events, &mut pending) {
            Offer::Sent | Offer::Gone => return,
            Offer::Full => {
                if !apply_control(&mut channel, &mut control) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(CHANNEL_POLL_IDLE_MS));
            }
        }
    }
}

fn pump_tunnel(mut channel: Channel, mut socket: TcpStream) {
    if socket.set_nonblocking(true).is_err() {
        close_channel(&mut channel);
        return;
    }
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let mut progressed = false;
        match socket.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if write_all_nonblocking(&mut channel, &buf[..n]).is_err() {
                    break;
                }
                progressed = true;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }
        match read_nonblocking(&mut channel, &mut buf) {
            ReadOutcome::Data(n) => {
                if write_all_nonblocking(&mut socket, &buf[..n]).is_err() {
                    break;
                }
                progressed = true;
            }
            ReadOutcome::Idle => {}
            ReadOutcome::Closed => break,
        }
        if channel.eof() && !progressed {
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(CHANNEL_POLL_IDLE_MS));
        }
    }
    let _ = socket.shutdown(std::net::Shutdown::Both);
    close_channel(&mut channel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fingerprint_accepts_prefix_and_padding() {
        assert_eq!(normalize_fingerprint("sha256:abc="), "SHA256:abc");
        assert_eq!(normalize_fingerprint("SHA256:abc"), "SHA256:abc");
        assert_eq!(normalize_fingerprint(" abc== "), "SHA256:abc");
    }

    #[test]
    fn write_all_nonblocking_writes_everything() {
        let mut out: Vec<u8> = Vec::new();
        write_all_nonblocking(&mut out, b"payload").unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn connect_tcp_reports_refused_as_network_error() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut host = HostConfig::ssh("closed", "127.0.0.1", "nobody");
        host.port = port;
        let err = connect_tcp(&host, Duration::from_millis(500)).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Network);
    }

    #[test]
    fn offer_keeps_the_event_while_the_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut pending = Some(ChannelEvent::Stdout(Bytes::from_static(b"a")));
        assert!(matches!(offer(&tx, &mut pending), Offer::Sent));
        assert!(pending.is_none());

        pending = Some(ChannelEvent::Stderr(Bytes::from_static(b"b")));
        assert!(matches!(offer(&tx, &mut pending), Offer::Full));
        assert_eq!(pending, Some(ChannelEvent::Stderr(Bytes::from_static(b"b"))));

        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::Stdout(Bytes::from_static(b"a"))
        );
        assert!(matches!(offer(&tx, &mut pending), Offer::Sent));
        drop(rx);
        pending = Some(ChannelEvent::Exit {
            code: Some(0),
            signal: None,
        });
        assert!(matches!(offer(&tx, &mut pending), Offer::Gone));
    }

    #[test]
    fn remaining_budget_times_out_past_deadline() {
        let err = remaining_budget(Instant::now(), "authentication").unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Timeout);
        assert!(err.message.contains("authentication"));

        let left = remaining_budget(Instant::now() + Duration::from_secs(5), "connect").unwrap();
        assert!(left <= Duration::from_secs(5));
        assert!(left > Duration::from_secs(4));
    }

    #[test]
    fn abort_shuts_down_the_attached_socket() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let abort = HandshakeAbort::default();
        abort.attach(&client).unwrap();
        abort.abort();
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), 0);

        // Anything attached after the abort is cut immediately.
        let late = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let err = abort.attach(&late).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Timeout);
        assert!(abort.detach().is_err());
    }

    #[tokio::test]
    async fn handshake_against_silent_server_ends_within_budget() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts, never answers, and reports whether the client hung up.
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf) {
                    Ok(0) => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        });

        let mut host = HostConfig::ssh("silent", "127.0.0.1", "nobody");
        host.port = port;
        host.timeout = 300;
        let transport = Ssh2Transport::new(Logger::new("test"));
        let started = Instant::now();
        let err = match transport.handshake(&host, None).await {
            Ok(_) => panic!("silent server cannot complete a handshake"),
            Err(err) => err,
        };
        assert_eq!(err.kind, crate::errors::ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));

        let hung_up = tokio::task::spawn_blocking(move || server.join().unwrap())
            .await
            .unwrap();
        assert!(hung_up, "client socket stayed open after the handshake returned");
    }
}
