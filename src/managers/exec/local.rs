use crate::constants::limits::READ_CHUNK_BYTES;
use crate::constants::network::TIMEOUT_EXEC_KILL_GRACE_MS;
use crate::errors::HostError;
use crate::transport::{channel_pair, ChannelControl, ChannelEnds, ChannelEvent, ChannelStream};
use bytes::Bytes;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Runs `command` through `sh -c` and exposes it as a [`ChannelStream`].
///
/// The child leads its own process group so interrupts and kills reach
/// everything the shell started. With `interactive` unset stdin is closed
/// up front, matching a one-shot exec.
pub fn spawn(command: &str, interactive: bool) -> Result<ChannelStream, HostError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdin(if interactive {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|err| HostError::exec(format!("Failed to spawn command: {}", err)))?;
    let (stream, ends) = channel_pair();
    tokio::spawn(pump(child, ends));
    Ok(stream)
}

async fn forward_output<R>(mut reader: R, events: mpsc::Sender<ChannelEvent>, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        let event = if stderr {
            ChannelEvent::Stderr(chunk)
        } else {
            ChannelEvent::Stdout(chunk)
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}

async fn pump(mut child: Child, ends: ChannelEnds) {
    let ChannelEnds {
        events,
        mut control,
    } = ends;
    let pid = child.id();
    let mut stdin = child.stdin.take();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_output(stdout, events.clone(), false)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_output(stderr, events.clone(), true)));
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status.ok(),
            message = control.recv() => match message {
                Some(ChannelControl::Input(bytes)) => {
                    if let Some(writer) = stdin.as_mut() {
                        if writer.write_all(&bytes).await.is_err() {
                            stdin = None;
                        }
                    }
                }
                Some(ChannelControl::Interrupt) => interrupt(pid),
                Some(ChannelControl::Close) | None => {
                    kill_group(pid);
                    let _ = child.kill().await;
                    break child.wait().await.ok();
                }
            },
        }
    };
    drop(stdin);

    let grace = Duration::from_millis(TIMEOUT_EXEC_KILL_GRACE_MS);
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(grace, reader).await.is_err() {
            // A leftover grandchild still holds the pipe open.
            abort.abort();
        }
    }

    let (code, signal) = status.map(describe_exit).unwrap_or((None, None));
    let _ = events.send(ChannelEvent::Exit { code, signal }).await;
}

#[cfg(unix)]
fn describe_exit(status: ExitStatus) -> (Option<i32>, Option<String>) {
    use std::os::unix::process::ExitStatusExt;
    let signal = status
        .signal()
        .map(|raw| match Signal::try_from(raw) {
            Ok(sig) => sig.as_str().to_string(),
            Err(_) => format!("SIG{}", raw),
        });
    (status.code(), signal)
}

#[cfg(not(unix))]
fn describe_exit(status: ExitStatus) -> (Option<i32>, Option<String>) {
    (status.code(), None)
}

#[cfg(unix)]
fn interrupt(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGINT);
    }
}

#[cfg(not(unix))]
fn interrupt(_pid: Option<u32>) {}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // Fails harmlessly once the group is gone.
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
