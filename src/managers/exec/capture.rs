use crate::errors::HostError;
use crate::transport::{ChannelEvent, ChannelStream};
use std::time::Duration;

/// Byte accumulator that stops growing at `limit` and remembers it did.
#[derive(Debug)]
pub struct OutputCapture {
    buf: Vec<u8>,
    limit: usize,
    total: usize,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            total: 0,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        let remaining = self.limit.saturating_sub(self.buf.len());
        if chunk.len() <= remaining {
            self.buf.extend_from_slice(chunk);
        } else {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Lossy UTF-8 text, with a marker appended when the cap was hit.
    pub fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            text.push_str(&format!(
                "\n[output truncated: {} of {} bytes shown]",
                self.buf.len(),
                self.total
            ));
        }
        text
    }
}

#[derive(Debug)]
pub struct Collected {
    pub stdout: OutputCapture,
    pub stderr: OutputCapture,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// Drains `stream` until the producer closes it.
///
/// When `timeout` elapses first the producer is told to close and this
/// waits (up to `grace`) for it to tear the process or channel down before
/// returning a timeout error.
pub async fn collect(
    mut stream: ChannelStream,
    timeout: Duration,
    grace: Duration,
    max_output: usize,
) -> Result<Collected, HostError> {
    let mut collected = Collected {
        stdout: OutputCapture::new(max_output),
        stderr: OutputCapture::new(max_output),
        exit_code: None,
        signal: None,
    };
    let finished = tokio::time::timeout(timeout, async {
        while let Some(event) = stream.events.recv().await {
            match event {
                ChannelEvent::Stdout(chunk) => collected.stdout.push(&chunk),
                ChannelEvent::Stderr(chunk) => collected.stderr.push(&chunk),
                ChannelEvent::Exit { code, signal } => {
                    collected.exit_code = code;
                    collected.signal = signal;
                }
            }
        }
    })
    .await;

    if finished.is_err() {
        let terminated = stream.terminate(grace).await;
        return Err(HostError::timeout(format!(
            "Command timed out after {}ms",
            timeout.as_millis()
        ))
        .with_details(serde_json::json!({
            "timeout_ms": timeout.as_millis() as u64,
            "terminated": terminated,
            "stdout_bytes": collected.stdout.total_bytes(),
            "stderr_bytes": collected.stderr.total_bytes(),
        })));
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel_pair, ChannelControl};
    use bytes::Bytes;

    #[test]
    fn capture_truncates_with_marker() {
        let mut capture = OutputCapture::new(4);
        capture.push(b"ab");
        capture.push(b"cdef");
        capture.push(b"gh");
        assert!(capture.is_truncated());
        assert_eq!(capture.total_bytes(), 8);
        let text = capture.into_text();
        assert!(text.starts_with("abcd\n[output truncated"));
    }

    #[test]
    fn capture_under_limit_is_verbatim() {
        let mut capture = OutputCapture::new(16);
        capture.push(b"hello");
        assert!(!capture.is_truncated());
        assert_eq!(capture.into_text(), "hello");
    }

    #[tokio::test]
    async fn collect_times_out_and_closes_producer() {
        let (stream, mut ends) = channel_pair();
        let producer = tokio::spawn(async move {
            ends.events
                .send(ChannelEvent::Stdout(Bytes::from_static(b"tick\n")))
                .await
                .unwrap();
            let control = ends.control.recv().await;
            assert_eq!(control, Some(ChannelControl::Close));
        });
        let err = collect(
            stream,
            Duration::from_millis(50),
            Duration::from_secs(1),
            1024,
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.details.as_ref().unwrap()["terminated"], true);
        producer.await.unwrap();
    }
}
