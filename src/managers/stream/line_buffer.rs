/// Splits an unbounded byte stream into trimmed, non-empty lines.
///
/// Bytes are buffered raw so multi-byte characters split across chunks
/// decode correctly. When the pending partial line grows past `max_bytes`
/// it is flushed as one line.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_bytes: usize,
}

fn finish_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl LineBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(line) = finish_line(&self.pending[start..end]) {
                lines.push(line);
            }
            start = end + 1;
        }
        self.pending.drain(..start);
        if self.pending.len() > self.max_bytes {
            lines.extend(self.flush());
        }
        lines
    }

    /// Emits whatever partial line is buffered.
    pub fn flush(&mut self) -> Option<String> {
        let line = finish_line(&self.pending);
        self.pending.clear();
        line
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_lines_across_chunks() {
        let mut buffer = LineBuffer::new(1024);
        assert!(buffer.push(b"hello ").is_empty());
        assert_eq!(buffer.push(b"world\nfo"), vec!["hello world".to_string()]);
        assert_eq!(buffer.pending_len(), 2);
        assert_eq!(buffer.push(b"o\n"), vec!["foo".to_string()]);
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn blank_lines_are_dropped() {
        let mut buffer = LineBuffer::new(1024);
        assert_eq!(
            buffer.push(b"a\n\n  \r\nb\r\n"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn oversized_partial_line_is_force_flushed() {
        let mut buffer = LineBuffer::new(8);
        assert!(buffer.push(b"12345").is_empty());
        assert_eq!(buffer.push(b"6789"), vec!["123456789".to_string()]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn split_utf8_sequence_survives() {
        let mut buffer = LineBuffer::new(64);
        let text = "caf\u{e9}\n".as_bytes();
        assert!(buffer.push(&text[..4]).is_empty());
        assert_eq!(buffer.push(&text[4..]), vec!["caf\u{e9}".to_string()]);
    }

    #[test]
    fn flush_returns_trailing_partial() {
        let mut buffer = LineBuffer::new(64);
        buffer.push(b"done\npartial");
        assert_eq!(buffer.flush(), Some("partial".to_string()));
    }
}
