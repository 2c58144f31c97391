pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;

/// Accumulates raw byte chunks from the serial link and yields complete,
/// trimmed, newline-terminated lines. Bytes without a trailing newline stay
/// buffered until the next chunk arrives.
#[derive(Debug)]
pub struct LineFramer {
    buffer: String,
    max_line_bytes: usize,
    overflow_count: u64,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_line_bytes: max_line_bytes.max(1),
            overflow_count: 0,
        }
    }

    /// Appends a chunk and returns every line completed by it. Chunk
    /// boundaries never affect which lines come out.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut lines = Vec::new();
        while let Some(index) = self.buffer.find('\n') {
            let line = self.buffer[..index].trim().to_string();
            self.buffer.drain(..=index);
            if !line.is_empty() {
                lines.push(line);
            }
        }

        // A device that never terminates a line must not grow the buffer
        // without bound. The torn line is unrecoverable, so drop it.
        if self.buffer.len() > self.max_line_bytes {
            self.overflow_count += 1;
            tracing::warn!(
                buffered_bytes = self.buffer.len(),
                max_line_bytes = self.max_line_bytes,
                "line buffer overflow, discarding unterminated data"
            );
            self.buffer.clear();
        }

        lines
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}
