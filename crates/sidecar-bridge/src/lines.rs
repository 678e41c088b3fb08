//! Reassembly of `\n`-terminated lines from raw stdout chunks.

/// A line grew past the configured cap before its terminator arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// Accumulates bytes until a full line is available.
///
/// The trailing partial line persists across [`push`](Self::push) calls.
/// A trailing `\r` is stripped and whitespace-only lines are skipped.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to contain no terminator.
    scanned: usize,
    max_line: usize,
}

impl LineBuffer {
    pub const fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, LineTooLong> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buf[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            let mut line = &self.buf[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.len() > self.max_line {
                return Err(LineTooLong {
                    limit: self.max_line,
                });
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line.to_vec());
            }
            start = end + 1;
            search_from = start;
        }

        self.buf.drain(..start);
        self.scanned = self.buf.len();
        // A held `\r` may be the first half of a CRLF terminator.
        let limit = if self.buf.last() == Some(&b'\r') {
            self.max_line + 1
        } else {
            self.max_line
        };
        if self.buf.len() > limit {
            return Err(LineTooLong {
                limit: self.max_line,
            });
        }
        Ok(lines)
    }

    /// Bytes held for an incomplete line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}
