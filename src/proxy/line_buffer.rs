//! Newline framing for the engine's output streams.

/// Accumulates raw reads and hands out complete lines only.
///
/// Bytes after the last `\n` stay buffered until a later read completes the
/// line. Invalid UTF-8 is replaced rather than dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        // `complete` ends with the newline found above
        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(|raw| {
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                String::from_utf8_lossy(raw).into_owned()
            })
            .filter(|line| !line.trim().is_empty())
            .collect()
    }

    /// Bytes still waiting for a newline
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drain whatever is left once the stream closed
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}
