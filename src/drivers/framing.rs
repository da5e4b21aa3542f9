// src/drivers/framing.rs
use std::io::{self, ErrorKind, Read};
use log::warn;
/// Splits a byte stream into trimmed, newline-terminated lines. Bytes of an
/// unfinished line are kept between reads, up to `max_pending`.
#[derive(Clone, Debug)]
pub struct LineAssembler {
    pending: Vec<u8>,
    max_pending: usize,
}
impl LineAssembler {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Vec::with_capacity(512),
            max_pending: max_pending.max(1),
        }
    }
    /// Appends raw bytes. An unterminated tail longer than `max_pending` is
    /// discarded; complete lines already buffered are kept.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let tail_start = self
            .pending
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i + 1);
        let tail = self.pending.len() - tail_start;
        if tail > self.max_pending {
            warn!("Discarding {tail} bytes received without a line ending");
            self.pending.truncate(tail_start);
        }
    }
    /// Reads once from `reader`. Timeouts count as zero bytes.
    pub fn fill_from<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        chunk: &mut [u8],
    ) -> io::Result<usize> {
        match reader.read(chunk) {
            Ok(n) => {
                self.push(&chunk[..n]);
                Ok(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
    /// Next complete line without its `\r\n`/`\n`; invalid UTF-8 is replaced.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
