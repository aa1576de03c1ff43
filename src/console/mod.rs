//! Serial console channel
//!
//! A line-oriented view of the guest's serial console. The hypervisor's
//! stdin/stdout are the transport, but any `AsyncRead`/`AsyncWrite` pair
//! works, which is how the protocol is exercised without a real guest.
//!
//! Reads are driven by the caller: bytes accumulate in an internal buffer
//! until one of the requested [`Marker`]s shows up, and everything after the
//! marker stays buffered for the next read.

pub mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::{Error, Result};

/// Banner the Linux kernel prints when it panics
const PANIC_BANNER: &[u8] = b"Kernel panic";

const READ_CHUNK: usize = 4096;

/// Default cap on output buffered while waiting for a marker (16 MiB)
pub const MAX_BUFFERED: usize = 16 * 1024 * 1024;

/// A response boundary to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    /// Matches anywhere in the stream
    Exact(&'a str),
    /// Matches only when it is the last thing the guest has written, which is
    /// how interactive prompts look
    Trailing(&'a str),
}

impl Marker<'_> {
    fn text(&self) -> &str {
        match self {
            Marker::Exact(s) | Marker::Trailing(s) => s,
        }
    }
}

/// Bidirectional text stream attached to the guest console
pub struct ConsoleChannel {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Bytes received but not yet consumed by a read
    buffer: Vec<u8>,
    /// Last line written, stripped from the next read if the guest echoes it
    pending_echo: Option<String>,
    /// Set once a kernel panic banner has been seen
    panicked: Arc<AtomicBool>,
    buffer_limit: usize,
}

impl ConsoleChannel {
    /// Create a channel over a reader (guest output) and writer (guest input)
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            buffer: Vec::new(),
            pending_echo: None,
            panicked: Arc::new(AtomicBool::new(false)),
            buffer_limit: MAX_BUFFERED,
        }
    }

    /// Fail a read with [`Error::ProtocolDesync`] once `limit` bytes are
    /// buffered without a marker
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Share an externally owned panic flag
    pub fn with_panic_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.panicked = flag;
        self
    }

    /// Whether a kernel panic banner has passed through this channel
    pub fn kernel_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    /// Send `text` followed by a newline
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        trace!(line = %text, "console write");
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;

        self.pending_echo = if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        };
        Ok(())
    }

    /// Read until `marker` appears anywhere, returning the text before it
    pub async fn read_until(&mut self, marker: &str, timeout: Duration) -> Result<String> {
        let (_, text) = self
            .read_until_any(&[Marker::Exact(marker)], timeout)
            .await?;
        Ok(text)
    }

    /// Read until one of `markers` matches.
    ///
    /// Returns the index of the matched marker and the text preceding it,
    /// with carriage returns normalised away and a leading echo of the last
    /// written line removed. The marker itself is consumed. When several
    /// markers match, the earliest in the stream wins. Output that outgrows
    /// the buffer limit before any marker shows up is a desync.
    pub async fn read_until_any(
        &mut self,
        markers: &[Marker<'_>],
        timeout: Duration,
    ) -> Result<(usize, String)> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some((index, start, end)) = self.find(markers) {
                let consumed: Vec<u8> = self.buffer.drain(..end).collect();
                let raw = String::from_utf8_lossy(&consumed[..start]).into_owned();
                let echo = self.pending_echo.take();
                let text = match echo {
                    Some(ref sent) => strip_echo(&raw, sent),
                    None => raw.as_str(),
                };
                return Ok((index, normalize(text)));
            }

            if self.buffer.len() >= self.buffer_limit {
                return Err(Error::ProtocolDesync(format!(
                    "{} bytes received without {}",
                    self.buffer.len(),
                    describe(markers)
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ProtocolTimeout(describe(markers)));
            }

            let read = tokio::time::timeout(deadline - now, self.reader.read(&mut chunk)).await;
            match read {
                Err(_) => return Err(Error::ProtocolTimeout(describe(markers))),
                Ok(Ok(0)) => return Err(Error::ConsoleClosed(describe(markers))),
                Ok(Ok(n)) => self.ingest(&chunk[..n]),
                Ok(Err(e)) => return Err(Error::Io(e)),
            }
        }
    }

    /// Drop everything received so far
    pub fn discard_buffered(&mut self) {
        self.buffer.clear();
        self.pending_echo = None;
    }

    fn ingest(&mut self, bytes: &[u8]) {
        trace!(bytes = bytes.len(), "console read");
        // Re-scan a little of the old tail so a banner split across reads is seen.
        let rescan_from = self.buffer.len().saturating_sub(PANIC_BANNER.len());
        self.buffer.extend_from_slice(bytes);
        if !self.panicked.load(Ordering::SeqCst)
            && find_bytes(&self.buffer[rescan_from..], PANIC_BANNER).is_some()
        {
            warn!("guest kernel panic observed on console");
            self.panicked.store(true, Ordering::SeqCst);
        }
    }

    /// Locate the earliest matching marker: (marker index, start, end).
    fn find(&self, markers: &[Marker<'_>]) -> Option<(usize, usize, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (index, marker) in markers.iter().enumerate() {
            let needle = marker.text().as_bytes();
            let start = match marker {
                Marker::Exact(_) => find_bytes(&self.buffer, needle),
                Marker::Trailing(_) => {
                    if !needle.is_empty() && self.buffer.ends_with(needle) {
                        Some(self.buffer.len() - needle.len())
                    } else {
                        None
                    }
                }
            };
            if let Some(start) = start {
                if best.map_or(true, |(_, s, _)| start < s) {
                    best = Some((index, start, start + needle.len()));
                }
            }
        }
        best
    }
}

fn describe(markers: &[Marker<'_>]) -> String {
    markers
        .iter()
        .map(|m| format!("{:?}", m.text()))
        .collect::<Vec<_>>()
        .join(" or ")
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Turn terminal `\r\n` line endings into `\n` and drop stray carriage returns
fn normalize(text: &str) -> String {
    text.replace('\r', "")
}

/// Remove the guest's echo of `sent` from the head of `raw`.
///
/// Carriage returns are ignored, and a space the line editor inserts when the
/// echo wraps at the terminal width is tolerated. If the head of `raw` is not
/// an echo of `sent`, `raw` is returned untouched.
fn strip_echo<'a>(raw: &'a str, sent: &str) -> &'a str {
    let mut rest = raw.char_indices().peekable();
    let mut expected = sent.chars().peekable();

    while let Some(&want) = expected.peek() {
        let Some(&(_, got)) = rest.peek() else {
            return raw;
        };
        if got == want {
            rest.next();
            expected.next();
        } else if got == '\r' || (got == ' ' && want != ' ') || got == '\n' {
            rest.next();
        } else {
            return raw;
        }
    }

    // Consume the remainder of the echoed line.
    while let Some(&(idx, c)) = rest.peek() {
        match c {
            '\r' => {
                rest.next();
            }
            '\n' => return &raw[idx + 1..],
            _ => return &raw[idx..],
        }
    }
    ""
}
