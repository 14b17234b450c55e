//! ndJSON line framing over the child's stdout.
//!
//! Agents are not always clean citizens on stdout: some print banners,
//! progress bars or stray logging between protocol frames.  Every complete
//! line runs through the transport's stdout filter before JSON parsing; a
//! trailing line without a final newline is retained until the stream ends
//! and then flushed through the same path.

use tokio::io::{AsyncRead, AsyncReadExt};

/// What to do with one raw stdout line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineDisposition {
    /// Pass the line through unchanged.
    Forward,
    /// Swallow the line (counted, logged at dispose).
    Drop,
    /// Substitute the line before JSON parsing.
    Replace(String),
}

/// Incremental line splitter with a retained partial-line buffer.
pub struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            eof: false,
        }
    }

    /// Next complete line, without its trailing `\n` (and `\r`).
    ///
    /// Returns `Ok(None)` once the stream ended and the retained buffer has
    /// been flushed.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buffer);
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            let mut chunk = [0_u8; 4096];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                self.eof = true;
            } else {
                self.buffer.extend_from_slice(&chunk[..read]);
            }
        }
    }
}
