//! HTTP transport backed by ureq
//!
//! ureq hands out a blocking reader. [`HttpStream`] stages one chunk at a
//! time so the fetcher can keep its poll/read loop: `available` pulls the next
//! chunk with a short read timeout, `read` drains it.

use super::error::{FetchError, FetchResult};
use super::transport::{NetworkLink, Transport, TransportStream};
use std::io::{self, Read};
use std::time::Duration;
use tracing::debug;

/// Upper bound for a single blocking socket read
const READ_SLICE: Duration = Duration::from_millis(500);

/// Default staging chunk
const DEFAULT_CHUNK: usize = 1024;

/// Plain HTTP(S) GET transport
pub struct HttpTransport {
    link: NetworkLink,
    chunk_size: usize,
}

impl HttpTransport {
    pub fn new(link: NetworkLink) -> Self {
        Self {
            link,
            chunk_size: DEFAULT_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn link(&self) -> &NetworkLink {
        &self.link
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(NetworkLink::default())
    }
}

impl Transport for HttpTransport {
    fn is_available(&self) -> bool {
        self.link.is_up()
    }

    fn open(&mut self, uri: &str, timeout: Duration) -> FetchResult<Box<dyn TransportStream>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout.min(READ_SLICE))
            .build();

        let response = match agent.get(uri).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => return Err(FetchError::RemoteError(code)),
            Err(ureq::Error::Transport(err)) => {
                let msg = err.to_string();
                let lower = msg.to_ascii_lowercase();
                if lower.contains("timeout") || lower.contains("timed out") {
                    return Err(FetchError::Timeout { received: 0 });
                }
                return Err(FetchError::Transport(msg));
            }
        };

        let content_length = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        debug!(uri, status = response.status(), ?content_length, "response headers received");

        Ok(Box::new(HttpStream::new(
            response.into_reader(),
            content_length,
            self.chunk_size,
        )))
    }
}

/// Response body with one staged chunk
pub struct HttpStream {
    reader: Box<dyn Read + Send + Sync>,
    content_length: Option<u64>,
    staged: Vec<u8>,
    pos: usize,
    eof: bool,
    chunk_size: usize,
}

impl HttpStream {
    fn new(reader: Box<dyn Read + Send + Sync>, content_length: Option<u64>, chunk_size: usize) -> Self {
        Self {
            reader,
            content_length,
            staged: Vec::with_capacity(chunk_size),
            pos: 0,
            eof: false,
            chunk_size,
        }
    }

    fn buffered(&self) -> usize {
        self.staged.len() - self.pos
    }

    fn fill(&mut self) {
        if self.eof || self.buffered() > 0 {
            return;
        }

        self.staged.resize(self.chunk_size, 0);
        self.pos = 0;
        match self.reader.read(&mut self.staged) {
            Ok(0) => {
                self.staged.clear();
                self.eof = true;
            }
            Ok(n) => self.staged.truncate(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                // Nothing yet; the fetcher's deadline decides when to give up
                self.staged.clear();
            }
            Err(e) => {
                debug!(error = %e, "response body closed");
                self.staged.clear();
                self.eof = true;
            }
        }
    }
}

impl TransportStream for HttpStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn connected(&self) -> bool {
        !self.eof || self.buffered() > 0
    }

    fn available(&mut self) -> usize {
        self.fill();
        self.buffered()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill();
        let n = buf.len().min(self.buffered());
        buf[..n].copy_from_slice(&self.staged[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
