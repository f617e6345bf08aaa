//! Transport abstraction
//!
//! The fetcher never talks to a socket directly. It asks a [`Transport`] to
//! open a stream and then polls that stream, which keeps it testable and lets
//! a device plug in whatever network stack it has.

use super::error::FetchResult;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A source of module byte streams
pub trait Transport {
    /// Whether the network link is up. Checked before any I/O.
    fn is_available(&self) -> bool;

    /// Issue a GET for `uri`. Non-success statuses map to
    /// [`FetchError::RemoteError`](super::FetchError::RemoteError).
    fn open(&mut self, uri: &str, timeout: Duration) -> FetchResult<Box<dyn TransportStream>>;
}

/// An open response body
pub trait TransportStream {
    /// Length declared by the response headers
    fn content_length(&self) -> Option<u64>;

    /// False once the peer has closed the connection and nothing is buffered
    fn connected(&self) -> bool;

    /// Bytes that can be read right now without blocking for long
    fn available(&mut self) -> usize;

    /// Read up to `buf.len()` bytes
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Shared "network is up" flag, owned by whoever manages the link
#[derive(Debug, Clone)]
pub struct NetworkLink(Arc<AtomicBool>);

impl NetworkLink {
    pub fn new(up: bool) -> Self {
        Self(Arc::new(AtomicBool::new(up)))
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::Release);
    }
}

impl Default for NetworkLink {
    fn default() -> Self {
        Self::new(true)
    }
}
