//! Module fetcher
//!
//! Downloads one module's bytecode into a registry slot.
//!
//! ```text
//! check slot + link -> unload old buffer -> GET -> declared length
//!     -> allocate exactly that -> poll/read chunks -> install
//! ```
//!
//! The transfer is synchronous and bounded by a deadline. A body shorter than
//! the declared length is an [`FetchError::IncompleteTransfer`]; the partial
//! buffer is dropped and the slot stays unloaded. Nothing is retried here.

mod error;
mod http;
mod transport;

pub use error::*;
pub use http::*;
pub use transport::*;

use crate::config::FetchConfig;
use crate::registry::{Bytecode, ModuleRegistry, RegistryError};
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Progress report handed to the fetch observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub index: usize,
    pub received: usize,
    pub total: usize,
    pub percent: u8,
}

/// Fills registry slots from a [`Transport`]
pub struct ModuleFetcher<T> {
    transport: T,
    config: FetchConfig,
}

impl<T: Transport> ModuleFetcher<T> {
    pub fn new(transport: T, config: FetchConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Download the module in `index` and install it.
    ///
    /// Returns the number of bytes installed. `progress` is called each time
    /// the completed percentage changes.
    #[instrument(skip(self, registry, progress), fields(slot = index))]
    pub fn fetch(
        &mut self,
        registry: &mut ModuleRegistry,
        index: usize,
        timeout: Duration,
        progress: &mut dyn FnMut(FetchProgress),
    ) -> FetchResult<usize> {
        let uri = {
            let descriptor = registry.get(index).ok_or(RegistryError::InvalidIndex(index))?;
            if descriptor.source_uri().is_empty() {
                return Err(FetchError::MissingSource(index));
            }
            descriptor.source_uri().to_string()
        };

        if !self.transport.is_available() {
            warn!("network link down, not fetching");
            return Err(FetchError::TransportUnavailable);
        }

        // A re-attempt releases the old buffer before allocating the new one
        registry.unload(index)?;

        let deadline = Instant::now() + timeout;
        info!(%uri, "downloading module");
        let mut stream = self.transport.open(&uri, timeout)?;

        let expected = match stream.content_length() {
            Some(len) if len > 0 => len,
            other => return Err(FetchError::InvalidContentLength(other)),
        };

        let buffer = self.allocate(expected)?;
        let bytes = self.transfer(stream.as_mut(), buffer, index, deadline, progress)?;
        let written = bytes.len();

        registry.install(index, Bytecode::new(bytes))?;
        info!(bytes = written, "module downloaded");
        Ok(written)
    }

    fn allocate(&self, expected: u64) -> FetchResult<Vec<u8>> {
        let limit = self.config.max_module_size;
        let failure = FetchError::AllocationFailure {
            requested: expected,
            limit,
        };

        let len = match usize::try_from(expected) {
            Ok(len) if len <= limit => len,
            _ => return Err(failure),
        };

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(len).is_err() {
            return Err(failure);
        }
        buffer.resize(len, 0);
        Ok(buffer)
    }

    fn transfer(
        &self,
        stream: &mut dyn TransportStream,
        mut buffer: Vec<u8>,
        index: usize,
        deadline: Instant,
        progress: &mut dyn FnMut(FetchProgress),
    ) -> FetchResult<Vec<u8>> {
        let expected = buffer.len();
        let chunk_size = self.config.chunk_size.max(1);
        let mut written = 0;
        let mut last_percent = None;

        while written < expected {
            if Instant::now() >= deadline {
                warn!(received = written, expected, "download timed out");
                return Err(FetchError::Timeout { received: written });
            }

            let available = stream.available();
            if available == 0 {
                if !stream.connected() {
                    warn!(received = written, expected, "connection closed mid-transfer");
                    return Err(FetchError::IncompleteTransfer {
                        received: written,
                        expected,
                    });
                }
                thread::sleep(self.config.poll_interval());
                continue;
            }

            let want = available.min(chunk_size).min(expected - written);
            let n = match stream.read(&mut buffer[written..written + want]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => {
                    debug!(error = %e, "read failed");
                    return Err(FetchError::IncompleteTransfer {
                        received: written,
                        expected,
                    });
                }
            };
            written += n;

            let percent = (written * 100 / expected) as u8;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                progress(FetchProgress {
                    index,
                    received: written,
                    total: expected,
                    percent,
                });
            }
        }

        Ok(buffer)
    }
}
