//! Per-device read loop.
use std::io::{ErrorKind, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, span, trace, Level};

use crate::framing::{Frame, FrameExtractor};
use crate::{Error, Result};

/// Size of the buffer a single read fills.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Pause after a read returned end-of-stream, so exhausted sources do not spin.
const EOF_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Created,
    /// Source is open, the read thread is preparing.
    Connected,
    Running,
    /// Stop was requested and teardown is in progress.
    Stopping,
    Closed,
}

/// Per-device behavior driven by a [DeviceReader].
///
/// All hooks run on the reader thread. `prepare` runs once before the first read;
/// exactly one of the teardown paths runs when the loop ends:
/// * stop requested: [disperse](Protocol::disperse) then `connection_lost(None)`
/// * I/O or prepare failure: `connection_lost(Some(err))`
///
/// A panic in `prepare` or `handle_frame` is a failure of the reader, it closes
/// like an I/O error.
pub trait Protocol: Send {
    /// # Errors
    /// Any error closes the reader before the first read.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called for every complete frame in arrival order. Failures must be handled
    /// here, they cannot end the read loop.
    fn handle_frame(&mut self, frame: Frame);

    fn disperse(&mut self) {}

    fn connection_lost(&mut self, _error: Option<&Error>) {}
}

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    state: Mutex<ReaderState>,
    error: Mutex<Option<Arc<Error>>>,
}

impl Shared {
    fn set_state(&self, state: ReaderState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> ReaderState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, err: Error) -> Arc<Error> {
        let err = Arc::new(err);
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
        err
    }
}

/// Marks the reader closed when the read thread ends, also when it unwinds.
struct ClosedOnExit<'a>(&'a Shared);

impl Drop for ClosedOnExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0
                .fail(Error::Runtime("reader thread panicked".to_string()));
        }
        self.0.set_state(ReaderState::Closed);
    }
}

/// Reads a byte source on a dedicated thread, splitting it into frames for a
/// [Protocol].
///
/// Cancellation is cooperative: [stop](Self::stop) sets a flag the loop checks after
/// every read, so a blocking read delays shutdown by at most the source's timeout.
#[derive(Debug)]
pub struct DeviceReader {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceReader {
    /// Start reading `source` on a new thread named after the device.
    ///
    /// # Errors
    /// [Error::Io] if the thread cannot be spawned.
    pub fn start<R, P>(name: &str, source: R, protocol: P) -> Result<Self>
    where
        R: Read + Send + 'static,
        P: Protocol + 'static,
    {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            state: Mutex::new(ReaderState::Created),
            error: Mutex::default(),
        });
        shared.set_state(ReaderState::Connected);

        let handle = {
            let shared = shared.clone();
            let name = name.to_string();
            thread::Builder::new()
                .name(format!("reader-{name}"))
                .spawn(move || run(&name, source, protocol, &shared))?
        };

        Ok(DeviceReader {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    /// True until the loop has finished its teardown.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() != ReaderState::Closed
    }

    /// The failure that closed the reader, if any.
    #[must_use]
    pub fn error(&self) -> Option<Arc<Error>> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Request the loop to end. Does not block.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Wait for the reader thread to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(device = %self.name, "reader thread panicked");
                self.shared.set_state(ReaderState::Closed);
            }
        }
    }
}

fn run<R: Read, P: Protocol>(name: &str, mut source: R, mut protocol: P, shared: &Shared) {
    let _span = span!(Level::INFO, "reader", device = %name).entered();
    let _closed = ClosedOnExit(shared);

    let prepared = panic::catch_unwind(AssertUnwindSafe(|| protocol.prepare()))
        .unwrap_or_else(|_| Err(Error::Runtime("prepare panicked".to_string())));
    if let Err(err) = prepared {
        error!(%err, "prepare failed");
        let err = shared.fail(err);
        protocol.connection_lost(Some(&err));
        return;
    }
    shared.set_state(ReaderState::Running);
    info!("reader running");

    let mut extractor = FrameExtractor::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let failure = 'read: loop {
        match source.read(&mut buf) {
            Ok(0) => thread::sleep(EOF_BACKOFF),
            Ok(n) => {
                trace!(bytes = n, "read");
                for frame in extractor.feed(&buf[..n]).frames {
                    let len = frame.len();
                    let handled =
                        panic::catch_unwind(AssertUnwindSafe(|| protocol.handle_frame(frame)));
                    if handled.is_err() {
                        break 'read Some(Error::Runtime(format!(
                            "protocol panicked handling a {len} byte frame"
                        )));
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(err) => break Some(Error::Io(err)),
        }
        if shared.stop.load(Ordering::Acquire) {
            break None;
        }
    };

    match failure {
        None => {
            shared.set_state(ReaderState::Stopping);
            debug!(pending = extractor.pending().len(), "stopping");
            protocol.disperse();
            protocol.connection_lost(None);
            info!("reader closed");
        }
        Some(err) => {
            error!(%err, "read failed; closing");
            let err = shared.fail(err);
            protocol.connection_lost(Some(&err));
        }
    }
}
