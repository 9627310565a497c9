//! The background reader thread.
//!
//! One reader per connection pulls frames off the socket and routes them
//! by message id. The socket carries a short read timeout so the reader
//! can notice stop requests between frames; a stopped reader hands its
//! [`FrameReader`] back, keeping any bytes it had already buffered.

use std::io::ErrorKind;
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use dirmux_frame::{FrameError, FrameReader};
use dirmux_transport::BoxedReader;
use tracing::{debug, trace, warn};

use crate::connection::{Shared, ShutdownCause, StopReader};
use crate::error::{ClientError, Result};
use crate::MessageId;

type ParkedReader = FrameReader<BoxedReader>;

/// Lifecycle of a connection's reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderState {
    /// No reader has been started.
    Idle,
    Starting,
    Running,
    /// Parked on request; reading can resume over the same stream.
    Stopped,
    /// Exited because the connection was shut down.
    Closed,
    /// Exited on a transport or decode error.
    Failed(String),
}

pub(crate) struct ReaderSlot {
    state: ReaderState,
    generation: u64,
    thread: Option<ThreadId>,
    handle: Option<JoinHandle<Option<ParkedReader>>>,
}

impl Default for ReaderSlot {
    fn default() -> Self {
        Self {
            state: ReaderState::Idle,
            generation: 0,
            thread: None,
            handle: None,
        }
    }
}

impl Shared {
    pub(crate) fn reader_state(&self) -> ReaderState {
        self.lock_reader().state.clone()
    }

    pub(crate) fn is_reader_thread(&self) -> bool {
        self.lock_reader().thread == Some(thread::current().id())
    }

    /// Start a reader over `reader` and wait until it runs.
    pub(crate) fn spawn_reader(self: &Arc<Self>, reader: ParkedReader) -> Result<()> {
        *self.lock_stop() = StopReader::KeepReading;

        let mut slot = self.lock_reader();
        slot.generation += 1;
        let generation = slot.generation;
        slot.state = ReaderState::Starting;

        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("dirmux-reader-{}", self.name()))
            .spawn(move || shared.read_loop(reader, generation));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                slot.state = ReaderState::Failed(err.to_string());
                return Err(ClientError::Io(err));
            }
        };
        slot.thread = Some(handle.thread().id());
        slot.handle = Some(handle);

        let _slot = self
            .reader_changed
            .wait_while(slot, |s| {
                s.generation == generation && s.state == ReaderState::Starting
            })
            .unwrap_or_else(PoisonError::into_inner);
        Ok(())
    }

    /// Ask the reader to stop, wait for it, and take back its stream.
    pub(crate) fn park_reader(&self) -> Result<ParkedReader> {
        *self.lock_stop() = StopReader::Immediately;

        let slot = self.lock_reader();
        let mut slot = self
            .reader_changed
            .wait_while(slot, |s| {
                matches!(s.state, ReaderState::Starting | ReaderState::Running)
            })
            .unwrap_or_else(PoisonError::into_inner);
        match &slot.state {
            ReaderState::Stopped => {}
            ReaderState::Failed(reason) => return Err(ClientError::ReaderDied(reason.clone())),
            ReaderState::Closed => {
                return Err(ClientError::ConnectionClosed(
                    "connection is shut down".to_string(),
                ))
            }
            _ => return Err(ClientError::NotConnected),
        }
        let handle = slot.handle.take();
        slot.thread = None;
        drop(slot);

        handle
            .and_then(|handle| handle.join().ok().flatten())
            .ok_or_else(|| ClientError::InvalidState("reader stopped without its stream".into()))
    }

    /// Park the reader and start a fresh one over the same stream.
    pub(crate) fn resume_reader(self: &Arc<Self>) -> Result<()> {
        let reader = self.park_reader()?;
        self.spawn_reader(reader)
    }

    /// Withdraw a pending stop request. A reader that already parked on
    /// it is restarted.
    pub(crate) fn cancel_stop_request(self: &Arc<Self>) -> Result<()> {
        let parked = {
            let mut stop = self.lock_stop();
            *stop = StopReader::KeepReading;
            self.lock_reader().state == ReaderState::Stopped
        };
        if parked && self.is_active() {
            self.resume_reader()?;
        }
        Ok(())
    }

    /// Wait for the reader thread to exit, unless called from it.
    pub(crate) fn join_reader(&self) {
        let handle = self.lock_reader().handle.take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(conn = %self.name(), "reader thread panicked");
        }
    }

    fn read_loop(self: Arc<Self>, mut reader: ParkedReader, generation: u64) -> Option<ParkedReader> {
        self.publish_reader(generation, ReaderState::Running);
        debug!(conn = %self.name(), "reader started");

        loop {
            if !self.is_active() {
                return self.reader_exit(generation, None);
            }
            if self.park_if_requested(generation, None) {
                debug!(conn = %self.name(), buffered = reader.buffered(), "reader stopped");
                return Some(reader);
            }

            match reader.read_frame() {
                Ok(frame) => {
                    let id = frame.message_id;
                    self.dispatch_frame(frame);
                    if self.park_if_requested(generation, Some(id)) {
                        debug!(conn = %self.name(), msg_id = id, "reader stopped after message");
                        return Some(reader);
                    }
                }
                Err(FrameError::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => return self.reader_exit(generation, Some(err)),
            }
        }
    }

    /// Publish `Stopped` if a stop request matches. The stop lock is held
    /// while publishing so a concurrent cancel sees a consistent state.
    fn park_if_requested(&self, generation: u64, last: Option<MessageId>) -> bool {
        let stop = self.lock_stop();
        let park = match *stop {
            StopReader::KeepReading => false,
            StopReader::Immediately => true,
            StopReader::AfterMessage(target) => last == Some(target),
        };
        if park {
            self.publish_reader(generation, ReaderState::Stopped);
        }
        park
    }

    fn reader_exit(&self, generation: u64, error: Option<FrameError>) -> Option<ParkedReader> {
        match error {
            Some(err) if self.is_active() => {
                let cause = if self.server_shutdown_noticed() {
                    ShutdownCause::ServerNotice(format!(
                        "connection lost after notice of disconnection: {err}"
                    ))
                } else {
                    ShutdownCause::ReaderFailed(err.to_string())
                };
                warn!(conn = %self.name(), error = %err, "reader terminated");

                self.close_transport();
                self.publish_reader(generation, ReaderState::Failed(cause.to_string()));
                self.shutdown(cause, true);
            }
            _ => {
                trace!(conn = %self.name(), "reader exiting, connection shut down");
                self.publish_reader(generation, ReaderState::Closed);
            }
        }
        None
    }

    fn publish_reader(&self, generation: u64, state: ReaderState) {
        let mut slot = self.lock_reader();
        if slot.generation != generation {
            return;
        }
        slot.state = state;
        drop(slot);
        self.reader_changed.notify_all();
    }

    fn lock_reader(&self) -> std::sync::MutexGuard<'_, ReaderSlot> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
