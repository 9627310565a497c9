//! Switching a live connection between plaintext and TLS.

use std::sync::Arc;
use std::time::Duration;

use dirmux_frame::{ExtendedResponse, FrameReader, FrameWriter, Request};
use dirmux_transport::{StreamPair, TlsUpgrader, TransportError};
use tracing::{debug, info, warn};

use crate::connection::{Connection, Shared};
use crate::error::{ClientError, Result};
use crate::multiplexer::Multiplexer;

impl Connection {
    /// Wrap the live socket in TLS using the configured upgrader.
    ///
    /// The reader is parked while the streams are swapped. If the
    /// handshake fails the plaintext streams stay in place and reading
    /// resumes.
    pub fn start_tls(&self) -> Result<()> {
        self.shared().start_tls()
    }

    /// Drop the TLS layer and continue in plaintext over the same socket.
    pub fn stop_tls(&self) -> Result<()> {
        self.shared().stop_tls()
    }

    pub fn is_tls(&self) -> bool {
        self.shared().lock_io().tls
    }

    /// Run the StartTLS extended operation, then [`start_tls`](Self::start_tls).
    ///
    /// Requires a quiet connection: no other request may be outstanding,
    /// since the reader stops right after the StartTLS response.
    pub fn negotiate_start_tls(&self, timeout: Option<Duration>) -> Result<()> {
        let shared = self.shared();
        if self.is_tls() {
            return Err(ClientError::InvalidState("TLS is already active".into()));
        }
        if shared.config.tls.is_none() {
            return Err(TransportError::TlsUnavailable.into());
        }
        let outstanding = shared.table.len();
        if outstanding > 0 {
            return Err(ClientError::InvalidState(format!(
                "cannot start TLS with {outstanding} outstanding requests"
            )));
        }

        let id = shared.allocate_message_id();
        self.stop_reader_after(id);

        let mux = Multiplexer::new();
        let reply = mux
            .submit(self, &Request::start_tls().with_message_id(id), timeout, None)
            .and_then(|_| mux.next_response(Some(id)));
        let frame = match reply {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(self.abort_start_tls(ClientError::NoSuchRequest(id))),
            Err(err) => return Err(self.abort_start_tls(err)),
        };

        let response = match ExtendedResponse::decode(&frame) {
            Ok(response) => response,
            Err(err) => {
                shared.resume_reader()?;
                return Err(err.into());
            }
        };
        if !response.result.is_success() {
            shared.resume_reader()?;
            return Err(ClientError::Protocol(format!(
                "StartTLS refused with result {}: {}",
                response.result.result_code, response.result.diagnostic_message
            )));
        }

        debug!(conn = self.name(), msg_id = id, "StartTLS accepted");
        self.start_tls()
    }

    fn abort_start_tls(&self, err: ClientError) -> ClientError {
        if let Err(resume) = self.shared().cancel_stop_request() {
            warn!(conn = self.name(), error = %resume, "reader not resumed after StartTLS failure");
        }
        err
    }
}

impl Shared {
    fn start_tls(self: &Arc<Self>) -> Result<()> {
        let upgrader = self
            .config
            .tls
            .clone()
            .ok_or(TransportError::TlsUnavailable)?;
        let holder = self.write_access.acquire(0);
        let result = self.swap_to_tls(upgrader.as_ref());
        self.release_write(holder);
        result
    }

    fn swap_to_tls(self: &Arc<Self>, upgrader: &dyn TlsUpgrader) -> Result<()> {
        let raw = {
            let io = self.lock_io();
            if io.tls {
                return Err(ClientError::InvalidState("TLS is already active".into()));
            }
            io.raw
                .as_ref()
                .ok_or(ClientError::NotConnected)?
                .try_clone()?
        };
        let host = self.host().unwrap_or_default();

        let plaintext = self.park_reader()?;
        if plaintext.buffered() > 0 {
            warn!(
                conn = %self.name(),
                buffered = plaintext.buffered(),
                "discarding plaintext bytes received before TLS"
            );
        }
        self.cert_problems.clear();

        let pair = match self.upgrade(upgrader, &host, &raw) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(conn = %self.name(), error = %err, "TLS upgrade failed, staying in plaintext");
                self.spawn_reader(plaintext)?;
                return Err(err);
            }
        };

        let frame_config = self.config.frame_config();
        {
            let mut io = self.lock_io();
            io.writer = Some(FrameWriter::with_config(pair.writer, frame_config.clone()));
            io.tls = true;
        }
        info!(conn = %self.name(), tls = upgrader.name(), "TLS started");
        self.spawn_reader(FrameReader::with_config(pair.reader, frame_config))
    }

    fn stop_tls(self: &Arc<Self>) -> Result<()> {
        let holder = self.write_access.acquire(0);
        let result = self.swap_to_plaintext();
        self.release_write(holder);
        result
    }

    fn swap_to_plaintext(self: &Arc<Self>) -> Result<()> {
        let pair = {
            let io = self.lock_io();
            if !io.tls {
                return Err(ClientError::InvalidState("TLS is not active".into()));
            }
            StreamPair::plaintext(io.raw.as_ref().ok_or(ClientError::NotConnected)?)?
        };

        self.park_reader()?;
        let frame_config = self.config.frame_config();
        {
            let mut io = self.lock_io();
            io.writer = Some(FrameWriter::with_config(pair.writer, frame_config.clone()));
            io.tls = false;
        }
        info!(conn = %self.name(), "TLS stopped");
        self.spawn_reader(FrameReader::with_config(pair.reader, frame_config))
    }
}
