//! One transport, one reader thread, many outstanding requests.
//!
//! A [`Connection`] is a counted handle: [`Connection::share`] hands out
//! another handle to the same transport, and the transport is shut down
//! when the last handle is released or dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use dirmux_frame::{Frame, FrameError, FrameReader, FrameWriter, Request};
use dirmux_transport::{
    tcp, BoxedWriter, CertificateProblems, StreamPair, TlsHandshakeError, TransportError,
    TransportStream,
};
use tracing::{debug, info, trace, warn};

use crate::bind::BindMetadata;
use crate::config::ConnectionConfig;
use crate::error::{ClientError, Result};
use crate::notification::{ListenerId, ListenerRegistry, UnsolicitedListener, UnsolicitedNotice};
use crate::reader::{ReaderSlot, ReaderState};
use crate::table::RequestTable;
use crate::write_access::WriteAccess;
use crate::MessageId;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// A handle to a multiplexed connection.
pub struct Connection {
    shared: Arc<Shared>,
    explicit_release: bool,
}

pub(crate) struct Shared {
    name: String,
    pub(crate) config: ConnectionConfig,
    endpoint: Mutex<Option<Endpoint>>,
    pub(crate) io: Mutex<IoSlot>,
    closer: Mutex<Option<TransportStream>>,
    pub(crate) write_access: WriteAccess,
    pub(crate) table: RequestTable,
    pub(crate) reader: Mutex<ReaderSlot>,
    pub(crate) reader_changed: Condvar,
    pub(crate) stop: Mutex<StopReader>,
    client_active: AtomicBool,
    shutdown_notice: AtomicBool,
    bound: Mutex<Option<BindMetadata>>,
    sasl_holder: Mutex<Option<MessageId>>,
    handles: AtomicUsize,
    next_message_id: AtomicI32,
    listeners: ListenerRegistry,
    pub(crate) cert_problems: CertificateProblems,
    active_referral: Mutex<Option<String>>,
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: Option<u16>,
}

/// The output side of the transport.
#[derive(Default)]
pub(crate) struct IoSlot {
    /// Plaintext socket, kept for TLS swaps and timeouts.
    pub(crate) raw: Option<TransportStream>,
    pub(crate) writer: Option<FrameWriter<BoxedWriter>>,
    pub(crate) tls: bool,
}

/// When the reader should park itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReader {
    KeepReading,
    AfterMessage(MessageId),
    Immediately,
}

/// Why a connection is being shut down.
#[derive(Debug, Clone)]
pub(crate) enum ShutdownCause {
    Requested(String),
    Released,
    ReaderFailed(String),
    ServerNotice(String),
}

impl ShutdownCause {
    pub(crate) fn to_error(&self) -> ClientError {
        match self {
            Self::Requested(reason) => ClientError::ConnectionClosed(reason.clone()),
            Self::Released => {
                ClientError::ConnectionClosed("connection handle released".to_string())
            }
            Self::ReaderFailed(reason) => ClientError::ReaderDied(reason.clone()),
            Self::ServerNotice(reason) => ClientError::ServerShutdownNotice(reason.clone()),
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested(reason) => write!(f, "requested: {reason}"),
            Self::Released => f.write_str("last handle released"),
            Self::ReaderFailed(reason) => write!(f, "reader failed: {reason}"),
            Self::ServerNotice(reason) => write!(f, "server notice: {reason}"),
        }
    }
}

impl Connection {
    /// An unconnected connection.
    pub fn new(config: ConnectionConfig) -> Self {
        let id = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let shared = Shared {
            name: format!("conn-{id}"),
            config,
            endpoint: Mutex::new(None),
            io: Mutex::new(IoSlot::default()),
            closer: Mutex::new(None),
            write_access: WriteAccess::new(),
            table: RequestTable::new(),
            reader: Mutex::new(ReaderSlot::default()),
            reader_changed: Condvar::new(),
            stop: Mutex::new(StopReader::KeepReading),
            client_active: AtomicBool::new(false),
            shutdown_notice: AtomicBool::new(false),
            bound: Mutex::new(None),
            sasl_holder: Mutex::new(None),
            handles: AtomicUsize::new(1),
            next_message_id: AtomicI32::new(1),
            listeners: ListenerRegistry::default(),
            cert_problems: CertificateProblems::new(),
            active_referral: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            explicit_release: false,
        }
    }

    /// Take over an already connected stream and start reading from it.
    ///
    /// `host` is used for TLS server name checks and diagnostics.
    pub fn open(stream: TransportStream, host: &str, config: ConnectionConfig) -> Result<Self> {
        let connection = Self::new(config);
        connection.shared.attach(stream, host, None)?;
        Ok(connection)
    }

    /// Connect to `host:port`.
    ///
    /// A no-op while already connected with a running reader. A reader
    /// that was stopped on request is restarted over the existing stream.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.shared.connect(host, port)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_active() && self.shared.lock_io().writer.is_some()
    }

    /// Name used in log records for this connection.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn host(&self) -> Option<String> {
        self.shared.host()
    }

    pub fn port(&self) -> Option<u16> {
        self.shared
            .lock_endpoint()
            .as_ref()
            .and_then(|endpoint| endpoint.port)
    }

    /// Another handle to the same connection.
    pub fn share(&self) -> Connection {
        let handles = self.shared.handles.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(conn = %self.shared.name, handles, "connection shared");
        Connection {
            shared: Arc::clone(&self.shared),
            explicit_release: false,
        }
    }

    /// Number of live handles.
    pub fn handle_count(&self) -> usize {
        self.shared.handles.load(Ordering::SeqCst)
    }

    /// Give up this handle. The last handle shuts the connection down;
    /// `explicit` selects the error outstanding requests receive.
    pub fn release(mut self, explicit: bool) {
        self.explicit_release = explicit;
    }

    /// Explicitly give up this handle.
    pub fn disconnect(self) {
        self.release(true)
    }

    /// Shut the connection down regardless of other handles.
    ///
    /// Outstanding requests receive `ConnectionClosed` carrying `reason`.
    pub fn shutdown(&self, reason: &str) {
        self.shared
            .shutdown(ShutdownCause::Requested(reason.to_string()), true);
    }

    /// Write one request without tracking replies.
    ///
    /// Meant for requests the server never answers, such as unbind.
    pub fn write_request(&self, request: &Request) -> Result<MessageId> {
        self.shared.write_request(request)
    }

    /// Block until `requester` holds exclusive write access.
    ///
    /// Requester 0 receives an ephemeral id, which must be passed to
    /// [`release_write_access`](Self::release_write_access).
    pub fn acquire_write_access(&self, requester: MessageId) -> MessageId {
        self.shared.write_access.acquire(requester)
    }

    pub fn release_write_access(&self, requester: MessageId) -> Result<()> {
        self.shared.write_access.release(requester)
    }

    /// End a SASL exchange that is holding write access. Returns true if
    /// one was.
    pub fn release_bind_hold(&self) -> bool {
        let holder = self.shared.lock_sasl().take();
        if let Some(holder) = holder {
            self.shared.release_write(holder);
        }
        holder.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.shared.lock_bound().is_some()
    }

    /// Identity established by the last successful bind.
    pub fn bound_identity(&self) -> Option<BindMetadata> {
        self.shared.lock_bound().clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn UnsolicitedListener>) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Ids of every outstanding request, in submission order.
    pub fn outstanding(&self) -> Vec<MessageId> {
        self.shared.table.ids()
    }

    /// Park the reader right after it delivers the reply for `id`.
    pub fn stop_reader_after(&self, id: MessageId) {
        *self.shared.lock_stop() = StopReader::AfterMessage(id);
    }

    /// Park the reader at its next poll.
    pub fn stop_reader_now(&self) {
        *self.shared.lock_stop() = StopReader::Immediately;
    }

    /// Cancel a stop request, restarting the reader if it already parked.
    pub fn resume_reading(&self) -> Result<()> {
        self.shared.cancel_stop_request()
    }

    pub fn reader_state(&self) -> ReaderState {
        self.shared.reader_state()
    }

    /// True once the server has announced it is closing the connection.
    pub fn server_shutdown_noticed(&self) -> bool {
        self.shared.server_shutdown_noticed()
    }

    /// Remember the referral URL this connection was opened to follow.
    pub fn set_active_referral(&self, url: Option<String>) {
        *self
            .shared
            .active_referral
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = url;
    }

    pub fn active_referral(&self) -> Option<String> {
        self.shared
            .active_referral
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.release_handle(self.explicit_release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("host", &self.host())
            .field("active", &self.shared.is_active())
            .field("handles", &self.handle_count())
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_active(&self) -> bool {
        self.client_active.load(Ordering::SeqCst)
    }

    pub(crate) fn server_shutdown_noticed(&self) -> bool {
        self.shutdown_notice.load(Ordering::SeqCst)
    }

    pub(crate) fn host(&self) -> Option<String> {
        self.lock_endpoint()
            .as_ref()
            .map(|endpoint| endpoint.host.clone())
    }

    /// Next message id not currently outstanding. Wraps to 1.
    pub(crate) fn allocate_message_id(&self) -> MessageId {
        loop {
            let id = self
                .next_message_id
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                    Some(if current == MessageId::MAX { 1 } else { current + 1 })
                })
                .unwrap_or_else(|current| current);
            if !self.table.contains(id) {
                return id;
            }
        }
    }

    fn connect(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let holder = self.write_access.acquire(0);
        let result = self.connect_locked(host, port);
        self.release_write(holder);
        result
    }

    fn connect_locked(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        if self.is_active() && self.lock_io().writer.is_some() {
            match self.reader_state() {
                ReaderState::Starting | ReaderState::Running => {
                    debug!(conn = %self.name, "already connected");
                    return Ok(());
                }
                ReaderState::Stopped => {
                    debug!(conn = %self.name, "restarting stopped reader");
                    let reader = self.park_reader()?;
                    return self.spawn_reader(reader);
                }
                ReaderState::Idle | ReaderState::Closed | ReaderState::Failed(_) => {}
            }
        }

        self.join_reader();
        let stream = tcp::connect(host, port, self.config.connect_timeout)?;
        self.attach(stream, host, Some(port))
    }

    /// Install `stream` as the transport and start the reader.
    pub(crate) fn attach(
        self: &Arc<Self>,
        stream: TransportStream,
        host: &str,
        port: Option<u16>,
    ) -> Result<()> {
        stream.set_read_timeout(Some(self.config.reader_poll_interval))?;
        stream.set_write_timeout(self.config.write_timeout)?;
        let closer = stream.try_clone()?;

        let (pair, tls) = if self.config.tls_on_connect {
            let upgrader = self
                .config
                .tls
                .clone()
                .ok_or(TransportError::TlsUnavailable)?;
            self.cert_problems.clear();
            let pair = self.upgrade(upgrader.as_ref(), host, &stream)?;
            (pair, true)
        } else {
            (StreamPair::plaintext(&stream)?, false)
        };

        let transport = stream.transport_name();
        let peer = stream.peer_label();
        let frame_config = self.config.frame_config();
        {
            let mut io = self.lock_io();
            io.writer = Some(FrameWriter::with_config(pair.writer, frame_config.clone()));
            io.raw = Some(stream);
            io.tls = tls;
        }
        *self.lock_closer() = Some(closer);
        *self.lock_endpoint() = Some(Endpoint {
            host: host.to_string(),
            port,
        });
        *self.lock_bound() = None;
        self.shutdown_notice.store(false, Ordering::SeqCst);
        self.table.reopen();
        self.client_active.store(true, Ordering::SeqCst);

        info!(conn = %self.name, host, peer = %peer, transport, tls, "connected");
        self.spawn_reader(FrameReader::with_config(pair.reader, frame_config))
    }

    /// Run a TLS handshake over a clone of `stream`.
    ///
    /// The handshake runs with the connect timeout rather than the reader's
    /// poll interval; the poll interval is restored afterwards.
    pub(crate) fn upgrade(
        &self,
        upgrader: &dyn dirmux_transport::TlsUpgrader,
        host: &str,
        stream: &TransportStream,
    ) -> Result<StreamPair> {
        stream.set_read_timeout(self.config.connect_timeout)?;
        let upgraded = stream
            .try_clone()
            .and_then(|clone| upgrader.upgrade(host, clone, &self.cert_problems));
        stream.set_read_timeout(Some(self.config.reader_poll_interval))?;
        upgraded.map_err(|err| self.tls_failure(err))
    }

    fn tls_failure(&self, err: TransportError) -> ClientError {
        let reason = match &err {
            TransportError::TlsHandshake(handshake) => Some(handshake.reason.clone()),
            TransportError::Io(io) => TlsHandshakeError::find(io).map(|h| h.reason.clone()),
            _ => None,
        };
        match reason {
            Some(reason) => ClientError::TlsHandshakeFailed {
                reason,
                problems: self.cert_problems.snapshot(),
            },
            None => ClientError::Transport(err),
        }
    }

    /// Write one encoded message while holding write access as `requester`.
    pub(crate) fn write_message(&self, requester: MessageId, encoded: &[u8]) -> Result<()> {
        let holder = self.write_access.acquire(requester);
        let result = self.write_locked(encoded);
        self.release_write(holder);
        result
    }

    fn write_locked(&self, encoded: &[u8]) -> Result<()> {
        let mut io = self.lock_io();
        let Some(writer) = io.writer.as_mut() else {
            return Err(self.closed_error("no transport"));
        };
        writer
            .write_encoded(encoded)
            .map_err(|err| self.write_failure(err))
    }

    pub(crate) fn write_request(&self, request: &Request) -> Result<MessageId> {
        let id = match request.message_id() {
            Some(id) => id,
            None => self.allocate_message_id(),
        };
        let mut encoded = BytesMut::new();
        request.encode(id, &mut encoded)?;
        self.write_message(id, &encoded)?;
        Ok(id)
    }

    pub(crate) fn send_abandon(&self, target: MessageId) -> Result<()> {
        self.write_request(&Request::abandon(target)).map(|_| ())
    }

    fn closed_error(&self, detail: &str) -> ClientError {
        if self.server_shutdown_noticed() {
            ClientError::ServerShutdownNotice(detail.to_string())
        } else if self.lock_endpoint().is_some() {
            ClientError::ConnectionClosed(detail.to_string())
        } else {
            ClientError::NotConnected
        }
    }

    fn write_failure(&self, err: FrameError) -> ClientError {
        if let FrameError::Io(io) = &err {
            if let Some(handshake) = TlsHandshakeError::find(io) {
                return ClientError::TlsHandshakeFailed {
                    reason: handshake.reason.clone(),
                    problems: self.cert_problems.snapshot(),
                };
            }
        }
        if self.server_shutdown_noticed() {
            ClientError::ServerShutdownNotice(err.to_string())
        } else if !self.is_active() {
            ClientError::ConnectionClosed(err.to_string())
        } else {
            match err {
                FrameError::Io(io) => ClientError::Io(io),
                other => ClientError::Frame(other),
            }
        }
    }

    /// Take write access for a bind, inheriting it from a SASL exchange
    /// in progress.
    pub(crate) fn begin_bind(&self, id: MessageId) {
        let previous = self.lock_sasl().take();
        if let Some(previous) = previous {
            if self.write_access.transfer(previous, id).is_ok() {
                return;
            }
        }
        self.write_access.acquire(id);
    }

    pub(crate) fn hold_for_sasl(&self, id: MessageId) {
        *self.lock_sasl() = Some(id);
    }

    pub(crate) fn release_write(&self, holder: MessageId) {
        if let Err(err) = self.write_access.release(holder) {
            warn!(conn = %self.name, holder, error = %err, "write access release failed");
        }
    }

    pub(crate) fn set_bound(&self, identity: Option<BindMetadata>) {
        *self.lock_bound() = identity;
    }

    /// Route one frame from the reader.
    pub(crate) fn dispatch_frame(&self, frame: Frame) {
        let id = frame.message_id;
        trace!(
            conn = %self.name,
            msg_id = id,
            op = %frame.op,
            len = frame.wire_size(),
            "received message"
        );

        if frame.is_unsolicited() {
            self.handle_unsolicited(&frame);
            return;
        }

        match self.table.find(id) {
            Some(request) => request.put_reply(frame),
            None => debug!(
                conn = %self.name,
                msg_id = id,
                op = %frame.op,
                "no outstanding request for message, dropped"
            ),
        }
    }

    fn handle_unsolicited(&self, frame: &Frame) {
        let notice = match UnsolicitedNotice::from_frame(frame) {
            Ok(notice) => notice,
            Err(err) => {
                warn!(conn = %self.name, error = %err, "undecodable unsolicited notification dropped");
                return;
            }
        };

        if notice.is_notice_of_disconnection() {
            self.shutdown_notice.store(true, Ordering::SeqCst);
            warn!(
                conn = %self.name,
                code = notice.result_code,
                message = %notice.diagnostic_message,
                "server sent notice of disconnection"
            );
        } else {
            debug!(conn = %self.name, oid = ?notice.oid, "unsolicited notification");
        }
        self.listeners.dispatch(&self.name, &notice);
    }

    fn release_handle(&self, explicit: bool) {
        let previous = self
            .handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |handles| {
                Some(handles.saturating_sub(1))
            })
            .unwrap_or_else(|handles| handles);
        if previous > 1 {
            trace!(conn = %self.name, handles = previous - 1, "connection handle released");
            return;
        }

        let cause = if explicit {
            ShutdownCause::Requested("connection closed by client".to_string())
        } else {
            ShutdownCause::Released
        };
        self.shutdown(cause, true);
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Outstanding requests are abandoned (with the cause's error when
    /// `notify` is set), an unbind is sent if the connection is bound, the
    /// socket is closed and the reader joined unless this is the reader.
    pub(crate) fn shutdown(&self, cause: ShutdownCause, notify: bool) {
        if !self.client_active.swap(false, Ordering::SeqCst) {
            trace!(conn = %self.name, "already shut down");
            return;
        }
        info!(conn = %self.name, reason = %cause, "shutting down connection");

        for request in self.table.close() {
            request.abandon_with(notify.then(|| cause.to_error()), false);
        }
        let sasl_holder = self.lock_sasl().take();
        if let Some(holder) = sasl_holder {
            self.release_write(holder);
        }

        let bound = self.lock_bound().take();
        let has_writer = self.lock_io().writer.is_some();
        if bound.is_some() && has_writer && self.config.unbind_on_shutdown {
            if let Err(err) = self.write_request(&Request::unbind()) {
                debug!(conn = %self.name, error = %err, "unbind on shutdown not sent");
            }
        }

        self.close_transport();
        if !self.is_reader_thread() {
            self.join_reader();
        }
    }

    /// Close the socket and drop both halves of the transport.
    pub(crate) fn close_transport(&self) {
        let closer = self.lock_closer().take();
        if let Some(closer) = closer {
            if let Err(err) = closer.shutdown() {
                debug!(conn = %self.name, error = %err, "socket shutdown failed");
            }
        }
        let mut io = self.lock_io();
        io.writer = None;
        io.raw = None;
        io.tls = false;
    }

    pub(crate) fn lock_io(&self) -> MutexGuard<'_, IoSlot> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_stop(&self) -> MutexGuard<'_, StopReader> {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_closer(&self) -> MutexGuard<'_, Option<TransportStream>> {
        self.closer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_endpoint(&self) -> MutexGuard<'_, Option<Endpoint>> {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_bound(&self) -> MutexGuard<'_, Option<BindMetadata>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sasl(&self) -> MutexGuard<'_, Option<MessageId>> {
        self.sasl_holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
