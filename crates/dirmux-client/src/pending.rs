use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dirmux_frame::{result_code, Frame, LdapResult, ProtocolOp, Request};
use tracing::{debug, info, trace, warn};

use crate::bind::BindMetadata;
use crate::connection::Shared;
use crate::error::{ClientError, Result};
use crate::multiplexer::MuxShared;
use crate::MessageId;

/// One reply slot: a frame from the server, or a synthetic error.
pub(crate) type Reply = Result<Frame>;

/// One outstanding request and its reply queue.
///
/// Replies are appended by the connection's reader thread and consumed by
/// whoever waits on the owning [`Multiplexer`](crate::Multiplexer). A
/// terminal reply, a timeout, or an abandon ends the request; exactly one
/// of them wins.
pub struct PendingRequest {
    message_id: MessageId,
    op: ProtocolOp,
    encoded: Bytes,
    bind: Option<BindMetadata>,
    timeout: Option<Duration>,
    connection: Weak<Shared>,
    owner: Mutex<Weak<MuxShared>>,
    state: Mutex<State>,
    changed: Condvar,
}

struct State {
    replies: VecDeque<Reply>,
    /// New frames are appended only while set.
    accepting: bool,
    /// Cleared once no further replies can appear.
    waiting: bool,
    complete: bool,
    /// Bind requests hold connection write access until they complete.
    holds_write_access: bool,
}

impl PendingRequest {
    pub(crate) fn new(
        connection: &Arc<Shared>,
        message_id: MessageId,
        request: &Request,
        timeout: Option<Duration>,
        bind: Option<BindMetadata>,
    ) -> Result<Arc<Self>> {
        if bind.is_some() && request.op() != ProtocolOp::BindRequest {
            return Err(ClientError::InvalidState(format!(
                "bind metadata attached to {}",
                request.op()
            )));
        }
        Self::build(Arc::downgrade(connection), message_id, request, timeout, bind)
    }

    #[cfg(test)]
    pub(crate) fn detached(message_id: MessageId, request: &Request) -> Result<Arc<Self>> {
        Self::build(Weak::new(), message_id, request, None, None)
    }

    fn build(
        connection: Weak<Shared>,
        message_id: MessageId,
        request: &Request,
        timeout: Option<Duration>,
        bind: Option<BindMetadata>,
    ) -> Result<Arc<Self>> {
        let mut encoded = BytesMut::new();
        request.encode(message_id, &mut encoded)?;

        Ok(Arc::new(Self {
            message_id,
            op: request.op(),
            encoded: encoded.freeze(),
            bind,
            timeout,
            connection,
            owner: Mutex::new(Weak::new()),
            state: Mutex::new(State {
                replies: VecDeque::new(),
                accepting: true,
                waiting: true,
                complete: false,
                holds_write_access: false,
            }),
            changed: Condvar::new(),
        }))
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn op(&self) -> ProtocolOp {
        self.op
    }

    pub fn is_bind(&self) -> bool {
        self.bind.is_some()
    }

    /// True once the terminal reply has been received.
    pub fn is_complete(&self) -> bool {
        self.lock_state().complete
    }

    /// True while replies may still arrive.
    pub fn is_waiting(&self) -> bool {
        self.lock_state().waiting
    }

    pub fn has_replies(&self) -> bool {
        !self.lock_state().replies.is_empty()
    }

    /// Nothing buffered and nothing more to come.
    pub(crate) fn is_drained(&self) -> bool {
        let state = self.lock_state();
        state.replies.is_empty() && !state.waiting
    }

    pub(crate) fn set_owner(&self, owner: &Arc<MuxShared>) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(owner);
    }

    /// Write the request and start its timer.
    ///
    /// The request must already be registered with the connection so the
    /// reader can route a fast reply.
    pub(crate) fn send(self: &Arc<Self>) -> Result<()> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(ClientError::NotConnected)?;

        if self.bind.is_some() {
            connection.begin_bind(self.message_id);
            let mut state = self.lock_state();
            if !state.waiting {
                drop(state);
                connection.release_write(self.message_id);
                return Err(ClientError::InvalidState(format!(
                    "bind {} abandoned before it was sent",
                    self.message_id
                )));
            }
            state.holds_write_access = true;
        }

        trace!(
            conn = connection.name(),
            msg_id = self.message_id,
            op = %self.op,
            len = self.encoded.len(),
            "sending request"
        );
        if let Err(err) = connection.write_message(self.message_id, &self.encoded) {
            debug!(
                conn = connection.name(),
                msg_id = self.message_id,
                error = %err,
                "request write failed"
            );
            self.retire(&connection, false);
            return Err(err);
        }

        if !self.op.expects_reply() {
            self.retire(&connection, true);
            return Ok(());
        }

        if let Some(timeout) = self.timeout.filter(|timeout| !timeout.is_zero()) {
            self.arm_timer(timeout);
        }
        Ok(())
    }

    /// Append a frame routed by the reader thread.
    pub(crate) fn put_reply(&self, frame: Frame) {
        let mut state = self.lock_state();
        if !state.accepting {
            trace!(
                msg_id = self.message_id,
                op = %frame.op,
                "request no longer accepting replies, frame dropped"
            );
            return;
        }

        let terminal = frame.is_terminal();
        let bind_outcome = (terminal && self.bind.is_some()).then(|| LdapResult::decode(&frame));
        state.replies.push_back(Ok(frame));

        let mut held = false;
        if terminal {
            state.complete = true;
            state.accepting = false;
            state.waiting = false;
            held = std::mem::take(&mut state.holds_write_access);
        }
        drop(state);
        self.changed.notify_all();

        if let Some(outcome) = bind_outcome {
            if let Some(connection) = self.connection.upgrade() {
                self.finish_bind(&connection, outcome, held);
            }
        }
        self.ring_owner();
    }

    fn finish_bind(
        &self,
        connection: &Shared,
        outcome: dirmux_frame::Result<LdapResult>,
        held: bool,
    ) {
        match outcome {
            Ok(result) if result.result_code == result_code::SASL_BIND_IN_PROGRESS => {
                debug!(
                    conn = connection.name(),
                    msg_id = self.message_id,
                    "SASL bind in progress, write access kept"
                );
                if held {
                    connection.hold_for_sasl(self.message_id);
                }
                return;
            }
            Ok(result) if result.is_success() => {
                info!(
                    conn = connection.name(),
                    dn = self.bind.as_ref().map_or("", |bind| bind.dn.as_str()),
                    "bound"
                );
                connection.set_bound(self.bind.clone());
            }
            Ok(result) => {
                debug!(
                    conn = connection.name(),
                    msg_id = self.message_id,
                    code = result.result_code,
                    "bind failed, connection is unbound"
                );
                connection.set_bound(None);
            }
            Err(err) => {
                warn!(
                    conn = connection.name(),
                    msg_id = self.message_id,
                    error = %err,
                    "undecodable bind response, connection is unbound"
                );
                connection.set_bound(None);
            }
        }
        if held {
            connection.release_write(self.message_id);
        }
    }

    /// Pop the next reply without blocking.
    pub(crate) fn next_reply(&self) -> Option<Reply> {
        let mut state = self.lock_state();
        let reply = state.replies.pop_front()?;
        let drained = state.replies.is_empty() && !state.waiting;
        drop(state);
        if drained {
            self.unregister();
        }
        Some(reply)
    }

    /// Pop the next reply, blocking while the queue is empty and replies
    /// may still arrive. `None` once drained and inactive.
    pub(crate) fn wait_for_reply(&self) -> Option<Reply> {
        let mut state = self.lock_state();
        loop {
            if let Some(reply) = state.replies.pop_front() {
                let drained = state.replies.is_empty() && !state.waiting;
                drop(state);
                if drained {
                    self.unregister();
                }
                return Some(reply);
            }
            if !state.waiting {
                return None;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drop out of the connection's table once fully consumed.
    fn unregister(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.table.remove_request(self);
        }
    }

    /// Stop the request and tell the server to stop processing it.
    pub(crate) fn abandon(&self, notify: Option<ClientError>) {
        self.abandon_with(notify, true);
    }

    /// Stop the request.
    ///
    /// With `notify`, waiters receive it as the final reply; without it,
    /// buffered frames are discarded. A bind gives up its write access;
    /// any other request sends a wire abandon when `send_abandon` is set.
    ///
    /// A request that already has its terminal reply only leaves the
    /// connection's table; without `notify` its unread replies are dropped.
    pub(crate) fn abandon_with(&self, notify: Option<ClientError>, send_abandon: bool) {
        let mut state = self.lock_state();
        if !state.waiting {
            if notify.is_none() {
                state.replies.clear();
            }
            drop(state);
            self.unregister();
            return;
        }
        state.waiting = false;
        state.accepting = false;
        let held = std::mem::take(&mut state.holds_write_access);
        match notify {
            Some(err) => state.replies.push_back(Err(err)),
            None => state.replies.clear(),
        }
        drop(state);
        self.changed.notify_all();

        if let Some(connection) = self.connection.upgrade() {
            debug!(
                conn = connection.name(),
                msg_id = self.message_id,
                "request abandoned"
            );
            if held {
                connection.release_write(self.message_id);
            } else if send_abandon && self.bind.is_none() {
                if let Err(err) = connection.send_abandon(self.message_id) {
                    debug!(
                        conn = connection.name(),
                        msg_id = self.message_id,
                        error = %err,
                        "abandon request not sent"
                    );
                }
            }
        }
        self.unregister();
        self.ring_owner();
    }

    fn retire(&self, connection: &Shared, complete: bool) {
        let mut state = self.lock_state();
        state.waiting = false;
        state.accepting = false;
        state.complete = complete;
        let held = std::mem::take(&mut state.holds_write_access);
        drop(state);
        self.changed.notify_all();

        if held {
            connection.release_write(self.message_id);
        }
        connection.table.remove_request(self);
        self.ring_owner();
    }

    fn arm_timer(self: &Arc<Self>, timeout: Duration) {
        let request = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("dirmux-timer-{}", self.message_id))
            .spawn(move || request.expire_after(timeout));
        if let Err(err) = spawned {
            warn!(
                msg_id = self.message_id,
                error = %err,
                "could not start request timer; request has no time limit"
            );
        }
    }

    fn expire_after(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            if !state.accepting {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        // Replies racing the timer are dropped from here on.
        state.accepting = false;
        drop(state);

        debug!(msg_id = self.message_id, ?timeout, "request timed out");
        self.abandon(Some(ClientError::ClientTimeout {
            message_id: self.message_id,
            timeout,
        }));
    }

    fn ring_owner(&self) {
        let owner = self
            .owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade();
        if let Some(owner) = owner {
            owner.ring();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("message_id", &self.message_id)
            .field("op", &self.op)
            .field("bind", &self.bind)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
