use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dirmux_frame::{Frame, Request};
use tracing::debug;

use crate::bind::BindMetadata;
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::pending::{PendingRequest, Reply};
use crate::MessageId;

/// A caller-side handle over a set of outstanding requests.
///
/// Requests submitted through one multiplexer are answered through it,
/// either by message id or by whichever has a reply ready. Clones share
/// the same set.
#[derive(Clone, Default)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

#[derive(Default)]
pub(crate) struct MuxShared {
    state: Mutex<MuxState>,
    doorbell: Condvar,
}

#[derive(Default)]
struct MuxState {
    requests: Vec<Arc<PendingRequest>>,
    last_served: Option<usize>,
    rings: u64,
}

impl MuxShared {
    /// Wake callers blocked in `next_response`.
    pub(crate) fn ring(&self) {
        let mut state = self.lock();
        state.rings = state.rings.wrapping_add(1);
        drop(state);
        self.doorbell.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `request` on `connection` and track it here.
    ///
    /// The request's pinned message id is used if it has one; otherwise the
    /// connection assigns the next free id. Bind requests carry `bind` so
    /// the connection learns its identity when the bind succeeds.
    pub fn submit(
        &self,
        connection: &Connection,
        request: &Request,
        timeout: Option<Duration>,
        bind: Option<BindMetadata>,
    ) -> Result<MessageId> {
        let shared = connection.shared();
        let id = match request.message_id() {
            Some(id) if id <= 0 => {
                return Err(ClientError::InvalidState(format!(
                    "message id {id} cannot be used for a request"
                )))
            }
            Some(id) => id,
            None => shared.allocate_message_id(),
        };

        let pending = PendingRequest::new(shared, id, request, timeout, bind)?;
        pending.set_owner(&self.shared);
        shared.table.insert(Arc::clone(&pending))?;
        self.shared.lock().requests.push(Arc::clone(&pending));

        if let Err(err) = pending.send() {
            self.forget(&pending);
            return Err(err);
        }
        if pending.is_drained() {
            self.forget(&pending);
        }
        Ok(id)
    }

    /// Next reply for `id`, or for any owned request when `id` is `None`.
    ///
    /// Blocks until a reply is available. With no id, owned requests are
    /// scanned round-robin starting after the one served last, and `None`
    /// is returned once nothing is owned. Synthetic errors (timeout,
    /// connection loss) are returned as `Err`.
    pub fn next_response(&self, id: Option<MessageId>) -> Result<Option<Frame>> {
        match id {
            Some(id) => self.next_for(id).map(Some),
            None => self.next_any(),
        }
    }

    fn next_for(&self, id: MessageId) -> Result<Frame> {
        let pending = self
            .find(id)
            .ok_or(ClientError::NoSuchRequest(id))?;
        let reply = pending.wait_for_reply();
        if pending.is_drained() {
            self.forget(&pending);
        }
        match reply {
            Some(reply) => reply,
            None => Err(ClientError::NoSuchRequest(id)),
        }
    }

    fn next_any(&self) -> Result<Option<Frame>> {
        let mut state = self.shared.lock();
        loop {
            state.requests.retain(|request| !request.is_drained());
            if state.requests.is_empty() {
                return Ok(None);
            }

            if let Some(reply) = Self::serve_round_robin(&mut state) {
                return reply.map(Some);
            }

            let seen = state.rings;
            state = self
                .shared
                .doorbell
                .wait_while(state, |s| s.rings == seen)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn serve_round_robin(state: &mut MuxState) -> Option<Reply> {
        let len = state.requests.len();
        let start = state.last_served.map_or(0, |last| (last + 1) % len);
        for offset in 0..len {
            let index = (start + offset) % len;
            let Some(reply) = state.requests[index].next_reply() else {
                continue;
            };
            if state.requests[index].is_drained() {
                state.requests.remove(index);
                state.last_served = index.checked_sub(1);
            } else {
                state.last_served = Some(index);
            }
            return Some(reply);
        }
        None
    }

    /// True if a reply for `id` (or for any owned request) is buffered.
    pub fn is_response_received(&self, id: Option<MessageId>) -> bool {
        let state = self.shared.lock();
        state
            .requests
            .iter()
            .filter(|request| id.is_none_or(|id| request.message_id() == id))
            .any(|request| request.has_replies())
    }

    /// True once the terminal reply for `id` has arrived.
    pub fn is_complete(&self, id: MessageId) -> Result<bool> {
        self.find(id)
            .map(|request| request.is_complete())
            .ok_or(ClientError::NoSuchRequest(id))
    }

    /// Stop tracking `id` and ask the server to abandon it.
    pub fn abandon(&self, id: MessageId) -> Result<()> {
        let pending = {
            let mut state = self.shared.lock();
            let index = state
                .requests
                .iter()
                .position(|request| request.message_id() == id)
                .ok_or(ClientError::NoSuchRequest(id))?;
            state.last_served = None;
            state.requests.remove(index)
        };
        pending.abandon(None);
        Ok(())
    }

    /// Abandon every owned request.
    pub fn abandon_all(&self) {
        let requests = {
            let mut state = self.shared.lock();
            state.last_served = None;
            std::mem::take(&mut state.requests)
        };
        for request in requests {
            request.abandon(None);
        }
    }

    /// Take over every request owned by `other`.
    ///
    /// Replies for merged requests are delivered here from now on;
    /// `other` is left empty.
    pub fn merge(&self, other: &Multiplexer) {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return;
        }

        let moved = {
            let mut theirs = other.shared.lock();
            theirs.last_served = None;
            std::mem::take(&mut theirs.requests)
        };
        for request in &moved {
            request.set_owner(&self.shared);
        }
        debug!(count = moved.len(), "merged outstanding requests");

        self.shared.lock().requests.extend(moved);
        self.shared.ring();
        other.shared.ring();
    }

    /// Ids of every owned request, in submission order.
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.shared
            .lock()
            .requests
            .iter()
            .map(|request| request.message_id())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().requests.is_empty()
    }

    fn find(&self, id: MessageId) -> Option<Arc<PendingRequest>> {
        self.shared
            .lock()
            .requests
            .iter()
            .find(|request| request.message_id() == id)
            .cloned()
    }

    fn forget(&self, pending: &Arc<PendingRequest>) {
        let mut state = self.shared.lock();
        if let Some(index) = state
            .requests
            .iter()
            .position(|request| Arc::ptr_eq(request, pending))
        {
            state.requests.remove(index);
            state.last_served = None;
        }
    }

    #[cfg(test)]
    fn adopt(&self, request: Arc<PendingRequest>) {
        request.set_owner(&self.shared);
        self.shared.lock().requests.push(request);
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("message_ids", &self.message_ids())
            .finish()
    }
}
