use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ClientError, Result};
use crate::pending::PendingRequest;
use crate::MessageId;

/// Outstanding requests on one connection, in insertion order.
///
/// Every id appears at most once. The reader thread looks requests up
/// here to route replies. A closed table refuses new requests until it is
/// reopened by the next connect.
#[derive(Default)]
pub struct RequestTable {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Arc<PendingRequest>>,
    closed: bool,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Fails if its id is already outstanding.
    pub fn insert(&self, request: Arc<PendingRequest>) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ClientError::ConnectionClosed(
                "connection is shut down".to_string(),
            ));
        }
        let id = request.message_id();
        if inner.entries.iter().any(|entry| entry.message_id() == id) {
            return Err(ClientError::DuplicateMessageId(id));
        }
        inner.entries.push(request);
        Ok(())
    }

    pub fn find(&self, id: MessageId) -> Option<Arc<PendingRequest>> {
        self.lock()
            .entries
            .iter()
            .find(|entry| entry.message_id() == id)
            .cloned()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.lock().entries.iter().any(|entry| entry.message_id() == id)
    }

    pub fn remove(&self, id: MessageId) -> Option<Arc<PendingRequest>> {
        let mut inner = self.lock();
        let index = inner
            .entries
            .iter()
            .position(|entry| entry.message_id() == id)?;
        Some(inner.entries.remove(index))
    }

    /// Remove exactly this request; a newer request reusing the id stays.
    pub(crate) fn remove_request(&self, request: &PendingRequest) -> bool {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|entry| !std::ptr::eq(Arc::as_ptr(entry), request));
        inner.entries.len() != before
    }

    /// Take every outstanding request, leaving the table empty.
    pub fn drain(&self) -> Vec<Arc<PendingRequest>> {
        std::mem::take(&mut self.lock().entries)
    }

    /// Drain and refuse further inserts.
    pub(crate) fn close(&self) -> Vec<Arc<PendingRequest>> {
        let mut inner = self.lock();
        inner.closed = true;
        std::mem::take(&mut inner.entries)
    }

    pub(crate) fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.message_id())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
