//! Unsolicited notifications (message id 0) and their listeners.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use bytes::Bytes;
use dirmux_frame::{oid, ExtendedResponse, Frame};
use tracing::warn;

use crate::error::Result;

/// A server-initiated extended response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsolicitedNotice {
    pub oid: Option<String>,
    pub value: Option<Bytes>,
    pub result_code: i32,
    pub diagnostic_message: String,
}

impl UnsolicitedNotice {
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let response = ExtendedResponse::decode(frame)?;
        Ok(Self {
            oid: response.oid,
            value: response.value,
            result_code: response.result.result_code,
            diagnostic_message: response.result.diagnostic_message,
        })
    }

    /// The server is about to close the connection.
    pub fn is_notice_of_disconnection(&self) -> bool {
        self.oid.as_deref() == Some(oid::NOTICE_OF_DISCONNECTION)
    }
}

/// Receives unsolicited notifications.
///
/// Each delivery runs on its own short-lived thread, so a slow listener
/// never stalls the connection's reader.
pub trait UnsolicitedListener: Send + Sync {
    fn on_notice(&self, notice: &UnsolicitedNotice);
}

impl<F> UnsolicitedListener for F
where
    F: Fn(&UnsolicitedNotice) + Send + Sync,
{
    fn on_notice(&self, notice: &UnsolicitedNotice) {
        self(notice)
    }
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Entry = (ListenerId, Arc<dyn UnsolicitedListener>);

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Entry>>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, listener: Arc<dyn UnsolicitedListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `notice` to every listener registered right now.
    pub(crate) fn dispatch(&self, connection: &str, notice: &UnsolicitedNotice) {
        let listeners: Vec<Entry> = self.lock().clone();
        for (id, listener) in listeners {
            let notice = notice.clone();
            let conn = connection.to_string();
            let spawned = thread::Builder::new()
                .name(format!("dirmux-notice-{}", id.0))
                .spawn(move || {
                    let delivered =
                        panic::catch_unwind(AssertUnwindSafe(|| listener.on_notice(&notice)));
                    if delivered.is_err() {
                        warn!(conn = %conn, listener = id.0, "unsolicited listener panicked");
                    }
                });
            if let Err(err) = spawned {
                warn!(conn = connection, error = %err, "failed to deliver unsolicited notice");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
