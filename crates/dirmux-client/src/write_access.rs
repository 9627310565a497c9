use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::{ClientError, Result};
use crate::MessageId;

/// Re-entrant exclusive access to a connection's output stream.
///
/// Access is held by a message id. The holder may acquire again without
/// blocking; each acquire must be matched by a release. Requester 0 asks
/// for an ephemeral negative id, which is returned and must be used to
/// release.
pub struct WriteAccess {
    state: Mutex<State>,
    released: Condvar,
}

struct State {
    owner: MessageId,
    count: u32,
    last_ephemeral: MessageId,
}

impl State {
    fn next_ephemeral(&mut self) -> MessageId {
        self.last_ephemeral = if self.last_ephemeral == MessageId::MIN {
            -1
        } else {
            self.last_ephemeral - 1
        };
        self.last_ephemeral
    }
}

impl WriteAccess {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                owner: 0,
                count: 0,
                last_ephemeral: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Block until `requester` holds access. Returns the holder id.
    pub fn acquire(&self, requester: MessageId) -> MessageId {
        let mut state = self.lock();
        let id = if requester == 0 {
            state.next_ephemeral()
        } else {
            requester
        };

        let mut state = self
            .released
            .wait_while(state, |s| s.owner != 0 && s.owner != id)
            .unwrap_or_else(PoisonError::into_inner);
        state.owner = id;
        state.count += 1;
        trace!(holder = id, depth = state.count, "write access acquired");
        id
    }

    /// Release one level held by `requester`.
    pub fn release(&self, requester: MessageId) -> Result<()> {
        let mut state = self.lock();
        if state.owner == 0 {
            return Err(ClientError::InvalidState(format!(
                "write access released by {requester} while not held"
            )));
        }
        if state.owner != requester {
            return Err(ClientError::InvalidState(format!(
                "write access held by {}, not {requester}",
                state.owner
            )));
        }

        state.count -= 1;
        if state.count == 0 {
            state.owner = 0;
            drop(state);
            self.released.notify_all();
            trace!(holder = requester, "write access released");
        }
        Ok(())
    }

    /// Hand every level held by `from` over to `to` without releasing.
    pub fn transfer(&self, from: MessageId, to: MessageId) -> Result<()> {
        let mut state = self.lock();
        if state.owner != from || from == 0 {
            return Err(ClientError::InvalidState(format!(
                "write access is not held by {from}"
            )));
        }
        state.owner = to;
        Ok(())
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<MessageId> {
        let owner = self.lock().owner;
        (owner != 0).then_some(owner)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for WriteAccess {
    fn default() -> Self {
        Self::new()
    }
}
