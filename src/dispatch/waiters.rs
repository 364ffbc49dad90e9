//! Pending-waiter table.
//!
//! One entry per in-flight request, keyed by the request's `message_id`.
//! Removing an entry from the map *is* the claim: whoever removes it owns
//! the one-shot slot, so a waiter resolves exactly once no matter how a
//! reply, a timeout and a recipient failure race.
//!
//! Recently closed ids are remembered (bounded) so a second reply can be
//! told apart from a late one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::bus::Envelope;

const CLOSED_MEMORY: usize = 4096;

/// What a waiter is resolved with.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// A `TASK_RESPONSE` or `TASK_ERROR` from the recipient.
    Reply(Envelope),
    /// The recipient went away before replying.
    Unavailable(String),
}

/// Result of trying to resolve a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Resolved,
    /// Already resolved by an earlier reply.
    Duplicate,
    /// The waiter timed out, was cancelled, or its recipient failed.
    Late,
    /// The reply came from someone other than the addressed agent.
    WrongSender,
    /// Never seen, or forgotten long ago.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Replied,
    Abandoned,
}

struct Waiter {
    recipient_id: String,
    tx: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, Waiter>,
    closed: HashMap<String, Closed>,
    closed_order: VecDeque<String>,
}

impl State {
    fn remember(&mut self, id: String, how: Closed) {
        if self.closed.insert(id.clone(), how).is_none() {
            self.closed_order.push_back(id);
        }
        while self.closed_order.len() > CLOSED_MEMORY {
            if let Some(old) = self.closed_order.pop_front() {
                self.closed.remove(&old);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct WaiterTable {
    state: Mutex<State>,
}

impl WaiterTable {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter before the request is published.
    pub fn insert(&self, id: &str, recipient_id: &str) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.state()
            .pending
            .insert(id.to_string(), Waiter { recipient_id: recipient_id.to_string(), tx });
        rx
    }

    /// Resolve with a reply from `sender_id`.
    pub fn resolve(&self, id: &str, sender_id: &str, reply: Envelope) -> Claim {
        let waiter = {
            let mut state = self.state();
            match state.pending.get(id) {
                Some(w) if w.recipient_id != sender_id => return Claim::WrongSender,
                Some(_) => {}
                None => {
                    return match state.closed.get(id) {
                        Some(Closed::Replied) => Claim::Duplicate,
                        Some(Closed::Abandoned) => Claim::Late,
                        None => Claim::Unknown,
                    };
                }
            }
            state.remember(id.to_string(), Closed::Replied);
            state.pending.remove(id)
        };
        if let Some(waiter) = waiter {
            // The caller may have stopped listening a moment ago; nothing to do then.
            let _ = waiter.tx.send(Resolution::Reply(reply));
        }
        Claim::Resolved
    }

    /// Drop the waiter without resolving it (timeout or cancellation).
    /// Returns `false` if someone else claimed it first.
    pub fn abandon(&self, id: &str) -> bool {
        let mut state = self.state();
        if state.pending.remove(id).is_some() {
            state.remember(id.to_string(), Closed::Abandoned);
            true
        } else {
            false
        }
    }

    /// Fail every waiter addressed to `recipient_id`. Returns how many.
    pub fn fail_recipient(&self, recipient_id: &str, reason: &str) -> usize {
        let failed: Vec<Waiter> = {
            let mut state = self.state();
            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, w)| w.recipient_id == recipient_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let waiter = state.pending.remove(&id);
                    state.remember(id, Closed::Abandoned);
                    waiter
                })
                .collect()
        };
        let count = failed.len();
        for waiter in failed {
            let _ = waiter.tx.send(Resolution::Unavailable(reason.to_string()));
        }
        count
    }

    /// Drop every waiter; their callers observe a closed slot.
    pub fn close_all(&self) -> usize {
        let mut state = self.state();
        let ids: Vec<String> = state.pending.drain().map(|(id, _)| id).collect();
        let count = ids.len();
        for id in ids {
            state.remember(id, Closed::Abandoned);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state().pending.contains_key(id)
    }
}

/// Abandons its waiter when dropped, covering every exit from a send
/// including the caller dropping the future.
pub(crate) struct WaiterGuard<'a> {
    table: &'a WaiterTable,
    id: String,
}

impl<'a> WaiterGuard<'a> {
    pub fn new(table: &'a WaiterTable, id: &str) -> Self {
        Self { table, id: id.to_string() }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.table.abandon(&self.id);
    }
}
