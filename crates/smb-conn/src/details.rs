//! Per-connection state shared by both roles

use std::collections::{HashMap, VecDeque};

use smb_proto::protocol::Dialect;
use smb_proto::signing::PacketSigner;
use smb_proto::window::{CreditPolicy, SequenceWindow};
use tracing::{debug, trace};

/// State owned by one connection task
///
/// `T` is whatever the client queues while it waits for credits. The server
/// never queues and uses the default `()`.
#[derive(Debug)]
pub struct ConnectionDetails<T = ()> {
    dialect: Option<Dialect>,
    signers: HashMap<u64, PacketSigner>,
    window: SequenceWindow,
    pending: VecDeque<T>,
    credits: CreditPolicy,
}

impl<T> ConnectionDetails<T> {
    /// Fresh connection state
    pub fn new(credits: CreditPolicy) -> Self {
        Self {
            dialect: None,
            signers: HashMap::new(),
            window: SequenceWindow::new(),
            pending: VecDeque::new(),
            credits,
        }
    }

    /// Negotiated dialect, once known
    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    /// Record the negotiated dialect
    pub fn set_dialect(&mut self, dialect: Dialect) {
        debug!(%dialect, "Dialect negotiated");
        self.dialect = Some(dialect);
    }

    /// Credit policy of this connection
    pub fn credit_policy(&self) -> &CreditPolicy {
        &self.credits
    }

    /// Install the signer of an established session
    pub fn insert_signer(&mut self, session_id: u64, signer: PacketSigner) {
        debug!(session_id, algorithm = ?signer.algorithm(), "Signer installed");
        self.signers.insert(session_id, signer);
    }

    /// Drop the signer of a logged-off session
    pub fn remove_signer(&mut self, session_id: u64) -> Option<PacketSigner> {
        let removed = self.signers.remove(&session_id);
        if removed.is_some() {
            debug!(session_id, "Signer removed");
        }
        removed
    }

    /// Signer for a session, if it has one
    pub fn signer(&self, session_id: u64) -> Option<&PacketSigner> {
        self.signers.get(&session_id)
    }

    /// Number of sessions with a signer
    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    /// Sequence window
    pub fn window(&self) -> &SequenceWindow {
        &self.window
    }

    /// Give `item` a message id, or queue it until credits arrive
    ///
    /// Items already waiting keep their place: a new item is only issued
    /// directly when the queue is empty.
    pub fn allocate(&mut self, item: T) -> Option<(u64, T)> {
        if self.pending.is_empty() {
            if let Some(id) = self.window.next_message_id() {
                return Some((id, item));
            }
        }
        self.pending.push_back(item);
        trace!(queued = self.pending.len(), "Out of credits, request queued");
        None
    }

    /// Absorb granted credits and release queued items, oldest first
    pub fn accept_granted(&mut self, granted: u16) -> Vec<(u64, T)> {
        self.window.accept_granted(granted);
        let mut released = Vec::new();
        while !self.pending.is_empty() {
            let Some(id) = self.window.next_message_id() else {
                break;
            };
            if let Some(item) = self.pending.pop_front() {
                released.push((id, item));
            }
        }
        if !released.is_empty() {
            trace!(released = released.len(), "Queued requests released");
        }
        released
    }

    /// Remove the first queued item matching `predicate`
    pub fn remove_queued(&mut self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let index = self.pending.iter().position(predicate)?;
        self.pending.remove(index)
    }

    /// Number of queued items
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Take every queued item
    pub fn drain_queued(&mut self) -> Vec<T> {
        self.pending.drain(..).collect()
    }
}
