//! Correlation of responses to outstanding requests

use std::collections::HashMap;

use smb_proto::protocol::{Command, Message};
use smb_proto::{SmbError, SmbResult};
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Who is waiting for a response
#[derive(Debug)]
pub enum Waiter {
    /// The negotiation flow
    Handshake,
    /// A caller of the client handle
    Caller {
        /// Handle-side identity of the request
        ticket: u64,
        /// Completion
        reply: oneshot::Sender<SmbResult<Message>>,
    },
}

impl Waiter {
    /// Ticket of a caller
    pub fn ticket(&self) -> Option<u64> {
        match self {
            Waiter::Handshake => None,
            Waiter::Caller { ticket, .. } => Some(*ticket),
        }
    }

    /// Resolve a caller; the handshake is resolved by the flow instead
    pub fn resolve(self, result: SmbResult<Message>) {
        if let Waiter::Caller { ticket, reply } = self {
            if reply.send(result).is_err() {
                trace!(ticket, "Caller went away before its response");
            }
        }
    }
}

/// One request on the wire
#[derive(Debug)]
pub struct PendingEntry {
    /// Command sent
    pub command: Command,
    /// Session the request ran on
    pub session_id: u64,
    /// Async ID from an interim response
    pub async_id: Option<u64>,
    /// Who gets the final response
    pub waiter: Waiter,
}

/// Requests awaiting their final response, keyed by message id
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<u64, PendingEntry>,
    tickets: HashMap<u64, u64>,
}

impl PendingTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request just written
    pub fn insert(&mut self, message_id: u64, command: Command, session_id: u64, waiter: Waiter) {
        if let Some(ticket) = waiter.ticket() {
            self.tickets.insert(ticket, message_id);
        }
        let entry = PendingEntry {
            command,
            session_id,
            async_id: None,
            waiter,
        };
        if let Some(previous) = self.entries.insert(message_id, entry) {
            warn!(message_id, "Message id reused while still pending");
            previous
                .waiter
                .resolve(Err(SmbError::Protocol("Message id reused".to_string())));
        }
    }

    /// Record the async id of an interim response
    ///
    /// Returns false when nothing is waiting on `message_id`.
    pub fn mark_async(&mut self, message_id: u64, async_id: u64) -> bool {
        match self.entries.get_mut(&message_id) {
            Some(entry) => {
                entry.async_id = Some(async_id);
                true
            }
            None => false,
        }
    }

    /// Remove the entry a final response completes
    pub fn take(&mut self, message_id: u64) -> Option<PendingEntry> {
        let entry = self.entries.remove(&message_id)?;
        if let Some(ticket) = entry.waiter.ticket() {
            self.tickets.remove(&ticket);
        }
        Some(entry)
    }

    /// Remove a caller's entry by ticket, returning its message id
    pub fn cancel(&mut self, ticket: u64) -> Option<(u64, PendingEntry)> {
        let message_id = self.tickets.remove(&ticket)?;
        self.entries
            .remove(&message_id)
            .map(|entry| (message_id, entry))
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every caller with an error built by `error`
    pub fn fail_all(&mut self, error: impl Fn() -> SmbError) {
        self.tickets.clear();
        for (_, entry) in self.entries.drain() {
            entry.waiter.resolve(Err(error()));
        }
    }
}
