//! Credit accounting and message-id allocation

use serde::{Deserialize, Serialize};

use crate::protocol::Command;

/// Per-connection sequence window
///
/// A message id can only be issued while a credit is available. Ids are
/// handed out in strictly increasing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceWindow {
    available: u32,
    next_id: u64,
}

impl SequenceWindow {
    /// Fresh window: one credit, first id 0
    pub fn new() -> Self {
        Self {
            available: 1,
            next_id: 0,
        }
    }

    /// Credits currently available
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Id the next allocation will return
    pub fn peek_next_id(&self) -> u64 {
        self.next_id
    }

    /// Take one credit and return the next message id
    ///
    /// `None` means the window is exhausted and the request must wait for
    /// a grant.
    pub fn next_message_id(&mut self) -> Option<u64> {
        if self.available == 0 {
            return None;
        }
        self.available -= 1;
        let id = self.next_id;
        self.next_id += 1;
        Some(id)
    }

    /// Add credits granted by the peer
    pub fn accept_granted(&mut self, granted: u16) {
        self.available = self.available.saturating_add(u32::from(granted));
    }
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// How many credits to ask for (client) or grant (server)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditPolicy {
    /// Credits requested/granted on NEGOTIATE and SESSION_SETUP
    pub setup_credits: u16,
    /// Credits requested/granted on every other command
    pub default_credits: u16,
    /// Upper bound on any single grant
    pub max_credits: u16,
}

impl CreditPolicy {
    /// Credit request to put in an outbound request header
    pub fn request_for(&self, command: Command) -> u16 {
        if command.is_handshake() {
            self.setup_credits
        } else {
            self.default_credits
        }
    }

    /// Credits to grant in response to a request
    ///
    /// Always at least one so the peer can keep talking.
    pub fn grant_for(&self, command: Command, requested: u16) -> u16 {
        let floor = if command.is_handshake() {
            self.setup_credits
        } else {
            1
        };
        requested.max(floor).clamp(1, self.max_credits.max(1))
    }

    /// Check the bounds are coherent
    pub fn validate(&self) -> Result<(), String> {
        if self.setup_credits == 0 || self.default_credits == 0 {
            return Err("credit requests must be at least 1".to_string());
        }
        if self.max_credits < self.setup_credits || self.max_credits < self.default_credits {
            return Err(format!(
                "max_credits {} below setup ({}) or default ({}) credits",
                self.max_credits, self.setup_credits, self.default_credits
            ));
        }
        Ok(())
    }
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            setup_credits: 64,
            default_credits: 16,
            max_credits: 512,
        }
    }
}
