// Ordered message log for the active group, including optimistic entries.

use std::collections::HashSet;

use crate::state::{ChatMessage, MessageBody, MessageKey};

/// Insertion order is the display order. Ids (temporary or server) are unique.
#[derive(Debug, Default)]
pub(crate) struct MessageStore {
    messages: Vec<ChatMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id() == id)
    }

    /// Appends at the end. Returns `false` (and stores nothing) if the id is already present.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if self.contains(message.id()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Swaps the pending entry `temp_id` for its confirmed form, keeping its position.
    ///
    /// When the confirmed id is already in the log (its echo was appended on its own), the
    /// pending entry is dropped instead. Returns whether a pending entry was found.
    pub fn replace_pending(&mut self, temp_id: &str, confirmed: ChatMessage) -> bool {
        let Some(pos) = self.pending_position(temp_id) else {
            return false;
        };
        if self.contains(confirmed.id()) {
            self.messages.remove(pos);
        } else {
            self.messages[pos] = confirmed;
        }
        true
    }

    /// Drops the pending entry with exactly this temporary id. Missing id is a no-op.
    pub fn remove_pending(&mut self, temp_id: &str) -> bool {
        match self.pending_position(temp_id) {
            Some(pos) => {
                self.messages.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    /// Installs the initial page. Entries that arrived while it was loading (live confirmed
    /// messages missing from the page, and every pending entry) follow it in their current order.
    pub fn load_page(&mut self, page: Vec<ChatMessage>) {
        let mut seen: HashSet<String> = HashSet::with_capacity(page.len());
        let mut merged: Vec<ChatMessage> = Vec::with_capacity(page.len() + self.messages.len());
        for message in page {
            if seen.insert(message.id().to_string()) {
                merged.push(message);
            }
        }
        for message in self.messages.drain(..) {
            if message.is_pending() || seen.insert(message.id().to_string()) {
                merged.push(message);
            }
        }
        self.messages = merged;
    }

    /// Oldest pending entry by `author_id` with an equal body: the one a server echo confirms.
    pub fn find_pending_echo(&self, author_id: &str, body: &MessageBody) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.is_pending() && m.author_id == author_id && m.body == *body)
            .map(ChatMessage::id)
    }

    fn pending_position(&self, temp_id: &str) -> Option<usize> {
        self.messages.iter().position(
            |m| matches!(&m.key, MessageKey::Pending { temp_id: t } if t == temp_id),
        )
    }
}
