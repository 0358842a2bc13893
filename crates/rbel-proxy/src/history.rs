//! Byte-bounded store of finished messages.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use rbel_core::RbelMessage;
use uuid::Uuid;

#[derive(Debug, Default)]
struct HistoryState {
    messages: VecDeque<Arc<RbelMessage>>,
    total_bytes: usize,
}

/// Finished messages in publication order, oldest evicted first.
///
/// The newest message is always kept, even if it alone exceeds the budget.
#[derive(Debug)]
pub struct MessageHistory {
    max_bytes: usize,
    state: RwLock<HistoryState>,
}

impl MessageHistory {
    /// Creates an empty history holding at most `max_bytes` of raw content.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            state: RwLock::new(HistoryState::default()),
        }
    }

    /// Appends a message and evicts old ones until the budget fits.
    pub fn push(&self, message: Arc<RbelMessage>) {
        let mut state = self.state.write();
        state.total_bytes += message.size();
        state.messages.push_back(message);
        while state.total_bytes > self.max_bytes && state.messages.len() > 1 {
            if let Some(evicted) = state.messages.pop_front() {
                state.total_bytes -= evicted.size();
                tracing::trace!("Evicted message {} from history", evicted.uuid());
            }
        }
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.state.read().messages.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.state.read().messages.is_empty()
    }

    /// Raw bytes held.
    pub fn total_bytes(&self) -> usize {
        self.state.read().total_bytes
    }

    /// All stored messages, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<RbelMessage>> {
        self.state.read().messages.iter().cloned().collect()
    }

    /// Looks up a stored message by uuid.
    pub fn find(&self, uuid: &Uuid) -> Option<Arc<RbelMessage>> {
        self.state
            .read()
            .messages
            .iter()
            .rev()
            .find(|m| m.uuid() == *uuid)
            .cloned()
    }

    /// The most recently stored message.
    pub fn last(&self) -> Option<Arc<RbelMessage>> {
        self.state.read().messages.back().cloned()
    }

    /// Drops everything.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.messages.clear();
        state.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use rbel_core::MessageMetadata;

    use super::*;

    fn message(len: usize) -> Arc<RbelMessage> {
        Arc::new(RbelMessage::new(vec![b'x'; len], MessageMetadata::new()))
    }

    #[test]
    fn evicts_oldest_over_budget() {
        let history = MessageHistory::new(10);
        let first = message(4);
        history.push(first.clone());
        history.push(message(4));
        history.push(message(4));
        assert_eq!(history.len(), 2);
        assert_eq!(history.total_bytes(), 8);
        assert!(history.find(&first.uuid()).is_none());
    }

    #[test]
    fn keeps_oversized_newest() {
        let history = MessageHistory::new(10);
        history.push(message(3));
        let big = message(50);
        history.push(big.clone());
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().uuid(), big.uuid());
    }

    #[test]
    fn snapshot_is_ordered() {
        let history = MessageHistory::new(1_000);
        let a = message(1);
        let b = message(2);
        history.push(a.clone());
        history.push(b.clone());
        let uuids: Vec<_> = history.snapshot().iter().map(|m| m.uuid()).collect();
        assert_eq!(uuids, vec![a.uuid(), b.uuid()]);
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.total_bytes(), 0);
    }
}
