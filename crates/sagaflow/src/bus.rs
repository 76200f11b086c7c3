use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use crate::action::Action;

/// Process-wide ordered channel of dispatched actions.
///
/// Every published action is stamped with a strictly increasing sequence
/// number. A bounded history of recent actions lets a `Take` that starts
/// slightly late still see actions dispatched after its cursor.
///
/// Delivery to live subscribers is at-most-once: a receiver that falls
/// more than `capacity` actions behind observes a lag and skips ahead.
pub(crate) struct ActionBus {
    sender: broadcast::Sender<Action>,
    history: Mutex<History>,
}

struct History {
    last_seq: u64,
    limit: usize,
    recent: VecDeque<Action>,
}

impl ActionBus {
    pub(crate) fn new(capacity: usize, history_len: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Mutex::new(History {
                last_seq: 0,
                limit: history_len,
                recent: VecDeque::with_capacity(history_len),
            }),
        }
    }

    /// Stamp, record and broadcast an action. Returns the stamped action.
    pub(crate) fn publish(&self, mut action: Action) -> Action {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.last_seq += 1;
        action.stamp(history.last_seq);

        if history.limit > 0 {
            if history.recent.len() == history.limit {
                history.recent.pop_front();
            }
            history.recent.push_back(action.clone());
        }

        // No live subscribers is fine: takes read the history.
        let _ = self.sender.send(action.clone());
        action
    }

    /// Live stream of actions dispatched from now on.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Action> {
        self.sender.subscribe()
    }

    /// Sequence number of the most recently published action.
    pub(crate) fn position(&self) -> u64 {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_seq
    }

    /// Retained actions after `cursor`, plus a receiver for everything
    /// published afterwards. No action is missed or seen twice between
    /// the two.
    pub(crate) fn subscribe_since(&self, cursor: u64) -> (Vec<Action>, broadcast::Receiver<Action>) {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = self.sender.subscribe();

        if let Some(oldest) = history.recent.front() {
            if oldest.seq() > cursor + 1 {
                debug!(
                    cursor,
                    oldest = oldest.seq(),
                    "take cursor is older than retained history"
                );
            }
        }

        let backlog = history
            .recent
            .iter()
            .filter(|action| action.seq() > cursor)
            .cloned()
            .collect();
        (backlog, receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_stamps_increasing_sequence() {
        let bus = ActionBus::new(8, 8);
        let first = bus.publish(Action::new("A"));
        let second = bus.publish(Action::new("B"));
        assert_eq!(first.seq(), 1);
        assert_eq!(second.seq(), 2);
        assert_eq!(bus.position(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let bus = ActionBus::new(8, 2);
        for _ in 0..5 {
            bus.publish(Action::new("A"));
        }
        let (backlog, _rx) = bus.subscribe_since(0);
        let seqs: Vec<u64> = backlog.iter().map(Action::seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn subscribe_since_splits_backlog_and_live() {
        let bus = ActionBus::new(8, 8);
        bus.publish(Action::new("OLD"));
        let cursor = bus.position();
        bus.publish(Action::new("BACKLOG"));

        let (backlog, mut rx) = bus.subscribe_since(cursor);
        bus.publish(Action::new("LIVE"));

        assert_eq!(backlog.len(), 1);
        assert!(backlog[0].is("BACKLOG"));
        let live = rx.recv().await.unwrap();
        assert!(live.is("LIVE"));
    }
}
