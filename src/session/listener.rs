use tokio::sync::mpsc;

use crate::chat::StreamEvent;

/// Returned by a listener that no longer wants events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("listener disconnected")]
pub struct ListenerGone;

/// Subscriber callback. Must not call back into the session.
pub type Listener = Box<dyn FnMut(&StreamEvent) -> Result<(), ListenerGone> + Send>;

/// Forward events into an unbounded channel; the listener goes away with the receiver.
pub fn channel_listener(tx: mpsc::UnboundedSender<StreamEvent>) -> Listener {
    Box::new(move |event| tx.send(event.clone()).map_err(|_| ListenerGone))
}

#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    pub(crate) fn push(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    /// Deliver `event` to every listener, dropping the ones that fail.
    pub(crate) fn broadcast(&mut self, event: &StreamEvent) {
        self.listeners.retain_mut(|listener| match listener(event) {
            Ok(()) => true,
            Err(ListenerGone) => {
                log::debug!("dropping disconnected listener");
                false
            }
        });
    }

    pub(crate) fn clear(&mut self) {
        self.listeners.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::MessageDelta {
            content: text.to_string(),
            reasoning: String::new(),
        }
    }

    #[test]
    fn failing_listener_is_removed_without_affecting_others() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let mut set = ListenerSet::default();
        set.push(Box::new(|_| Err(ListenerGone)));
        let counter = Arc::clone(&delivered);
        set.push(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        set.broadcast(&delta("a"));
        set.broadcast(&delta("b"));

        assert_eq!(set.len(), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn channel_listener_stops_after_receiver_drops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = ListenerSet::default();
        set.push(channel_listener(tx));

        set.broadcast(&delta("a"));
        assert_eq!(rx.try_recv().unwrap(), delta("a"));

        drop(rx);
        set.broadcast(&delta("b"));
        assert_eq!(set.len(), 0);
    }
}
