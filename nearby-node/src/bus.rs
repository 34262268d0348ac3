//! Event bus: fan-out of core events to every subscribed observer.

use nearby_core::Event;
use tokio::sync::mpsc;

/// Owned by the actor. Publishing never blocks; observers that dropped their stream
/// are pruned on the next publish.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    observers: Vec<mpsc::UnboundedSender<Event>>,
}

impl EventBus {
    pub(crate) fn subscribe(&mut self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        EventStream { rx }
    }

    pub(crate) fn publish(&mut self, event: Event) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

/// Events published after `subscribe`, in order and without loss.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Next event; `None` once the node has shut down and the backlog is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
