use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// An envelope pairing a payload with the identity of the component that
/// produced it.
#[derive(Debug)]
pub struct Message<I, C> {
    pub sender: I,
    pub content: C,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink is sealed")]
    Sealed,
    #[error("sink receiver is gone")]
    Closed,
}

/// One-way send handle with a fixed sender identity. Subcomponents receive a
/// sink by value and use it to emit events back to their owner; the owner
/// seals the sink when it stops caring, after which every send fails.
#[derive(Debug)]
pub struct MessageSink<I, C> {
    sender_id: I,
    tx: mpsc::UnboundedSender<Message<I, C>>,
    sealed: Arc<AtomicBool>,
}

impl<I: Clone, C> Clone for MessageSink<I, C> {
    fn clone(&self) -> Self {
        Self {
            sender_id: self.sender_id.clone(),
            tx: self.tx.clone(),
            sealed: self.sealed.clone(),
        }
    }
}

impl<I: Clone, C> MessageSink<I, C> {
    pub fn new(sender_id: I, tx: mpsc::UnboundedSender<Message<I, C>>) -> Self {
        Self {
            sender_id,
            tx,
            sealed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sender_id(&self) -> &I {
        &self.sender_id
    }

    /// Delivers `content` unless the sink has been sealed or the receiving
    /// side is gone.
    pub fn send(&self, content: C) -> Result<(), SinkError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(SinkError::Sealed);
        }
        self.tx
            .send(Message {
                sender: self.sender_id.clone(),
                content,
            })
            .map_err(|_| SinkError::Closed)
    }

    /// Prevents any further sends through this sink and all of its clones.
    /// Idempotent.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_with_sender_identity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = MessageSink::new("peer-a", tx);
        sink.send(42).unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.sender, "peer-a");
        assert_eq!(msg.content, 42);
    }

    #[tokio::test]
    async fn seal_is_terminal_and_shared_across_clones() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = MessageSink::new("peer-a", tx);
        let clone = sink.clone();

        sink.send(1).unwrap();
        sink.seal();
        sink.seal(); // idempotent

        assert_eq!(sink.send(2), Err(SinkError::Sealed));
        assert_eq!(clone.send(3), Err(SinkError::Sealed));

        // Only the pre-seal message is observable.
        assert_eq!(rx.recv().await.unwrap().content, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = MessageSink::new("peer-a", tx);
        drop(rx);
        assert_eq!(sink.send(1), Err(SinkError::Closed));
    }
}
