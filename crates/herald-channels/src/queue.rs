//! Inbound message queue shared between a provider's network callbacks and its consumer

use herald_core::error::{ChatError, Result};
use herald_core::types::{InboundMessage, QueueItem};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Multi-producer, single-consumer queue of inbound traffic.
///
/// Producers never block. [`MessageQueue::next_message`] suspends until an item
/// is available or the caller cancels; cancelling never drops a queued item.
pub struct MessageQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    rx: Mutex<mpsc::UnboundedReceiver<QueueItem>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queue an inbound message
    pub fn enqueue(&self, message: InboundMessage) {
        self.push(QueueItem::Message(message));
    }

    /// Tell the consumer the channel mapping may be stale
    pub fn request_remap(&self) {
        debug!("Queueing channel remap request");
        self.push(QueueItem::RemapRequested);
    }

    fn push(&self, item: QueueItem) {
        // The receiver lives as long as self, so this cannot fail
        let _ = self.tx.send(item);
    }

    /// Wait for the next queued item
    pub async fn next_message(&self, token: &CancellationToken) -> Result<QueueItem> {
        let mut rx = tokio::select! {
            _ = token.cancelled() => return Err(ChatError::Cancelled),
            rx = self.rx.lock() => rx,
        };

        tokio::select! {
            // Prefer an available item over a simultaneous cancellation
            biased;
            item = rx.recv() => item.ok_or(ChatError::NotConnected),
            _ = token.cancelled() => Err(ChatError::Cancelled),
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::{ChannelAddress, ChatUser};
    use std::sync::Arc;
    use std::time::Duration;

    fn message(content: &str) -> InboundMessage {
        let channel = ChannelAddress::private(1, "irc.example.org", "alice");
        InboundMessage {
            content: content.to_string(),
            author: ChatUser {
                real_id: 1,
                display_name: "alice".to_string(),
                mention_token: "alice".to_string(),
                channel,
            },
        }
    }

    fn content(item: QueueItem) -> String {
        match item {
            QueueItem::Message(m) => m.content,
            QueueItem::RemapRequested => "<remap>".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MessageQueue::new();
        queue.enqueue(message("one"));
        queue.request_remap();
        queue.enqueue(message("two"));

        let token = CancellationToken::new();
        assert_eq!(content(queue.next_message(&token).await.unwrap()), "one");
        assert_eq!(content(queue.next_message(&token).await.unwrap()), "<remap>");
        assert_eq!(content(queue.next_message(&token).await.unwrap()), "two");
    }

    #[tokio::test]
    async fn test_waits_for_enqueue() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_message(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.enqueue(message("late"));
        let item = consumer.await.unwrap().unwrap();
        assert_eq!(content(item), "late");
    }

    #[tokio::test]
    async fn test_cancel_leaves_queue_usable() {
        let queue = MessageQueue::new();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            queue.next_message(&token).await,
            Err(ChatError::Cancelled)
        ));

        queue.enqueue(message("after"));
        let item = queue.next_message(&CancellationToken::new()).await.unwrap();
        assert_eq!(content(item), "after");
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let queue = Arc::new(MessageQueue::new());
        let token = CancellationToken::new();
        let consumer = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.next_message(&token).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(matches!(consumer.await.unwrap(), Err(ChatError::Cancelled)));

        // Nothing was lost and the next consumer call still works
        queue.enqueue(message("kept"));
        let item = queue.next_message(&CancellationToken::new()).await.unwrap();
        assert_eq!(content(item), "kept");
    }

    #[tokio::test]
    async fn test_concurrent_producers_deliver_everything_once() {
        let queue = Arc::new(MessageQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        queue.enqueue(message(&format!("{}-{}", p, i)));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let token = CancellationToken::new();
        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.push(content(queue.next_message(&token).await.unwrap()));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        // Per-producer order is preserved and nothing is duplicated
        for p in 0..4 {
            let prefix = format!("{}-", p);
            let ours: Vec<usize> = seen
                .iter()
                .filter_map(|s| s.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(ours, (0..50).collect::<Vec<_>>());
        }
        assert_eq!(seen.len(), 200);
    }
}
