//! Result delivery
//!
//! Battle results go back to the chat thread that started the battle. The
//! chat layer itself lives outside this crate behind [`Notifier`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// The chat message a reply answers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    /// Thread (conversation) id
    pub thread_id: String,
    /// The specific message being answered, if any
    pub message_id: Option<String>,
}

impl MessageRef {
    /// Reference a specific message in a thread
    pub fn new(thread_id: &str, message_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            message_id: Some(message_id.to_string()),
        }
    }

    /// Reference a thread without a triggering message (timer results)
    pub fn thread(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            message_id: None,
        }
    }
}

/// Delivers composed messages
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Reply to a message
    async fn reply(&self, original: &MessageRef, text: &str);

    /// Reply to a message, tagging the given participants
    async fn reply_with_mentions(&self, original: &MessageRef, text: &str, participants: &[String]);
}

/// A delivered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub original: MessageRef,
    pub text: String,
    pub mentions: Vec<String>,
}

/// Notifier that queues deliveries for later draining
#[derive(Debug, Default)]
pub struct OutboxNotifier {
    deliveries: RwLock<Vec<Delivery>>,
}

impl OutboxNotifier {
    /// Create an empty outbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in Arc for sharing
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drain all deliveries from the outbox
    pub async fn drain(&self) -> Vec<Delivery> {
        let mut deliveries = self.deliveries.write().await;
        std::mem::take(&mut *deliveries)
    }

    /// Get count of pending deliveries
    pub async fn len(&self) -> usize {
        self.deliveries.read().await.len()
    }

    /// Check whether the outbox is empty
    pub async fn is_empty(&self) -> bool {
        self.deliveries.read().await.is_empty()
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn reply(&self, original: &MessageRef, text: &str) {
        self.deliveries.write().await.push(Delivery {
            original: original.clone(),
            text: text.to_string(),
            mentions: Vec::new(),
        });
    }

    async fn reply_with_mentions(&self, original: &MessageRef, text: &str, participants: &[String]) {
        self.deliveries.write().await.push(Delivery {
            original: original.clone(),
            text: text.to_string(),
            mentions: participants.to_vec(),
        });
    }
}

/// Notifier that writes every delivery to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn reply(&self, original: &MessageRef, text: &str) {
        info!(thread = %original.thread_id, "{}", text);
    }

    async fn reply_with_mentions(&self, original: &MessageRef, text: &str, participants: &[String]) {
        let mentions: Vec<String> = participants.iter().map(|p| format!("@{}", p)).collect();
        info!(thread = %original.thread_id, mentions = %mentions.join(" "), "{}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbox_drain() {
        let outbox = OutboxNotifier::new();
        let msg = MessageRef::new("t1", "m1");

        outbox.reply(&msg, "hello").await;
        outbox
            .reply_with_mentions(&msg, "fight!", &["a".to_string(), "b".to_string()])
            .await;
        assert_eq!(outbox.len().await, 2);

        let drained = outbox.drain().await;
        assert_eq!(drained[0].text, "hello");
        assert!(drained[0].mentions.is_empty());
        assert_eq!(drained[1].mentions, vec!["a", "b"]);
        assert!(outbox.is_empty().await);
    }

    #[test]
    fn test_thread_ref() {
        let r = MessageRef::thread("t9");
        assert_eq!(r.thread_id, "t9");
        assert!(r.message_id.is_none());
    }
}
