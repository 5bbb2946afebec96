//! In-memory storage queues for testing and single-process scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::client::{QueueClient, QueueMessage};
use crate::envelope::Envelope;
use crate::error::{BusError, Result};

struct StoredMessage {
    id: String,
    pop_receipt: Option<String>,
    content: String,
    dequeue_count: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct MemoryQueue {
    metadata: BTreeMap<String, String>,
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<String, MemoryQueue>,
    failing_adds: BTreeMap<String, usize>,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> Result<&mut MemoryQueue> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BusError::NotFound(format!("queue {}", name)))
    }
}

/// Storage-queue service emulated in memory.
///
/// Emulates visibility timeouts (on tokio's clock, so paused-time tests
/// work), dequeue counters, pop receipts and queue metadata.
/// Clones share the same queues.
///
/// ## Example
///
/// ```ignore
/// let client = InMemoryQueueClient::new();
/// let transport = StorageQueueTransport::new(client.clone(), registry, options);
/// // ...
/// assert_eq!(client.envelopes("orders-poison").len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryQueueClient {
    state: Arc<Mutex<State>>,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.state.lock().queues.keys().cloned().collect()
    }

    /// Number of messages in a queue, visible or not.
    pub fn len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Number of messages that can be retrieved right now.
    pub fn visible_len(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.state.lock().queues.get(queue).map_or(0, |q| {
            q.messages.iter().filter(|m| m.visible_at <= now).count()
        })
    }

    /// Raw bodies in a queue, in insertion order.
    pub fn contents(&self, queue: &str) -> Vec<String> {
        self.state.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.messages.iter().map(|m| m.content.clone()).collect()
        })
    }

    /// Bodies of a queue parsed as envelopes; unparseable bodies are skipped.
    pub fn envelopes(&self, queue: &str) -> Vec<Envelope> {
        self.contents(queue)
            .iter()
            .filter_map(|content| Envelope::from_wire(content).ok())
            .collect()
    }

    /// Dequeue count of each message in a queue.
    pub fn dequeue_counts(&self, queue: &str) -> Vec<u32> {
        self.state.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.messages.iter().map(|m| m.dequeue_count).collect()
        })
    }

    /// Make the next `times` adds to `queue` fail with an infrastructure error.
    pub fn fail_next_adds(&self, queue: &str, times: usize) {
        self.state.lock().failing_adds.insert(queue.to_string(), times);
    }

    /// Delete a queue and its messages.
    pub fn delete_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.remove(queue).is_some()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn create_if_not_exists(&self, queue: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.queues.contains_key(queue) {
            return Ok(false);
        }
        state.queues.insert(queue.to_string(), MemoryQueue::default());
        Ok(true)
    }

    async fn exists(&self, queue: &str) -> Result<bool> {
        Ok(self.state.lock().queues.contains_key(queue))
    }

    async fn fetch_metadata(&self, queue: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.state.lock().queue_mut(queue)?.metadata.clone())
    }

    async fn set_metadata(&self, queue: &str, metadata: BTreeMap<String, String>) -> Result<()> {
        self.state.lock().queue_mut(queue)?.metadata = metadata;
        Ok(())
    }

    async fn add_message(&self, queue: &str, content: String) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.failing_adds.get_mut(queue) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Infrastructure(format!("add to {} failed", queue)));
            }
        }
        state.queue_mut(queue)?.messages.push(StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            pop_receipt: None,
            content,
            dequeue_count: 0,
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn get_message(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let Some(message) = state
            .queue_mut(queue)?
            .messages
            .iter_mut()
            .find(|m| m.visible_at <= now)
        else {
            return Ok(None);
        };

        let pop_receipt = uuid::Uuid::new_v4().to_string();
        message.dequeue_count += 1;
        message.visible_at = now + visibility_timeout;
        message.pop_receipt = Some(pop_receipt.clone());

        Ok(Some(QueueMessage {
            id: message.id.clone(),
            pop_receipt,
            content: message.content.clone(),
            dequeue_count: message.dequeue_count,
        }))
    }

    async fn delete_message(&self, queue: &str, id: &str, pop_receipt: &str) -> Result<()> {
        let mut state = self.state.lock();
        let messages = &mut state.queue_mut(queue)?.messages;
        let position = messages
            .iter()
            .position(|m| m.id == id && m.pop_receipt.as_deref() == Some(pop_receipt))
            .ok_or_else(|| BusError::LeaseLost(format!("message {} in {}", id, queue)))?;
        messages.remove(position);
        Ok(())
    }

    async fn update_visibility(
        &self,
        queue: &str,
        id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<String> {
        let mut state = self.state.lock();
        let message = state
            .queue_mut(queue)?
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.pop_receipt.as_deref() == Some(pop_receipt))
            .ok_or_else(|| BusError::LeaseLost(format!("message {} in {}", id, queue)))?;

        let new_receipt = uuid::Uuid::new_v4().to_string();
        message.pop_receipt = Some(new_receipt.clone());
        message.visible_at = Instant::now() + visibility_timeout;
        Ok(new_receipt)
    }
}
