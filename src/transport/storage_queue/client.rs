use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A message as returned by [`QueueClient::get_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    /// Proof of the current lease; required to delete or update.
    pub pop_receipt: String,
    /// Raw body, an envelope in wire form.
    pub content: String,
    /// Number of times the message has been retrieved, this time included.
    pub dequeue_count: u32,
}

/// Storage-queue data plane and the small part of the management plane the
/// transport needs.
///
/// Missing queues are reported as `BusError::NotFound`; stale pop receipts as
/// `BusError::LeaseLost`.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    /// Create the queue; `true` when it did not exist before.
    async fn create_if_not_exists(&self, queue: &str) -> Result<bool>;

    async fn exists(&self, queue: &str) -> Result<bool>;

    /// Read the queue's metadata, always fresh from the service.
    async fn fetch_metadata(&self, queue: &str) -> Result<BTreeMap<String, String>>;

    /// Replace the queue's metadata.
    async fn set_metadata(&self, queue: &str, metadata: BTreeMap<String, String>) -> Result<()>;

    async fn add_message(&self, queue: &str, content: String) -> Result<()>;

    /// Retrieve one visible message and hide it for `visibility_timeout`.
    async fn get_message(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>>;

    async fn delete_message(&self, queue: &str, id: &str, pop_receipt: &str) -> Result<()>;

    /// Change a leased message's visibility; returns the new pop receipt.
    async fn update_visibility(
        &self,
        queue: &str,
        id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<String>;
}
