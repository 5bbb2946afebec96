//! The polling receive loop shared by all transports.
//!
//! A transport exposes its receiving queue through [`ReceivingQueue`]; the
//! [`ReceiveLoop`] owns the `Stopped -> Running -> Stopped` state machine and
//! applies the delivery policy:
//!
//! - handled: complete (acknowledge) the message,
//! - handler failed, or the acknowledgement failed: release it for immediate
//!   redelivery while its delivery count is below the limit, quarantine it
//!   once the count reaches the limit,
//! - configuration error (unknown type, no handler, undecodable body):
//!   quarantine at once,
//! - cancelled by `stop`: release it.
//!
//! Each tick retrieves at most one message and awaits its handling before
//! the next tick, so an endpoint has at most one handling in flight. Ticks
//! that fall due while a message is being handled are skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ReceiveOptions;
use crate::envelope::Envelope;
use crate::error::{BusError, Result};
use crate::executor::{HandlingOutcome, MessageHandlerExecutor};
use crate::registry::MessageTypeRegistry;

/// One received message, leased to this endpoint.
#[derive(Debug)]
pub struct Delivery<R> {
    /// Transport handle used to settle the message.
    pub receipt: R,
    /// How many times the message has been delivered, this delivery included.
    pub delivery_count: u32,
    /// The decoded envelope, or why the body could not be decoded.
    pub envelope: Result<Envelope>,
}

/// A receiving queue as seen by the receive loop.
#[async_trait]
pub trait ReceivingQueue: Send + Sync + 'static {
    type Receipt: Send + Sync + 'static;

    /// Queue identity, for logging.
    fn name(&self) -> &str;

    /// Lease at most one message for `lease`.
    async fn receive(&self, lease: Duration) -> Result<Option<Delivery<Self::Receipt>>>;

    /// Remove a handled message.
    async fn complete(&self, receipt: &Self::Receipt) -> Result<()>;

    /// Make the message visible again with zero delay.
    async fn release(&self, receipt: &Self::Receipt) -> Result<()>;

    /// Move the message to the poison destination.
    async fn quarantine(&self, receipt: &Self::Receipt, reason: &str) -> Result<()>;
}

/// What one receive tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Nothing to receive (or retrieval failed).
    Idle,
    /// Handled and removed.
    Completed,
    /// Handling failed; the message is visible again.
    Released { delivery_count: u32 },
    /// Moved to the poison destination.
    Quarantined,
    /// Stop fired during handling; the message was released.
    Cancelled,
    /// Settling the message failed; it reappears when its lease expires.
    Abandoned,
}

/// Counters for a receive loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveStats {
    pub polls: usize,
    pub received: usize,
    pub completed: usize,
    pub released: usize,
    pub quarantined: usize,
    pub cancelled: usize,
    pub abandoned: usize,
}

struct Worker<Q> {
    queue: Arc<Q>,
    registry: Arc<MessageTypeRegistry>,
    options: ReceiveOptions,
    stats: Mutex<ReceiveStats>,
}

impl<Q: ReceivingQueue> Worker<Q> {
    async fn run(self: Arc<Self>, executor: MessageHandlerExecutor, cancel: CancellationToken) {
        let period = self.options.poll_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.process_next(&executor, &cancel).await;
        }
        debug!(queue = self.queue.name(), "receive loop exited");
    }

    async fn process_next(
        &self,
        executor: &MessageHandlerExecutor,
        cancel: &CancellationToken,
    ) -> ReceiveOutcome {
        self.stats.lock().polls += 1;
        let queue = self.queue.name();

        let delivery = match self.queue.receive(self.options.lease_duration).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return ReceiveOutcome::Idle,
            Err(err) => {
                warn!(queue, error = %err, "failed to receive message");
                return ReceiveOutcome::Idle;
            }
        };
        self.stats.lock().received += 1;

        let Delivery {
            receipt,
            delivery_count,
            envelope,
        } = delivery;

        let message = match envelope.and_then(|envelope| self.registry.unwrap(&envelope)) {
            Ok(message) => message,
            Err(err) => return self.quarantine(&receipt, &err.to_string()).await,
        };
        let message_type = message.type_name();

        let failure = match message.dispatch(executor.clone(), cancel.child_token()).await {
            Ok(HandlingOutcome::Handled) => match self.queue.complete(&receipt).await {
                Ok(()) => {
                    debug!(queue, message_type, delivery_count, "message completed");
                    self.stats.lock().completed += 1;
                    return ReceiveOutcome::Completed;
                }
                Err(err) => {
                    warn!(queue, message_type, error = %err, "failed to complete handled message");
                    err.to_string()
                }
            },
            Ok(HandlingOutcome::HandlerFailed(err)) => err.to_string(),
            Ok(HandlingOutcome::Cancelled) => {
                if let Err(err) = self.queue.release(&receipt).await {
                    warn!(queue, message_type, error = %err, "failed to release cancelled message");
                }
                self.stats.lock().cancelled += 1;
                return ReceiveOutcome::Cancelled;
            }
            Err(err) if err.is_configuration() => {
                return self.quarantine(&receipt, &err.to_string()).await
            }
            Err(err) => err.to_string(),
        };

        if delivery_count < self.options.max_dequeue_count {
            self.release(&receipt, message_type, delivery_count).await
        } else {
            error!(
                queue,
                message_type,
                delivery_count,
                max_dequeue_count = self.options.max_dequeue_count,
                "delivery attempts exhausted"
            );
            self.quarantine(&receipt, &format!("delivery attempts exhausted: {}", failure))
                .await
        }
    }

    async fn release(
        &self,
        receipt: &Q::Receipt,
        message_type: &str,
        delivery_count: u32,
    ) -> ReceiveOutcome {
        match self.queue.release(receipt).await {
            Ok(()) => {
                debug!(
                    queue = self.queue.name(),
                    message_type, delivery_count, "message released for redelivery"
                );
                self.stats.lock().released += 1;
                ReceiveOutcome::Released { delivery_count }
            }
            Err(err) => {
                warn!(queue = self.queue.name(), message_type, error = %err, "failed to release message");
                self.stats.lock().abandoned += 1;
                ReceiveOutcome::Abandoned
            }
        }
    }

    async fn quarantine(&self, receipt: &Q::Receipt, reason: &str) -> ReceiveOutcome {
        match self.queue.quarantine(receipt, reason).await {
            Ok(()) => {
                error!(queue = self.queue.name(), reason, "message quarantined");
                self.stats.lock().quarantined += 1;
                ReceiveOutcome::Quarantined
            }
            Err(err) => {
                error!(queue = self.queue.name(), reason, error = %err, "failed to quarantine message");
                self.stats.lock().abandoned += 1;
                ReceiveOutcome::Abandoned
            }
        }
    }
}

enum LoopState {
    Stopped,
    Running {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
}

/// Receive loop for one endpoint.
///
/// `start` spawns the polling task; `stop` cancels it and every in-flight
/// handling without waiting. Stopping twice is a no-op and a stopped loop can
/// be started again.
///
/// ## Example
///
/// ```ignore
/// let receiver = ReceiveLoop::new(queue, registry, ReceiveOptions::default());
/// receiver.start(executor)?;
/// // ...
/// receiver.stop();
/// println!("completed {}", receiver.stats().completed);
/// ```
pub struct ReceiveLoop<Q: ReceivingQueue> {
    worker: Arc<Worker<Q>>,
    state: Mutex<LoopState>,
}

impl<Q: ReceivingQueue> ReceiveLoop<Q> {
    pub fn new(queue: Arc<Q>, registry: Arc<MessageTypeRegistry>, options: ReceiveOptions) -> Self {
        Self {
            worker: Arc::new(Worker {
                queue,
                registry,
                options,
                stats: Mutex::new(ReceiveStats::default()),
            }),
            state: Mutex::new(LoopState::Stopped),
        }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.worker.queue
    }

    pub fn stats(&self) -> ReceiveStats {
        self.worker.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), LoopState::Running { task, .. } if !task.is_finished())
    }

    /// Spawn the polling task. Must be called within a tokio runtime.
    pub fn start(&self, executor: MessageHandlerExecutor) -> Result<()> {
        let mut state = self.state.lock();
        if let LoopState::Running { task, .. } = &*state {
            if !task.is_finished() {
                return Err(BusError::AlreadyReceiving);
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.worker).run(executor, cancel.clone()));
        *state = LoopState::Running { cancel, task };

        info!(
            queue = self.worker.queue.name(),
            poll_interval = ?self.worker.options.poll_interval,
            max_dequeue_count = self.worker.options.max_dequeue_count,
            "receive loop started"
        );
        Ok(())
    }

    /// Cancel the polling task and any in-flight handling.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), LoopState::Stopped);
        if let LoopState::Running { cancel, .. } = previous {
            cancel.cancel();
            info!(queue = self.worker.queue.name(), "receive loop stopped");
        }
    }

    /// Run a single receive tick outside the polling task.
    pub async fn process_next(
        &self,
        executor: &MessageHandlerExecutor,
        cancel: &CancellationToken,
    ) -> ReceiveOutcome {
        self.worker.process_next(executor, cancel).await
    }
}

impl<Q: ReceivingQueue> Drop for ReceiveLoop<Q> {
    fn drop(&mut self) {
        self.stop();
    }
}
