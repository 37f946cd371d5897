//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The event bus owns the broker session of a service: exchange and queue topology, the
// consumption loops, publishing, and the acknowledgement policy.
//
// | Component        | Description                                                        |
// |------------------|--------------------------------------------------------------------|
// | EventBus         | Topology, consume loops, publish, close                            |
// | MessageHandler   | Per-message handler a consume loop hands decoded events to         |
// | ConsumerHandle   | Observes a running consume loop                                    |
// | EntityLocks      | Keyed mutex serializing handlers of the same entity (see `locks`)  |
//
// Acknowledgement policy of a consume loop:
//
// | Outcome                                   | Action                |
// |-------------------------------------------|-----------------------|
// | handler Ok (applied, skipped, soft fail)  | ack                   |
// | Connection / Persistence error            | nack, requeue         |
// | any other DispatchError, handler panic    | ack, logged           |
// | body is not a valid envelope              | ack, dropped (poison) |
//--------------------------------------------------------------------------------------------------

pub mod event_bus;
pub mod locks;

pub use event_bus::EventBus;
pub use locks::{EntityGuard, EntityLocks, lock_key};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::domain::models::{DecodedEvent, DispatchError, DispatchResult};
use crate::domain::ports::ExchangeKind;

/// Default exchange every service publishes to and binds on
pub const DEFAULT_EXCHANGE: &str = "mu.events";

/// Handles the decoded messages of a consume loop
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message.
    ///
    /// # Arguments
    /// * `routing_key` - Key the message was published with
    /// * `event` - Decoded envelope
    ///
    /// # Errors
    /// A `DispatchError`; `should_requeue` decides between ack and nack
    async fn handle(
        &self,
        routing_key: &str,
        event: DecodedEvent,
    ) -> Result<DispatchResult, DispatchError>;
}

/// Settings of an event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusOptions {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub durable: bool,
    /// Unacknowledged deliveries per consumer, also the number of handlers
    /// allowed to run at once
    pub prefetch: u16,
}

impl Default for EventBusOptions {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_owned(),
            exchange_kind: ExchangeKind::Topic,
            durable: true,
            prefetch: 1,
        }
    }
}

impl EventBusOptions {
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

/// Per-publish settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Message id; a random UUID when absent
    pub message_id: Option<String>,
}

/// Observes a consume loop started by [`EventBus::consume`]
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    queue: String,
    consumer_tag: String,
    active: Arc<AtomicBool>,
}

impl ConsumerHandle {
    fn new(queue: &str, consumer_tag: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// False once the loop stopped, either on close or on connection loss
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}
