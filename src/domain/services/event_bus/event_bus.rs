//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                         | Key Methods           |
// |-----------------|-----------------------------------------------------|-----------------------|
// | EventBus        | Broker session of one service                       | connect, consume,     |
// |                 |                                                     | publish, close        |
// | LoopContext     | State shared by a consume loop and its handlers     |                       |
//--------------------------------------------------------------------------------------------------

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::select;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::locks::{EntityLocks, lock_key};
use super::{ConsumerHandle, EventBusOptions, MessageHandler, PublishOptions};
use crate::domain::models::{
    AckDecision, DecodedEvent, DispatchError, EventContext, MessageEnvelope, RoutingKey,
};
use crate::domain::ports::{BrokerTransport, Delivery, ExchangeKind, OutboundMessage};
use crate::domain::services::metrics::ConsumerMetrics;

struct RunningConsumer {
    handle: ConsumerHandle,
    task: JoinHandle<()>,
}

/// Broker session of a service.
///
/// One transport (one connection, one channel) per process. Topology calls
/// are idempotent and cached, so re-running subscription set-up against a
/// live bus does not hit the broker again.
pub struct EventBus {
    transport: Arc<dyn BrokerTransport>,
    options: EventBusOptions,
    metrics: Arc<ConsumerMetrics>,
    declared_exchanges: Mutex<HashSet<String>>,
    declared_queues: Mutex<HashSet<String>>,
    bindings: Mutex<HashSet<(String, String)>>,
    consumers: Mutex<Vec<RunningConsumer>>,
    shutdown: Mutex<CancellationToken>,
    locks: EntityLocks,
}

impl EventBus {
    /// Creates a bus over a transport; nothing is opened until `connect`
    ///
    /// # Arguments
    /// * `transport` - Broker transport
    /// * `options` - Exchange, durability and prefetch
    /// * `metrics` - Process-scoped counters
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        options: EventBusOptions,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            transport,
            options,
            metrics,
            declared_exchanges: Mutex::new(HashSet::new()),
            declared_queues: Mutex::new(HashSet::new()),
            bindings: Mutex::new(HashSet::new()),
            consumers: Mutex::new(Vec::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            locks: EntityLocks::new(),
        }
    }

    pub fn options(&self) -> &EventBusOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Opens the connection and channel, declares the configured exchange
    /// and applies the prefetch window. A no-op when already connected.
    ///
    /// # Errors
    /// `DispatchError::Connection` when the broker is unreachable; callers
    /// may retry with backoff
    pub async fn connect(&self) -> Result<(), DispatchError> {
        let already_connected = self.transport.is_connected().await;
        self.transport.connect().await?;

        if !already_connected {
            // a fresh channel knows nothing of earlier declarations
            self.declared_exchanges.lock().clear();
            self.declared_queues.lock().clear();
            self.bindings.lock().clear();
            self.transport.set_prefetch(self.options.prefetch).await?;
            info!(
                exchange = %self.options.exchange,
                prefetch = self.options.prefetch,
                "Connected to broker"
            );
        }

        self.declare_exchange(&self.options.exchange, self.options.exchange_kind, self.options.durable)
            .await
    }

    /// Declares an exchange once per connection
    ///
    /// # Errors
    /// `DispatchError::Connection` when the broker refuses the declaration
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), DispatchError> {
        if self.declared_exchanges.lock().contains(name) {
            return Ok(());
        }

        self.transport.assert_exchange(name, kind, durable).await?;
        self.declared_exchanges.lock().insert(name.to_owned());
        debug!(exchange = name, ?kind, durable, "Exchange declared");
        Ok(())
    }

    /// Declares `queue` and binds it to every key on the configured exchange.
    ///
    /// # Arguments
    /// * `queue` - Queue name
    /// * `routing_keys` - Keys or wildcard patterns to bind
    ///
    /// # Returns
    /// Number of bindings created by this call; pairs bound before are skipped
    ///
    /// # Errors
    /// `DispatchError::Connection` when a declaration or binding fails
    pub async fn assert_and_bind_queue(
        &self,
        queue: &str,
        routing_keys: &[RoutingKey],
    ) -> Result<usize, DispatchError> {
        if routing_keys.is_empty() {
            warn!(queue, "No routing keys to bind, skipping queue");
            return Ok(0);
        }

        self.declare_exchange(&self.options.exchange, self.options.exchange_kind, self.options.durable)
            .await?;

        if !self.declared_queues.lock().contains(queue) {
            self.transport.assert_queue(queue, self.options.durable).await?;
            self.declared_queues.lock().insert(queue.to_owned());
        }

        let mut created = 0;
        for key in routing_keys {
            let pair = (queue.to_owned(), key.as_str().to_owned());
            if self.bindings.lock().contains(&pair) {
                continue;
            }

            self.transport
                .bind_queue(queue, &self.options.exchange, key.as_str())
                .await?;
            self.bindings.lock().insert(pair);
            created += 1;
        }

        info!(
            queue,
            exchange = %self.options.exchange,
            keys = routing_keys.len(),
            created,
            "Queue bound"
        );
        Ok(created)
    }

    /// Starts a consume loop on `queue`.
    ///
    /// Up to `prefetch` handlers run at once. Handlers of events that share
    /// an entity key are serialized across every loop of the bus, so
    /// per-event queues of one entity never overlap either. The loop stops
    /// on `close` or when the
    /// delivery stream ends (connection loss); it is not restarted
    /// automatically.
    ///
    /// # Errors
    /// `DispatchError::Connection` when the consumer cannot be started
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle, DispatchError> {
        let consumer = self.transport.consume(queue).await?;
        let handle = ConsumerHandle::new(queue, &consumer.consumer_tag);
        let shutdown = self.shutdown.lock().clone();

        let context = Arc::new(LoopContext {
            queue: queue.to_owned(),
            transport: Arc::clone(&self.transport),
            handler,
            metrics: Arc::clone(&self.metrics),
            locks: self.locks.clone(),
        });

        let task = tokio::spawn(run_consumer(
            context,
            consumer.deliveries,
            handle.clone(),
            shutdown,
            self.options.prefetch,
        ));

        info!(queue, consumer_tag = %consumer.consumer_tag, "Consumer started");
        {
            let mut consumers = self.consumers.lock();
            // loops ended by a connection loss are done; forget them
            consumers.retain(|running| !running.task.is_finished());
            consumers.push(RunningConsumer {
                handle: handle.clone(),
                task,
            });
        }
        Ok(handle)
    }

    /// Handles of every consume loop started on this bus
    pub fn consumers(&self) -> Vec<ConsumerHandle> {
        self.consumers
            .lock()
            .iter()
            .map(|consumer| consumer.handle.clone())
            .collect()
    }

    /// Wraps `payload` in an envelope and publishes it on the configured
    /// exchange. Fire-and-forget beyond what the transport itself confirms.
    ///
    /// # Arguments
    /// * `routing_key` - Concrete key; wildcard patterns are refused
    /// * `payload` - Entity payload, JSON-encoded into the envelope `data`
    /// * `context` - Request context travelling with the event
    /// * `options` - Message id override
    ///
    /// # Errors
    /// `Validation` for a pattern key or an unencodable payload,
    /// `Connection` when the transport refuses the message
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        routing_key: &RoutingKey,
        payload: &T,
        context: EventContext,
        options: PublishOptions,
    ) -> Result<(), DispatchError> {
        if routing_key.is_pattern() {
            return Err(DispatchError::Validation(format!(
                "cannot publish to pattern {}",
                routing_key
            )));
        }

        let request_id = context.request_id.clone();
        let body = MessageEnvelope::wrap(payload, context)
            .and_then(|envelope| envelope.to_bytes())
            .map_err(|err| DispatchError::Validation(format!("unencodable payload: {}", err)))?;

        let message = OutboundMessage {
            routing_key: routing_key.as_str().to_owned(),
            body,
            request_id,
            message_id: Some(
                options
                    .message_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
        };

        self.transport.publish(&self.options.exchange, message).await?;
        self.metrics.record_published();
        debug!(routing_key = %routing_key, exchange = %self.options.exchange, "Event published");
        Ok(())
    }

    /// Stops every consume loop, waits for in-flight handlers, then closes
    /// the channel and the connection. Safe to call when never connected.
    ///
    /// # Errors
    /// `DispatchError::Connection` when the transport fails to close
    pub async fn close(&self) -> Result<(), DispatchError> {
        let shutdown = std::mem::replace(&mut *self.shutdown.lock(), CancellationToken::new());
        shutdown.cancel();

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            if consumer.handle.is_active() {
                if let Err(err) = self.transport.cancel(consumer.handle.consumer_tag()).await {
                    warn!(queue = consumer.handle.queue(), error = %err, "Failed to cancel consumer");
                }
            }
            if let Err(err) = consumer.task.await {
                error!(queue = consumer.handle.queue(), error = %err, "Consumer task failed");
            }
        }

        self.transport.close().await?;
        self.declared_exchanges.lock().clear();
        self.declared_queues.lock().clear();
        self.bindings.lock().clear();
        info!("Event bus closed");
        Ok(())
    }
}

/// State shared by a consume loop and the handlers it spawns
struct LoopContext {
    queue: String,
    transport: Arc<dyn BrokerTransport>,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<ConsumerMetrics>,
    /// Shared by every loop of the bus
    locks: EntityLocks,
}

async fn run_consumer(
    context: Arc<LoopContext>,
    mut deliveries: tokio::sync::mpsc::UnboundedReceiver<Delivery>,
    handle: ConsumerHandle,
    shutdown: CancellationToken,
    prefetch: u16,
) {
    let semaphore = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
    let mut in_flight = JoinSet::new();

    loop {
        let next = select! {
            _ = shutdown.cancelled() => {
                info!(queue = %context.queue, "Consumer stopping");
                break;
            }
            next = deliveries.recv() => next,
        };

        let Some(delivery) = next else {
            error!(
                queue = %context.queue,
                "Delivery stream ended, connection lost; consumer is inactive until reconnected"
            );
            break;
        };

        context.metrics.record_received();
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        // reap finished handlers so the set does not grow unbounded
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(process_delivery(Arc::clone(&context), delivery, permit));
    }

    handle.deactivate();
    while in_flight.join_next().await.is_some() {}
    debug!(queue = %context.queue, "Consumer drained");
}

async fn process_delivery(context: Arc<LoopContext>, delivery: Delivery, _permit: OwnedSemaphorePermit) {
    let decision = match DecodedEvent::decode(&delivery.body) {
        Ok(event) => dispatch(&context, &delivery, event).await,
        Err(err) => {
            warn!(
                queue = %context.queue,
                routing_key = %delivery.routing_key,
                error = %err,
                "Dropping undecodable message"
            );
            context.metrics.record_decode_failure();
            AckDecision::Ack
        }
    };

    let settled = match decision {
        AckDecision::Ack => context.transport.ack(delivery.delivery_tag).await.map(|_| {
            context.metrics.record_acked();
        }),
        AckDecision::Requeue => context
            .transport
            .nack(delivery.delivery_tag, true)
            .await
            .map(|_| {
                context.metrics.record_requeued();
            }),
    };

    if let Err(err) = settled {
        error!(
            queue = %context.queue,
            delivery_tag = delivery.delivery_tag,
            error = %err,
            "Failed to settle delivery"
        );
    }
}

async fn dispatch(context: &LoopContext, delivery: &Delivery, event: DecodedEvent) -> AckDecision {
    let _guard = match lock_key(&delivery.routing_key, &event.data) {
        Some(key) => Some(context.locks.lock(key).await),
        None => None,
    };

    let outcome = AssertUnwindSafe(context.handler.handle(&delivery.routing_key, event))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(DispatchError::CallbackPanicked {
                callback: "message handler".to_owned(),
                message: "handler panicked".to_owned(),
            })
        });

    match outcome {
        Ok(result) => {
            if !result.success {
                context.metrics.record_dropped();
            }
            debug!(
                routing_key = %delivery.routing_key,
                success = result.success,
                message = %result.message,
                "Message handled"
            );
            AckDecision::Ack
        }
        Err(err) => {
            let decision = err.ack_decision();
            match decision {
                AckDecision::Requeue => warn!(
                    routing_key = %delivery.routing_key,
                    redelivered = delivery.redelivered,
                    error = %err,
                    "Transient failure, requeueing message"
                ),
                AckDecision::Ack => {
                    context.metrics.record_dropped();
                    error!(
                        routing_key = %delivery.routing_key,
                        error = %err,
                        "Message rejected, acknowledging without applying"
                    );
                }
            }
            decision
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_broker::InMemoryBroker;
    use crate::domain::models::DispatchResult;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_with: Option<DispatchError>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(
            &self,
            routing_key: &str,
            _event: DecodedEvent,
        ) -> Result<DispatchResult, DispatchError> {
            self.seen.lock().push(routing_key.to_owned());
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(DispatchResult::skipped("recorded")),
            }
        }
    }

    fn recorder(fail_with: Option<DispatchError>) -> Arc<Recorder> {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_with,
        })
    }

    fn bus(broker: &Arc<InMemoryBroker>) -> EventBus {
        EventBus::new(
            broker.clone(),
            EventBusOptions::default(),
            Arc::new(ConsumerMetrics::new()),
        )
    }

    fn key(raw: &str) -> RoutingKey {
        RoutingKey::parse(raw).unwrap()
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_binding_twice_is_a_noop() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus(&broker);
        bus.connect().await.unwrap();

        let keys = [key("service.created"), key("service.*")];
        assert_eq!(bus.assert_and_bind_queue("svc-queue", &keys).await.unwrap(), 2);
        assert_eq!(bus.assert_and_bind_queue("svc-queue", &keys).await.unwrap(), 0);
        assert_eq!(bus.assert_and_bind_queue("svc-queue", &[]).await.unwrap(), 0);
        assert_eq!(broker.bindings_for("svc-queue").len(), 2);
    }

    #[tokio::test]
    async fn test_connect_fails_when_broker_unreachable() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_reachable(false);

        let err = bus(&broker).connect().await.unwrap_err();
        assert!(matches!(err, DispatchError::Connection(_)));
    }

    #[tokio::test]
    async fn test_close_without_connect_is_safe() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus(&broker);
        bus.close().await.unwrap();
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_refuses_patterns() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus(&broker);
        bus.connect().await.unwrap();

        let err = bus
            .publish(&key("service.*"), &serde_json::json!({}), EventContext::default(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn test_poison_message_is_acked_and_loop_continues() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus(&broker);
        bus.connect().await.unwrap();
        bus.assert_and_bind_queue("svc-queue", &[key("service.*")]).await.unwrap();

        let handler = recorder(None);
        bus.consume("svc-queue", handler.clone()).await.unwrap();

        broker.publish_raw("mu.events", "service.created", b"not json".to_vec());
        bus.publish(
            &key("service.updated"),
            &serde_json::json!({"serviceID": "abc"}),
            EventContext::default(),
            PublishOptions::default(),
        )
        .await
        .unwrap();

        settle(|| broker.ack_count() == 2).await;
        assert_eq!(*handler.seen.lock(), vec!["service.updated".to_owned()]);
        assert_eq!(bus.metrics().snapshot().decode_failures, 1);
        assert_eq!(broker.queue_depth("svc-queue"), 0);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_requeue_class_errors_are_nacked() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus(&broker);
        bus.connect().await.unwrap();
        bus.assert_and_bind_queue("svc-queue", &[key("service.created")]).await.unwrap();

        let handler = recorder(Some(DispatchError::Persistence {
            attempts: 3,
            message: "down".into(),
        }));
        bus.consume("svc-queue", handler.clone()).await.unwrap();
        bus.publish(
            &key("service.created"),
            &serde_json::json!({"uniqRef": "r1"}),
            EventContext::default(),
            PublishOptions::default(),
        )
        .await
        .unwrap();

        settle(|| broker.nack_count() >= 2).await;
        assert_eq!(broker.ack_count(), 0);
        bus.close().await.unwrap();
        assert!(broker.queue_depth("svc-queue") >= 1);
    }

    #[tokio::test]
    async fn test_connection_loss_deactivates_consumer() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus(&broker);
        bus.connect().await.unwrap();
        bus.assert_and_bind_queue("svc-queue", &[key("service.created")]).await.unwrap();

        let handle = bus.consume("svc-queue", recorder(None)).await.unwrap();
        assert!(handle.is_active());

        broker.disconnect();
        settle(|| !handle.is_active()).await;
        assert!(!bus.is_connected().await);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_forgets_finished_loops() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = bus(&broker);

        for _ in 0..3 {
            bus.connect().await.unwrap();
            bus.assert_and_bind_queue("svc-queue", &[key("service.created")]).await.unwrap();
            let handle = bus.consume("svc-queue", recorder(None)).await.unwrap();

            broker.disconnect();
            settle(|| !handle.is_active()).await;
            // the loop deactivates its handle just before it returns
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        bus.connect().await.unwrap();
        bus.assert_and_bind_queue("svc-queue", &[key("service.created")]).await.unwrap();
        bus.consume("svc-queue", recorder(None)).await.unwrap();

        let consumers = bus.consumers();
        assert_eq!(consumers.len(), 1);
        assert!(consumers[0].is_active());
        bus.close().await.unwrap();
    }
}
