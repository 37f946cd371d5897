//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name             | Description                                            | Key Methods        |
// |------------------|--------------------------------------------------------|--------------------|
// | InMemoryBroker   | In-process topic broker with AMQP-like semantics       | publish, ack, nack |
// |                  |                                                        | disconnect         |
//--------------------------------------------------------------------------------------------------
// Exchanges route with topic matching (`*` one word, `#` zero or more), direct (exact key) or
// fanout. Deliveries are manual-ack, bounded per consumer by the prefetch window, and nacked or
// orphaned messages go back to the head of their queue flagged `redelivered`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use crate::domain::models::topic_matches;
use crate::domain::ports::{
    BrokerTransport, Consumer, Delivery, ExchangeKind, OutboundMessage, TransportError,
};

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    ready: VecDeque<QueuedMessage>,
}

#[derive(Debug)]
struct ConsumerState {
    queue: String,
    sender: UnboundedSender<Delivery>,
    in_flight: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    message: QueuedMessage,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    connected: bool,
    prefetch: u16,
    exchanges: HashMap<String, (ExchangeKind, bool)>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<(String, String, String)>,
    consumers: BTreeMap<String, ConsumerState>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
    next_consumer: u64,
    acks: u64,
    nacks: u64,
    published: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connected: false,
            prefetch: 1,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: BTreeSet::new(),
            consumers: BTreeMap::new(),
            unacked: HashMap::new(),
            next_delivery_tag: 1,
            next_consumer: 1,
            acks: 0,
            nacks: 0,
            published: 0,
        }
    }
}

impl BrokerState {
    fn require_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, body: Vec<u8>) -> usize {
        let Some((kind, _)) = self.exchanges.get(exchange).copied() else {
            return 0;
        };

        let targets: BTreeSet<String> = self
            .bindings
            .iter()
            .filter(|(_, bound_exchange, pattern)| {
                bound_exchange == exchange
                    && match kind {
                        ExchangeKind::Topic => topic_matches(pattern, routing_key),
                        ExchangeKind::Direct => pattern == routing_key,
                        ExchangeKind::Fanout => true,
                    }
            })
            .map(|(queue, _, _)| queue.clone())
            .collect();

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.ready.push_back(QueuedMessage {
                    routing_key: routing_key.to_owned(),
                    body: body.clone(),
                    redelivered: false,
                });
            }
        }
        self.published += 1;
        targets.len()
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(consumer) = self.consumers.get_mut(&unacked.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push_front(QueuedMessage {
                redelivered: true,
                ..unacked.message
            });
        }
    }

    /// Hands ready messages to consumers with room in their prefetch window
    fn pump(&mut self) {
        let window = usize::from(self.prefetch.max(1));
        let tags: Vec<String> = self.consumers.keys().cloned().collect();

        for tag in tags {
            loop {
                let Some(consumer) = self.consumers.get(&tag) else {
                    break;
                };
                if consumer.in_flight >= window {
                    break;
                }
                let queue = consumer.queue.clone();
                let Some(message) = self.queues.get_mut(&queue).and_then(|q| q.ready.pop_front()) else {
                    break;
                };

                let delivery_tag = self.next_delivery_tag;
                self.next_delivery_tag += 1;
                let delivery = Delivery {
                    delivery_tag,
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                    body: message.body.clone(),
                };

                let sent = self
                    .consumers
                    .get(&tag)
                    .is_some_and(|consumer| consumer.sender.send(delivery).is_ok());
                if !sent {
                    // receiver dropped: forget the consumer, keep the message
                    if let Some(state) = self.queues.get_mut(&queue) {
                        state.ready.push_front(message);
                    }
                    self.consumers.remove(&tag);
                    break;
                }

                if let Some(consumer) = self.consumers.get_mut(&tag) {
                    consumer.in_flight += 1;
                }
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue,
                        consumer_tag: tag.clone(),
                        message,
                    },
                );
            }
        }
    }

    /// Drops every consumer and returns unacknowledged messages to their queues
    fn drop_session(&mut self) {
        self.connected = false;
        self.consumers.clear();
        let mut orphaned: Vec<(u64, Unacked)> = self.unacked.drain().collect();
        // newest first so push_front restores the original order
        orphaned.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, unacked) in orphaned {
            self.requeue(unacked);
        }
    }
}

/// In-process broker used by tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unreachable, `connect` fails
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Simulates a lost connection: every delivery stream ends and
    /// unacknowledged messages return to their queues
    pub fn disconnect(&self) {
        self.state.lock().drop_session();
        debug!("in-memory broker dropped the connection");
    }

    /// Routes a raw body without an envelope, bypassing the connection
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> usize {
        let mut state = self.state.lock();
        let routed = state.route(exchange, routing_key, body);
        state.pump();
        routed
    }

    /// Messages waiting in a queue, not counting unacknowledged ones
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn ack_count(&self) -> u64 {
        self.state.lock().acks
    }

    pub fn nack_count(&self) -> u64 {
        self.state.lock().nacks
    }

    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Routing keys bound to a queue, on any exchange
    pub fn bindings_for(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|(bound_queue, _, _)| bound_queue == queue)
            .map(|(_, _, key)| key.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(TransportError::Unreachable(
                "in-memory broker is unreachable".to_owned(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        match state.exchanges.get(name).copied() {
            Some(existing) if existing != (kind, durable) => Err(TransportError::Topology(format!(
                "exchange {} redeclared with different parameters",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), (kind, durable));
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        match state.queues.get(name).map(|queue| queue.durable) {
            Some(existing) if existing != durable => Err(TransportError::Topology(format!(
                "queue {} redeclared with different durability",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_owned(),
                    QueueState {
                        durable,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Topology(format!("no queue {}", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Topology(format!("no exchange {}", exchange)));
        }
        state
            .bindings
            .insert((queue.to_owned(), exchange.to_owned(), routing_key.to_owned()));
        Ok(())
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        state.prefetch = prefetch_count.max(1);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Consume(format!("no queue {}", queue)));
        }

        let consumer_tag = format!("ctag-{}", state.next_consumer);
        state.next_consumer += 1;
        let (sender, deliveries) = mpsc::unbounded_channel();
        state.consumers.insert(
            consumer_tag.clone(),
            ConsumerState {
                queue: queue.to_owned(),
                sender,
                in_flight: 0,
            },
        );
        state.pump();

        Ok(Consumer {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        state.consumers.remove(consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
            TransportError::Acknowledge(format!("unknown delivery tag {}", delivery_tag))
        })?;
        if let Some(consumer) = state.consumers.get_mut(&unacked.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        state.acks += 1;
        state.pump();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
            TransportError::Acknowledge(format!("unknown delivery tag {}", delivery_tag))
        })?;
        state.nacks += 1;
        if requeue {
            state.requeue(unacked);
        } else if let Some(consumer) = state.consumers.get_mut(&unacked.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        state.pump();
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.require_connected()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Publish(format!("no exchange {}", exchange)));
        }
        let routed = state.route(exchange, &message.routing_key, message.body);
        debug!(exchange, routing_key = %message.routing_key, routed, "in-memory publish");
        state.pump();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.connected {
            state.drop_session();
        }
        Ok(())
    }
}
