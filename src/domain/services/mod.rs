//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Event routing and dispatch services, leaves first.
//
// | Module          | Description                                                         |
// |-----------------|---------------------------------------------------------------------|
// | retry           | Bounded retry with pluggable backoff                                |
// | metrics         | Process-scoped delivery counters                                    |
// | routing_table   | Static routing configuration and the routing-key catalog            |
// | crud            | Default create/update/delete handlers over an entity store          |
// | callbacks       | Callback registry, binding resolution and execution                 |
// | event_bus       | Broker topology, consume loops, publish and ack policy              |
// | subscriptions   | Routing table -> queues, bindings and consumers                     |
//--------------------------------------------------------------------------------------------------

pub mod callbacks;
pub mod crud;
pub mod event_bus;
pub mod metrics;
pub mod retry;
pub mod routing_table;
pub mod subscriptions;

pub use callbacks::{
    Binding, CallbackManager, EntityCallbacks, EventCallback, EventData, FnCallback,
    HandlerRegistry,
};
pub use crud::{CrudCallback, ModelRegistry, create_entity, delete_entity, update_entity};
pub use event_bus::{ConsumerHandle, EventBus, EventBusOptions, MessageHandler, PublishOptions};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use retry::{Backoff, RetryFailure, RetryPolicy, Retryable, retry_with_policy};
pub use routing_table::{EntityConfig, RoutingKeyCatalog, RoutingTable, RoutingTableError};
pub use subscriptions::{
    QueueMode, SubscriptionInitializer, aggregate_routing_keys, event_queue_name, queue_name,
};
