// Expose the modules
pub mod adapters;
pub mod config;
pub mod domain;

// Re-export key types for easier usage
pub use config::{Config, ConfigError};
pub use domain::models::{
    AckDecision, CrudOperation, DecodedEvent, DispatchError, DispatchResult, EventContext,
    MessageEnvelope, Record, RoutingKey,
};
pub use domain::ports::{BrokerTransport, EntityStore, StoreError, TransportError};
pub use domain::services::{
    CallbackManager, ConsumerMetrics, EventBus, EventBusOptions, EventCallback, EventData,
    FnCallback, HandlerRegistry, ModelRegistry, PublishOptions, QueueMode, RetryPolicy,
    RoutingKeyCatalog, RoutingTable, SubscriptionInitializer,
};
