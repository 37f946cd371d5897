//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Ports to the two external collaborators of the routing core. Adapters in `crate::adapters`
// implement them.
//
// | Port              | Description                                                    |
// |-------------------|----------------------------------------------------------------|
// | EntityStore       | Per-entity persistence: create/find/update/delete              |
// | BrokerTransport   | Topic-exchange broker: topology, consume, ack/nack, publish    |
//--------------------------------------------------------------------------------------------------

pub mod store;
pub mod transport;

pub use store::{EntityStore, StoreError};
pub use transport::{
    BrokerTransport, Consumer, Delivery, ExchangeKind, OutboundMessage, TransportError,
};

#[cfg(test)]
pub use store::MockEntityStore;
