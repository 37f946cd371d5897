//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// | Adapter              | Port             | Description                                       |
// |----------------------|------------------|---------------------------------------------------|
// | AmqpTransport        | BrokerTransport  | RabbitMQ through the workspace `rabbitmq` crate   |
// | InMemoryBroker       | BrokerTransport  | In-process topic broker for tests and local runs  |
// | InMemoryEntityStore  | EntityStore      | Per-entity records kept in memory                 |
//--------------------------------------------------------------------------------------------------

pub mod amqp;
pub mod memory_broker;
pub mod memory_store;

pub use amqp::AmqpTransport;
pub use memory_broker::InMemoryBroker;
pub use memory_store::InMemoryEntityStore;
