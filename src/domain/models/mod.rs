pub mod dispatch;
pub mod envelope;
pub mod routing;

pub use dispatch::{AckDecision, DispatchError, DispatchResult};
pub use envelope::{DecodedEvent, EventContext, MessageEnvelope, Record};
pub use routing::{
    CrudOperation, RoutingKey, RoutingKeyError, SubscriptionEntry, UNIQ_REF_FIELD,
    identifier_field, normalize_entity_name, topic_matches,
};
