//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name               | Description                                          | Key Methods       |
// |--------------------|------------------------------------------------------|-------------------|
// | Route              | Resolved bindings of one routing key or pattern      |                   |
// | DispatchTable      | Flat lookup built once at set-up                     | routes_for,       |
// |                    |                                                      | exact_route       |
// | RoutingDispatcher  | MessageHandler driving the callback manager          | handle            |
//--------------------------------------------------------------------------------------------------

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::models::{DecodedEvent, DispatchError, DispatchResult, RoutingKey};
use crate::domain::services::callbacks::{Binding, CallbackManager, EventData, summarize};
use crate::domain::services::event_bus::MessageHandler;

/// Bindings of one routing key or wildcard pattern
#[derive(Debug, Clone)]
pub struct Route {
    /// Normalized entity name, or the domain for wildcard routes
    pub entity: String,
    pub action: String,
    pub bindings: Vec<Binding>,
}

/// Routing key -> resolved callbacks, built once when subscriptions start
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    exact: HashMap<String, Route>,
    patterns: Vec<(RoutingKey, Route)>,
    unresolved: BTreeSet<String>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: RoutingKey, route: Route) {
        if key.is_pattern() {
            self.patterns.push((key, route));
        } else {
            self.exact.insert(key.into(), route);
        }
    }

    /// Records a bound key whose callbacks did not resolve; its messages
    /// are acknowledged and dropped
    pub fn mark_unresolved(&mut self, key: &RoutingKey) {
        self.unresolved.insert(key.as_str().to_owned());
    }

    pub fn is_unresolved(&self, routing_key: &str) -> bool {
        self.unresolved.contains(routing_key)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.unresolved.iter().map(String::as_str)
    }

    /// Route configured for exactly this key, ignoring wildcard patterns
    pub fn exact_route(&self, routing_key: &str) -> Option<&Route> {
        self.exact.get(routing_key)
    }

    /// The exact route of the key first, then every matching wildcard route
    pub fn routes_for(&self, routing_key: &str) -> Vec<&Route> {
        self.exact
            .get(routing_key)
            .into_iter()
            .chain(
                self.patterns
                    .iter()
                    .filter(|(pattern, _)| pattern.matches(routing_key))
                    .map(|(_, route)| route),
            )
            .collect()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hands decoded messages to the callbacks the dispatch table resolves for
/// their routing key.
///
/// A dispatcher created for one `(entity, action)` pair ignores deliveries
/// carrying any other key and runs only the exact route of its key. Domain
/// wildcard routes belong to the stars queue of the domain.
pub struct RoutingDispatcher {
    table: Arc<DispatchTable>,
    manager: Arc<CallbackManager>,
    only: Option<(String, String)>,
}

impl RoutingDispatcher {
    pub fn new(table: Arc<DispatchTable>, manager: Arc<CallbackManager>) -> Self {
        Self {
            table,
            manager,
            only: None,
        }
    }

    /// Restricts the dispatcher to a single entity event
    pub fn for_event(mut self, entity: &str, action: &str) -> Self {
        self.only = Some((entity.to_lowercase(), action.to_owned()));
        self
    }
}

#[async_trait]
impl MessageHandler for RoutingDispatcher {
    async fn handle(
        &self,
        routing_key: &str,
        event: DecodedEvent,
    ) -> Result<DispatchResult, DispatchError> {
        let key = RoutingKey::parse(routing_key)
            .map_err(|err| DispatchError::Validation(err.to_string()))?;
        let (entity, action) = key
            .split()
            .ok_or_else(|| DispatchError::Validation(format!("routing key {} has no action", key)))?;

        if let Some((only_entity, only_action)) = &self.only {
            if !entity.eq_ignore_ascii_case(only_entity) || action != only_action {
                debug!(routing_key, "Routing key not handled by this consumer, ignoring");
                return Ok(DispatchResult::soft_failure(format!(
                    "{} ignored by {}.{} consumer",
                    routing_key, only_entity, only_action
                )));
            }
        }

        let routes = match &self.only {
            Some(_) => self.table.exact_route(routing_key).into_iter().collect(),
            None => self.table.routes_for(routing_key),
        };
        if routes.is_empty() {
            if self.table.is_unresolved(routing_key) {
                warn!(routing_key, "No registered callback for routing key, dropping message");
            } else {
                warn!(routing_key, "Routing key is not configured, dropping message");
            }
            return Ok(DispatchResult::soft_failure(format!(
                "no callback registered for {}",
                routing_key
            )));
        }

        let event = EventData {
            routing_key: routing_key.to_owned(),
            entity: entity.to_owned(),
            action: action.to_owned(),
            context: event.context,
            data: event.data,
        };

        let mut reports = Vec::new();
        for route in routes {
            reports.extend(
                self.manager
                    .execute_callbacks(&route.action, &route.bindings, &event)
                    .await,
            );
        }
        summarize(reports)
    }
}
