//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Turns the static routing table of a service into live queues, bindings and consume loops.
//
// | Component                | Description                                                  |
// |--------------------------|--------------------------------------------------------------|
// | aggregate_routing_keys   | Deduplicated keys and patterns a service binds               |
// | queue_name               | `<service>-queue`                                            |
// | event_queue_name         | `<entity>-<action>-<service>-queue`                          |
// | SubscriptionInitializer  | Builds the dispatch table, binds queues, starts consumers    |
// | RoutingDispatcher        | Per-message handler (see `dispatcher`)                       |
//--------------------------------------------------------------------------------------------------

pub mod dispatcher;

pub use dispatcher::{DispatchTable, Route, RoutingDispatcher};

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::models::{DispatchError, RoutingKey, normalize_entity_name};
use crate::domain::services::callbacks::CallbackManager;
use crate::domain::services::event_bus::{ConsumerHandle, EventBus};
use crate::domain::services::routing_table::RoutingTable;

/// Queue layout of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueMode {
    /// One queue bound to every key the service consumes
    #[default]
    Shared,
    /// One queue and one consume loop per (entity, action)
    PerEvent,
}

impl FromStr for QueueMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "per-event" | "per_event" | "perevent" => Ok(Self::PerEvent),
            other => Err(format!("unknown queue mode {:?}, expected shared or per-event", other)),
        }
    }
}

/// Every routing key a service binds: one per declared `(entity, action)`,
/// plus `<domain>.*` for each domain with `stars` callbacks. Keys declared
/// under several domains collapse into one.
pub fn aggregate_routing_keys(table: &RoutingTable) -> Vec<RoutingKey> {
    let mut keys = BTreeSet::new();
    for (domain, routes) in table.domains() {
        for (entity, config) in &routes.entities {
            for action in config.operations.keys() {
                keys.insert(RoutingKey::for_event(entity, action));
            }
        }
        if !routes.stars.is_empty() {
            keys.insert(RoutingKey::domain_wildcard(domain));
        }
    }
    keys.into_iter().collect()
}

/// Queue of a service in shared mode
pub fn queue_name(service_name: &str) -> String {
    format!("{}-queue", service_name)
}

/// Queue of one entity event in per-event mode
pub fn event_queue_name(entity_name: &str, action: &str, service_name: &str) -> String {
    format!("{}-{}-{}-queue", entity_name, action, service_name)
}

/// Starts the subscriptions of one service
pub struct SubscriptionInitializer {
    bus: Arc<EventBus>,
    manager: Arc<CallbackManager>,
    table: Arc<RoutingTable>,
    service_name: String,
    queue_mode: QueueMode,
}

impl SubscriptionInitializer {
    pub fn new(
        bus: Arc<EventBus>,
        manager: Arc<CallbackManager>,
        table: Arc<RoutingTable>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            manager,
            table,
            service_name: service_name.into(),
            queue_mode: QueueMode::default(),
        }
    }

    pub fn with_queue_mode(mut self, queue_mode: QueueMode) -> Self {
        self.queue_mode = queue_mode;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn aggregate_routing_keys(&self) -> Vec<RoutingKey> {
        aggregate_routing_keys(&self.table)
    }

    /// Resolves every configured key into callbacks.
    ///
    /// An entity whose callbacks cannot be configured (missing model)
    /// degrades to no callbacks with a warning; its keys stay bound and
    /// their messages are dropped.
    ///
    /// # Errors
    /// `ConfigurationError` only when the callback manager is strict
    pub fn build_dispatch_table(&self) -> Result<DispatchTable, DispatchError> {
        let mut dispatch = DispatchTable::new();

        for (entity, config) in self.table.entity_configs() {
            let keys: Vec<(String, RoutingKey)> = config
                .operations
                .keys()
                .map(|action| (action.clone(), RoutingKey::for_event(&entity, action)))
                .collect();

            let callbacks = match self
                .manager
                .configure_entity_callbacks(&config, &self.service_name, &entity)
            {
                Ok(callbacks) => callbacks,
                Err(err) if !self.manager.is_strict() => {
                    warn!(
                        service = %self.service_name,
                        entity = %entity,
                        error = %err,
                        "Entity has no callbacks, its events will be dropped"
                    );
                    keys.iter().for_each(|(_, key)| dispatch.mark_unresolved(key));
                    continue;
                }
                Err(err) => return Err(err),
            };

            for (action, key) in keys {
                let bindings = callbacks.callbacks_for(&action).to_vec();
                if bindings.is_empty() {
                    dispatch.mark_unresolved(&key);
                } else {
                    dispatch.insert(
                        key,
                        Route {
                            entity: entity.clone(),
                            action,
                            bindings,
                        },
                    );
                }
            }
        }

        for (domain, routes) in self.table.domains() {
            if routes.stars.is_empty() {
                continue;
            }
            let pattern = RoutingKey::domain_wildcard(domain);
            let resolved = self
                .manager
                .resolve_named(&self.service_name, domain, &routes.stars)?;
            if resolved.bindings.is_empty() {
                dispatch.mark_unresolved(&pattern);
            } else {
                dispatch.insert(
                    pattern,
                    Route {
                        entity: domain.to_owned(),
                        action: "*".to_owned(),
                        bindings: resolved.bindings,
                    },
                );
            }
        }

        Ok(dispatch)
    }

    /// Connects, declares and binds the service queue(s), and starts the
    /// consume loops. A service without routing keys does nothing.
    ///
    /// # Returns
    /// Handles of the started consumers
    ///
    /// # Errors
    /// `Connection` when the broker set-up fails, `Configuration` when the
    /// callback manager is strict and a callback does not resolve
    pub async fn start_all_consumers(&self) -> Result<Vec<ConsumerHandle>, DispatchError> {
        let keys = self.aggregate_routing_keys();
        if keys.is_empty() {
            warn!(service = %self.service_name, "No routing keys configured, not consuming");
            return Ok(Vec::new());
        }

        let dispatch = Arc::new(self.build_dispatch_table()?);
        for key in dispatch.unresolved() {
            warn!(
                service = %self.service_name,
                routing_key = key,
                "Routing key is bound without callbacks"
            );
        }

        self.bus.connect().await?;

        let handles = match self.queue_mode {
            QueueMode::Shared => {
                let queue = queue_name(&self.service_name);
                self.bus.assert_and_bind_queue(&queue, &keys).await?;
                let dispatcher = RoutingDispatcher::new(dispatch, Arc::clone(&self.manager));
                vec![self.bus.consume(&queue, Arc::new(dispatcher)).await?]
            }
            QueueMode::PerEvent => self.start_per_event_consumers(dispatch).await?,
        };

        info!(
            service = %self.service_name,
            keys = keys.len(),
            consumers = handles.len(),
            mode = ?self.queue_mode,
            "Subscriptions started"
        );
        Ok(handles)
    }

    async fn start_per_event_consumers(
        &self,
        dispatch: Arc<DispatchTable>,
    ) -> Result<Vec<ConsumerHandle>, DispatchError> {
        let mut events = BTreeSet::new();
        let mut domains = BTreeSet::new();
        for (domain, routes) in self.table.domains() {
            for (entity, config) in &routes.entities {
                for action in config.operations.keys() {
                    events.insert((normalize_entity_name(entity), action.clone()));
                }
            }
            if !routes.stars.is_empty() {
                domains.insert(domain.to_owned());
            }
        }

        let mut handles = Vec::with_capacity(events.len() + domains.len());
        for (entity, action) in events {
            let queue = event_queue_name(&entity, &action, &self.service_name);
            let key = RoutingKey::for_event(&entity, &action);
            self.bus
                .assert_and_bind_queue(&queue, std::slice::from_ref(&key))
                .await?;

            let dispatcher = RoutingDispatcher::new(Arc::clone(&dispatch), Arc::clone(&self.manager))
                .for_event(&entity, &action);
            handles.push(self.bus.consume(&queue, Arc::new(dispatcher)).await?);
        }

        for domain in domains {
            let queue = event_queue_name(&domain, "stars", &self.service_name);
            let pattern = RoutingKey::domain_wildcard(&domain);
            self.bus
                .assert_and_bind_queue(&queue, std::slice::from_ref(&pattern))
                .await?;

            let dispatcher = RoutingDispatcher::new(Arc::clone(&dispatch), Arc::clone(&self.manager));
            handles.push(self.bus.consume(&queue, Arc::new(dispatcher)).await?);
        }

        Ok(handles)
    }
}
