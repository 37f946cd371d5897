//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Callback resolution and execution. Callback names from the routing table are resolved once,
// at subscription set-up, into `Binding`s; message handling only walks the resolved lists.
//
// | Component          | Description                                                     |
// |--------------------|-----------------------------------------------------------------|
// | EventCallback      | Anything that applies an event to local state                   |
// | FnCallback         | Adapts an async closure into an EventCallback                   |
// | HandlerRegistry    | Named special-event handlers and (entity, action) overrides     |
// | Binding            | Default(entity, operation) or Override(handler)                 |
// | CallbackManager    | Resolves bindings per entity and executes them (see `manager`)  |
//--------------------------------------------------------------------------------------------------

pub mod manager;

pub use manager::{
    CallbackManager, CallbackReport, CrudCallbacks, EntityCallbacks, ResolvedCallbacks, summarize,
};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::domain::models::{
    CrudOperation, DispatchError, DispatchResult, EventContext, Record, normalize_entity_name,
};

/// A decoded event handed to callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub routing_key: String,
    /// Entity segment of the routing key, as published (`service`)
    pub entity: String,
    pub action: String,
    pub context: EventContext,
    pub data: Record,
}

/// Applies one event to local state
#[async_trait]
pub trait EventCallback: Send + Sync {
    fn name(&self) -> &str;

    /// Handles the event.
    ///
    /// # Returns
    /// `DispatchResult` with `success: false` for soft failures that must not
    /// be retried
    ///
    /// # Errors
    /// A `DispatchError` whose `should_requeue` decides the message fate
    async fn call(&self, event: &EventData) -> Result<DispatchResult, DispatchError>;
}

type BoxedHandler =
    Box<dyn Fn(EventData) -> BoxFuture<'static, Result<DispatchResult, DispatchError>> + Send + Sync>;

/// Named callback backed by an async closure
pub struct FnCallback {
    name: String,
    handler: BoxedHandler,
}

impl FnCallback {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(EventData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DispatchResult, DispatchError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(move |event| Box::pin(handler(event))),
        }
    }
}

impl fmt::Debug for FnCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCallback").field("name", &self.name).finish()
    }
}

#[async_trait]
impl EventCallback for FnCallback {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, event: &EventData) -> Result<DispatchResult, DispatchError> {
        (self.handler)(event.clone()).await
    }
}

/// Statically registered special-event handlers.
///
/// Handlers registered by name are referenced from the routing table.
/// Handlers registered for an `(entity, action)` pair replace whatever the
/// table lists for that pair, default CRUD included.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    named: HashMap<String, Arc<dyn EventCallback>>,
    overrides: HashMap<(String, String), Arc<dyn EventCallback>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its own name
    pub fn register(&mut self, handler: Arc<dyn EventCallback>) -> &mut Self {
        self.named.insert(handler.name().to_owned(), handler);
        self
    }

    /// Registers a handler that replaces the callbacks of `(entity, action)`
    pub fn register_override(
        &mut self,
        entity: &str,
        action: &str,
        handler: Arc<dyn EventCallback>,
    ) -> &mut Self {
        self.overrides
            .insert((normalize_entity_name(entity), action.to_owned()), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EventCallback>> {
        self.named.get(name).cloned()
    }

    pub fn override_for(&self, entity: &str, action: &str) -> Option<Arc<dyn EventCallback>> {
        self.overrides
            .get(&(normalize_entity_name(entity), action.to_owned()))
            .cloned()
    }
}

/// A resolved callback
#[derive(Clone)]
pub enum Binding {
    /// Default CRUD handler of the entity store
    Default {
        entity: String,
        operation: CrudOperation,
        callback: Arc<dyn EventCallback>,
    },
    /// Special-event handler from the registry
    Override { handler: Arc<dyn EventCallback> },
}

impl Binding {
    pub fn name(&self) -> &str {
        self.callback().name()
    }

    pub fn callback(&self) -> &Arc<dyn EventCallback> {
        match self {
            Self::Default { callback, .. } => callback,
            Self::Override { handler } => handler,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default { .. })
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default { entity, operation, .. } => f
                .debug_struct("Default")
                .field("entity", entity)
                .field("operation", operation)
                .finish(),
            Self::Override { handler } => f
                .debug_struct("Override")
                .field("name", &handler.name())
                .finish(),
        }
    }
}
