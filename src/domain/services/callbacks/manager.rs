//--------------------------------------------------------------------------------------------------
// STRUCTS & FUNCTIONS
//--------------------------------------------------------------------------------------------------
// | Name               | Description                                          | Key Methods        |
// |--------------------|------------------------------------------------------|--------------------|
// | CallbackManager    | Resolves and runs callbacks                          | configure_entity_  |
// |                    |                                                      | callbacks, execute_|
// |                    |                                                      | callbacks          |
// | CrudCallbacks      | The three default handlers of one entity             | for_operation      |
// | EntityCallbacks    | action -> bindings, plus missing/unresolved actions  | callbacks_for      |
// | CallbackReport     | Outcome of one callback for one event                |                    |
// | summarize          | Folds reports into the message outcome               |                    |
//--------------------------------------------------------------------------------------------------

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::{Binding, EventCallback, EventData, HandlerRegistry};
use crate::domain::models::{CrudOperation, DispatchError, DispatchResult, normalize_entity_name};
use crate::domain::services::crud::{CrudCallback, ModelRegistry};
use crate::domain::services::retry::RetryPolicy;
use crate::domain::services::routing_table::EntityConfig;

/// Callback name standing for "the default CRUD handler of this action"
pub const DEFAULT_CALLBACK: &str = "default";

/// The default create/update/delete handlers of one entity
#[derive(Clone)]
pub struct CrudCallbacks {
    pub created: Arc<CrudCallback>,
    pub updated: Arc<CrudCallback>,
    pub deleted: Arc<CrudCallback>,
}

impl CrudCallbacks {
    pub fn for_operation(&self, operation: CrudOperation) -> Arc<CrudCallback> {
        match operation {
            CrudOperation::Created => Arc::clone(&self.created),
            CrudOperation::Updated => Arc::clone(&self.updated),
            CrudOperation::Deleted => Arc::clone(&self.deleted),
        }
    }
}

/// Bindings resolved from a list of callback names
#[derive(Debug, Clone, Default)]
pub struct ResolvedCallbacks {
    pub bindings: Vec<Binding>,
    /// Names no handler answers to
    pub unresolved: Vec<String>,
}

/// Resolved callbacks of one entity
#[derive(Debug, Clone, Default)]
pub struct EntityCallbacks {
    pub entity: String,
    /// action -> bindings; actions without any binding are absent
    pub operations: BTreeMap<String, Vec<Binding>>,
    /// Declared actions that ended up without a callback
    pub missing: Vec<String>,
    /// (action, callback name) pairs that did not resolve
    pub unresolved: Vec<(String, String)>,
}

impl EntityCallbacks {
    /// An entity whose callbacks could not be configured at all
    pub fn empty(entity: &str) -> Self {
        Self {
            entity: normalize_entity_name(entity),
            ..Self::default()
        }
    }

    pub fn callbacks_for(&self, action: &str) -> &[Binding] {
        self.operations.get(action).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Outcome of one callback for one event
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackReport {
    pub callback: String,
    pub outcome: Result<DispatchResult, DispatchError>,
}

/// Resolves callback names into bindings and runs them
#[derive(Debug, Clone)]
pub struct CallbackManager {
    models: ModelRegistry,
    registry: HandlerRegistry,
    retry: RetryPolicy,
    strict: bool,
}

impl CallbackManager {
    /// Creates a manager
    ///
    /// # Arguments
    /// * `models` - Entity stores backing the default CRUD handlers
    /// * `registry` - Special-event handlers
    /// * `retry` - Policy used by the default CRUD handlers
    pub fn new(models: ModelRegistry, registry: HandlerRegistry, retry: RetryPolicy) -> Self {
        Self {
            models,
            registry,
            retry,
            strict: false,
        }
    }

    /// When strict, an unresolvable callback name fails configuration
    /// instead of being logged and dropped
    pub fn with_strict_callbacks(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Builds the default CRUD handlers of an entity.
    ///
    /// # Errors
    /// `ConfigurationError("model not found")` when no store is registered
    /// for the normalized entity name
    pub fn get_crud_callbacks(&self, entity_name: &str) -> Result<CrudCallbacks, DispatchError> {
        let entity = normalize_entity_name(entity_name);
        let store = self.models.get(&entity).ok_or_else(|| {
            DispatchError::Configuration(format!("model not found: {}", entity))
        })?;

        let build = |operation| {
            Arc::new(CrudCallback::new(
                &entity,
                operation,
                Arc::clone(&store),
                self.retry.clone(),
            ))
        };

        Ok(CrudCallbacks {
            created: build(CrudOperation::Created),
            updated: build(CrudOperation::Updated),
            deleted: build(CrudOperation::Deleted),
        })
    }

    /// Resolves every declared action of an entity.
    ///
    /// An `(entity, action)` override from the registry replaces whatever the
    /// table lists for that action. Otherwise `default` and the conventional
    /// CRUD names bind the default handler, and other names bind registry
    /// handlers by name.
    ///
    /// # Arguments
    /// * `entity_config` - Declared actions and callback names
    /// * `service_name` - Consuming service, used for logging
    /// * `entity_name` - Entity as named in the routing table
    ///
    /// # Errors
    /// `ConfigurationError` when a default handler is needed but the model is
    /// missing, or when strict and a name does not resolve
    pub fn configure_entity_callbacks(
        &self,
        entity_config: &EntityConfig,
        service_name: &str,
        entity_name: &str,
    ) -> Result<EntityCallbacks, DispatchError> {
        let entity = normalize_entity_name(entity_name);
        let mut result = EntityCallbacks::empty(&entity);
        let mut crud: Option<CrudCallbacks> = None;

        for (action, names) in &entity_config.operations {
            if let Some(handler) = self.registry.override_for(&entity, action) {
                debug!(
                    service = service_name,
                    entity = %entity,
                    action = %action,
                    handler = handler.name(),
                    "Special handler replaces configured callbacks"
                );
                result
                    .operations
                    .insert(action.clone(), vec![Binding::Override { handler }]);
                continue;
            }

            let mut bindings = Vec::new();
            for name in names {
                let default_operation = CrudOperation::from_action(action)
                    .filter(|operation| is_default_name(name, &entity, *operation));

                if let Some(operation) = default_operation {
                    let callbacks = match &crud {
                        Some(callbacks) => callbacks.clone(),
                        None => {
                            let callbacks = self.get_crud_callbacks(&entity)?;
                            crud = Some(callbacks.clone());
                            callbacks
                        }
                    };
                    let callback: Arc<dyn EventCallback> = callbacks.for_operation(operation);
                    bindings.push(Binding::Default {
                        entity: entity.clone(),
                        operation,
                        callback,
                    });
                } else if let Some(handler) = self.registry.get(name) {
                    bindings.push(Binding::Override { handler });
                } else {
                    self.unresolved(service_name, &entity, action, name)?;
                    result.unresolved.push((action.clone(), name.clone()));
                }
            }

            if bindings.is_empty() {
                result.missing.push(action.clone());
            } else {
                result.operations.insert(action.clone(), bindings);
            }
        }

        info!(
            service = service_name,
            entity = %entity,
            actions = result.operations.len(),
            missing = result.missing.len(),
            "Configured entity callbacks"
        );
        Ok(result)
    }

    /// Resolves the callbacks subscribed to a domain wildcard. Only registry
    /// handlers can serve a wildcard since no single CRUD operation applies.
    ///
    /// # Errors
    /// `ConfigurationError` when strict and a name does not resolve
    pub fn resolve_named(
        &self,
        service_name: &str,
        domain: &str,
        names: &[String],
    ) -> Result<ResolvedCallbacks, DispatchError> {
        let mut resolved = ResolvedCallbacks::default();
        for name in names {
            match self.registry.get(name) {
                Some(handler) => resolved.bindings.push(Binding::Override { handler }),
                None => {
                    self.unresolved(service_name, domain, "*", name)?;
                    resolved.unresolved.push(name.clone());
                }
            }
        }
        Ok(resolved)
    }

    fn unresolved(
        &self,
        service_name: &str,
        entity: &str,
        action: &str,
        name: &str,
    ) -> Result<(), DispatchError> {
        if self.strict {
            return Err(DispatchError::Configuration(format!(
                "callback {} for {}.{} is not registered",
                name, entity, action
            )));
        }
        warn!(
            service = service_name,
            entity,
            action,
            callback = name,
            "Callback is not registered, matching messages will be dropped"
        );
        Ok(())
    }

    /// Runs every callback in order, one after the other. A failing or
    /// panicking callback is logged and the remaining callbacks still run.
    ///
    /// # Arguments
    /// * `operation` - Action being handled, used for logging
    /// * `callbacks` - Bindings in registration order
    /// * `event` - The decoded event
    ///
    /// # Returns
    /// One report per callback, in execution order
    pub async fn execute_callbacks(
        &self,
        operation: &str,
        callbacks: &[Binding],
        event: &EventData,
    ) -> Vec<CallbackReport> {
        let mut reports = Vec::with_capacity(callbacks.len());

        for binding in callbacks {
            let name = binding.name().to_owned();
            let outcome = match AssertUnwindSafe(binding.callback().call(event))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(DispatchError::CallbackPanicked {
                    callback: name.clone(),
                    message: panic_message(panic.as_ref()),
                }),
            };

            match &outcome {
                Ok(result) if result.success => {
                    debug!(callback = %name, operation, message = %result.message, "Callback succeeded");
                }
                Ok(result) => {
                    warn!(callback = %name, operation, message = %result.message, "Callback soft-failed");
                }
                Err(err) => {
                    error!(
                        callback = %name,
                        operation,
                        routing_key = %event.routing_key,
                        error = %err,
                        "Callback failed"
                    );
                }
            }

            reports.push(CallbackReport {
                callback: name,
                outcome,
            });
        }

        reports
    }
}

fn is_default_name(name: &str, entity: &str, operation: CrudOperation) -> bool {
    name == DEFAULT_CALLBACK || name == operation.default_callback_name(entity)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Folds the callback reports of one event into the outcome of the message:
/// a requeue-class error wins over any other error, an error wins over a
/// soft failure, and a soft failure wins over success.
pub fn summarize(reports: Vec<CallbackReport>) -> Result<DispatchResult, DispatchError> {
    let mut first_error: Option<DispatchError> = None;
    let mut soft_failure: Option<DispatchResult> = None;
    let mut last_success: Option<DispatchResult> = None;

    for report in reports {
        match report.outcome {
            Err(err) if err.should_requeue() => return Err(err),
            Err(err) => {
                first_error.get_or_insert(err);
            }
            Ok(result) if !result.success => {
                soft_failure.get_or_insert(result);
            }
            Ok(result) => last_success = Some(result),
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(soft_failure
        .or(last_success)
        .unwrap_or_else(|| DispatchResult::skipped("no callbacks ran")))
}
