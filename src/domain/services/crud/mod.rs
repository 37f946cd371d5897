//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Default create/update/delete handlers applied against an entity store.
//
// | Operation | Behaviour                                                                    |
// |-----------|------------------------------------------------------------------------------|
// | created   | Skips when a record with the same `uniqRef` exists, otherwise inserts        |
// | updated   | Requires `<entity>ID`; missing record is NotFound; applies a partial update  |
// | deleted   | Requires `<entity>ID`; retries the lookup, then soft-fails if still missing  |
//
// Every store call goes through `retry_with_policy`. Transient store failures that outlive
// the policy surface as `DispatchError::Persistence`, permanent ones as `Validation`.
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::models::{
    CrudOperation, DispatchError, DispatchResult, Record, UNIQ_REF_FIELD, identifier_field,
    normalize_entity_name,
};
use crate::domain::ports::{EntityStore, StoreError};
use crate::domain::services::callbacks::{EventCallback, EventData};
use crate::domain::services::retry::{RetryFailure, RetryPolicy, Retryable, retry_with_policy};

/// Entity stores by normalized entity name
#[derive(Clone, Default)]
pub struct ModelRegistry {
    stores: HashMap<String, Arc<dyn EntityStore>>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.stores.keys().collect();
        names.sort();
        f.debug_struct("ModelRegistry").field("models", &names).finish()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the store backing an entity. `service` and `Service` name
    /// the same model.
    pub fn register(&mut self, entity: &str, store: Arc<dyn EntityStore>) -> &mut Self {
        self.stores.insert(normalize_entity_name(entity), store);
        self
    }

    pub fn get(&self, entity: &str) -> Option<Arc<dyn EntityStore>> {
        self.stores.get(&normalize_entity_name(entity)).cloned()
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.stores.contains_key(&normalize_entity_name(entity))
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Default CRUD handler of one (entity, operation) pair
pub struct CrudCallback {
    name: String,
    entity: String,
    operation: CrudOperation,
    store: Arc<dyn EntityStore>,
    retry: RetryPolicy,
}

impl fmt::Debug for CrudCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrudCallback")
            .field("name", &self.name)
            .field("operation", &self.operation)
            .finish()
    }
}

impl CrudCallback {
    pub fn new(
        entity: &str,
        operation: CrudOperation,
        store: Arc<dyn EntityStore>,
        retry: RetryPolicy,
    ) -> Self {
        let entity = normalize_entity_name(entity);
        Self {
            name: operation.default_callback_name(&entity),
            entity,
            operation,
            store,
            retry,
        }
    }

    pub fn operation(&self) -> CrudOperation {
        self.operation
    }
}

#[async_trait]
impl EventCallback for CrudCallback {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, event: &EventData) -> Result<DispatchResult, DispatchError> {
        let store = self.store.as_ref();
        match self.operation {
            CrudOperation::Created => {
                create_entity(store, &self.entity, event.data.clone(), &self.retry).await
            }
            CrudOperation::Updated => {
                update_entity(store, &self.entity, event.data.clone(), &self.retry).await
            }
            CrudOperation::Deleted => {
                delete_entity(store, &self.entity, &event.data, &self.retry).await
            }
        }
    }
}

fn store_failure(failure: RetryFailure<StoreError>) -> DispatchError {
    match failure.error {
        StoreError::Unavailable(message) => DispatchError::Persistence {
            attempts: failure.attempts,
            message,
        },
        StoreError::Rejected(message) => DispatchError::Validation(message),
    }
}

/// Reads a string or numeric identifier out of a payload field
fn read_identifier(data: &Record, field: &str) -> Option<String> {
    match data.get(field)? {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn require_identifier(entity: &str, data: &Record) -> Result<(String, String), DispatchError> {
    let field = identifier_field(entity);
    match read_identifier(data, &field) {
        Some(id) => Ok((field, id)),
        None => {
            warn!(entity, field = %field, "Event payload has no identifier");
            Err(DispatchError::Validation(format!(
                "no ID provided: {} is missing {}",
                entity, field
            )))
        }
    }
}

/// Creates a record unless one with the same `uniqRef` already exists.
///
/// # Arguments
/// * `store` - Store of the entity
/// * `entity` - Normalized entity name, used for logging
/// * `data` - Event payload to insert
/// * `retry` - Policy applied to every store call
///
/// # Returns
/// `applied` with the stored record, or `skipped` when the event was
/// already applied
///
/// # Errors
/// `Persistence` when the store stays unavailable, `Validation` when it
/// rejects the record
pub async fn create_entity(
    store: &dyn EntityStore,
    entity: &str,
    data: Record,
    retry: &RetryPolicy,
) -> Result<DispatchResult, DispatchError> {
    let uniq_ref = read_identifier(&data, UNIQ_REF_FIELD);

    match &uniq_ref {
        Some(uniq_ref) => {
            let existing = retry_with_policy(retry, "find_by_unique_ref", || {
                store.find_by_unique_ref(uniq_ref)
            })
            .await
            .map_err(store_failure)?;

            if existing.is_some() {
                info!(entity, uniq_ref = %uniq_ref, "Record already exists, skipping create");
                return Ok(DispatchResult::skipped(format!(
                    "{} with uniqRef {} already exists",
                    entity, uniq_ref
                )));
            }
        }
        None => debug!(entity, "Create event without uniqRef, skipping duplicate check"),
    }

    let created = retry_with_policy(retry, "create", || store.create(data.clone()))
        .await
        .map_err(store_failure)?;

    info!(entity, uniq_ref = ?uniq_ref, "Record created");
    Ok(DispatchResult::applied(format!("{} created", entity), created))
}

/// Applies the payload, minus its identifier, as a partial update.
///
/// # Errors
/// `Validation` when the identifier is missing (the store is never called),
/// `NotFound` when no record has that identifier, `Persistence` when the
/// store stays unavailable
pub async fn update_entity(
    store: &dyn EntityStore,
    entity: &str,
    mut data: Record,
    retry: &RetryPolicy,
) -> Result<DispatchResult, DispatchError> {
    let (field, id) = require_identifier(entity, &data)?;

    let existing = retry_with_policy(retry, "find_by_id", || store.find_by_id(&id))
        .await
        .map_err(store_failure)?;

    if existing.is_none() {
        warn!(entity, id = %id, "Update target does not exist");
        return Err(DispatchError::NotFound {
            entity: entity.to_owned(),
            id,
        });
    }

    data.remove(&field);
    let updated = retry_with_policy(retry, "update", || store.update(&id, data.clone()))
        .await
        .map_err(store_failure)?;

    info!(entity, id = %id, "Record updated");
    Ok(DispatchResult::applied(format!("{} {} updated", entity, id), updated))
}

/// Lookup outcome while waiting for a record to become visible
#[derive(Debug)]
enum Lookup {
    Missing,
    Store(StoreError),
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("record not found"),
            Self::Store(err) => err.fmt(f),
        }
    }
}

impl Retryable for Lookup {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Missing => true,
            Self::Store(err) => err.is_transient(),
        }
    }
}

/// Deletes a record, tolerating a create that has not become visible yet.
///
/// # Returns
/// `applied` with the deleted record, or a soft failure when the record is
/// still missing after every lookup attempt
///
/// # Errors
/// `Validation` when the identifier is missing, `Persistence` when the store
/// stays unavailable
pub async fn delete_entity(
    store: &dyn EntityStore,
    entity: &str,
    data: &Record,
    retry: &RetryPolicy,
) -> Result<DispatchResult, DispatchError> {
    let (_, id) = require_identifier(entity, data)?;

    let id_ref = id.as_str();
    let lookup = retry_with_policy(retry, "find_by_id", move || async move {
        match store.find_by_id(id_ref).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(Lookup::Missing),
            Err(err) => Err(Lookup::Store(err)),
        }
    })
    .await;

    let existing = match lookup {
        Ok(record) => record,
        Err(RetryFailure { attempts, error: Lookup::Missing }) => {
            warn!(entity, id = %id, attempts, "Delete target not found");
            return Ok(DispatchResult::soft_failure(format!(
                "{} {} not found after {} attempt(s)",
                entity, id, attempts
            )));
        }
        Err(RetryFailure { attempts, error: Lookup::Store(error) }) => {
            return Err(store_failure(RetryFailure { attempts, error }));
        }
    };

    retry_with_policy(retry, "delete", || store.delete(&id))
        .await
        .map_err(store_failure)?;

    info!(entity, id = %id, "Record deleted");
    Ok(DispatchResult::applied(format!("{} {} deleted", entity, id), existing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::EventContext;
    use crate::domain::ports::MockEntityStore;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::immediate(3)
    }

    #[tokio::test]
    async fn test_create_skips_existing_uniq_ref() {
        let mut store = MockEntityStore::new();
        store
            .expect_find_by_unique_ref()
            .withf(|uniq_ref| uniq_ref == "r1")
            .times(1)
            .returning(|_| Ok(Some(Record::new())));
        store.expect_create().never();

        let result = create_entity(
            &store,
            "Service",
            record(json!({"serviceID": "abc", "uniqRef": "r1"})),
            &policy(),
        )
        .await
        .unwrap();

        assert!(result.success);
        assert!(result.entity.is_none());
    }

    #[tokio::test]
    async fn test_create_checks_numeric_uniq_ref() {
        let mut store = MockEntityStore::new();
        store
            .expect_find_by_unique_ref()
            .withf(|uniq_ref| uniq_ref == "42")
            .times(1)
            .returning(|_| Ok(Some(Record::new())));
        store.expect_create().never();

        let result = create_entity(&store, "Service", record(json!({"uniqRef": 42})), &policy())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.entity.is_none());
    }

    #[tokio::test]
    async fn test_create_retries_then_reports_persistence_error() {
        let mut store = MockEntityStore::new();
        store.expect_find_by_unique_ref().returning(|_| Ok(None));
        store
            .expect_create()
            .times(3)
            .returning(|_| Err(StoreError::Unavailable("connection refused".into())));

        let err = create_entity(
            &store,
            "Service",
            record(json!({"uniqRef": "r1"})),
            &policy(),
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            DispatchError::Persistence {
                attempts: 3,
                message: "connection refused".into()
            }
        );
        assert!(err.should_requeue());
    }

    #[tokio::test]
    async fn test_create_rejected_record_is_not_retried() {
        let mut store = MockEntityStore::new();
        store.expect_find_by_unique_ref().returning(|_| Ok(None));
        store
            .expect_create()
            .times(1)
            .returning(|_| Err(StoreError::Rejected("title is required".into())));

        let err = create_entity(&store, "Service", record(json!({"uniqRef": "r1"})), &policy())
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::Validation("title is required".into()));
    }

    #[tokio::test]
    async fn test_update_without_id_never_reaches_store() {
        let mut store = MockEntityStore::new();
        store.expect_find_by_id().never();
        store.expect_update().never();

        let err = update_entity(&store, "Service", record(json!({"title": "X"})), &policy())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Validation(message) if message.starts_with("no ID provided")));
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let mut store = MockEntityStore::new();
        store.expect_find_by_id().times(1).returning(|_| Ok(None));
        store.expect_update().never();

        let err = update_entity(
            &store,
            "Service",
            record(json!({"serviceID": "missing", "title": "X"})),
            &policy(),
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            DispatchError::NotFound {
                entity: "Service".into(),
                id: "missing".into()
            }
        );
        assert!(!err.should_requeue());
    }

    #[tokio::test]
    async fn test_update_excludes_identifier_from_partial() {
        let mut store = MockEntityStore::new();
        store
            .expect_find_by_id()
            .returning(|_| Ok(Some(record(json!({"serviceID": "abc"})))));
        store
            .expect_update()
            .withf(|id, partial| id == "abc" && !partial.contains_key("serviceID") && partial["title"] == "Y")
            .times(1)
            .returning(|_, partial| Ok(partial));

        let result = update_entity(
            &store,
            "Service",
            record(json!({"serviceID": "abc", "title": "Y"})),
            &policy(),
        )
        .await
        .unwrap();

        assert!(result.success);
    }

    #[tokio::test]
    async fn test_delete_missing_record_soft_fails_after_three_lookups() {
        let mut store = MockEntityStore::new();
        store.expect_find_by_id().times(3).returning(|_| Ok(None));
        store.expect_delete().never();

        let result = delete_entity(
            &store,
            "Service",
            &record(json!({"serviceID": "gone"})),
            &policy(),
        )
        .await
        .unwrap();

        assert!(!result.success);
        assert!(result.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_delete_waits_for_record_to_appear() {
        let mut store = MockEntityStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_find_by_id()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        store
            .expect_find_by_id()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(record(json!({"serviceID": "abc"})))));
        store.expect_delete().withf(|id| id == "abc").times(1).returning(|_| Ok(()));

        let result = delete_entity(
            &store,
            "Service",
            &record(json!({"serviceID": "abc"})),
            &policy(),
        )
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(result.entity.unwrap()["serviceID"], "abc");
    }

    #[tokio::test]
    async fn test_crud_callback_dispatches_by_operation() {
        let mut store = MockEntityStore::new();
        store.expect_find_by_unique_ref().returning(|_| Ok(None));
        store.expect_create().times(1).returning(Ok);

        let callback = CrudCallback::new("service", CrudOperation::Created, Arc::new(store), policy());
        assert_eq!(callback.name(), "saveServiceToDatabase");

        let event = EventData {
            routing_key: "service.created".into(),
            entity: "service".into(),
            action: "created".into(),
            context: EventContext::default(),
            data: record(json!({"uniqRef": "r9"})),
        };
        let result = callback.call(&event).await.unwrap();
        assert_eq!(result.entity.unwrap()["uniqRef"], "r9");
    }
}
