//! `EntityStore` kept in process memory.
//!
//! Records are keyed by the entity's identifier field (`serviceID` for
//! `Service`); a record created without one gets a fresh UUID. `uniqRef`
//! is unique, like the constraint a database table would carry.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::models::{Record, UNIQ_REF_FIELD, identifier_field};
use crate::domain::ports::{EntityStore, StoreError};

const CREATED_AT: &str = "createdAt";
const UPDATED_AT: &str = "updatedAt";

#[derive(Debug, Default)]
struct StoreState {
    records: BTreeMap<String, Record>,
    by_unique_ref: HashMap<String, String>,
    failures_left: u32,
}

impl StoreState {
    fn fail_if_scheduled(&mut self) -> Result<(), StoreError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(StoreError::Unavailable("injected store failure".to_owned()));
        }
        Ok(())
    }
}

fn as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Thread-safe in-memory store for one entity type
#[derive(Debug)]
pub struct InMemoryEntityStore {
    entity: String,
    id_field: String,
    state: Mutex<StoreState>,
}

impl InMemoryEntityStore {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_owned(),
            id_field: identifier_field(entity),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Makes the next `calls` store operations fail with `Unavailable`
    pub fn fail_next_calls(&self, calls: u32) {
        self.state.lock().failures_left = calls;
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.state.lock().records.get(id).cloned()
    }

    pub fn find_by_ref(&self, uniq_ref: &str) -> Option<Record> {
        let state = self.state.lock();
        state
            .by_unique_ref
            .get(uniq_ref)
            .and_then(|id| state.records.get(id))
            .cloned()
    }

    pub fn records(&self) -> Vec<Record> {
        self.state.lock().records.values().cloned().collect()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn create(&self, mut data: Record) -> Result<Record, StoreError> {
        let mut state = self.state.lock();
        state.fail_if_scheduled()?;

        let id = match data.get(&self.id_field).and_then(as_key) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                data.insert(self.id_field.clone(), Value::String(id.clone()));
                id
            }
        };
        if state.records.contains_key(&id) {
            return Err(StoreError::Rejected(format!(
                "{} {} already exists",
                self.entity, id
            )));
        }

        let uniq_ref = data.get(UNIQ_REF_FIELD).and_then(as_key);
        if let Some(uniq_ref) = &uniq_ref {
            if state.by_unique_ref.contains_key(uniq_ref) {
                return Err(StoreError::Rejected(format!(
                    "{} with uniqRef {} already exists",
                    self.entity, uniq_ref
                )));
            }
        }

        let now = Value::String(Utc::now().to_rfc3339());
        data.entry(CREATED_AT).or_insert_with(|| now.clone());
        data.insert(UPDATED_AT.to_owned(), now);

        if let Some(uniq_ref) = uniq_ref {
            state.by_unique_ref.insert(uniq_ref, id.clone());
        }
        state.records.insert(id, data.clone());
        Ok(data)
    }

    async fn find_by_unique_ref(&self, uniq_ref: &str) -> Result<Option<Record>, StoreError> {
        let mut state = self.state.lock();
        state.fail_if_scheduled()?;
        Ok(state
            .by_unique_ref
            .get(uniq_ref)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let mut state = self.state.lock();
        state.fail_if_scheduled()?;
        Ok(state.records.get(id).cloned())
    }

    async fn update(&self, id: &str, partial: Record) -> Result<Record, StoreError> {
        let mut state = self.state.lock();
        state.fail_if_scheduled()?;

        let Some(mut record) = state.records.get(id).cloned() else {
            return Err(StoreError::Rejected(format!("{} {} does not exist", self.entity, id)));
        };

        let old_ref = record.get(UNIQ_REF_FIELD).and_then(as_key);
        for (field, value) in partial {
            if field != self.id_field {
                record.insert(field, value);
            }
        }
        record.insert(UPDATED_AT.to_owned(), Value::String(Utc::now().to_rfc3339()));

        let new_ref = record.get(UNIQ_REF_FIELD).and_then(as_key);
        if new_ref != old_ref {
            if let Some(new_ref) = &new_ref {
                if state.by_unique_ref.get(new_ref).is_some_and(|owner| owner != id) {
                    return Err(StoreError::Rejected(format!(
                        "{} with uniqRef {} already exists",
                        self.entity, new_ref
                    )));
                }
                state.by_unique_ref.insert(new_ref.clone(), id.to_owned());
            }
            if let Some(old_ref) = old_ref {
                state.by_unique_ref.remove(&old_ref);
            }
        }

        state.records.insert(id.to_owned(), record.clone());
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.fail_if_scheduled()?;

        if let Some(record) = state.records.remove(id) {
            if let Some(uniq_ref) = record.get(UNIQ_REF_FIELD).and_then(as_key) {
                state.by_unique_ref.remove(&uniq_ref);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_timestamps() {
        let store = InMemoryEntityStore::new("Service");
        let created = store
            .create(record(json!({"uniqRef": "svc-1", "name": "Cut"})))
            .await
            .unwrap();

        let id = created["serviceID"].as_str().unwrap().to_owned();
        assert!(created.contains_key("createdAt"));
        assert_eq!(store.get(&id).unwrap()["name"], "Cut");
        assert_eq!(store.find_by_unique_ref("svc-1").await.unwrap().unwrap()["serviceID"], json!(id));
    }

    #[tokio::test]
    async fn test_unique_ref_is_unique() {
        let store = InMemoryEntityStore::new("Service");
        store.create(record(json!({"uniqRef": "svc-1"}))).await.unwrap();

        let err = store.create(record(json!({"uniqRef": "svc-1"}))).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_id_and_reindexes_ref() {
        let store = InMemoryEntityStore::new("Service");
        store
            .create(record(json!({"serviceID": "s1", "uniqRef": "old", "name": "Cut"})))
            .await
            .unwrap();

        let updated = store
            .update("s1", record(json!({"serviceID": "other", "uniqRef": "new", "name": "Trim"})))
            .await
            .unwrap();

        assert_eq!(updated["serviceID"], "s1");
        assert_eq!(updated["name"], "Trim");
        assert!(store.find_by_ref("old").is_none());
        assert!(store.find_by_ref("new").is_some());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = InMemoryEntityStore::new("Service");
        store.fail_next_calls(2);

        assert!(store.find_by_id("s1").await.unwrap_err().is_transient());
        assert!(store.delete("s1").await.unwrap_err().is_transient());
        assert!(store.find_by_id("s1").await.unwrap().is_none());
    }
}
