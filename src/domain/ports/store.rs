use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::Record;

/// Errors reported by an entity store
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The store could not be reached or timed out; retrying may help
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the operation (constraint, schema); retrying cannot help
    #[error("store rejected operation: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Persistence collaborator for a single entity type.
///
/// The dispatch handlers never embed persistence logic beyond these five
/// calls. Implementations must be safe to call concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Inserts a new record and returns it as stored
    async fn create(&self, data: Record) -> Result<Record, StoreError>;

    /// Looks a record up by its `uniqRef`
    async fn find_by_unique_ref(&self, uniq_ref: &str) -> Result<Option<Record>, StoreError>;

    /// Looks a record up by its identifier
    async fn find_by_id(&self, id: &str) -> Result<Option<Record>, StoreError>;

    /// Applies a partial update and returns the updated record
    async fn update(&self, id: &str, partial: Record) -> Result<Record, StoreError>;

    /// Removes a record
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
