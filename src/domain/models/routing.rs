//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name                | Description                                        | Key Methods        |
// |---------------------|----------------------------------------------------|--------------------|
// | RoutingKey          | `<entity>.<action>` key or binding pattern         | parse, matches     |
// | CrudOperation       | created / updated / deleted                        | from_action        |
// | SubscriptionEntry   | One row of the routing table                       |                    |
//--------------------------------------------------------------------------------------------------

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the field carrying an entity's externally stable unique reference
pub const UNIQ_REF_FIELD: &str = "uniqRef";

/// Errors raised while parsing a routing key
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingKeyError {
    #[error("routing key is empty")]
    Empty,

    #[error("routing key {0:?} contains an empty segment")]
    EmptySegment(String),

    #[error("routing key {0:?} mixes a wildcard with other characters in one segment")]
    BadWildcard(String),
}

/// A dot-delimited routing key (`service.created`) or a binding pattern
/// using topic-exchange wildcards (`service.*`, `catalog.#`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Parses and validates a routing key or pattern.
    ///
    /// # Errors
    /// Returns `RoutingKeyError` for empty keys, empty segments (`a..b`) or
    /// segments such as `ab*` where a wildcard is not the whole segment.
    pub fn parse(raw: &str) -> Result<Self, RoutingKeyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RoutingKeyError::Empty);
        }

        for segment in raw.split('.') {
            if segment.is_empty() {
                return Err(RoutingKeyError::EmptySegment(raw.to_owned()));
            }
            if segment.len() > 1 && (segment.contains('*') || segment.contains('#')) {
                return Err(RoutingKeyError::BadWildcard(raw.to_owned()));
            }
        }

        Ok(Self(raw.to_owned()))
    }

    /// Canonical key for an entity event: `<entity-lowercase>.<action>`
    pub fn for_event(entity: &str, action: &str) -> Self {
        Self(format!("{}.{}", entity.to_lowercase(), action))
    }

    /// Wildcard pattern subscribing to every action of an entity
    pub fn entity_wildcard(entity: &str) -> Self {
        Self(format!("{}.*", entity.to_lowercase()))
    }

    /// Wildcard pattern reserved for a domain's `stars` subscription
    pub fn domain_wildcard(domain: &str) -> Self {
        Self(format!("{}.*", domain))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the key contains `*` or `#` segments and can only be bound,
    /// never published
    pub fn is_pattern(&self) -> bool {
        self.0.split('.').any(|segment| segment == "*" || segment == "#")
    }

    /// Splits the key into `(entity, action)` using the first two segments.
    ///
    /// Keys with a single segment have no action and return `None`.
    pub fn split(&self) -> Option<(&str, &str)> {
        let mut segments = self.0.splitn(3, '.');
        let entity = segments.next()?;
        let action = segments.next()?;
        Some((entity, action))
    }

    /// Returns true when this key, read as a binding pattern, matches `key`
    pub fn matches(&self, key: &str) -> bool {
        topic_matches(&self.0, key)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = RoutingKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.0
    }
}

/// Topic-exchange matching: `*` matches exactly one word, `#` matches zero
/// or more words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            // `#` swallows zero words, or one word and stays in place
            match_segments(&pattern[1..], key) || (!key.is_empty() && match_segments(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_segments(&pattern[1..], &key[1..]),
        (Some(word), Some(other)) if word == other => match_segments(&pattern[1..], &key[1..]),
        _ => false,
    }
}

/// The three operations every entity store supports by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudOperation {
    Created,
    Updated,
    Deleted,
}

impl CrudOperation {
    pub const ALL: [CrudOperation; 3] = [Self::Created, Self::Updated, Self::Deleted];

    /// Maps an action name onto a CRUD operation, if it is one
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn as_action(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    /// Conventional callback name for the default handler of this operation,
    /// e.g. `saveServiceToDatabase`
    pub fn default_callback_name(&self, entity: &str) -> String {
        let entity = normalize_entity_name(entity);
        match self {
            Self::Created => format!("save{}ToDatabase", entity),
            Self::Updated => format!("update{}InDatabase", entity),
            Self::Deleted => format!("delete{}FromDatabase", entity),
        }
    }
}

impl fmt::Display for CrudOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_action())
    }
}

/// Upper-cases the first letter: `service` -> `Service`
pub fn normalize_entity_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Name of an entity's identifier field: `ServiceCategory` -> `serviceCategoryID`
pub fn identifier_field(entity: &str) -> String {
    let mut chars = entity.chars();
    match chars.next() {
        Some(first) => {
            let lower_first: String = first.to_lowercase().chain(chars).collect();
            format!("{}ID", lower_first)
        }
        None => "ID".to_owned(),
    }
}

/// One row of the routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionEntry {
    pub microservice: String,
    pub domain: String,
    pub entity: String,
    pub action: String,
    pub callback_name: String,
}
