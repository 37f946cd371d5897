//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Static routing configuration of a service: which entity events it consumes and which
// callbacks handle them. Loaded once at start-up and never mutated afterwards.
//
// JSON shape:
//
//     { "<domain>": { "<entity>": { "<action>": "name" | ["name", ...] },
//                     "stars": "name" | ["name", ...] } }
//
// | Component          | Description                                                  |
// |--------------------|--------------------------------------------------------------|
// | RoutingTable       | Parsed and validated configuration                           |
// | DomainRoutes       | Entities of one domain plus its `stars` callbacks            |
// | EntityConfig       | action -> callback names for one entity                      |
// | RoutingKeyCatalog  | Canonical routing keys for producers (see `catalog`)         |
//--------------------------------------------------------------------------------------------------

pub mod catalog;

pub use catalog::{DomainKeys, RoutingKeyCatalog};

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::domain::models::{SubscriptionEntry, normalize_entity_name};

/// Reserved key of a domain subscribing to `<domain>.*`
pub const STARS_KEY: &str = "stars";

/// Errors raised while loading a routing table
#[derive(Debug, Error)]
pub enum RoutingTableError {
    #[error("failed to read routing config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid routing config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("domain {domain:?}: `stars` must be a callback name or a list of names")]
    InvalidStars { domain: String },

    #[error("domain {domain:?}: entity {entity:?} must map actions to callback names")]
    InvalidEntity { domain: String, entity: String },

    #[error("{0:?} is not a valid domain, entity or action name")]
    InvalidName(String),

    #[error("{domain}.{entity}.{action}: empty callback name")]
    EmptyCallbackName {
        domain: String,
        entity: String,
        action: String,
    },
}

/// One callback name or a list of them
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CallbackNames {
    One(String),
    Many(Vec<String>),
}

impl CallbackNames {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(name) => vec![name],
            Self::Many(names) => names,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DomainNode {
    Entity(BTreeMap<String, CallbackNames>),
    Callbacks(CallbackNames),
}

type RawRoutingTable = BTreeMap<String, BTreeMap<String, DomainNode>>;

/// Actions an entity subscribes to and the callbacks handling each
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityConfig {
    /// action -> callback names, in declaration order
    pub operations: BTreeMap<String, Vec<String>>,
}

impl EntityConfig {
    pub fn callbacks_for(&self, action: &str) -> &[String] {
        self.operations.get(action).map(Vec::as_slice).unwrap_or(&[])
    }

    fn merge(&mut self, other: &EntityConfig) {
        for (action, names) in &other.operations {
            let merged = self.operations.entry(action.clone()).or_default();
            for name in names {
                if !merged.contains(name) {
                    merged.push(name.clone());
                }
            }
        }
    }
}

/// Routes declared under one domain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainRoutes {
    /// entity name as written in the config -> its actions
    pub entities: BTreeMap<String, EntityConfig>,
    /// callbacks subscribed to `<domain>.*`
    pub stars: Vec<String>,
}

/// Validated routing configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRoutingTable")]
pub struct RoutingTable {
    domains: BTreeMap<String, DomainRoutes>,
}

impl RoutingTable {
    /// Parses a routing table from JSON text
    ///
    /// # Errors
    /// Returns `RoutingTableError::Json` for malformed JSON or an invalid shape
    pub fn from_json_str(json: &str) -> Result<Self, RoutingTableError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a routing table file
    ///
    /// # Arguments
    /// * `path` - Path of the JSON routing config
    ///
    /// # Errors
    /// Returns `RoutingTableError::Io` when the file cannot be read, otherwise
    /// the same errors as [`RoutingTable::from_json_str`]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RoutingTableError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| RoutingTableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_json_str(&json)?;
        info!(
            path = %path.display(),
            domains = table.domains.len(),
            "Loaded routing table"
        );
        Ok(table)
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn domains(&self) -> impl Iterator<Item = (&str, &DomainRoutes)> {
        self.domains.iter().map(|(name, routes)| (name.as_str(), routes))
    }

    pub fn domain(&self, name: &str) -> Option<&DomainRoutes> {
        self.domains.get(name)
    }

    /// Entity configurations merged across domains, keyed by the normalized
    /// entity name (`service` and `Service` are the same entity)
    pub fn entity_configs(&self) -> BTreeMap<String, EntityConfig> {
        let mut merged: BTreeMap<String, EntityConfig> = BTreeMap::new();
        for routes in self.domains.values() {
            for (entity, config) in &routes.entities {
                merged
                    .entry(normalize_entity_name(entity))
                    .or_default()
                    .merge(config);
            }
        }
        merged
    }

    /// Flattens the table into one row per (entity, action, callback).
    /// `stars` rows use `*` for both entity and action.
    pub fn entries(&self, microservice: &str) -> Vec<SubscriptionEntry> {
        let mut rows = Vec::new();
        for (domain, routes) in &self.domains {
            for (entity, config) in &routes.entities {
                for (action, names) in &config.operations {
                    rows.extend(names.iter().map(|name| SubscriptionEntry {
                        microservice: microservice.to_owned(),
                        domain: domain.clone(),
                        entity: entity.clone(),
                        action: action.clone(),
                        callback_name: name.clone(),
                    }));
                }
            }
            rows.extend(routes.stars.iter().map(|name| SubscriptionEntry {
                microservice: microservice.to_owned(),
                domain: domain.clone(),
                entity: "*".to_owned(),
                action: "*".to_owned(),
                callback_name: name.clone(),
            }));
        }
        rows
    }
}

fn validate_name(name: &str) -> Result<(), RoutingTableError> {
    let valid = !name.is_empty()
        && !name.contains('.')
        && !name.contains('*')
        && !name.contains('#')
        && !name.contains(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(RoutingTableError::InvalidName(name.to_owned()))
    }
}

impl TryFrom<RawRoutingTable> for RoutingTable {
    type Error = RoutingTableError;

    fn try_from(raw: RawRoutingTable) -> Result<Self, Self::Error> {
        let mut domains = BTreeMap::new();

        for (domain, nodes) in raw {
            validate_name(&domain)?;
            let mut routes = DomainRoutes::default();

            for (key, node) in nodes {
                if key == STARS_KEY {
                    match node {
                        DomainNode::Callbacks(names) => routes.stars = names.into_vec(),
                        DomainNode::Entity(_) => {
                            return Err(RoutingTableError::InvalidStars { domain });
                        }
                    }
                    continue;
                }

                let DomainNode::Entity(actions) = node else {
                    return Err(RoutingTableError::InvalidEntity { domain, entity: key });
                };
                validate_name(&key)?;

                let mut config = EntityConfig::default();
                for (action, names) in actions {
                    validate_name(&action)?;
                    let names = names.into_vec();
                    if names.iter().any(|name| name.trim().is_empty()) {
                        return Err(RoutingTableError::EmptyCallbackName {
                            domain,
                            entity: key,
                            action,
                        });
                    }
                    config.operations.insert(action, names);
                }
                routes.entities.insert(key, config);
            }

            domains.insert(domain, routes);
        }

        Ok(Self { domains })
    }
}
