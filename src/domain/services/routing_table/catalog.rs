use std::collections::BTreeMap;

use serde::Serialize;

use super::RoutingTable;
use crate::domain::models::RoutingKey;

/// Routing keys of one domain: entity -> action -> key, plus the domain
/// wildcard under `stars`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainKeys {
    #[serde(flatten)]
    pub entities: BTreeMap<String, BTreeMap<String, RoutingKey>>,
    pub stars: RoutingKey,
}

/// Canonical routing keys producers publish under, generated from a
/// routing table so publishers and consumers never disagree on spelling.
///
/// Serializes as `{domain: {entity: {action: "entity.action"}, "stars": "domain.*"}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RoutingKeyCatalog {
    domains: BTreeMap<String, DomainKeys>,
}

impl RoutingKeyCatalog {
    pub fn generate(table: &RoutingTable) -> Self {
        let domains = table
            .domains()
            .map(|(domain, routes)| {
                let entities = routes
                    .entities
                    .iter()
                    .map(|(entity, config)| {
                        let actions = config
                            .operations
                            .keys()
                            .map(|action| (action.clone(), RoutingKey::for_event(entity, action)))
                            .collect();
                        (entity.clone(), actions)
                    })
                    .collect();

                let keys = DomainKeys {
                    entities,
                    stars: RoutingKey::domain_wildcard(domain),
                };
                (domain.to_owned(), keys)
            })
            .collect();

        Self { domains }
    }

    /// Key for an entity event declared in the table
    pub fn key(&self, domain: &str, entity: &str, action: &str) -> Option<&RoutingKey> {
        self.domains.get(domain)?.entities.get(entity)?.get(action)
    }

    /// `<domain>.*` pattern of a declared domain
    pub fn stars(&self, domain: &str) -> Option<&RoutingKey> {
        self.domains.get(domain).map(|keys| &keys.stars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_canonical_keys() {
        let table = RoutingTable::from_json_str(
            r#"{"catalog": {"Service": {"created": "default", "deleted": "default"}}}"#,
        )
        .unwrap();
        let catalog = RoutingKeyCatalog::generate(&table);

        assert_eq!(
            catalog.key("catalog", "Service", "created").map(RoutingKey::as_str),
            Some("service.created")
        );
        assert_eq!(catalog.stars("catalog").map(RoutingKey::as_str), Some("catalog.*"));
        assert_eq!(catalog.key("catalog", "Service", "updated"), None);

        assert_eq!(
            serde_json::to_value(&catalog).unwrap(),
            json!({
                "catalog": {
                    "Service": {"created": "service.created", "deleted": "service.deleted"},
                    "stars": "catalog.*"
                }
            })
        );
    }
}
