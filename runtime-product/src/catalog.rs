//! Product catalog types: the wire representation fetched from
//! `GET <baseURL>/products`, and the compiled form the authorizer walks.
//!
//! Grounded on the config-struct-with-validation shape of
//! `integration-gateway/src/config.rs`, adapted here to a JSON payload
//! instead of environment variables.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use serde::Deserialize;

use runtime_util::PathTree;

/// Request quota template attached to a product or operation-config
/// override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: i64,
    pub interval: i64,
    pub time_unit: TimeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

impl TimeUnit {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "second" | "s" => TimeUnit::Second,
            "minute" | "m" => TimeUnit::Minute,
            "hour" | "h" => TimeUnit::Hour,
            "day" | "d" => TimeUnit::Day,
            "month" => TimeUnit::Month,
            _ => TimeUnit::Minute,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    #[serde(rename = "apiProduct", default)]
    api_product: Vec<ProductRepr>,
}

#[derive(Debug, Deserialize)]
struct AttributeRepr {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct OperationRepr {
    resource: String,
    #[serde(default)]
    methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OperationConfigRepr {
    #[serde(rename = "apiSource")]
    api_source: String,
    #[serde(default)]
    operations: Vec<OperationRepr>,
    quota: Option<String>,
    #[serde(rename = "quotaInterval")]
    quota_interval: Option<String>,
    #[serde(rename = "quotaTimeUnit")]
    quota_time_unit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationGroupRepr {
    #[serde(rename = "operationConfigType", default)]
    operation_config_type: Option<String>,
    #[serde(rename = "operationConfigs", default)]
    operation_configs: Vec<OperationConfigRepr>,
}

#[derive(Debug, Deserialize)]
struct ProductRepr {
    name: String,
    #[serde(default)]
    environments: Vec<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(rename = "apiResources", default)]
    api_resources: Vec<String>,
    #[serde(default)]
    proxies: Vec<String>,
    #[serde(default)]
    attributes: Vec<AttributeRepr>,
    quota: Option<String>,
    #[serde(rename = "quotaInterval")]
    quota_interval: Option<String>,
    #[serde(rename = "quotaTimeUnit")]
    quota_time_unit: Option<String>,
    #[serde(rename = "operationGroup")]
    operation_group: Option<OperationGroupRepr>,
}

fn parse_quota(limit: &Option<String>, interval: &Option<String>, unit: &Option<String>) -> Option<Quota> {
    let limit = limit.as_ref()?.parse().ok()?;
    let interval = interval.as_ref().and_then(|v| v.parse().ok()).unwrap_or(1);
    let time_unit = unit.as_deref().map(TimeUnit::parse).unwrap_or(TimeUnit::Minute);
    Some(Quota { limit, interval, time_unit })
}

const TARGETS_ATTRIBUTE: &str = "apigee-remote-service-targets";

/// A single resource+method entry inside an operation config, hashed as
/// part of the config's deterministic identifier.
fn hash_operations(ops: &[OperationRepr]) -> u64 {
    let mut sorted: Vec<(String, Vec<String>)> = ops
        .iter()
        .map(|op| {
            let mut methods = op.methods.clone();
            methods.sort();
            (op.resource.clone(), methods)
        })
        .collect();
    sorted.sort();
    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    hasher.finish()
}

/// One compiled operation config: a resource+method path tree plus its
/// quota override (falls back to the owning product's quota when absent).
pub struct OperationConfig {
    pub api_source: String,
    pub hash: u64,
    pub quota: Option<Quota>,
    tree: PathTree<()>,
}

impl OperationConfig {
    fn compile(repr: OperationConfigRepr) -> Self {
        let hash = hash_operations(&repr.operations);
        let mut tree = PathTree::new();
        for op in &repr.operations {
            if op.methods.is_empty() {
                tree.insert(&format!("*/{}", op.resource.trim_start_matches('/')), ());
            } else {
                for method in &op.methods {
                    tree.insert(
                        &format!("{}/{}", method.to_ascii_uppercase(), op.resource.trim_start_matches('/')),
                        (),
                    );
                }
            }
        }
        let quota = parse_quota(&repr.quota, &repr.quota_interval, &repr.quota_time_unit);
        Self {
            api_source: repr.api_source,
            hash,
            quota,
            tree,
        }
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        let key = format!("{}/{}", method.to_ascii_uppercase(), path.trim_start_matches('/'));
        self.tree.find(&key).is_some()
    }
}

pub struct OperationGroup {
    pub operation_config_type: String,
    pub configs: Vec<OperationConfig>,
}

/// A compiled product: resources/operation-group ready for
/// [`crate::authorize::ProductAuthorizer`] to walk without re-parsing
/// anything per request.
pub struct Product {
    pub name: String,
    pub environments: HashSet<String>,
    pub scopes: Vec<String>,
    pub targets: Vec<String>,
    pub quota: Option<Quota>,
    pub operation_group: Option<OperationGroup>,
    resource_tree: Option<PathTree<()>>,
}

impl Product {
    fn compile(repr: ProductRepr) -> Self {
        let targets = repr
            .attributes
            .iter()
            .find(|a| a.name == TARGETS_ATTRIBUTE)
            .map(|a| a.value.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or(repr.proxies);

        let operation_group = repr.operation_group.map(|group| OperationGroup {
            operation_config_type: group
                .operation_config_type
                .unwrap_or_else(|| "remoteservice".to_string()),
            configs: group.operation_configs.into_iter().map(OperationConfig::compile).collect(),
        });

        let resource_tree = if operation_group.is_some() {
            None
        } else {
            let mut tree = PathTree::new();
            let resources = if repr.api_resources.is_empty() {
                vec!["/**".to_string()]
            } else {
                repr.api_resources
            };
            for resource in resources {
                let pattern = if resource == "/" { "/**".to_string() } else { resource };
                tree.insert(pattern.trim_start_matches('/'), ());
            }
            Some(tree)
        };

        Self {
            name: repr.name,
            environments: repr.environments.into_iter().collect(),
            scopes: repr.scopes,
            targets,
            quota: parse_quota(&repr.quota, &repr.quota_interval, &repr.quota_time_unit),
            operation_group,
            resource_tree,
        }
    }

    pub fn resource_matches(&self, path: &str) -> bool {
        self.resource_tree
            .as_ref()
            .map(|tree| tree.find(path.trim_start_matches('/')).is_some())
            .unwrap_or(false)
    }

    pub fn scopes_intersect(&self, token_scopes: &[String], is_api_key: bool) -> bool {
        is_api_key || self.scopes.is_empty() || token_scopes.iter().any(|s| self.scopes.contains(s))
    }
}

/// An immutable name→product snapshot, the unit the atomic mux publishes
/// and swaps.
pub struct ProductSnapshot {
    products: HashMap<String, Product>,
}

impl ProductSnapshot {
    pub fn empty() -> Self {
        Self { products: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<&Product> {
        self.products.get(name)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

pub(crate) fn parse_snapshot(body: &str) -> serde_json::Result<ProductSnapshot> {
    let parsed: ProductsResponse = serde_json::from_str(body)?;
    let products = parsed
        .api_product
        .into_iter()
        .map(Product::compile)
        .map(|p| (p.name.clone(), p))
        .collect();
    Ok(ProductSnapshot { products })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_resource_product() {
        let body = r#"{"apiProduct":[{
            "name": "weather",
            "environments": ["test"],
            "scopes": ["read"],
            "apiResources": ["/forecast/*"]
        }]}"#;
        let snapshot = parse_snapshot(body).unwrap();
        let product = snapshot.get("weather").unwrap();
        assert!(product.environments.contains("test"));
        assert!(product.resource_matches("forecast/today"));
        assert!(!product.resource_matches("other"));
    }

    #[test]
    fn root_resource_matches_anything() {
        let body = r#"{"apiProduct":[{"name":"p","apiResources":["/"]}]}"#;
        let snapshot = parse_snapshot(body).unwrap();
        let product = snapshot.get("p").unwrap();
        assert!(product.resource_matches("anything/at/all"));
    }

    #[test]
    fn operation_group_config_matches_resource_and_method() {
        let body = r#"{"apiProduct":[{
            "name": "p",
            "operationGroup": {
                "operationConfigs": [{
                    "apiSource": "weatherapi",
                    "operations": [{"resource": "/forecast/{city}", "methods": ["GET"]}],
                    "quota": "100",
                    "quotaInterval": "1",
                    "quotaTimeUnit": "minute"
                }]
            }
        }]}"#;
        let snapshot = parse_snapshot(body).unwrap();
        let product = snapshot.get("p").unwrap();
        let group = product.operation_group.as_ref().unwrap();
        let config = &group.configs[0];
        assert!(config.matches("GET", "forecast/paris"));
        assert!(!config.matches("POST", "forecast/paris"));
        assert_eq!(config.quota.unwrap().limit, 100);
    }

    #[test]
    fn empty_methods_match_all_verbs() {
        let body = r#"{"apiProduct":[{
            "name": "p",
            "operationGroup": {
                "operationConfigs": [{
                    "apiSource": "weatherapi",
                    "operations": [{"resource": "/forecast", "methods": []}]
                }]
            }
        }]}"#;
        let snapshot = parse_snapshot(body).unwrap();
        let config = &snapshot.get("p").unwrap().operation_group.as_ref().unwrap().configs[0];
        assert!(config.matches("GET", "forecast"));
        assert!(config.matches("DELETE", "forecast"));
    }

    #[test]
    fn targets_attribute_overrides_proxies_list() {
        let body = r#"{"apiProduct":[{
            "name": "p",
            "proxies": ["ignored"],
            "attributes": [{"name": "apigee-remote-service-targets", "value": "weatherapi, otherapi"}]
        }]}"#;
        let snapshot = parse_snapshot(body).unwrap();
        let product = snapshot.get("p").unwrap();
        assert_eq!(product.targets, vec!["weatherapi".to_string(), "otherapi".to_string()]);
    }
}
