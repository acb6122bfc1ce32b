//! Product-authorization walk: §4.7.

use runtime_util::RegistryReader;

use crate::catalog::{Quota, ProductSnapshot};

/// Gateway-supplied request context, merged from verified JWT claims (or
/// an API-key lookup) and the inbound request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub environment: String,
    pub application: String,
    pub products: Vec<String>,
    pub scopes: Vec<String>,
    pub api_key: bool,
}

/// One entitlement the request holds: a product the caller can use, scoped
/// to an environment and (if the product has an operation group) a
/// specific operation config — the quota-bucket key.
#[derive(Debug, Clone)]
pub struct AuthorizedOperation {
    pub id: String,
    pub product_name: String,
    pub environment: String,
    pub application: String,
    pub operation_config_hash: Option<u64>,
    pub quota: Option<Quota>,
}

fn operation_id(product: &str, env: &str, app: &str, hash: Option<u64>) -> String {
    match hash {
        Some(h) => format!("{product}~{env}~{app}~{h:x}"),
        None => format!("{product}~{env}~{app}"),
    }
}

pub struct ProductAuthorizer {
    reader: RegistryReader<ProductSnapshot>,
}

impl ProductAuthorizer {
    pub fn new(reader: RegistryReader<ProductSnapshot>) -> Self {
        Self { reader }
    }

    /// Returns every authorized operation the context's product list
    /// grants for `target_api`/`path`/`method`. The caller enforces each
    /// returned quota independently.
    pub fn authorize(&self, ctx: &AuthContext, target_api: &str, path: &str, method: &str) -> Vec<AuthorizedOperation> {
        let snapshot = self.reader.get();
        let mut matches = Vec::new();

        for name in &ctx.products {
            let Some(product) = snapshot.get(name) else { continue };

            if !product.environments.contains(&ctx.environment) {
                continue;
            }
            if !product.scopes_intersect(&ctx.scopes, ctx.api_key) {
                continue;
            }

            if let Some(group) = &product.operation_group {
                for config in &group.configs {
                    if config.api_source == target_api && config.matches(method, path) {
                        matches.push(AuthorizedOperation {
                            id: operation_id(name, &ctx.environment, &ctx.application, Some(config.hash)),
                            product_name: name.clone(),
                            environment: ctx.environment.clone(),
                            application: ctx.application.clone(),
                            operation_config_hash: Some(config.hash),
                            quota: config.quota.or(product.quota),
                        });
                    }
                }
            } else if product.targets.iter().any(|t| t == target_api) && product.resource_matches(path) {
                matches.push(AuthorizedOperation {
                    id: operation_id(name, &ctx.environment, &ctx.application, None),
                    product_name: name.clone(),
                    environment: ctx.environment.clone(),
                    application: ctx.application.clone(),
                    operation_config_hash: None,
                    quota: product.quota,
                });
            }
        }

        matches
    }
}
