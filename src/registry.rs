use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::config::{RouteConfig, RouterConfig, ServerConfig};
use crate::error::{Result, RouterError};
use crate::mutation::{ContentPipeline, HeaderRules};
use crate::providers::Protocol;
use crate::retry::RetryPolicy;
use crate::transport::Timeouts;

/// Everything the relay needs to call one backend.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    /// Logical name callers use
    pub name: String,
    pub protocol: Protocol,
    pub endpoint: String,
    /// Full request URL (endpoint plus the protocol's path)
    pub url: String,
    pub api_key: Option<String>,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub target_model: Option<String>,
}

impl ModelRoute {
    /// Name sent in the outgoing request's model field.
    pub fn upstream_model(&self) -> &str {
        self.target_model.as_deref().unwrap_or(&self.name)
    }

    fn from_config(route: &RouteConfig, retry: RetryPolicy) -> Result<Self> {
        let protocol = Protocol::from_name(&route.backend)
            .map_err(|e| RouterError::config(format!("Route '{}': {}", route.name, e)))?;
        let preset = protocol.preset();

        let endpoint = route
            .endpoint
            .clone()
            .unwrap_or_else(|| preset.default_endpoint.to_string());
        let url = format!("{}{}", endpoint.trim_end_matches('/'), preset.path);
        reqwest::Url::parse(&url).map_err(|e| {
            RouterError::config(format!("Route '{}': invalid endpoint '{}': {}", route.name, endpoint, e))
        })?;

        let api_key = route.api_key.clone().or_else(|| {
            route
                .api_key_env
                .as_deref()
                .or(preset.default_api_key_env)
                .and_then(|var| std::env::var(var).ok())
        });

        Ok(Self {
            name: route.name.clone(),
            protocol,
            endpoint,
            url,
            api_key,
            timeouts: Timeouts {
                connect: Duration::try_from_secs_f64(route.connect_timeout).unwrap_or_default(),
                read: Duration::try_from_secs_f64(route.timeout).unwrap_or_default(),
            },
            retry,
            target_model: route.target_model.clone(),
        })
    }
}

/// Audit settings carried with the snapshot so a reload can change them.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditSettings {
    pub log_requests: bool,
    pub log_responses: bool,
    pub mask_api_keys: bool,
}

impl From<&ServerConfig> for AuditSettings {
    fn from(server: &ServerConfig) -> Self {
        Self {
            log_requests: server.log_requests,
            log_responses: server.log_responses,
            mask_api_keys: server.mask_api_keys,
        }
    }
}

/// One immutable configuration snapshot.
#[derive(Debug, Default)]
pub struct Registry {
    routes: Vec<Arc<ModelRoute>>,
    by_name: HashMap<String, usize>,
    pub headers: HeaderRules,
    pub content: ContentPipeline,
    pub audit: AuditSettings,
}

impl Registry {
    /// Compile a validated config. Fails on duplicate names, unknown backends,
    /// and bad patterns or paths, before any network activity.
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        config.validate()?;
        let mut routes = Vec::with_capacity(config.routes.len());
        let mut by_name = HashMap::new();

        for route in &config.routes {
            if by_name.contains_key(&route.name) {
                return Err(RouterError::config(format!(
                    "Duplicate route name '{}'",
                    route.name
                )));
            }
            let retry = RetryPolicy::from_config(config.retry_for(route));
            by_name.insert(route.name.clone(), routes.len());
            routes.push(Arc::new(ModelRoute::from_config(route, retry)?));
        }

        Ok(Self {
            routes,
            by_name,
            headers: HeaderRules::compile(&config.headers)?,
            content: ContentPipeline::compile(&config.mutations)?,
            audit: AuditSettings::from(&config.server),
        })
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ModelRoute>> {
        self.by_name
            .get(name)
            .map(|&i| self.routes[i].clone())
            .ok_or_else(|| RouterError::config(format!("Unknown model '{}'", name)))
    }

    /// Logical model names in configured order.
    pub fn model_names(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.name.clone()).collect()
    }

    pub fn routes(&self) -> &[Arc<ModelRoute>] {
        &self.routes
    }
}

/// Shared pointer to the live snapshot. Readers pin an `Arc<Registry>` for the
/// whole call; `swap` only affects calls that start afterwards.
#[derive(Debug)]
pub struct RegistryHandle(RwLock<Arc<Registry>>);

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self(RwLock::new(Arc::new(registry)))
    }

    pub fn current(&self) -> Arc<Registry> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Install a new snapshot, returning the one it replaced.
    pub fn swap(&self, registry: Registry) -> Arc<Registry> {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> RouterConfig {
        toml::from_str(toml).unwrap()
    }

    const ROUTES: &str = r#"
[[routes]]
name = "fast"
backend = "openai"
endpoint = "http://localhost:9000/v1/"
api_key = "sk-test"

[[routes]]
name = "smart"
backend = "anthropic"
target_model = "claude-sonnet-4-20250514"
[routes.retry]
max_retries = 1
"#;

    #[test]
    fn test_resolve_and_names() {
        let registry = Registry::from_config(&config(ROUTES)).unwrap();
        assert_eq!(registry.model_names(), vec!["fast", "smart"]);

        let fast = registry.resolve("fast").unwrap();
        assert_eq!(fast.url, "http://localhost:9000/v1/chat/completions");
        assert_eq!(fast.upstream_model(), "fast");
        assert_eq!(fast.retry.max_retries, 3);

        let smart = registry.resolve("smart").unwrap();
        assert_eq!(smart.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(smart.upstream_model(), "claude-sonnet-4-20250514");
        assert_eq!(smart.retry.max_retries, 1);

        assert!(matches!(
            registry.resolve("missing"),
            Err(RouterError::Configuration { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let toml = r#"
[[routes]]
name = "a"
backend = "openai"

[[routes]]
name = "a"
backend = "ollama"
"#;
        let err = Registry::from_config(&config(toml)).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let toml = r#"
[[routes]]
name = "a"
backend = "bedrock"
"#;
        assert!(matches!(
            Registry::from_config(&config(toml)),
            Err(RouterError::Configuration { .. })
        ));
    }

    #[test]
    fn test_nan_timeout_rejected() {
        let toml = r#"
[[routes]]
name = "a"
backend = "openai"
connect_timeout = nan
"#;
        assert!(matches!(
            Registry::from_config(&config(toml)),
            Err(RouterError::Configuration { .. })
        ));
    }

    #[test]
    fn test_swap_keeps_pinned_snapshot() {
        let handle = RegistryHandle::new(Registry::from_config(&config(ROUTES)).unwrap());
        let pinned = handle.current();
        let route = pinned.resolve("fast").unwrap();

        handle.swap(Registry::default());

        assert!(handle.current().resolve("fast").is_err());
        assert_eq!(pinned.resolve("fast").unwrap().url, route.url);
        assert_eq!(route.name, "fast");
    }
}
