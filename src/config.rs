use crate::error::{FaultKind, Result, RouterError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub headers: HeaderRulesConfig,
    #[serde(default)]
    pub mutations: Vec<MutationConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub log_requests: bool,
    #[serde(default)]
    pub log_responses: bool,
    #[serde(default = "default_true")]
    pub mask_api_keys: bool,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_requests: false,
            log_responses: false,
            mask_api_keys: true,
            log_file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    /// Backend protocol family: "openai", "anthropic" or "ollama"
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Per-read timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Model name sent upstream instead of the route name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<FaultKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_status_codes: default_retry_status_codes(),
            backoff_factor: default_backoff_factor(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            retry_on: default_retry_on(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderRulesConfig {
    /// Start from an empty header set instead of the generated one
    #[serde(default)]
    pub drop_all: bool,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub drop_patterns: Vec<String>,
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    #[serde(default)]
    pub force: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub target: MutationTarget,
    pub kind: MutationKindConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationTarget {
    Request,
    Response,
    #[default]
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationKindConfig {
    RegexReplace {
        pattern: String,
        #[serde(default)]
        replacement: String,
        #[serde(default)]
        case_insensitive: bool,
        #[serde(default)]
        multiline: bool,
        #[serde(default)]
        dot_all: bool,
    },
    PathDelete {
        path: String,
    },
    PathInsert {
        path: String,
        value: serde_json::Value,
    },
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_log_file() -> PathBuf {
    PathBuf::from("llm-router.log")
}

fn default_timeout() -> f64 {
    60.0
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_retry_on() -> Vec<FaultKind> {
    vec![FaultKind::Connect, FaultKind::Timeout, FaultKind::Connection]
}

impl RouterConfig {
    /// Load config from a TOML file and apply the environment overlay.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RouterError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|e| {
            RouterError::config(format!("Invalid config file {}: {}", path.display(), e))
        })?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<(Self, PathBuf)> {
        if let Some(path) = explicit_path {
            return Ok((Self::load(path)?, path.to_path_buf()));
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Ok((Self::load(candidate)?, candidate.clone()));
            }
        }

        Err(RouterError::config(format!(
            "No config file found. Searched: {}",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Overlay secrets and server settings from the environment.
    ///
    /// `LLM_ROUTER_MODEL_<NAME>_API_KEY` replaces a route's key,
    /// `LLM_ROUTER_SERVER_PORT` and `LLM_ROUTER_SERVER_HOST` replace the listener.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for route in &mut self.routes {
            if let Some(key) = lookup(&route_key_env(&route.name)) {
                route.api_key = Some(key);
            }
        }

        if let Some(port) = lookup("LLM_ROUTER_SERVER_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(host) = lookup("LLM_ROUTER_SERVER_HOST") {
            self.server.host = host;
        }
    }

    /// Cheap structural checks; pattern and path compilation happens in the registry.
    pub fn validate(&self) -> Result<()> {
        for route in &self.routes {
            if route.name.trim().is_empty() {
                return Err(RouterError::config("Route with an empty name"));
            }
            if !is_positive_secs(route.timeout) || !is_positive_secs(route.connect_timeout) {
                return Err(RouterError::config(format!(
                    "Route '{}': timeouts must be positive and finite",
                    route.name
                )));
            }
            if let Some(ref retry) = route.retry {
                retry.validate(&route.name)?;
            }
        }
        self.retry.validate("default")?;
        Ok(())
    }

    /// Retry policy for a route: its own block or the default one.
    pub fn retry_for<'a>(&'a self, route: &'a RouteConfig) -> &'a RetryConfig {
        route.retry.as_ref().unwrap_or(&self.retry)
    }
}

impl RetryConfig {
    fn validate(&self, owner: &str) -> Result<()> {
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(RouterError::config(format!(
                "Retry policy '{owner}': backoff_factor must be >= 1.0"
            )));
        }
        if !is_delay_secs(self.initial_delay) || !is_delay_secs(self.max_delay) {
            return Err(RouterError::config(format!(
                "Retry policy '{owner}': delays must be finite and not negative"
            )));
        }
        Ok(())
    }
}

fn is_positive_secs(secs: f64) -> bool {
    secs > 0.0 && secs.is_finite()
}

fn is_delay_secs(secs: f64) -> bool {
    secs >= 0.0 && secs.is_finite()
}

pub fn route_key_env(route_name: &str) -> String {
    let normalized: String = route_name
        .chars()
        .map(|c| match c {
            '-' | '.' | '/' | ':' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect();
    format!("LLM_ROUTER_MODEL_{normalized}_API_KEY")
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("llm-router.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("llm-router").join("config.toml"));
    }
    if let Some(home) = dirs_path() {
        paths.push(home.join(".config").join("llm-router").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".llm-router.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[server]
port = 5000

[[routes]]
name = "gpt-4o"
backend = "openai"
api_key_env = "OPENAI_API_KEY"

[[routes]]
name = "claude-sonnet"
backend = "anthropic"
target_model = "claude-sonnet-4-20250514"
timeout = 120
[routes.retry]
max_retries = 1
retry_status_codes = [529]

[headers]
drop = ["x-debug"]
drop_patterns = ["^x-internal-"]
add = { "x-router" = "llm-router" }
force = { "user-agent" = "llm-router/0.1" }

[[mutations]]
name = "rename"
kind = { type = "regex_replace", pattern = "foo", replacement = "bar", case_insensitive = true }

[[mutations]]
name = "strip-metadata"
enabled = false
target = "request"
kind = { type = "path_delete", path = "$.metadata" }
"#;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{SAMPLE}").unwrap();

        let config = RouterConfig::load(f.path()).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].name, "gpt-4o");
        assert_eq!(config.routes[0].connect_timeout, 10.0);
        assert_eq!(
            config.routes[1].target_model.as_deref(),
            Some("claude-sonnet-4-20250514")
        );
        assert_eq!(config.retry_for(&config.routes[1]).max_retries, 1);
        assert_eq!(config.retry_for(&config.routes[0]).max_retries, 3);
        assert_eq!(config.headers.drop_patterns, vec!["^x-internal-"]);
        assert_eq!(config.mutations.len(), 2);
        assert!(!config.mutations[1].enabled);
        assert_eq!(config.mutations[1].target, MutationTarget::Request);
        assert!(matches!(
            config.mutations[0].kind,
            MutationKindConfig::RegexReplace {
                case_insensitive: true,
                ..
            }
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config: RouterConfig = toml::from_str(SAMPLE).unwrap();
        config.apply_env_overrides(|key| match key {
            "LLM_ROUTER_MODEL_CLAUDE_SONNET_API_KEY" => Some("sk-ant-env".to_string()),
            "LLM_ROUTER_SERVER_PORT" => Some("9100".to_string()),
            _ => None,
        });

        assert_eq!(config.routes[1].api_key.as_deref(), Some("sk-ant-env"));
        assert_eq!(config.routes[0].api_key, None);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.retry_status_codes, vec![429, 500, 502, 503, 504]);
        assert!(retry.retry_on.contains(&FaultKind::Connect));
        assert!(!retry.retry_on.contains(&FaultKind::Decode));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let mut config: RouterConfig = toml::from_str(SAMPLE).unwrap();
        config.retry.backoff_factor = 0.5;
        assert!(matches!(
            config.validate(),
            Err(RouterError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rejects_nan_and_infinite_timeouts() {
        for value in ["nan", "inf", "0.0", "-1.0"] {
            let toml = format!(
                "[[routes]]\nname = \"fast\"\nbackend = \"openai\"\ntimeout = {value}\n"
            );
            let config: RouterConfig = toml::from_str(&toml).unwrap();
            assert!(
                matches!(config.validate(), Err(RouterError::Configuration { .. })),
                "{value}"
            );
        }

        let mut config: RouterConfig = toml::from_str(SAMPLE).unwrap();
        config.retry.initial_delay = f64::NAN;
        assert!(config.validate().is_err());
        config.retry.initial_delay = 1.0;
        config.retry.backoff_factor = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_route_key_env() {
        assert_eq!(route_key_env("gpt-4o"), "LLM_ROUTER_MODEL_GPT_4O_API_KEY");
    }
}
