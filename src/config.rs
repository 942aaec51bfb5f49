use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker count used when the configured value is absent or not a positive integer
pub const DEFAULT_WORKERS: usize = 1;

/// Process-wide configuration distributed by the supervisor to every worker
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    /// Listener and pool settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Remote identity service
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Client configuration shared by every app
    #[serde(default)]
    pub client: serde_json::Value,

    /// Registered client applications
    #[serde(default)]
    pub apps: Vec<AppConfig>,

    /// Version tag stamped by the supervisor before distribution
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Desired number of worker processes (default: 1)
    #[serde(default = "default_workers", deserialize_with = "lenient_worker_count")]
    pub workers: usize,

    /// Port every worker listens on (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Expect a PROXY protocol v1 header on every connection
    #[serde(default)]
    pub proxy_protocol: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Time to wait for open connections to finish when a worker closes
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Development mode; a dev-mode worker cannot be clustered
    #[serde(default)]
    pub dev_mode: bool,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            port: default_listen_port(),
            bind: default_bind_address(),
            proxy_protocol: false,
            tls_cert: None,
            tls_key: None,
            drain_timeout_secs: default_drain_timeout(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IdentityConfig {
    /// Base URL of the identity service (`/ping` and `/servicedocument` live below it)
    #[serde(default = "default_identity_url")]
    pub url: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: default_identity_url(),
        }
    }
}

/// A client application mounted under a path prefix
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AppConfig {
    pub name: String,

    /// Mount point, starting and ending with `/`
    pub basepath: String,

    /// Page title for the rendered shell (default: app name)
    pub title: Option<String>,

    /// Whether requests must be authenticated (default: true)
    #[serde(default = "default_true")]
    pub session: bool,

    /// Scope prefixes that never trigger a login redirect
    #[serde(default = "default_allow_unauthenticated")]
    pub allow_unauthenticated: Vec<String>,

    /// Gate requests on pending login actions from the service document
    #[serde(default)]
    pub login_actions: bool,

    /// App-specific client configuration, overlaid on the shared one
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AppConfig {
    pub fn new(name: &str, basepath: &str) -> Self {
        Self {
            name: name.to_string(),
            basepath: basepath.to_string(),
            title: None,
            session: true,
            allow_unauthenticated: default_allow_unauthenticated(),
            login_actions: false,
            config: serde_json::Value::Null,
        }
    }

    /// Disable authentication for this app (builder pattern)
    pub fn public(mut self) -> Self {
        self.session = false;
        self
    }

    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err(format!("App at '{}': 'name' must not be empty", self.basepath));
        }
        if !self.basepath.starts_with('/') || !self.basepath.ends_with('/') {
            return Err(format!(
                "App '{}': basepath '{}' must start and end with '/'",
                self.name, self.basepath
            ));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

/// Accepts a positive integer or a numeric string; anything else falls back to the default
fn lenient_worker_count<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    let count = match raw {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    Ok(count
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_WORKERS))
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_drain_timeout() -> u64 {
    30 // 30 seconds for open connections to finish
}

fn default_identity_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_allow_unauthenticated() -> Vec<String> {
    vec!["api".to_string(), "login".to_string()]
}

impl PoolConfig {
    /// Desired worker count
    pub fn worker_count(&self) -> usize {
        self.server.workers
    }

    /// Port the workers report as listening on
    pub fn port(&self) -> u16 {
        self.server.port
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: PoolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: PoolConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }
        if self.apps.is_empty() {
            errors.push("at least one [[apps]] entry is required".to_string());
        }

        let mut seen = HashSet::new();
        for app in &self.apps {
            if let Err(e) = app.validate() {
                errors.push(e);
            }
            if !seen.insert(app.basepath.as_str()) {
                errors.push(format!("App '{}': duplicate basepath '{}'", app.name, app.basepath));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Where the supervisor loads its configuration from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Url(String),
}

impl ConfigSource {
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            ConfigSource::Url(source.to_string())
        } else {
            ConfigSource::File(PathBuf::from(source))
        }
    }

    pub async fn load(&self) -> anyhow::Result<PoolConfig> {
        match self {
            ConfigSource::File(path) => load_file(path).await,
            ConfigSource::Url(url) => load_url(url).await,
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Url(url) => write!(f, "{}", url),
        }
    }
}

async fn load_file(path: &Path) -> anyhow::Result<PoolConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let is_json = path.extension().is_some_and(|ext| ext == "json");
    if is_json {
        PoolConfig::from_json(&content)
    } else {
        PoolConfig::from_toml(&content)
    }
    .with_context(|| format!("Invalid configuration in {}", path.display()))
}

async fn load_url(url: &str) -> anyhow::Result<PoolConfig> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()
        .with_context(|| format!("Configuration server rejected {}", url))?;
    let content = response.text().await?;
    PoolConfig::from_json(&content).with_context(|| format!("Invalid configuration from {}", url))
}

/// The supervisor's authoritative configuration, replaced wholesale on each load
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: Option<PoolConfig>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&PoolConfig> {
        self.current.as_ref()
    }

    pub fn replace(&mut self, config: PoolConfig) {
        self.current = Some(config);
    }

    /// Configured worker count, or zero before the first successful load
    pub fn worker_count(&self) -> usize {
        self.current.as_ref().map(|c| c.worker_count()).unwrap_or(0)
    }

    pub fn port(&self) -> Option<u16> {
        self.current.as_ref().map(|c| c.port())
    }

    /// Lower the configured worker count to at most `max`, returning the previous count
    pub fn clamp_workers(&mut self, max: usize) -> Option<usize> {
        let config = self.current.as_mut()?;
        let previous = config.server.workers;
        config.server.workers = previous.min(max);
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[apps]]
name = "console"
basepath = "/"
"#;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
workers = 4
port = 3000
bind = "127.0.0.1"
proxy_protocol = true
drain_timeout_secs = 5

[identity]
url = "https://identity.example.com/api"

[client]
theme = "dark"

[[apps]]
name = "console"
basepath = "/console/"
title = "Console"
login_actions = true

[apps.config]
feature = "beta"

[[apps]]
name = "docs"
basepath = "/docs/"
session = false
"#;

        let config = PoolConfig::from_toml(toml).unwrap();
        assert_eq!(config.worker_count(), 4);
        assert_eq!(config.port(), 3000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert!(config.server.proxy_protocol);
        assert_eq!(config.server.drain_timeout(), Duration::from_secs(5));
        assert_eq!(config.identity.url, "https://identity.example.com/api");
        assert_eq!(config.client["theme"], "dark");

        let console = &config.apps[0];
        assert_eq!(console.title(), "Console");
        assert!(console.session);
        assert!(console.login_actions);
        assert_eq!(console.config["feature"], "beta");
        assert_eq!(console.allow_unauthenticated, vec!["api", "login"]);

        let docs = &config.apps[1];
        assert_eq!(docs.title(), "docs");
        assert!(!docs.session);
    }

    #[test]
    fn test_default_server_config() {
        let config = PoolConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.worker_count(), 1);
        assert_eq!(config.port(), 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(!config.server.proxy_protocol);
        assert!(!config.server.tls_enabled());
        assert!(!config.server.dev_mode);
        assert!(config.version.is_none());
    }

    #[test]
    fn test_invalid_worker_counts_fall_back_to_one() {
        for raw in ["0", "-3", "\"many\"", "true", "1.5"] {
            let toml = format!("[server]\nworkers = {}\n{}", raw, MINIMAL);
            let config = PoolConfig::from_toml(&toml).unwrap();
            assert_eq!(config.worker_count(), 1, "workers = {}", raw);
        }
    }

    #[test]
    fn test_numeric_string_worker_count() {
        let toml = format!("[server]\nworkers = \"3\"\n{}", MINIMAL);
        let config = PoolConfig::from_toml(&toml).unwrap();
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_json_config() {
        let json = r#"{
            "server": { "workers": 2, "port": 9090 },
            "apps": [{ "name": "console", "basepath": "/" }]
        }"#;
        let config = PoolConfig::from_json(json).unwrap();
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.port(), 9090);
    }

    #[test]
    fn test_validate_requires_apps() {
        let err = PoolConfig::from_toml("[server]\nport = 80\n").unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn test_validate_basepath_slashes() {
        let toml = r#"
[[apps]]
name = "console"
basepath = "console"
"#;
        let err = PoolConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("must start and end with '/'"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
port = 0
tls_cert = "cert.pem"

[[apps]]
name = "a"
basepath = "/"

[[apps]]
name = "b"
basepath = "/"
"#;
        let err = PoolConfig::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("'port' must be greater than 0"));
        assert!(err.contains("must be set together"));
        assert!(err.contains("duplicate basepath"));
    }

    #[test]
    fn test_config_source_parse() {
        assert_eq!(
            ConfigSource::parse("https://config.local/frontgate.json"),
            ConfigSource::Url("https://config.local/frontgate.json".to_string())
        );
        assert_eq!(
            ConfigSource::parse("config.toml"),
            ConfigSource::File(PathBuf::from("config.toml"))
        );
    }

    #[tokio::test]
    async fn test_load_file_missing() {
        let source = ConfigSource::parse("/nonexistent/frontgate.toml");
        let err = source.load().await.unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[tokio::test]
    async fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frontgate.json");
        std::fs::write(&path, r#"{"apps":[{"name":"console","basepath":"/"}]}"#).unwrap();

        let config = ConfigSource::File(path).load().await.unwrap();
        assert_eq!(config.apps[0].name, "console");
    }

    #[test]
    fn test_store_clamp_workers() {
        let mut store = ConfigStore::new();
        assert_eq!(store.clamp_workers(1), None);
        assert_eq!(store.worker_count(), 0);

        let toml = format!("[server]\nworkers = 4\n{}", MINIMAL);
        store.replace(PoolConfig::from_toml(&toml).unwrap());
        assert_eq!(store.worker_count(), 4);

        assert_eq!(store.clamp_workers(1), Some(4));
        assert_eq!(store.clamp_workers(1), Some(1));
        assert_eq!(store.worker_count(), 1);
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let toml = format!("[server]\nworkers = 3\n{}", MINIMAL);
        let config = PoolConfig::from_toml(&toml).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.worker_count(), 3);
        assert_eq!(decoded.apps.len(), 1);
    }
}
