use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BobbConfig {
    #[serde(default)]
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default = "default_agents_dir")]
    pub agents_dir: String,
}

impl Default for BobbConfig {
    fn default() -> Self {
        Self {
            primary: PrimaryConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            registry: RegistryConfig::default(),
            backend: BackendConfig::default(),
            routing: RoutingConfig::default(),
            gateway: GatewayConfig::default(),
            agents_dir: default_agents_dir(),
        }
    }
}

fn default_agents_dir() -> String {
    "~/.bobb/agents".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PrimaryConfig {
    #[serde(default = "default_primary_id")]
    pub id: String,
    #[serde(default = "default_primary_name")]
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_primary_port")]
    pub port: u16,
    #[serde(default = "default_primary_dir")]
    pub dir: String,
}

impl std::fmt::Debug for PrimaryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &mask(&self.token))
            .field("port", &self.port)
            .field("dir", &self.dir)
            .finish()
    }
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            id: default_primary_id(),
            name: default_primary_name(),
            token: String::new(),
            port: default_primary_port(),
            dir: default_primary_dir(),
        }
    }
}

fn default_primary_id() -> String {
    "bobb".to_string()
}

fn default_primary_name() -> String {
    "BoBB".to_string()
}

fn default_primary_port() -> u16 {
    4096
}

fn default_primary_dir() -> String {
    "~/.bobb/bobb".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_orchestrator_id")]
    pub id: String,
    #[serde(default = "default_orchestrator_name")]
    pub name: String,
    #[serde(default = "default_orchestrator_persona")]
    pub persona: String,
    #[serde(default = "default_orchestrator_port")]
    pub port: u16,
    #[serde(default = "default_orchestrator_dir")]
    pub dir: String,
    /// Empty means the deployment runs without an orchestrator
    #[serde(default)]
    pub token: String,
}

impl std::fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("persona", &self.persona)
            .field("port", &self.port)
            .field("dir", &self.dir)
            .field("token", &mask(&self.token))
            .finish()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            id: default_orchestrator_id(),
            name: default_orchestrator_name(),
            persona: default_orchestrator_persona(),
            port: default_orchestrator_port(),
            dir: default_orchestrator_dir(),
            token: String::new(),
        }
    }
}

fn default_orchestrator_id() -> String {
    "obb".to_string()
}

fn default_orchestrator_name() -> String {
    "OBB".to_string()
}

fn default_orchestrator_persona() -> String {
    "Orchestration Bot - manages multi-bot interactions".to_string()
}

fn default_orchestrator_port() -> u16 {
    4095
}

fn default_orchestrator_dir() -> String {
    "~/.bobb/agents/obb".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: String,
    #[serde(default = "default_activations_dir")]
    pub activations_dir: String,
    #[serde(default = "default_child_port_start")]
    pub child_port_start: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            activations_dir: default_activations_dir(),
            child_port_start: default_child_port_start(),
        }
    }
}

fn default_registry_path() -> String {
    "~/.bobb/registry.json".to_string()
}

fn default_activations_dir() -> String {
    "~/.bobb/.activations".to_string()
}

fn default_child_port_start() -> u16 {
    4097
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_command")]
    pub command: String,
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            args: default_backend_args(),
            health_path: default_health_path(),
            health_timeout_ms: default_health_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_backend_command() -> String {
    "opencode".to_string()
}

fn default_backend_args() -> Vec<String> {
    vec!["serve".into(), "--port".into(), "{port}".into()]
}

fn default_health_path() -> String {
    "/api/session".to_string()
}

fn default_health_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_broadcast_marker")]
    pub broadcast_marker: String,
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_history_entry_max_chars")]
    pub history_entry_max_chars: usize,
    #[serde(default = "default_presence_timeout_secs")]
    pub presence_timeout_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            broadcast_marker: default_broadcast_marker(),
            claim_ttl_secs: default_claim_ttl_secs(),
            history_limit: default_history_limit(),
            history_entry_max_chars: default_history_entry_max_chars(),
            presence_timeout_secs: default_presence_timeout_secs(),
        }
    }
}

fn default_broadcast_marker() -> String {
    "@here".to_string()
}

fn default_claim_ttl_secs() -> u64 {
    60
}

fn default_history_limit() -> usize {
    bobb_core::bridge::DEFAULT_HISTORY_LIMIT
}

fn default_history_entry_max_chars() -> usize {
    bobb_core::bridge::DEFAULT_HISTORY_ENTRY_MAX_CHARS
}

fn default_presence_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
        }
    }
}

fn default_gateway_bind() -> String {
    "127.0.0.1:3001".to_string()
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "***" }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bobb")
}

impl BobbConfig {
    /// Load from `custom_path` or `~/.bobb/config.toml`. A missing default
    /// file falls back to built-in defaults so an env-only deployment works.
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        let mut config = if path.exists() || custom_path.is_some() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(metadata) = std::fs::metadata(&path) {
                    let mode = metadata.permissions().mode();
                    if mode & 0o077 != 0 {
                        bail!(
                            "Config file {:?} has overly permissive permissions ({:o}). \
                             It may contain tokens. Fix with: chmod 600 {:?}",
                            path,
                            mode & 0o777,
                            path
                        );
                    }
                }
            }

            let content = std::fs::read_to_string(&path).with_context(|| {
                format!(
                    "Failed to read config at {}. Run `bobb init` first.",
                    path.display()
                )
            })?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config at {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content, |name| std::env::var(name).ok());
        let config: Self = toml::from_str(&expanded)?;

        if looks_hardcoded(&config.primary.token, content, "BOBB_DISCORD_TOKEN") {
            warn!(
                "Primary token is hardcoded in config file. For security, use environment variables: token = \"${{BOBB_DISCORD_TOKEN}}\""
            );
        }
        Ok(config)
    }

    /// Overrides from the deployment environment; invalid numbers are ignored
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty("BOBB_DISCORD_TOKEN") {
            self.primary.token = token;
        }
        if let Some(token) = non_empty("OBB_DISCORD_TOKEN") {
            self.orchestrator.token = token;
        }
        if let Some(port) = parse_env::<u16>("BOBB_OPENCODE_PORT", non_empty("BOBB_OPENCODE_PORT")) {
            self.primary.port = port;
        }
        if let Some(port) =
            parse_env::<u16>("BOBB_CHILD_PORT_START", non_empty("BOBB_CHILD_PORT_START"))
        {
            self.registry.child_port_start = port;
        }
        if let Some(command) = non_empty("OPENCODE_COMMAND") {
            self.backend.command = command;
        }
        if let Some(ms) =
            parse_env::<u64>("OPENCODE_HEALTH_TIMEOUT", non_empty("OPENCODE_HEALTH_TIMEOUT"))
        {
            self.backend.health_timeout_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary.id == self.orchestrator.id {
            bail!(
                "primary and orchestrator must have different ids (both are '{}')",
                self.primary.id
            );
        }
        if self.primary.port == self.orchestrator.port {
            bail!(
                "primary and orchestrator backends cannot share port {}",
                self.primary.port
            );
        }
        let fixed_max = self.primary.port.max(self.orchestrator.port);
        if self.registry.child_port_start <= fixed_max {
            bail!(
                "registry child_port_start {} must be above the primary and orchestrator ports (max {})",
                self.registry.child_port_start,
                fixed_max
            );
        }
        if self.backend.command.trim().is_empty() {
            bail!("backend command must not be empty");
        }
        self.gateway_addr()?;
        Ok(())
    }

    pub fn gateway_addr(&self) -> Result<SocketAddr> {
        self.gateway
            .bind
            .parse()
            .with_context(|| format!("Invalid gateway bind address '{}'", self.gateway.bind))
    }

    pub fn has_orchestrator(&self) -> bool {
        !self.orchestrator.token.trim().is_empty()
    }

    pub fn supervisor_config(&self) -> bobb_runtime::SupervisorConfig {
        bobb_runtime::SupervisorConfig {
            command: self.backend.command.clone(),
            args: self.backend.args.clone(),
            health_path: self.backend.health_path.clone(),
            health_timeout: Duration::from_millis(self.backend.health_timeout_ms),
            poll_interval: Duration::from_millis(self.backend.poll_interval_ms.max(10)),
        }
    }

    pub fn prompt_limits(&self) -> bobb_core::PromptLimits {
        bobb_core::PromptLimits {
            history_limit: self.routing.history_limit,
            entry_max_chars: self.routing.history_entry_max_chars,
        }
    }

    pub fn manager_config(&self) -> bobb_channels::ManagerConfig {
        bobb_channels::ManagerConfig {
            primary_id: self.primary.id.clone(),
            orchestrator_id: self.orchestrator.id.clone(),
            presence_timeout: Duration::from_secs(self.routing.presence_timeout_secs),
            history_limit: self.routing.history_limit,
            claim_ttl: Duration::from_secs(self.routing.claim_ttl_secs),
        }
    }

    pub fn orchestrator_seed(&self) -> bobb_core::OrchestratorSeed {
        bobb_core::OrchestratorSeed {
            id: self.orchestrator.id.clone(),
            name: self.orchestrator.name.clone(),
            persona: self.orchestrator.persona.clone(),
            port: self.orchestrator.port,
        }
    }

    /// Copy with every token replaced by `***`, for display
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.primary.token = mask(&copy.primary.token).to_string();
        copy.orchestrator.token = mask(&copy.orchestrator.token).to_string();
        copy
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}: '{}' is not a valid number", name, value);
            None
        }
    }
}

fn looks_hardcoded(token: &str, raw: &str, var: &str) -> bool {
    !token.is_empty() && !raw.contains(&format!("${{{}}}", var))
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "BOBB_DISCORD_TOKEN",
    "OBB_DISCORD_TOKEN",
    "BOBB_OPENCODE_PORT",
    "BOBB_CHILD_PORT_START",
    "OPENCODE_COMMAND",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // leave it unexpanded so the problem is visible
            pos = abs_start + end + 1;
            continue;
        }

        let value = lookup(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(s: &str) -> PathBuf {
    match (s.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_file_parses() {
        let config: BobbConfig = toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config.primary.id, "bobb");
        assert_eq!(config.primary.port, 4096);
        assert_eq!(config.orchestrator.port, 4095);
        assert_eq!(config.registry.child_port_start, 4097);
        assert_eq!(config.routing.broadcast_marker, "@here");
        assert_eq!(config.gateway.bind, "127.0.0.1:3001");
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: BobbConfig = toml::from_str("").unwrap();
        assert_eq!(config.primary.name, "BoBB");
        assert_eq!(config.orchestrator.name, "OBB");
        assert_eq!(config.backend.args, vec!["serve", "--port", "{port}"]);
        assert_eq!(config.backend.health_timeout_ms, 30_000);
        assert_eq!(config.routing.claim_ttl_secs, 60);
        assert_eq!(config.agents_dir, "~/.bobb/agents");
        assert!(!config.has_orchestrator());
    }

    #[test]
    fn test_expansion_respects_allowlist() {
        let lookup = env(&[("BOBB_DISCORD_TOKEN", "a.b.c"), ("SECRET", "nope")]);
        let out = expand_env_vars("t = \"${BOBB_DISCORD_TOKEN}\" s = \"${SECRET}\"", lookup);
        assert_eq!(out, "t = \"a.b.c\" s = \"${SECRET}\"");

        let out = expand_env_vars("x = \"${OBB_DISCORD_TOKEN}\" ${", env(&[]));
        assert_eq!(out, "x = \"\" ${");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BobbConfig::default();
        config.apply_env_overrides(env(&[
            ("BOBB_DISCORD_TOKEN", "x.y.z"),
            ("BOBB_OPENCODE_PORT", "5000"),
            ("BOBB_CHILD_PORT_START", "not-a-port"),
            ("OPENCODE_COMMAND", "/usr/local/bin/opencode"),
            ("OPENCODE_HEALTH_TIMEOUT", "1500"),
            ("OBB_DISCORD_TOKEN", "  "),
        ]));
        assert_eq!(config.primary.token, "x.y.z");
        assert_eq!(config.primary.port, 5000);
        assert_eq!(config.registry.child_port_start, 4097);
        assert_eq!(config.backend.command, "/usr/local/bin/opencode");
        assert_eq!(
            config.supervisor_config().health_timeout,
            Duration::from_millis(1500)
        );
        assert!(!config.has_orchestrator());
    }

    #[test]
    fn test_validation() {
        let mut config = BobbConfig::default();
        config.orchestrator.id = "bobb".into();
        assert!(config.validate().is_err());

        let mut config = BobbConfig::default();
        config.orchestrator.port = 4096;
        assert!(config.validate().is_err());

        let mut config = BobbConfig::default();
        config.gateway.bind = "localhost".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_child_ports_start_above_fixed_ports() {
        let mut config = BobbConfig::default();
        config.registry.child_port_start = 4095;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("child_port_start"));

        config.registry.child_port_start = 4096;
        assert!(config.validate().is_err());

        config.primary.port = 5000;
        config.registry.child_port_start = 4097;
        assert!(config.validate().is_err());

        config.registry.child_port_start = 5001;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tokens_are_masked() {
        let mut config = BobbConfig::default();
        config.primary.token = "secret.token.value".into();
        config.orchestrator.token = "other.token.value".into();

        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret.token.value"));
        assert!(!debug.contains("other.token.value"));

        let shown = toml::to_string_pretty(&config.masked()).unwrap();
        assert!(shown.contains("***"));
        assert!(!shown.contains("secret.token.value"));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = Some(dir.path().join("missing.toml"));
        assert!(BobbConfig::load(&path).is_err());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/tmp/x"), PathBuf::from("/tmp/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/reg.json"), home.join("reg.json"));
        }
    }
}
