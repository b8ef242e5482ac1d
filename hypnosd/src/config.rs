//! Configuration loading, validation, and role resolution.
//!
//! Both hosts share one TOML file with `[common]`, `[waker]` and
//! `[sleeper]` tables. Which role an instance plays is either pinned with
//! `common.role` or auto-detected by matching the local hostname against
//! the configured host names. Legacy uppercase table and key spellings
//! are still accepted.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const CONFIG_ENV_VAR: &str = "HYPNOS_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "hypnos.toml";

/// Request timeouts shorter than this stall inside the TCP retry window
/// and report failures late; 3.05s clears it.
const REQUEST_TIMEOUT_FLOOR_SECS: f64 = 3.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Waker,
    Sleeper,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Waker => "waker",
            Role::Sleeper => "sleeper",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(alias = "COMMON")]
    pub common: CommonConf,
    #[serde(alias = "WAKER")]
    pub waker: WakerConf,
    #[serde(alias = "SLEEPER")]
    pub sleeper: SleeperConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConf {
    /// Explicit role pin. Normally absent: the role is resolved from the
    /// local hostname so both hosts can share one config file.
    #[serde(default, alias = "ROLE", skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(alias = "DOMAIN")]
    pub domain: String,
    #[serde(alias = "PORT")]
    pub port: u16,
    #[serde(alias = "API_KEY")]
    pub api_key: String,
    #[serde(default = "default_request_timeout", alias = "DEFAULT_REQUEST_TIMEOUT")]
    pub default_request_timeout: f64,
    #[serde(default = "default_heartbeat_interval", alias = "HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: f64,
    #[serde(default = "default_wake_timeout", alias = "WAKE_TIMEOUT")]
    pub wake_timeout: f64,
    #[serde(default = "default_miss_threshold", alias = "HEARTBEAT_MISS_THRESHOLD")]
    pub heartbeat_miss_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakerConf {
    #[serde(alias = "NAME")]
    pub name: String,
    /// Wake-on-LAN executable, e.g. "/usr/sbin/etherwake" or
    /// "wol -i 192.168.1.255". Absent means native UDP broadcast.
    #[serde(default, alias = "WOL_EXEC", skip_serializing_if = "Option::is_none")]
    pub wol_exec: Option<String>,
    /// Broadcast address for native Wake-on-LAN.
    #[serde(default, alias = "BROADCAST_HINT", skip_serializing_if = "Option::is_none")]
    pub broadcast_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleeperConf {
    #[serde(alias = "NAME")]
    pub name: String,
    #[serde(alias = "MAC_ADDRESS")]
    pub mac_address: String,
    #[serde(alias = "SYSTEMCTL_COMMAND")]
    pub systemctl_command: String,
    #[serde(default = "default_suspend_verb", alias = "SUSPEND_VERB")]
    pub suspend_verb: String,
    #[serde(default = "default_status_verb", alias = "STATUS_VERB")]
    pub status_verb: String,
}

fn default_request_timeout() -> f64 {
    3.0
}

fn default_heartbeat_interval() -> f64 {
    60.0
}

fn default_wake_timeout() -> f64 {
    120.0
}

fn default_miss_threshold() -> u32 {
    3
}

fn default_suspend_verb() -> String {
    "suspend".to_string()
}

fn default_status_verb() -> String {
    "is-system-running".to_string()
}

impl AppConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration file")
    }

    pub fn waker_url(&self) -> String {
        format!(
            "http://{}:{}/waker",
            qualified_host(&self.waker.name, &self.common.domain),
            self.common.port
        )
    }

    pub fn sleeper_url(&self) -> String {
        format!(
            "http://{}:{}/sleeper",
            qualified_host(&self.sleeper.name, &self.common.domain),
            self.common.port
        )
    }

    /// Full config as JSON with the API key hidden, for the config
    /// endpoints.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(common) = value.get_mut("common").and_then(|v| v.as_object_mut()) {
            common.insert(
                "api_key".to_string(),
                serde_json::Value::String("***hidden***".to_string()),
            );
        }
        value
    }
}

impl CommonConf {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_request_timeout.max(REQUEST_TIMEOUT_FLOOR_SECS))
    }

    /// Heartbeat send period. Falls back to the default when the
    /// configured value cannot drive a timer (validation reports it).
    pub fn heartbeat_period(&self) -> Duration {
        match Duration::try_from_secs_f64(self.heartbeat_interval) {
            Ok(period) if !period.is_zero() => period,
            _ => Duration::from_secs_f64(default_heartbeat_interval()),
        }
    }
}

fn qualified_host(name: &str, domain: &str) -> String {
    if domain.is_empty() {
        name.to_string()
    } else {
        format!("{name}.{domain}")
    }
}

fn resolve_config_path() -> Result<PathBuf> {
    let path = std::env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    if !path.exists() {
        bail!(
            "config file {} not found (set {} to override)",
            path.display(),
            CONFIG_ENV_VAR
        );
    }
    Ok(path)
}

pub async fn load() -> Result<AppConfig> {
    let path = resolve_config_path()?;
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    AppConfig::parse(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Check the loaded config for operational problems. Returns every
/// problem found rather than stopping at the first; the health endpoint
/// reports the same list.
pub fn validate(cfg: &AppConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if cfg.common.api_key.trim().is_empty() {
        errors.push("common.api_key must not be empty".to_string());
    }
    if cfg.common.port == 0 {
        errors.push("common.port must not be 0".to_string());
    }
    if cfg.common.heartbeat_interval <= 0.0 {
        errors.push("common.heartbeat_interval must be positive".to_string());
    }
    if cfg.common.wake_timeout <= 0.0 {
        errors.push("common.wake_timeout must be positive".to_string());
    }
    if cfg.common.heartbeat_miss_threshold == 0 {
        errors.push("common.heartbeat_miss_threshold must be at least 1".to_string());
    }
    if cfg.waker.name.eq_ignore_ascii_case(&cfg.sleeper.name) {
        errors.push("waker.name and sleeper.name must differ".to_string());
    }
    if cfg.sleeper.systemctl_command.trim().is_empty() {
        errors.push("sleeper.systemctl_command must not be empty".to_string());
    }
    if crate::wol::parse_mac(&cfg.sleeper.mac_address).is_err() {
        errors.push(format!(
            "sleeper.mac_address {:?} is not a valid MAC address",
            cfg.sleeper.mac_address
        ));
    }
    errors
}

/// Resolve which role this instance plays.
pub fn resolve_role(cfg: &AppConfig) -> Result<Role> {
    if let Some(role) = cfg.common.role {
        return Ok(role);
    }
    let host = hostname::get().context("failed to read local hostname")?;
    resolve_role_for_host(cfg, &host.to_string_lossy())
}

pub fn resolve_role_for_host(cfg: &AppConfig, local_hostname: &str) -> Result<Role> {
    let local = local_hostname.to_lowercase();
    let is_waker = role_candidates(&cfg.waker.name, &cfg.common.domain).contains(&local);
    let is_sleeper = role_candidates(&cfg.sleeper.name, &cfg.common.domain).contains(&local);
    match (is_waker, is_sleeper) {
        (true, true) => bail!("Hostname matches both waker and sleeper: {local_hostname}"),
        (true, false) => Ok(Role::Waker),
        (false, true) => Ok(Role::Sleeper),
        (false, false) => {
            bail!("Hostname did not match waker or sleeper config: {local_hostname}")
        }
    }
}

fn role_candidates(name: &str, domain: &str) -> HashSet<String> {
    let mut candidates = HashSet::new();
    candidates.insert(name.to_lowercase());
    if !domain.is_empty() {
        candidates.insert(format!("{name}.{domain}").to_lowercase());
    }
    candidates
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig::parse(
        r#"
[common]
domain = "test.local"
port = 5000
api_key = "test-api-key"
default_request_timeout = 3.0

[waker]
name = "test-waker"
wol_exec = "/usr/sbin/etherwake"

[sleeper]
name = "test-sleeper"
mac_address = "00:11:22:33:44:55"
systemctl_command = "/usr/bin/systemctl"
"#,
    )
    .expect("test config parses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let cfg = test_config();
        assert_eq!(cfg.common.heartbeat_interval, 60.0);
        assert_eq!(cfg.common.wake_timeout, 120.0);
        assert_eq!(cfg.common.heartbeat_miss_threshold, 3);
        assert_eq!(cfg.sleeper.suspend_verb, "suspend");
        assert_eq!(cfg.sleeper.status_verb, "is-system-running");
        assert!(cfg.common.role.is_none());
    }

    #[test]
    fn accepts_legacy_uppercase_spelling() {
        let cfg = AppConfig::parse(
            r#"
[COMMON]
ROLE = "waker"
DOMAIN = "test.local"
PORT = 5000
DEFAULT_REQUEST_TIMEOUT = 3
API_KEY = "test-api-key"

[WAKER]
name = "test-waker"
wol_exec = "/usr/sbin/etherwake"

[SLEEPER]
name = "test-sleeper"
mac_address = "00:11:22:33:44:55"
systemctl_command = "/usr/bin/systemctl"
suspend_verb = "suspend"
status_verb = "is-system-running"
"#,
        )
        .unwrap();
        assert_eq!(cfg.common.role, Some(Role::Waker));
        assert_eq!(cfg.common.domain, "test.local");
        assert_eq!(cfg.waker.name, "test-waker");
    }

    #[test]
    fn request_timeout_has_a_floor() {
        let mut cfg = test_config();
        cfg.common.default_request_timeout = 1.0;
        assert_eq!(cfg.common.request_timeout(), Duration::from_secs_f64(3.05));
        cfg.common.default_request_timeout = 10.0;
        assert_eq!(cfg.common.request_timeout(), Duration::from_secs_f64(10.0));
    }

    #[test]
    fn url_generation() {
        let cfg = test_config();
        assert_eq!(cfg.waker_url(), "http://test-waker.test.local:5000/waker");
        assert_eq!(cfg.sleeper_url(), "http://test-sleeper.test.local:5000/sleeper");
    }

    #[test]
    fn redacted_hides_api_key() {
        let value = test_config().redacted();
        assert_eq!(value["common"]["api_key"], "***hidden***");
        assert_eq!(value["sleeper"]["mac_address"], "00:11:22:33:44:55");
    }

    #[test]
    fn validate_accepts_good_config() {
        assert!(validate(&test_config()).is_empty());
    }

    #[test]
    fn validate_collects_all_problems() {
        let mut cfg = test_config();
        cfg.common.api_key = String::new();
        cfg.common.heartbeat_miss_threshold = 0;
        cfg.sleeper.mac_address = "nonsense".to_string();
        let errors = validate(&cfg);
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn explicit_role_wins_over_hostname() {
        let mut cfg = test_config();
        cfg.common.role = Some(Role::Sleeper);
        assert_eq!(resolve_role(&cfg).unwrap(), Role::Sleeper);
    }

    #[test]
    fn role_matches_short_hostname() {
        let cfg = test_config();
        assert_eq!(
            resolve_role_for_host(&cfg, "test-waker").unwrap(),
            Role::Waker
        );
        assert_eq!(
            resolve_role_for_host(&cfg, "test-sleeper").unwrap(),
            Role::Sleeper
        );
    }

    #[test]
    fn role_matches_fqdn_case_insensitively() {
        let cfg = test_config();
        assert_eq!(
            resolve_role_for_host(&cfg, "Test-Waker.Test.Local").unwrap(),
            Role::Waker
        );
    }

    #[test]
    fn ambiguous_hostname_is_an_error() {
        let mut cfg = test_config();
        cfg.sleeper.name = cfg.waker.name.clone();
        let err = resolve_role_for_host(&cfg, "test-waker").unwrap_err();
        assert!(err.to_string().contains("matches both waker and sleeper"));
    }

    #[test]
    fn unknown_hostname_is_an_error() {
        let cfg = test_config();
        let err = resolve_role_for_host(&cfg, "unrelated-host").unwrap_err();
        assert!(err
            .to_string()
            .contains("did not match waker or sleeper config"));
    }

    #[tokio::test]
    async fn load_reads_path_from_env_var() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hypnos.toml");
        std::fs::write(
            &path,
            r#"
[common]
domain = "test.local"
port = 5000
api_key = "k"

[waker]
name = "w"

[sleeper]
name = "s"
mac_address = "00:11:22:33:44:55"
systemctl_command = "/usr/bin/systemctl"
"#,
        )
        .unwrap();
        std::env::set_var(CONFIG_ENV_VAR, &path);
        let cfg = load().await.unwrap();
        std::env::remove_var(CONFIG_ENV_VAR);
        assert_eq!(cfg.common.domain, "test.local");
        assert!(cfg.waker.wol_exec.is_none());
    }
}
