//! TOML config file loading, environment overrides and validation.
//!
//! Every field has a default, so a missing file simply means "run with
//! defaults". Environment variables override the file; this is how the
//! broker credentials and the telemetry switch are usually supplied.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::solar::DEFAULT_BASE_URL;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub solar: SolarConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_sec: u64,
    /// How long startup waits for CONNACK / SUBACK before giving up.
    pub connect_timeout_sec: u64,
    /// Upper bound on a single scheduled publish.
    pub publish_timeout_sec: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "automation-hub".to_string(),
            username: None,
            password: None,
            keep_alive_sec: 30,
            connect_timeout_sec: 10,
            publish_timeout_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub rules_path: PathBuf,
    pub telemetry_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            rules_path: PathBuf::from("config.json"),
            telemetry_path: PathBuf::from("temperature.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolarConfig {
    pub base_url: String,
    pub timeout_sec: u64,
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Subscribe to `Temperature` / `Humidity`. Hubs that only drive
    /// actuators turn this off.
    pub enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

fn parse_bool(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

impl Config {
    /// Apply overrides from `var` (normally `std::env::var`).
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = var("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT '{v}' is not a port number"))?;
        }
        if let Some(v) = var("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = var("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = var("WEB_PORT") {
            self.web.port = v
                .parse()
                .with_context(|| format!("WEB_PORT '{v}' is not a port number"))?;
        }
        if let Some(v) = var("RULES_PATH") {
            self.storage.rules_path = PathBuf::from(v);
        }
        if let Some(v) = var("TELEMETRY_PATH") {
            self.storage.telemetry_path = PathBuf::from(v);
        }
        if let Some(v) = var("TELEMETRY_ENABLED") {
            self.telemetry.enabled = parse_bool(&v);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_storage(&mut errors);

        if self.web.port == 0 {
            errors.push("web.port must not be 0".to_string());
        }

        if !(self.solar.base_url.starts_with("http://")
            || self.solar.base_url.starts_with("https://"))
        {
            errors.push(format!(
                "solar.base_url '{}' must be an http(s) URL",
                self.solar.base_url
            ));
        }
        if self.solar.timeout_sec == 0 {
            errors.push("solar.timeout_sec must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt.port must not be 0".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }

        // ── Credentials come as a pair ──────────────────────────
        match (&m.username, &m.password) {
            (Some(_), None) => errors.push("mqtt.username set without mqtt.password".to_string()),
            (None, Some(_)) => errors.push("mqtt.password set without mqtt.username".to_string()),
            _ => {}
        }

        // ── Timing values (all must be positive) ────────────────
        if m.keep_alive_sec == 0 {
            errors.push("mqtt.keep_alive_sec must be positive".to_string());
        }
        if m.connect_timeout_sec == 0 {
            errors.push("mqtt.connect_timeout_sec must be positive".to_string());
        }
        if m.publish_timeout_sec == 0 {
            errors.push("mqtt.publish_timeout_sec must be positive".to_string());
        }
    }

    fn validate_storage(&self, errors: &mut Vec<String>) {
        let s = &self.storage;

        if s.rules_path.as_os_str().is_empty() {
            errors.push("storage.rules_path is empty".to_string());
        }
        if s.telemetry_path.as_os_str().is_empty() {
            errors.push("storage.telemetry_path is empty".to_string());
        }
        if s.rules_path == s.telemetry_path {
            errors.push(format!(
                "storage.rules_path and storage.telemetry_path are both '{}'",
                s.rules_path.display()
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML config string.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents)?;
    Ok(config)
}

/// Read the config file (defaults when absent), apply environment
/// overrides and validate the result.
pub fn load(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        parse(&contents).with_context(|| format!("failed to parse config: {}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };

    config.apply_overrides(|name| std::env::var(name).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
