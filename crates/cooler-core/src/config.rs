//! Typed, validated configuration shared by all four binaries.
//!
//! Parsed once at startup from a TOML file (`-c <config>`); a missing or
//! out-of-range field is a fatal `ConfigInvalid`, never a silent default.
//! Covers the mode/duty table, scheduler/fault timings, and the MQTT/DB
//! endpoints each binary needs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoolerError;
use crate::model::Duty;

/// One entry of the staged classifier's rule table. The condition is
/// expressed through a small threshold-on-metric DSL so it round-trips
/// through TOML instead of being an arbitrary closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    pub metric: String,
    pub at_least: f64,
    pub mode_index: u16,
}

/// MQTT connection + topic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_control_topic")]
    pub control_topic: String,
    #[serde(default = "default_relay_topic")]
    pub relay_topic: String,
    #[serde(default = "default_fault_topic")]
    pub fault_topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_control_topic() -> String {
    "cooler/control".to_string()
}
fn default_relay_topic() -> String {
    "cooler/relay".to_string()
}
fn default_fault_topic() -> String {
    "cooler/fault".to_string()
}

/// Sensor query + mode decider timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeciderConfig {
    #[serde(default = "default_lookback_sec")]
    pub lookback_sec: u64,
    #[serde(default = "default_stale_threshold_sec")]
    pub stale_threshold_sec: u64,
    #[serde(default = "default_stale_keep_ticks")]
    pub stale_keep_ticks: u32,
    pub rules: Vec<RuleEntry>,
    pub modes: Vec<Duty>,
    #[serde(default = "default_up_debounce")]
    pub up_debounce_ticks: u32,
    #[serde(default = "default_down_debounce")]
    pub down_debounce_ticks: u32,
}

fn default_lookback_sec() -> u64 {
    300
}
fn default_stale_threshold_sec() -> u64 {
    300
}
fn default_stale_keep_ticks() -> u32 {
    2
}
fn default_up_debounce() -> u32 {
    3
}
fn default_down_debounce() -> u32 {
    6
}

/// Publisher / proxy / subscriber timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    #[serde(default = "default_pub_interval_sec")]
    pub pub_interval_sec: u64,
    #[serde(default = "default_replay_deadline_ms")]
    pub replay_deadline_ms: u64,
    #[serde(default = "default_liveness_multiplier")]
    pub liveness_multiplier: u32,
}

fn default_pub_interval_sec() -> u64 {
    10
}
fn default_replay_deadline_ms() -> u64 {
    200
}
fn default_liveness_multiplier() -> u32 {
    3
}

impl PubSubConfig {
    pub fn liveness_timeout_sec(&self) -> u64 {
        self.pub_interval_sec * self.liveness_multiplier as u64
    }
}

/// Flow sampler + fault detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    #[serde(default = "default_flow_window_sec")]
    pub flow_window_sec: u64,
    #[serde(default = "default_grace_open_sec")]
    pub grace_open_sec: u64,
    #[serde(default = "default_grace_close_sec")]
    pub grace_close_sec: u64,
    #[serde(default = "default_min_flow")]
    pub min_flow_lpm: f64,
    #[serde(default = "default_leak_threshold")]
    pub leak_threshold_lpm: f64,
    #[serde(default = "default_noise_ratio")]
    pub noise_ratio: f64,
    #[serde(default = "default_unstable_window_sec")]
    pub unstable_window_sec: u64,
    #[serde(default = "default_recover_hold_sec")]
    pub recover_hold_sec: u64,
    /// `None` (the default) means `FLOW_WHILE_CLOSED` requires a manual
    /// clear; `Some(seconds)` opts into automatic recovery after that hold.
    #[serde(default)]
    pub auto_recover_sec: Option<u64>,
}

fn default_flow_window_sec() -> u64 {
    3
}
fn default_grace_open_sec() -> u64 {
    5
}
fn default_grace_close_sec() -> u64 {
    3
}
fn default_min_flow() -> f64 {
    0.5
}
fn default_leak_threshold() -> f64 {
    0.3
}
fn default_noise_ratio() -> f64 {
    0.5
}
fn default_unstable_window_sec() -> u64 {
    10
}
fn default_recover_hold_sec() -> u64 {
    15
}

/// Event log + metrics store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
    /// Where to `VACUUM INTO` periodic backups, and restore from on boot if
    /// `db_path`'s working copy is missing or empty — lets `db_path` live
    /// on tmpfs to cut SD-card write wear while still surviving a reboot.
    #[serde(default)]
    pub backup_path: Option<String>,
    #[serde(default = "default_ring_size")]
    pub ring_size: usize,
    #[serde(default = "default_sse_queue_max")]
    pub sse_queue_max: usize,
    #[serde(default = "default_write_queue_max")]
    pub write_queue_max: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_backup_interval_hours")]
    pub backup_interval_hours: u64,
}

fn default_ring_size() -> usize {
    1000
}
fn default_sse_queue_max() -> usize {
    64
}
fn default_write_queue_max() -> usize {
    1024
}
fn default_retention_days() -> i64 {
    400
}
fn default_backup_interval_hours() -> u64 {
    24
}

/// Optional Slack webhook for rate-limited hardware-fault notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: Option<String>,
    #[serde(default = "default_slack_rate_limit_sec")]
    pub rate_limit_sec: u64,
}

fn default_slack_rate_limit_sec() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Cost per liter used by the webui's `/api/watering` to derive a daily
    /// spend figure alongside integrated volume. `0.0` (the default) reports
    /// volume only.
    #[serde(default)]
    pub water_cost_per_liter: f64,
}

fn default_web_port() -> u16 {
    8080
}

/// Actuator-only hardware wiring: valve/echo GPIO pins, flow-sample rate,
/// and the deterministic simulator's parameters for `-d`/dummy mode.
/// `None` at the `Config` level means "no GPIO pins configured" — the
/// actuator falls back to `MockValveDriver`/`SimFlowSource` regardless of
/// `-d`, which is the only sane behavior off real hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub valve_pin: u8,
    #[serde(default)]
    pub echo_pin: Option<u8>,
    /// GPIO pin the flow sensor's pulse output is wired to.
    pub flow_pin: u8,
    #[serde(default = "default_flow_sample_hz")]
    pub flow_sample_hz: f64,
    #[serde(default = "default_sim_base_lpm")]
    pub sim_base_lpm: f64,
    #[serde(default = "default_sim_noise_sigma")]
    pub sim_noise_sigma: f64,
    #[serde(default = "default_sim_leak_lpm")]
    pub sim_leak_lpm: f64,
}

fn default_flow_sample_hz() -> f64 {
    10.0
}
fn default_sim_base_lpm() -> f64 {
    3.0
}
fn default_sim_noise_sigma() -> f64 {
    0.1
}
fn default_sim_leak_lpm() -> f64 {
    0.0
}

/// Root configuration tree, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub decider: DeciderConfig,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub fault: FaultConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub hardware: Option<HardwareConfig>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            pub_interval_sec: default_pub_interval_sec(),
            replay_deadline_ms: default_replay_deadline_ms(),
            liveness_multiplier: default_liveness_multiplier(),
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            flow_window_sec: default_flow_window_sec(),
            grace_open_sec: default_grace_open_sec(),
            grace_close_sec: default_grace_close_sec(),
            min_flow_lpm: default_min_flow(),
            leak_threshold_lpm: default_leak_threshold(),
            noise_ratio: default_noise_ratio(),
            unstable_window_sec: default_unstable_window_sec(),
            recover_hold_sec: default_recover_hold_sec(),
            auto_recover_sec: None,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            water_cost_per_liter: 0.0,
        }
    }
}

impl Config {
    /// Parse `path` as TOML and validate it. Any failure is a
    /// `ConfigInvalid` — callers should treat it as fatal (exit code 1).
    pub fn load(path: impl AsRef<Path>) -> Result<Config, CoolerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoolerError::config_invalid(format!("reading {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| CoolerError::config_invalid(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on anything a downstream component would otherwise have to
    /// guard against at runtime.
    pub fn validate(&self) -> Result<(), CoolerError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(CoolerError::config_invalid("mqtt.host must not be empty"));
        }
        if self.decider.modes.is_empty() {
            return Err(CoolerError::config_invalid(
                "decider.modes must have at least one entry (mode 0)",
            ));
        }
        for rule in &self.decider.rules {
            if rule.mode_index as usize >= self.decider.modes.len() {
                return Err(CoolerError::config_invalid(format!(
                    "rule targets mode_index {} but only {} modes are configured",
                    rule.mode_index,
                    self.decider.modes.len()
                )));
            }
        }
        if self.storage.db_path.trim().is_empty() {
            return Err(CoolerError::config_invalid("storage.db_path must not be empty"));
        }
        if self.storage.ring_size == 0 {
            return Err(CoolerError::config_invalid("storage.ring_size must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        [mqtt]
        host = "localhost"

        [decider]
        modes = [
            { enable = false, on_sec = 0, off_sec = 0 },
            { enable = true, on_sec = 60, off_sec = 120 },
        ]
        rules = [
            { metric = "power", at_least = 500.0, mode_index = 1 },
        ]

        [storage]
        db_path = "/tmp/cooler.db"
        "#
    }

    #[test]
    fn parse_minimal_config() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.decider.modes.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_host() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.mqtt.host = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_rule_targeting_missing_mode() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.decider.rules[0].mode_index = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_mode_table() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.decider.modes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn liveness_timeout_derives_from_pub_interval() {
        let pubsub = PubSubConfig::default();
        assert_eq!(pubsub.liveness_timeout_sec(), 30);
    }

    #[test]
    fn load_missing_file_is_config_invalid() {
        let err = Config::load("/nonexistent/path.toml").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigInvalid);
    }
}
