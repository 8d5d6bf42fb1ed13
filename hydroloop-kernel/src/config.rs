use crate::correction::pid::ZonedPidConfig;
use crate::models::CorrectionType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub greenhouse_uid: String,
    pub data_dir: PathBuf,
    pub http: HttpConf,
    pub gateway: GatewayConf,
    pub breaker: BreakerConf,
    pub tracker: TrackerConf,
    pub closed_loop: ClosedLoopConf,
    pub validator: ValidatorLimits,
    pub mqtt: Option<MqttConf>,
    pub correction: CorrectionConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    #[serde(skip)] // HYDROLOOP_API_KEY uniquement
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConf {
    pub base_url: String, // ex: "http://history-logger:9300"
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub source: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BreakerConf {
    pub enabled: bool,
    pub name: String,
    pub failure_threshold: u32,
    pub timeout_secs: f64,
    pub half_open_max_calls: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TrackerConf {
    pub command_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClosedLoopConf {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub rollback_on_timeout: bool,
}

/// Ceilings enforced by the command validator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ValidatorLimits {
    /// PID max output; no single dose may exceed it.
    pub max_dose_ml: f64,
    pub max_run_pump_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CorrectionConf {
    pub ph: CorrectionSettings,
    pub ec: CorrectionSettings,
}

/// Per-metric tuning of the correction controller.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CorrectionSettings {
    pub max_telemetry_age_secs: u64,
    /// Timestamps further in the future than this fail the freshness gate.
    pub max_clock_skew_secs: u64,
    /// Consecutive freshness failures before an alert is raised.
    pub freshness_alert_threshold: u32,
    pub dead_zone: f64,
    /// `diff < -direction_threshold` selects add_base / add_nutrients.
    pub direction_threshold: f64,
    pub default_ml_per_sec: f64,
    /// |diff| beyond which PH_TOO_HIGH/LOW_DETECTED is raised (pH only).
    pub critical_diff: Option<f64>,
    pub dose_delay_sec: f64,
    pub ec_stop_tolerance: f64,
}

fn default_response_topic() -> String {
    "hydro/+/+/+/+/command_response".into()
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            greenhouse_uid: "gh-1".into(),
            data_dir: PathBuf::from("./data"),
            http: HttpConf::default(),
            gateway: GatewayConf::default(),
            breaker: BreakerConf::default(),
            tracker: TrackerConf::default(),
            closed_loop: ClosedLoopConf::default(),
            validator: ValidatorLimits::default(),
            mqtt: Some(MqttConf {
                host: "localhost".into(),
                port: 1883,
                response_topic: default_response_topic(),
            }),
            correction: CorrectionConf::default(),
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into(), api_key: None }
    }
}

impl Default for GatewayConf {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9300".into(),
            token: None,
            timeout_secs: 5,
            source: "automation-engine".into(),
        }
    }
}

impl Default for BreakerConf {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "command-gateway".into(),
            failure_threshold: 5,
            timeout_secs: 30.0,
            half_open_max_calls: 3,
        }
    }
}

impl Default for TrackerConf {
    fn default() -> Self {
        Self { command_timeout_secs: 30 }
    }
}

impl Default for ClosedLoopConf {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            poll_interval_ms: 500,
            rollback_on_timeout: false,
        }
    }
}

impl ValidatorLimits {
    /// Dose ceiling taken from the PID output bound.
    pub fn for_pid(pid: &ZonedPidConfig) -> Self {
        Self {
            max_dose_ml: pid.max_output,
            max_run_pump_ms: 3_600_000,
        }
    }
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        // only pH roles publish `dose`
        Self::for_pid(&ZonedPidConfig::for_type(CorrectionType::Ph))
    }
}

impl Default for CorrectionConf {
    fn default() -> Self {
        Self {
            ph: CorrectionSettings {
                dead_zone: 0.1,
                critical_diff: Some(1.0),
                ..CorrectionSettings::default()
            },
            ec: CorrectionSettings {
                dead_zone: 0.1,
                ..CorrectionSettings::default()
            },
        }
    }
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            max_telemetry_age_secs: 300,
            max_clock_skew_secs: 60,
            freshness_alert_threshold: 3,
            dead_zone: 0.1,
            direction_threshold: 0.0,
            default_ml_per_sec: 1.0,
            critical_diff: None,
            dose_delay_sec: 30.0,
            ec_stop_tolerance: 0.05,
        }
    }
}

impl TrackerConf {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl ClosedLoopConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

impl KernelConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt)
    }

    /// Secrets never live in the YAML file.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("HYDROLOOP_GATEWAY_TOKEN") {
            if !token.is_empty() {
                self.gateway.token = Some(token);
            }
        }
        if let Ok(key) = std::env::var("HYDROLOOP_API_KEY") {
            if !key.is_empty() {
                self.http.api_key = Some(key);
            }
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("HYDROLOOP_CONFIG").unwrap_or_else(|_| "hydroloop.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        KernelConfig::from_yaml_str(&txt).unwrap_or_else(|e| {
            tracing::warn!(path = %path, error = %e, "invalid config, using defaults");
            KernelConfig::default()
        })
    } else {
        tracing::warn!(path = %path, "no config file, using defaults");
        KernelConfig::default()
    };
    cfg.apply_env();
    cfg
}
