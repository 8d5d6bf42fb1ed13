//! Shared data model of the kernel: correction types, typed actuator commands,
//! command lifecycle statuses, decision context and the persisted row shapes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use time::OffsetDateTime;

// ============ CORRECTION ============

/// Metric corrected by a controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CorrectionType {
    Ph,
    Ec,
}

impl CorrectionType {
    /// Key used in telemetry maps and timestamp maps ("PH", "EC").
    pub fn metric(&self) -> &'static str {
        match self {
            CorrectionType::Ph => "PH",
            CorrectionType::Ec => "EC",
        }
    }

    /// Key used in zone targets ("ph", "ec").
    pub fn target_key(&self) -> &'static str {
        match self {
            CorrectionType::Ph => "ph",
            CorrectionType::Ec => "ec",
        }
    }
}

impl fmt::Display for CorrectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target_key())
    }
}

/// PID gain region, selected by the distance between measurement and setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PidZone {
    Dead,
    Close,
    Far,
}

impl PidZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            PidZone::Dead => "DEAD",
            PidZone::Close => "CLOSE",
            PidZone::Far => "FAR",
        }
    }
}

/// Direction of a correction, chosen from the sign of the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    AddAcid,
    AddBase,
    AddNutrients,
    Dilute,
}

impl CorrectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionKind::AddAcid => "add_acid",
            CorrectionKind::AddBase => "add_base",
            CorrectionKind::AddNutrients => "add_nutrients",
            CorrectionKind::Dilute => "dilute",
        }
    }
}

// ============ COMMANDS ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseParams {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub ml: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunPumpParams {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayParams {
    #[serde(default)]
    pub state: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwmParams {
    #[serde(default)]
    pub value: Option<i64>,
}

/// Verb + typed parameters. Unknown verbs are carried verbatim in `Custom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub enum CommandAction {
    Dose(DoseParams),
    RunPump(RunPumpParams),
    SetRelay(RelayParams),
    SetPwm(PwmParams),
    Custom { cmd: String, params: Value },
}

/// Wire shape `{cmd, params}` of a [`CommandAction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAction {
    cmd: String,
    #[serde(default)]
    params: Value,
}

impl TryFrom<RawAction> for CommandAction {
    type Error = serde_json::Error;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        CommandAction::from_parts(&raw.cmd, raw.params)
    }
}

impl From<CommandAction> for RawAction {
    fn from(action: CommandAction) -> Self {
        RawAction {
            cmd: action.verb().to_string(),
            params: action.params_json(),
        }
    }
}

impl CommandAction {
    /// Builds a typed action from a verb and its JSON parameters.
    pub fn from_parts(cmd: &str, params: Value) -> Result<Self, serde_json::Error> {
        let params = if params.is_null() { json!({}) } else { params };
        Ok(match cmd {
            "dose" => CommandAction::Dose(serde_json::from_value(params)?),
            "run_pump" => CommandAction::RunPump(serde_json::from_value(params)?),
            "set_relay" => CommandAction::SetRelay(serde_json::from_value(params)?),
            "set_pwm" => CommandAction::SetPwm(serde_json::from_value(params)?),
            other => CommandAction::Custom {
                cmd: other.to_string(),
                params,
            },
        })
    }

    pub fn verb(&self) -> &str {
        match self {
            CommandAction::Dose(_) => "dose",
            CommandAction::RunPump(_) => "run_pump",
            CommandAction::SetRelay(_) => "set_relay",
            CommandAction::SetPwm(_) => "set_pwm",
            CommandAction::Custom { cmd, .. } => cmd,
        }
    }

    pub fn params_json(&self) -> Value {
        let value = match self {
            CommandAction::Dose(p) => serde_json::to_value(p),
            CommandAction::RunPump(p) => serde_json::to_value(p),
            CommandAction::SetRelay(p) => serde_json::to_value(p),
            CommandAction::SetPwm(p) => serde_json::to_value(p),
            CommandAction::Custom { params, .. } => Ok(params.clone()),
        };
        value.unwrap_or_else(|_| json!({}))
    }

    /// Pump run time carried by the command, if any.
    pub fn duration_ms(&self) -> Option<i64> {
        match self {
            CommandAction::RunPump(p) => p.duration_ms,
            _ => None,
        }
    }

    pub fn ml(&self) -> Option<f64> {
        match self {
            CommandAction::Dose(p) => p.ml,
            CommandAction::RunPump(p) => p.ml,
            _ => None,
        }
    }
}

/// Command addressed to one actuator channel of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub node_uid: String,
    pub channel: String,
    #[serde(flatten)]
    pub action: CommandAction,
    /// Semantic hint used by validation (climate vs light for relay/pwm).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl Command {
    pub fn new(node_uid: impl Into<String>, channel: impl Into<String>, action: CommandAction) -> Self {
        Self {
            node_uid: node_uid.into(),
            channel: channel.into(),
            action,
            event_type: None,
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn cmd(&self) -> &str {
        self.action.verb()
    }
}

/// Lifecycle status of a tracked command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    /// Device accepted the command but has not reported its effect yet.
    Ack,
    Done,
    Error,
    Invalid,
    Busy,
    NoEffect,
    Timeout,
    SendFailed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending | CommandStatus::Ack)
    }

    /// Only `DONE` means the actuator genuinely ran.
    pub fn is_success(&self) -> bool {
        matches!(self, CommandStatus::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Ack => "ACK",
            CommandStatus::Done => "DONE",
            CommandStatus::Error => "ERROR",
            CommandStatus::Invalid => "INVALID",
            CommandStatus::Busy => "BUSY",
            CommandStatus::NoEffect => "NO_EFFECT",
            CommandStatus::Timeout => "TIMEOUT",
            CommandStatus::SendFailed => "SEND_FAILED",
        }
    }

    /// Parses a device-reported status, tolerating case and a few aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" => Some(CommandStatus::Pending),
            "ACK" | "ACCEPTED" => Some(CommandStatus::Ack),
            "DONE" | "COMPLETED" => Some(CommandStatus::Done),
            "ERROR" | "FAILED" => Some(CommandStatus::Error),
            "INVALID" => Some(CommandStatus::Invalid),
            "BUSY" => Some(CommandStatus::Busy),
            "NO_EFFECT" => Some(CommandStatus::NoEffect),
            "TIMEOUT" => Some(CommandStatus::Timeout),
            "SEND_FAILED" => Some(CommandStatus::SendFailed),
            _ => None,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of why a command was issued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    #[serde(default)]
    pub telemetry: BTreeMap<String, f64>,
    pub current_value: Option<f64>,
    pub target_value: Option<f64>,
    pub diff: Option<f64>,
    #[serde(default)]
    pub reason: String,
    pub correction_type: Option<CorrectionType>,
    pub pid_zone: Option<PidZone>,
    pub pid_output: Option<f64>,
    pub pid_integral: Option<f64>,
    pub pid_prev_error: Option<f64>,
    pub trace_id: Option<String>,
}

impl DecisionContext {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn pid_state_json(&self) -> Value {
        json!({
            "zone": self.pid_zone,
            "output": self.pid_output,
            "integral": self.pid_integral,
            "prev_error": self.pid_prev_error,
        })
    }
}

// ============ PERSISTED ROWS ============

/// Row of `command_tracking`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub cmd_id: String,
    pub zone_id: i64,
    pub command: Command,
    pub status: CommandStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub latency_seconds: Option<f64>,
    pub context: DecisionContext,
}

/// Status change applied to an existing `command_tracking` row.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandUpdate {
    pub cmd_id: String,
    pub status: CommandStatus,
    pub completed_at: Option<OffsetDateTime>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub latency_seconds: Option<f64>,
}

/// Row of `command_audit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub zone_id: i64,
    pub command_type: String,
    pub command_data: Value,
    pub telemetry_snapshot: Value,
    pub decision_context: Value,
    pub pid_state: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneEventRecord {
    pub zone_id: i64,
    pub event_type: String,
    pub details: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Decision log entry (one per applied correction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub zone_id: i64,
    pub decision: String,
    pub details: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub zone_id: Option<i64>,
    pub code: String,
    pub details: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Alert {
    pub fn new(zone_id: Option<i64>, code: impl Into<String>, details: Value) -> Self {
        Self {
            zone_id,
            code: code.into(),
            details,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Latest stored sample of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

// ============ ZONE INPUTS ============

/// Target for one metric: either a bare value or a `{target, min, max}` band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricTarget {
    Value(f64),
    Band {
        target: f64,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

/// Resolved `(target, min, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedTarget {
    pub target: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricTarget {
    pub fn resolve(&self) -> ResolvedTarget {
        match *self {
            MetricTarget::Value(target) => ResolvedTarget { target, min: target, max: target },
            MetricTarget::Band { target, min, max } => ResolvedTarget {
                target,
                min: min.unwrap_or(target),
                max: max.unwrap_or(target),
            },
        }
    }
}

/// One nutrient component of the recipe.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NutrientComponent {
    #[serde(default)]
    pub ratio_pct: Option<f64>,
    #[serde(default)]
    pub dose_ml_per_l: Option<f64>,
}

/// Recipe nutrition configuration used by EC dosing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NutritionConfig {
    #[serde(default)]
    pub components: HashMap<String, NutrientComponent>,
    #[serde(default)]
    pub dose_delay_sec: Option<f64>,
    #[serde(default)]
    pub ec_stop_tolerance: Option<f64>,
}

/// Active targets of one zone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ZoneTargets {
    #[serde(default)]
    pub ph: Option<MetricTarget>,
    #[serde(default)]
    pub ec: Option<MetricTarget>,
    #[serde(default)]
    pub nutrition: Option<NutritionConfig>,
}

impl ZoneTargets {
    pub fn for_type(&self, correction_type: CorrectionType) -> Option<MetricTarget> {
        match correction_type {
            CorrectionType::Ph => self.ph,
            CorrectionType::Ec => self.ec,
        }
    }
}

/// Role-keyed binding of a zone actuator ("ph_acid_pump", "ec_npk_pump", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorBinding {
    pub node_uid: String,
    pub channel: String,
    #[serde(default)]
    pub ml_per_sec: Option<f64>,
}

/// Legacy type/channel node entry. Never used to pick a dosing actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_uid: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub channel: Option<String>,
}

/// Everything a controller needs to decide one correction for one zone.
#[derive(Debug, Clone, Default)]
pub struct ZoneSnapshot {
    pub zone_id: i64,
    pub targets: ZoneTargets,
    pub telemetry: HashMap<String, f64>,
    pub telemetry_timestamps: HashMap<String, String>,
    pub nodes: HashMap<String, NodeInfo>,
    pub water_level_ok: bool,
    pub actuators: HashMap<String, ActuatorBinding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serializes_with_flat_cmd_and_params() {
        let cmd = Command::new(
            "nd-ph-1",
            "pump_acid",
            CommandAction::Dose(DoseParams { kind: "add_acid".into(), ml: Some(3.0) }),
        );
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["cmd"], "dose");
        assert_eq!(value["params"]["type"], "add_acid");
        assert_eq!(value["params"]["ml"], 3.0);
        assert!(value.get("event_type").is_none());
    }

    #[test]
    fn unknown_verb_is_kept_as_custom() {
        let value = json!({"node_uid": "nd-1", "channel": "fan", "cmd": "calibrate", "params": {"step": 2}});
        let cmd: Command = serde_json::from_value(value).unwrap();
        assert_eq!(cmd.cmd(), "calibrate");
        assert!(matches!(cmd.action, CommandAction::Custom { .. }));
        assert_eq!(cmd.action.params_json()["step"], 2);
    }

    #[test]
    fn status_parse_accepts_aliases() {
        assert_eq!(CommandStatus::parse("done"), Some(CommandStatus::Done));
        assert_eq!(CommandStatus::parse("accepted"), Some(CommandStatus::Ack));
        assert_eq!(CommandStatus::parse("no_effect"), Some(CommandStatus::NoEffect));
        assert_eq!(CommandStatus::parse("weird"), None);
        assert!(!CommandStatus::Ack.is_terminal());
        assert!(CommandStatus::Busy.is_terminal());
        assert!(!CommandStatus::Busy.is_success());
    }

    #[test]
    fn metric_target_accepts_value_or_band() {
        let bare: MetricTarget = serde_json::from_value(json!(6.5)).unwrap();
        assert_eq!(bare.resolve(), ResolvedTarget { target: 6.5, min: 6.5, max: 6.5 });

        let band: MetricTarget = serde_json::from_value(json!({"target": 6.5, "min": 6.4, "max": 6.6})).unwrap();
        assert_eq!(band.resolve(), ResolvedTarget { target: 6.5, min: 6.4, max: 6.6 });
    }
}
