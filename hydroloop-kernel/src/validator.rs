//! Structural and semantic checks applied to every command before send.
//!
//! Strict for the dosing verbs, permissive for verbs the kernel does not know
//! so newer firmware commands can still flow through the bus.

use crate::config::ValidatorLimits;
use crate::error::ValidationError;
use crate::models::{Command, CommandAction};

/// Hard ceiling on a single pump run, whatever the configuration says.
pub const MAX_RUN_PUMP_MS: i64 = 3_600_000;

const PWM_MAX: i64 = 255;
const LIGHT_DUTY_MAX: i64 = 100;

#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    limits: ValidatorLimits,
}

impl CommandValidator {
    pub fn new(limits: ValidatorLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidatorLimits {
        &self.limits
    }

    pub fn validate(&self, command: &Command) -> Result<(), ValidationError> {
        if command.node_uid.trim().is_empty() {
            return Err(ValidationError::new("node_uid", "must not be empty"));
        }

        match &command.action {
            CommandAction::Dose(p) => {
                self.require_channel(command)?;
                let ml = p.ml.ok_or_else(|| ValidationError::new("ml", "required for dose"))?;
                if !ml.is_finite() || ml <= 0.0 {
                    return Err(ValidationError::new("ml", format!("must be a positive number, got {ml}")));
                }
                if ml > self.limits.max_dose_ml {
                    return Err(ValidationError::new(
                        "ml",
                        format!("{ml} exceeds the maximum dose of {} ml", self.limits.max_dose_ml),
                    ));
                }
                if p.kind.trim().is_empty() {
                    return Err(ValidationError::new("type", "must not be empty"));
                }
                Ok(())
            }
            CommandAction::RunPump(p) => {
                self.require_channel(command)?;
                let duration = p
                    .duration_ms
                    .ok_or_else(|| ValidationError::new("duration_ms", "required for run_pump"))?;
                let ceiling = self.limits.max_run_pump_ms.min(MAX_RUN_PUMP_MS);
                if duration <= 0 {
                    return Err(ValidationError::new("duration_ms", format!("must be positive, got {duration}")));
                }
                if duration > ceiling {
                    return Err(ValidationError::new(
                        "duration_ms",
                        format!("{duration} exceeds the maximum run time of {ceiling} ms"),
                    ));
                }
                if let Some(ml) = p.ml {
                    if !ml.is_finite() || ml <= 0.0 {
                        return Err(ValidationError::new("ml", format!("must be a positive number, got {ml}")));
                    }
                }
                Ok(())
            }
            CommandAction::SetRelay(p) => {
                self.require_channel(command)?;
                p.state
                    .map(|_| ())
                    .ok_or_else(|| ValidationError::new("state", "boolean state required for set_relay"))
            }
            CommandAction::SetPwm(p) => {
                self.require_channel(command)?;
                let value = p.value.ok_or_else(|| ValidationError::new("value", "required for set_pwm"))?;
                let max = if is_light(command) { LIGHT_DUTY_MAX } else { PWM_MAX };
                if !(0..=max).contains(&value) {
                    return Err(ValidationError::new("value", format!("{value} outside 0..={max}")));
                }
                Ok(())
            }
            CommandAction::Custom { cmd, .. } => {
                if cmd.trim().is_empty() {
                    return Err(ValidationError::new("cmd", "must not be empty"));
                }
                Ok(())
            }
        }
    }

    fn require_channel(&self, command: &Command) -> Result<(), ValidationError> {
        if command.channel.trim().is_empty() {
            return Err(ValidationError::new("channel", "must not be empty"));
        }
        Ok(())
    }
}

/// Light channels take a duty cycle in percent instead of a raw PWM byte.
fn is_light(command: &Command) -> bool {
    command
        .event_type
        .as_deref()
        .is_some_and(|hint| hint.to_ascii_uppercase().contains("LIGHT"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DoseParams, PwmParams, RelayParams, RunPumpParams};
    use serde_json::json;

    fn validator() -> CommandValidator {
        CommandValidator::new(ValidatorLimits { max_dose_ml: 20.0, max_run_pump_ms: 3_600_000 })
    }

    fn dose(ml: Option<f64>) -> Command {
        Command::new("nd-1", "acid", CommandAction::Dose(DoseParams { kind: "add_acid".into(), ml }))
    }

    fn run_pump(duration_ms: Option<i64>, ml: Option<f64>) -> Command {
        Command::new(
            "nd-1",
            "npk",
            CommandAction::RunPump(RunPumpParams { duration_ms, ml, ..Default::default() }),
        )
    }

    #[test]
    fn dose_requires_positive_amount_under_ceiling() {
        let v = validator();
        assert!(v.validate(&dose(Some(3.0))).is_ok());
        assert_eq!(v.validate(&dose(None)).unwrap_err().field, "ml");
        assert!(v.validate(&dose(Some(0.0))).is_err());
        assert!(v.validate(&dose(Some(f64::NAN))).is_err());
        assert!(v.validate(&dose(Some(20.5))).is_err());
    }

    #[test]
    fn default_dose_ceiling_is_the_ph_pid_output_bound() {
        let v = CommandValidator::new(ValidatorLimits::default());
        assert!(v.validate(&dose(Some(20.0))).is_ok());
        let err = v.validate(&dose(Some(50.0))).unwrap_err();
        assert_eq!(err.field, "ml");
        assert!(err.message.contains("maximum dose of 20"));
    }

    #[test]
    fn run_pump_is_capped_at_one_hour() {
        let v = validator();
        assert!(v.validate(&run_pump(Some(6_750), Some(13.5))).is_ok());
        assert!(v.validate(&run_pump(Some(3_600_000), None)).is_ok());
        assert_eq!(v.validate(&run_pump(Some(3_600_001), None)).unwrap_err().field, "duration_ms");
        assert!(v.validate(&run_pump(None, Some(1.0))).is_err());
        assert!(v.validate(&run_pump(Some(0), None)).is_err());
        assert_eq!(v.validate(&run_pump(Some(100), Some(-1.0))).unwrap_err().field, "ml");
    }

    #[test]
    fn relay_needs_boolean_state() {
        let v = validator();
        let ok = Command::new("nd-1", "fan", CommandAction::SetRelay(RelayParams { state: Some(false) }));
        let missing = Command::new("nd-1", "fan", CommandAction::SetRelay(RelayParams { state: None }));
        assert!(v.validate(&ok).is_ok());
        assert_eq!(v.validate(&missing).unwrap_err().field, "state");
    }

    #[test]
    fn pwm_range_depends_on_event_hint() {
        let v = validator();
        let pwm = |value| Command::new("nd-1", "fan", CommandAction::SetPwm(PwmParams { value: Some(value) }));
        assert!(v.validate(&pwm(200)).is_ok());
        assert!(v.validate(&pwm(256)).is_err());
        assert!(v.validate(&pwm(-1)).is_err());
        assert!(v.validate(&pwm(200).with_event_type("LIGHT_SCHEDULE")).is_err());
        assert!(v.validate(&pwm(80).with_event_type("light_schedule")).is_ok());
        assert!(v.validate(&pwm(200).with_event_type("CLIMATE_FAN")).is_ok());
    }

    #[test]
    fn unknown_verbs_only_need_identity() {
        let v = validator();
        let custom = Command::new("nd-1", "", CommandAction::Custom { cmd: "calibrate".into(), params: json!({}) });
        assert!(v.validate(&custom).is_ok());

        let anonymous = Command::new("", "x", CommandAction::Custom { cmd: "calibrate".into(), params: json!({}) });
        assert_eq!(v.validate(&anonymous).unwrap_err().field, "node_uid");

        let blank = Command::new("nd-1", "x", CommandAction::Custom { cmd: " ".into(), params: json!({}) });
        assert_eq!(v.validate(&blank).unwrap_err().field, "cmd");
    }
}
