//! Compensating commands for actuations whose effect was never confirmed.

use crate::bus::CommandBus;
use crate::events;
use crate::models::{Command, CommandAction, DecisionContext, PwmParams, RelayParams};
use serde_json::json;

/// Inverse of an action, when one exists. Doses cannot be undone.
pub fn compensating_action(action: &CommandAction) -> Option<CommandAction> {
    match action {
        CommandAction::SetRelay(RelayParams { state: Some(true) }) => {
            Some(CommandAction::SetRelay(RelayParams { state: Some(false) }))
        }
        CommandAction::SetPwm(PwmParams { value: Some(v) }) if *v > 0 => {
            Some(CommandAction::SetPwm(PwmParams { value: Some(0) }))
        }
        CommandAction::RunPump(_) => Some(CommandAction::Custom { cmd: "stop".into(), params: json!({}) }),
        _ => None,
    }
}

pub struct CommandRollback;

impl CommandRollback {
    /// Publishes the compensation through the regular (open-loop) bus path.
    /// Returns `true` when a compensating command was accepted.
    pub async fn execute(bus: &CommandBus, zone_id: i64, command: &Command, cmd_id: Option<&str>, reason: &str) -> bool {
        let Some(action) = compensating_action(&command.action) else {
            tracing::debug!(zone_id, cmd = command.cmd(), "no compensating action");
            return false;
        };

        let mut compensation = Command::new(command.node_uid.clone(), command.channel.clone(), action);
        compensation.event_type = command.event_type.clone();
        let context = DecisionContext::with_reason(format!("rollback of {} ({reason})", command.cmd()));

        let result = bus.publish_controller_command(zone_id, &compensation, &context).await;
        let accepted = result.is_ok();
        if let Err(e) = &result {
            tracing::warn!(zone_id, cmd = command.cmd(), error = %e, "rollback publish failed");
        }

        events::emit(
            bus.store(),
            zone_id,
            events::COMMAND_ROLLBACK,
            json!({
                "original_cmd_id": cmd_id,
                "original_cmd": command.cmd(),
                "rollback_cmd": compensation.cmd(),
                "node_uid": command.node_uid,
                "channel": command.channel,
                "reason": reason,
                "published": accepted,
                "rollback_cmd_id": result.as_ref().ok().and_then(|r| r.cmd_id.clone()),
            }),
        )
        .await;
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DoseParams, RunPumpParams};

    #[test]
    fn compensations() {
        let relay_on = CommandAction::SetRelay(RelayParams { state: Some(true) });
        assert_eq!(
            compensating_action(&relay_on),
            Some(CommandAction::SetRelay(RelayParams { state: Some(false) }))
        );
        assert_eq!(compensating_action(&CommandAction::SetRelay(RelayParams { state: Some(false) })), None);

        let pwm = CommandAction::SetPwm(PwmParams { value: Some(180) });
        assert_eq!(compensating_action(&pwm), Some(CommandAction::SetPwm(PwmParams { value: Some(0) })));
        assert_eq!(compensating_action(&CommandAction::SetPwm(PwmParams { value: Some(0) })), None);

        let pump = CommandAction::RunPump(RunPumpParams { duration_ms: Some(1000), ..Default::default() });
        assert_eq!(compensating_action(&pump).map(|a| a.verb().to_string()), Some("stop".to_string()));

        let dose = CommandAction::Dose(DoseParams { kind: "add_acid".into(), ml: Some(1.0) });
        assert_eq!(compensating_action(&dose), None);
    }
}
