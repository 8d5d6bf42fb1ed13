//! Append-only audit of every published command and the decision behind it.

use crate::events::{self, alerts};
use crate::models::{AuditRecord, Command, DecisionContext};
use crate::ports::{AlertSink, Store};
use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;

pub struct CommandAudit {
    store: Arc<dyn Store>,
    alerts: Arc<dyn AlertSink>,
}

impl CommandAudit {
    pub fn new(store: Arc<dyn Store>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { store, alerts }
    }

    /// Best effort: a failed write is alerted, never returned.
    pub async fn audit_command(&self, zone_id: i64, command: &Command, context: &DecisionContext) -> bool {
        let record = AuditRecord {
            zone_id,
            command_type: command.cmd().to_string(),
            command_data: serde_json::to_value(command).unwrap_or(Value::Null),
            telemetry_snapshot: json!(context.telemetry),
            decision_context: serde_json::to_value(context).unwrap_or(Value::Null),
            pid_state: context.pid_state_json(),
            created_at: OffsetDateTime::now_utc(),
        };

        match self.store.append_audit(&record).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(zone_id, cmd = command.cmd(), error = %e, "audit write failed");
                events::raise(
                    self.alerts.as_ref(),
                    Some(zone_id),
                    alerts::AUDIT_WRITE_FAILED,
                    json!({"cmd": command.cmd(), "node_uid": command.node_uid, "error": e.to_string()}),
                )
                .await;
                false
            }
        }
    }
}
