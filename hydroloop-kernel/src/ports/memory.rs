//! In-memory [`Store`] + [`AlertSink`], used by tests and dry runs.
//!
//! Every table is a plain vector/map behind one `parking_lot::Mutex`. Fault
//! switches let callers simulate an unavailable database per concern.

use super::{AlertSink, Store, StoreError};
use crate::correction::pid::PidState;
use crate::models::{
    Alert, AuditRecord, CommandRecord, CommandUpdate, CorrectionType, DecisionLogEntry, MetricSample,
    ZoneEventRecord,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Default)]
struct Tables {
    commands: Vec<CommandRecord>,
    audits: Vec<AuditRecord>,
    events: Vec<ZoneEventRecord>,
    decisions: Vec<DecisionLogEntry>,
    alerts: Vec<Alert>,
    node_zones: HashMap<String, i64>,
    metrics: HashMap<(i64, String), MetricSample>,
    pid_states: HashMap<(i64, CorrectionType), PidState>,
}

#[derive(Default, Clone, Copy)]
struct Faults {
    commands: bool,
    audit: bool,
    node_lookup: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_node(&self, node_uid: &str, zone_id: i64) {
        self.tables.lock().node_zones.insert(node_uid.to_string(), zone_id);
    }

    pub fn set_metric(&self, zone_id: i64, metric: &str, value: f64) {
        let sample = MetricSample { value, ts: OffsetDateTime::now_utc() };
        self.tables.lock().metrics.insert((zone_id, metric.to_string()), sample);
    }

    /// Makes command tracking writes fail (tracker unavailable).
    pub fn fail_commands(&self, fail: bool) {
        self.faults.lock().commands = fail;
    }

    pub fn fail_audit(&self, fail: bool) {
        self.faults.lock().audit = fail;
    }

    pub fn fail_node_lookup(&self, fail: bool) {
        self.faults.lock().node_lookup = fail;
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.tables.lock().commands.clone()
    }

    pub fn audits(&self) -> Vec<AuditRecord> {
        self.tables.lock().audits.clone()
    }

    pub fn events(&self) -> Vec<ZoneEventRecord> {
        self.tables.lock().events.clone()
    }

    /// Events of one type, in emission order.
    pub fn events_of(&self, event_type: &str) -> Vec<ZoneEventRecord> {
        self.tables
            .lock()
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn decision_logs(&self) -> Vec<DecisionLogEntry> {
        self.tables.lock().decisions.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.tables.lock().alerts.clone()
    }

    pub fn alerts_of(&self, code: &str) -> Vec<Alert> {
        self.tables.lock().alerts.iter().filter(|a| a.code == code).cloned().collect()
    }

    pub fn pid_state(&self, zone_id: i64, correction_type: CorrectionType) -> Option<PidState> {
        self.tables.lock().pid_states.get(&(zone_id, correction_type)).cloned()
    }

    pub fn put_pid_state(&self, zone_id: i64, correction_type: CorrectionType, state: PidState) {
        self.tables.lock().pid_states.insert((zone_id, correction_type), state);
    }

    fn check(&self, failing: impl Fn(Faults) -> bool, what: &str) -> Result<(), StoreError> {
        if failing(*self.faults.lock()) {
            return Err(StoreError::Unavailable(format!("{what} table unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_command(&self, record: &CommandRecord) -> Result<(), StoreError> {
        self.check(|f| f.commands, "command_tracking")?;
        self.tables.lock().commands.push(record.clone());
        Ok(())
    }

    async fn update_command(&self, update: &CommandUpdate) -> Result<(), StoreError> {
        self.check(|f| f.commands, "command_tracking")?;
        let mut tables = self.tables.lock();
        let row = tables
            .commands
            .iter_mut()
            .find(|r| r.cmd_id == update.cmd_id)
            .ok_or_else(|| StoreError::NotFound(update.cmd_id.clone()))?;
        row.status = update.status;
        if update.completed_at.is_some() {
            row.completed_at = update.completed_at;
        }
        if update.response.is_some() {
            row.response = update.response.clone();
        }
        if update.error.is_some() {
            row.error = update.error.clone();
        }
        if update.latency_seconds.is_some() {
            row.latency_seconds = update.latency_seconds;
        }
        Ok(())
    }

    async fn get_command(&self, cmd_id: &str) -> Result<Option<CommandRecord>, StoreError> {
        self.check(|f| f.commands, "command_tracking")?;
        Ok(self.tables.lock().commands.iter().find(|r| r.cmd_id == cmd_id).cloned())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.check(|f| f.audit, "command_audit")?;
        self.tables.lock().audits.push(record.clone());
        Ok(())
    }

    async fn create_zone_event(&self, zone_id: i64, event_type: &str, details: Value) -> Result<(), StoreError> {
        self.tables.lock().events.push(ZoneEventRecord {
            zone_id,
            event_type: event_type.to_string(),
            details,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn create_decision_log(&self, entry: &DecisionLogEntry) -> Result<(), StoreError> {
        self.tables.lock().decisions.push(entry.clone());
        Ok(())
    }

    async fn node_zone(&self, node_uid: &str) -> Result<Option<i64>, StoreError> {
        self.check(|f| f.node_lookup, "nodes")?;
        Ok(self.tables.lock().node_zones.get(node_uid).copied())
    }

    async fn latest_metric(&self, zone_id: i64, metric: &str) -> Result<Option<MetricSample>, StoreError> {
        Ok(self.tables.lock().metrics.get(&(zone_id, metric.to_string())).copied())
    }

    async fn load_pid_state(&self, zone_id: i64, correction_type: CorrectionType) -> Result<Option<PidState>, StoreError> {
        Ok(self.pid_state(zone_id, correction_type))
    }

    async fn save_pid_state(
        &self,
        zone_id: i64,
        correction_type: CorrectionType,
        state: &PidState,
    ) -> Result<(), StoreError> {
        self.put_pid_state(zone_id, correction_type, state.clone());
        Ok(())
    }
}

#[async_trait]
impl AlertSink for MemoryStore {
    async fn send_alert(&self, alert: Alert) {
        self.tables.lock().alerts.push(alert);
    }
}
