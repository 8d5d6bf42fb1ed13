/**
 * FILE STORE - Persistance JSON des tables du kernel HydroLoop
 *
 * RÔLE :
 * Backend durable simple : une table = un fichier JSON sous `data_dir`.
 * Suffisant pour une serre seule ; un backend SQL implémente le même trait.
 *
 * FONCTIONNEMENT :
 * - Chargement de toutes les tables au démarrage (fichier absent = table vide)
 * - Cache mémoire + write-through à chaque écriture ; une écriture disque
 *   ratée annule la modification en mémoire
 * - `zone_events.json` est borné aux `event_cap` derniers événements
 * - `nodes.json` (affectation node → zone) et `telemetry.json` (derniers
 *   échantillons) sont alimentés par l'extérieur : relus à chaque lecture
 *
 * FICHIERS :
 * command_tracking.json, command_audit.json, zone_events.json, ai_logs.json,
 * alerts.json, pid_state.json, nodes.json, telemetry.json
 */

use super::{AlertSink, Store, StoreError};
use crate::correction::pid::PidState;
use crate::models::{
    Alert, AuditRecord, CommandRecord, CommandUpdate, CorrectionType, DecisionLogEntry, MetricSample,
    ZoneEventRecord,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::Mutex;

const COMMANDS_FILE: &str = "command_tracking.json";
const AUDIT_FILE: &str = "command_audit.json";
const EVENTS_FILE: &str = "zone_events.json";
const DECISIONS_FILE: &str = "ai_logs.json";
const ALERTS_FILE: &str = "alerts.json";
const PID_FILE: &str = "pid_state.json";
const NODES_FILE: &str = "nodes.json";
const TELEMETRY_FILE: &str = "telemetry.json";

/// Default number of zone events kept on disk.
pub const DEFAULT_EVENT_CAP: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PidStateRow {
    zone_id: i64,
    correction_type: CorrectionType,
    state: PidState,
}

/// Externally written telemetry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub zone_id: i64,
    pub metric: String,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

#[derive(Default)]
struct Tables {
    commands: Vec<CommandRecord>,
    audits: Vec<AuditRecord>,
    events: Vec<ZoneEventRecord>,
    decisions: Vec<DecisionLogEntry>,
    alerts: Vec<Alert>,
    pid_states: Vec<PidStateRow>,
}

pub struct FileStore {
    dir: PathBuf,
    /// Held across the file write so snapshots hit disk in mutation order.
    tables: Mutex<Tables>,
    event_cap: usize,
}

impl FileStore {
    /// Ouvre (ou crée) le store dans `dir`
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let tables = Tables {
            commands: load_table(&dir.join(COMMANDS_FILE))?,
            audits: load_table(&dir.join(AUDIT_FILE))?,
            events: load_table(&dir.join(EVENTS_FILE))?,
            decisions: load_table(&dir.join(DECISIONS_FILE))?,
            alerts: load_table(&dir.join(ALERTS_FILE))?,
            pid_states: load_table(&dir.join(PID_FILE))?,
        };
        tracing::info!(
            dir = %dir.display(),
            commands = tables.commands.len(),
            audits = tables.audits.len(),
            "file store opened"
        );

        Ok(Self { dir, tables: Mutex::new(tables), event_cap: DEFAULT_EVENT_CAP })
    }

    /// Keeps only the `cap` most recent zone events.
    pub fn with_event_cap(mut self, cap: usize) -> Self {
        self.event_cap = cap.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn save<T: Serialize>(&self, file: &str, rows: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(rows)?;
        tokio::fs::write(self.dir.join(file), json).await?;
        Ok(())
    }

    async fn read_external<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T, StoreError> {
        let path = self.dir.join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(txt) if txt.trim().is_empty() => Ok(T::default()),
            Ok(txt) => Ok(serde_json::from_str(&txt)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }
}

fn load_table<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&content)?)
}

#[async_trait]
impl Store for FileStore {
    async fn insert_command(&self, record: &CommandRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.commands.push(record.clone());
        let saved = self.save(COMMANDS_FILE, &tables.commands).await;
        if saved.is_err() {
            tables.commands.pop();
        }
        saved
    }

    async fn update_command(&self, update: &CommandUpdate) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .commands
            .iter_mut()
            .find(|r| r.cmd_id == update.cmd_id)
            .ok_or_else(|| StoreError::NotFound(update.cmd_id.clone()))?;
        let previous = row.clone();
        row.status = update.status;
        if let Some(at) = update.completed_at {
            row.completed_at = Some(at);
        }
        if let Some(response) = &update.response {
            row.response = Some(response.clone());
        }
        if let Some(error) = &update.error {
            row.error = Some(error.clone());
        }
        if let Some(latency) = update.latency_seconds {
            row.latency_seconds = Some(latency);
        }
        let saved = self.save(COMMANDS_FILE, &tables.commands).await;
        if saved.is_err() {
            if let Some(row) = tables.commands.iter_mut().find(|r| r.cmd_id == previous.cmd_id) {
                *row = previous;
            }
        }
        saved
    }

    async fn get_command(&self, cmd_id: &str) -> Result<Option<CommandRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.commands.iter().find(|r| r.cmd_id == cmd_id).cloned())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.audits.push(record.clone());
        let saved = self.save(AUDIT_FILE, &tables.audits).await;
        if saved.is_err() {
            tables.audits.pop();
        }
        saved
    }

    async fn create_zone_event(&self, zone_id: i64, event_type: &str, details: Value) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.events.push(ZoneEventRecord {
            zone_id,
            event_type: event_type.to_string(),
            details,
            created_at: OffsetDateTime::now_utc(),
        });
        let overflow = tables.events.len().saturating_sub(self.event_cap);
        tables.events.drain(..overflow);
        self.save(EVENTS_FILE, &tables.events).await
    }

    async fn create_decision_log(&self, entry: &DecisionLogEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.decisions.push(entry.clone());
        let saved = self.save(DECISIONS_FILE, &tables.decisions).await;
        if saved.is_err() {
            tables.decisions.pop();
        }
        saved
    }

    async fn node_zone(&self, node_uid: &str) -> Result<Option<i64>, StoreError> {
        let nodes: HashMap<String, i64> = self.read_external(NODES_FILE).await?;
        Ok(nodes.get(node_uid).copied())
    }

    async fn latest_metric(&self, zone_id: i64, metric: &str) -> Result<Option<MetricSample>, StoreError> {
        let rows: Vec<TelemetryRow> = self.read_external(TELEMETRY_FILE).await?;
        Ok(rows
            .into_iter()
            .filter(|r| r.zone_id == zone_id && r.metric == metric)
            .max_by_key(|r| r.ts)
            .map(|r| MetricSample { value: r.value, ts: r.ts }))
    }

    async fn load_pid_state(&self, zone_id: i64, correction_type: CorrectionType) -> Result<Option<PidState>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .pid_states
            .iter()
            .find(|r| r.zone_id == zone_id && r.correction_type == correction_type)
            .map(|r| r.state.clone()))
    }

    async fn save_pid_state(
        &self,
        zone_id: i64,
        correction_type: CorrectionType,
        state: &PidState,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .pid_states
            .retain(|r| !(r.zone_id == zone_id && r.correction_type == correction_type));
        tables.pid_states.push(PidStateRow {
            zone_id,
            correction_type,
            state: state.clone(),
        });
        self.save(PID_FILE, &tables.pid_states).await
    }
}

#[async_trait]
impl AlertSink for FileStore {
    async fn send_alert(&self, alert: Alert) {
        tracing::warn!(zone_id = ?alert.zone_id, code = %alert.code, "alert raised");
        let mut tables = self.tables.lock().await;
        tables.alerts.push(alert);
        if let Err(e) = self.save(ALERTS_FILE, &tables.alerts).await {
            tracing::error!(error = %e, "failed to persist alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Command, CommandAction, CommandStatus, DecisionContext, DoseParams, PidZone};

    fn record(cmd_id: &str) -> CommandRecord {
        CommandRecord {
            cmd_id: cmd_id.to_string(),
            zone_id: 4,
            command: Command::new(
                "nd-ph-1",
                "pump_acid",
                CommandAction::Dose(DoseParams { kind: "add_acid".into(), ml: Some(2.5) }),
            ),
            status: CommandStatus::Pending,
            sent_at: OffsetDateTime::now_utc(),
            completed_at: None,
            response: None,
            error: None,
            latency_seconds: None,
            context: DecisionContext::with_reason("test"),
        }
    }

    #[tokio::test]
    async fn commands_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.insert_command(&record("c1")).await.unwrap();
            store
                .update_command(&CommandUpdate {
                    cmd_id: "c1".into(),
                    status: CommandStatus::Done,
                    completed_at: Some(OffsetDateTime::now_utc()),
                    response: None,
                    error: None,
                    latency_seconds: Some(0.4),
                })
                .await
                .unwrap();
        }

        let reopened = FileStore::open(dir.path()).unwrap();
        let row = reopened.get_command("c1").await.unwrap().unwrap();
        assert_eq!(row.status, CommandStatus::Done);
        assert_eq!(row.latency_seconds, Some(0.4));
    }

    #[tokio::test]
    async fn reads_externally_written_nodes_and_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.node_zone("nd-1").await.unwrap(), None);

        fs::write(dir.path().join(NODES_FILE), r#"{"nd-1": 7}"#).unwrap();
        fs::write(
            dir.path().join(TELEMETRY_FILE),
            r#"[
                {"zone_id": 7, "metric": "EC", "value": 1.4, "ts": "2026-01-01T10:00:00Z"},
                {"zone_id": 7, "metric": "EC", "value": 1.6, "ts": "2026-01-01T10:05:00Z"},
                {"zone_id": 8, "metric": "EC", "value": 9.9, "ts": "2026-01-01T10:09:00Z"}
            ]"#,
        )
        .unwrap();

        assert_eq!(store.node_zone("nd-1").await.unwrap(), Some(7));
        let sample = store.latest_metric(7, "EC").await.unwrap().unwrap();
        assert_eq!(sample.value, 1.6);
    }

    #[tokio::test]
    async fn failed_write_leaves_cache_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let store = FileStore::open(&data).unwrap();
        store.insert_command(&record("c1")).await.unwrap();

        fs::remove_dir_all(&data).unwrap();
        assert!(store.insert_command(&record("c2")).await.is_err());
        assert!(store.get_command("c2").await.unwrap().is_none());

        let failed = store
            .update_command(&CommandUpdate {
                cmd_id: "c1".into(),
                status: CommandStatus::Done,
                completed_at: Some(OffsetDateTime::now_utc()),
                response: None,
                error: None,
                latency_seconds: Some(1.0),
            })
            .await;
        assert!(failed.is_err());
        let row = store.get_command("c1").await.unwrap().unwrap();
        assert_eq!(row.status, CommandStatus::Pending);
        assert!(row.completed_at.is_none());
    }

    #[tokio::test]
    async fn zone_events_keep_only_the_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap().with_event_cap(3);
        for i in 0..5 {
            store.create_zone_event(1, "PID_OUTPUT", serde_json::json!({ "i": i })).await.unwrap();
        }

        let reopened = FileStore::open(dir.path()).unwrap();
        let events = reopened.tables.lock().await.events.clone();
        let kept: Vec<i64> = events.iter().filter_map(|e| e.details["i"].as_i64()).collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn pid_state_is_replaced_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut state = PidState { zone: PidZone::Close, integral: 0.5, prev_error: -0.1, setpoint: 6.0 };
        store.save_pid_state(3, CorrectionType::Ph, &state).await.unwrap();
        state.integral = 0.9;
        store.save_pid_state(3, CorrectionType::Ph, &state).await.unwrap();

        let loaded = store.load_pid_state(3, CorrectionType::Ph).await.unwrap().unwrap();
        assert_eq!(loaded.integral, 0.9);
        assert!(store.load_pid_state(3, CorrectionType::Ec).await.unwrap().is_none());
    }
}
