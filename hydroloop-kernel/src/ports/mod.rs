/**
 * PORTS - Interfaces de persistance et d'alerte du kernel HydroLoop
 *
 * RÔLE :
 * Définit les contrats que le kernel consomme pour tout ce qui est durable :
 * suivi des commandes, audit, événements de zone, journal de décisions,
 * affectation node → zone, dernier échantillon de télémétrie, état PID.
 *
 * FONCTIONNEMENT :
 * - `Store` = trait async implémenté par chaque backend (mémoire, fichiers JSON...)
 * - `AlertSink` = canal d'alertes fire-and-forget (jamais bloquant)
 * - `StoreError` = erreurs communes à tous les backends
 *
 * IMPLÉMENTATIONS :
 * - `memory::MemoryStore` : tests, dry-run, inspection
 * - `file::FileStore` : fichiers JSON sous `data_dir`, cache + write-through
 */

pub mod file;
pub mod memory;

use crate::correction::pid::PidState;
use crate::models::{
    Alert, AuditRecord, CommandRecord, CommandUpdate, CorrectionType, DecisionLogEntry, MetricSample,
};
use async_trait::async_trait;
use serde_json::Value;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Erreurs possibles lors des opérations sur le store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable store consumed by tracker, audit, bus and correction controller.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a new `command_tracking` row.
    async fn insert_command(&self, record: &CommandRecord) -> Result<(), StoreError>;

    /// Applies a status change to an existing row; `NotFound` if absent.
    async fn update_command(&self, update: &CommandUpdate) -> Result<(), StoreError>;

    async fn get_command(&self, cmd_id: &str) -> Result<Option<CommandRecord>, StoreError>;

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;

    async fn create_zone_event(&self, zone_id: i64, event_type: &str, details: Value) -> Result<(), StoreError>;

    async fn create_decision_log(&self, entry: &DecisionLogEntry) -> Result<(), StoreError>;

    /// Zone currently owning the node, `None` if the node is unassigned or unknown.
    async fn node_zone(&self, node_uid: &str) -> Result<Option<i64>, StoreError>;

    /// Most recent sample of `metric` for the zone.
    async fn latest_metric(&self, zone_id: i64, metric: &str) -> Result<Option<MetricSample>, StoreError>;

    async fn load_pid_state(&self, zone_id: i64, correction_type: CorrectionType) -> Result<Option<PidState>, StoreError>;

    async fn save_pid_state(
        &self,
        zone_id: i64,
        correction_type: CorrectionType,
        state: &PidState,
    ) -> Result<(), StoreError>;
}

/// Alert channel. Delivery is best effort; implementations must not fail loudly.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: Alert);
}

