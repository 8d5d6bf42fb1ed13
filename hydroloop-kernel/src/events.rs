//! Zone event and alert codes, plus fire-and-forget emit helpers.
//!
//! Every decline or delivery failure is paired with a durable zone event so an
//! operator can reconstruct why no dose happened.

use crate::models::{Alert, CorrectionType};
use crate::ports::{AlertSink, Store};
use serde_json::Value;

pub const CORRECTION_SKIPPED_FRESHNESS_CHECK_FAILED: &str = "CORRECTION_SKIPPED_FRESHNESS_CHECK_FAILED";
pub const PID_OUTPUT: &str = "PID_OUTPUT";
pub const DOSING: &str = "DOSING";
pub const PH_TOO_HIGH_DETECTED: &str = "PH_TOO_HIGH_DETECTED";
pub const PH_TOO_LOW_DETECTED: &str = "PH_TOO_LOW_DETECTED";
pub const EC_COMPONENT_RECHECK: &str = "EC_COMPONENT_RECHECK";
pub const EC_COMPONENT_BATCH_STOPPED: &str = "EC_COMPONENT_BATCH_STOPPED";
pub const COMMAND_VALIDATION_FAILED: &str = "COMMAND_VALIDATION_FAILED";
pub const COMMAND_ZONE_NODE_MISMATCH: &str = "COMMAND_ZONE_NODE_MISMATCH";
pub const COMMAND_TIMEOUT: &str = "COMMAND_TIMEOUT";
pub const COMMAND_ROLLBACK: &str = "COMMAND_ROLLBACK";

pub fn correction_skipped(correction_type: CorrectionType) -> &'static str {
    match correction_type {
        CorrectionType::Ph => "PH_CORRECTION_SKIPPED",
        CorrectionType::Ec => "EC_CORRECTION_SKIPPED",
    }
}

pub fn correction_skipped_stale(correction_type: CorrectionType) -> &'static str {
    match correction_type {
        CorrectionType::Ph => "PH_CORRECTION_SKIPPED_STALE_DATA",
        CorrectionType::Ec => "EC_CORRECTION_SKIPPED_STALE_DATA",
    }
}

/// Event recorded once a correction has been applied.
pub fn corrected(correction_type: CorrectionType) -> &'static str {
    match correction_type {
        CorrectionType::Ph => "PH_CORRECTED",
        CorrectionType::Ec => "EC_DOSING",
    }
}

/// Alert codes (infra / safety channel).
pub mod alerts {
    pub const FRESHNESS_CHECK_FAILED: &str = "CORRECTION_FRESHNESS_CHECK_FAILED";
    pub const COMMAND_VALIDATION_FAILED: &str = "COMMAND_VALIDATION_FAILED";
    pub const COMMAND_ZONE_NODE_MISMATCH: &str = "COMMAND_ZONE_NODE_MISMATCH";
    pub const NODE_LOOKUP_FAILED: &str = "COMMAND_NODE_LOOKUP_FAILED";
    pub const COMMAND_PUBLISH_FAILED: &str = "COMMAND_PUBLISH_FAILED";
    pub const TRACKER_UNAVAILABLE: &str = "COMMAND_TRACKER_UNAVAILABLE";
    pub const AUDIT_WRITE_FAILED: &str = "AUDIT_WRITE_FAILED";
    pub const COMMAND_EFFECT_NOT_CONFIRMED: &str = "COMMAND_EFFECT_NOT_CONFIRMED";
    pub const COMMAND_TIMEOUT: &str = "COMMAND_TIMEOUT";
}

/// Records a zone event; a store failure is logged, never propagated.
pub async fn emit(store: &dyn Store, zone_id: i64, event_type: &str, details: Value) {
    if let Err(e) = store.create_zone_event(zone_id, event_type, details).await {
        tracing::warn!(zone_id, event_type, error = %e, "failed to record zone event");
    }
}

pub async fn raise(alerts: &dyn AlertSink, zone_id: Option<i64>, code: &str, details: Value) {
    alerts.send_alert(Alert::new(zone_id, code, details)).await;
}
