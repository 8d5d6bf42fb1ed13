use thiserror::Error;

/// Reason a command failed validation before being sent.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

/// Delivery faults surfaced by the command bus.
///
/// Every variant is a typed non-success; only `BreakerOpen` is expected to be
/// handled specially by callers (isolate the failing actuator path).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    #[error("circuit breaker '{name}' is open")]
    BreakerOpen { name: String },
    #[error("command validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("node {node_uid} is not assigned to zone {zone_id} (assigned: {assigned_zone:?})")]
    ZoneNodeMismatch {
        node_uid: String,
        zone_id: i64,
        assigned_zone: Option<i64>,
    },
    #[error("node lookup failed: {0}")]
    NodeLookup(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("gateway answered HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
}

impl DeliveryError {
    /// Stable machine-readable code used in events and alerts.
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::BreakerOpen { .. } => "circuit_open",
            DeliveryError::Validation(_) => "validation_failed",
            DeliveryError::ZoneNodeMismatch { .. } => "zone_node_mismatch",
            DeliveryError::NodeLookup(_) => "node_lookup_failed",
            DeliveryError::Transport(_) => "transport_error",
            DeliveryError::HttpStatus { .. } => "http_error",
            DeliveryError::InvalidResponse(_) => "invalid_response",
        }
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, DeliveryError::BreakerOpen { .. })
    }
}
