//! HydroLoop kernel: closed-loop pH/EC correction and reliable delivery of
//! actuator commands for greenhouse zones.
//!
//! The correction side ([`correction::CorrectionController`]) turns a zone
//! snapshot into at most one correction command; the delivery side
//! ([`bus::CommandBus`]) validates, tracks, audits and sends it, then waits
//! for the device to confirm the effect.

pub mod audit;
pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod correction;
pub mod error;
pub mod events;
pub mod health;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod ports;
pub mod rollback;
pub mod tracker;
pub mod transport;
pub mod validator;

pub use bus::{BusSettings, ClosedLoopOutcome, ClosedLoopStatus, CommandBus, PublishReceipt};
pub use circuit_breaker::{BreakerSettings, CircuitBreaker};
pub use correction::CorrectionController;
pub use error::{DeliveryError, ValidationError};
pub use tracker::CommandTracker;
pub use validator::CommandValidator;
