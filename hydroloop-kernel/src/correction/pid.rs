//! Zoned adaptive PID used to size pH/EC corrections.
//!
//! The controller only talks to [`AdaptivePid`] / [`PidFactory`]; [`ZonedPid`]
//! is the implementation wired by default.

use crate::models::{CorrectionType, PidZone};
use serde::{Deserialize, Serialize};

/// Persisted part of a PID, restored when a controller restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidState {
    pub zone: PidZone,
    pub integral: f64,
    pub prev_error: f64,
    pub setpoint: f64,
}

/// PID engine consumed by the correction controller.
///
/// `dt` passed to [`AdaptivePid::compute`] is always `max(1.0, now - last_tick)`
/// in seconds, measured per zone on a monotonic clock. The floor keeps the
/// derivative term bounded on rapid successive calls; implementations may
/// rely on `dt >= 1.0`.
pub trait AdaptivePid: Send {
    /// Returns the correction magnitude (ml). `0.0` means nothing to do.
    fn compute(&mut self, current: f64, dt: f64) -> f64;

    /// Gain region selected by the last `compute` call.
    fn zone(&self) -> PidZone;

    fn update_setpoint(&mut self, setpoint: f64);

    fn state(&self) -> PidState;

    fn restore(&mut self, state: &PidState);
}

pub trait PidFactory: Send + Sync {
    fn create(&self, zone_id: i64, correction_type: CorrectionType, setpoint: f64) -> Box<dyn AdaptivePid>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonedPidConfig {
    /// |error| at or below this is the DEAD region (no output).
    pub dead_threshold: f64,
    /// |error| at or below this (and above dead) uses `close` gains.
    pub close_threshold: f64,
    pub close: Gains,
    pub far: Gains,
    pub max_output: f64,
    pub max_integral: f64,
    /// Minimum accumulated time between two non-zero outputs.
    pub min_interval_secs: f64,
}

impl ZonedPidConfig {
    pub fn for_type(correction_type: CorrectionType) -> Self {
        match correction_type {
            CorrectionType::Ph => Self {
                dead_threshold: 0.05,
                close_threshold: 0.3,
                close: Gains { kp: 10.0, ki: 0.01, kd: 0.0 },
                far: Gains { kp: 12.0, ki: 0.02, kd: 0.5 },
                max_output: 20.0,
                max_integral: 100.0,
                min_interval_secs: 60.0,
            },
            CorrectionType::Ec => Self {
                dead_threshold: 0.05,
                close_threshold: 0.3,
                close: Gains { kp: 60.0, ki: 0.05, kd: 0.0 },
                far: Gains { kp: 100.0, ki: 0.1, kd: 1.0 },
                max_output: 100.0,
                max_integral: 500.0,
                min_interval_secs: 60.0,
            },
        }
    }
}

/// Three-region PID with anti-windup and minimum-interval gating.
///
/// Error is `current - setpoint`; the returned magnitude is `|output|`
/// clamped to `max_output`. Direction is decided by the caller.
pub struct ZonedPid {
    config: ZonedPidConfig,
    setpoint: f64,
    integral: f64,
    prev_error: f64,
    zone: PidZone,
    since_last_output: f64,
}

impl ZonedPid {
    pub fn new(config: ZonedPidConfig, setpoint: f64) -> Self {
        // first non-zero output is never gated
        let since_last_output = config.min_interval_secs;
        Self {
            config,
            setpoint,
            integral: 0.0,
            prev_error: 0.0,
            zone: PidZone::Dead,
            since_last_output,
        }
    }

    fn select_zone(&self, error: f64) -> PidZone {
        let magnitude = error.abs();
        if magnitude <= self.config.dead_threshold {
            PidZone::Dead
        } else if magnitude <= self.config.close_threshold {
            PidZone::Close
        } else {
            PidZone::Far
        }
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.zone = PidZone::Dead;
    }
}

impl AdaptivePid for ZonedPid {
    fn compute(&mut self, current: f64, dt: f64) -> f64 {
        let dt = dt.max(1.0);
        let error = current - self.setpoint;
        self.zone = self.select_zone(error);
        self.since_last_output += dt;

        let gains = match self.zone {
            PidZone::Dead => {
                self.prev_error = error;
                return 0.0;
            }
            PidZone::Close => self.config.close,
            PidZone::Far => self.config.far,
        };

        let p = gains.kp * error;

        let prev_integral = self.integral;
        self.integral = (prev_integral + error * dt).clamp(-self.config.max_integral, self.config.max_integral);
        let i = gains.ki * self.integral;

        let d = gains.kd * (error - self.prev_error) / dt;
        self.prev_error = error;

        let raw = p + i + d;
        let output = raw.clamp(-self.config.max_output, self.config.max_output);

        // Anti-windup: if output is saturated, keep the previous integral
        if raw != output {
            self.integral = prev_integral;
        }

        if self.since_last_output < self.config.min_interval_secs {
            return 0.0;
        }

        let magnitude = output.abs();
        if magnitude > 0.0 {
            self.since_last_output = 0.0;
        }
        magnitude
    }

    fn zone(&self) -> PidZone {
        self.zone
    }

    fn update_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    fn state(&self) -> PidState {
        PidState {
            zone: self.zone,
            integral: self.integral,
            prev_error: self.prev_error,
            setpoint: self.setpoint,
        }
    }

    fn restore(&mut self, state: &PidState) {
        self.zone = state.zone;
        self.integral = state.integral.clamp(-self.config.max_integral, self.config.max_integral);
        self.prev_error = state.prev_error;
    }
}

/// Builds one [`ZonedPid`] per `(zone, type)` from per-type configs.
#[derive(Debug, Clone)]
pub struct ZonedPidFactory {
    pub ph: ZonedPidConfig,
    pub ec: ZonedPidConfig,
}

impl Default for ZonedPidFactory {
    fn default() -> Self {
        Self {
            ph: ZonedPidConfig::for_type(CorrectionType::Ph),
            ec: ZonedPidConfig::for_type(CorrectionType::Ec),
        }
    }
}

impl PidFactory for ZonedPidFactory {
    fn create(&self, zone_id: i64, correction_type: CorrectionType, setpoint: f64) -> Box<dyn AdaptivePid> {
        let config = match correction_type {
            CorrectionType::Ph => self.ph.clone(),
            CorrectionType::Ec => self.ec.clone(),
        };
        tracing::debug!(zone_id, %correction_type, setpoint, "creating PID");
        Box::new(ZonedPid::new(config, setpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ZonedPidConfig {
        ZonedPidConfig {
            dead_threshold: 0.05,
            close_threshold: 0.3,
            close: Gains { kp: 10.0, ki: 0.0, kd: 0.0 },
            far: Gains { kp: 20.0, ki: 0.0, kd: 0.0 },
            max_output: 50.0,
            max_integral: 10.0,
            min_interval_secs: 0.0,
        }
    }

    #[test]
    fn zone_follows_error_magnitude() {
        let mut pid = ZonedPid::new(config(), 6.5);
        assert_eq!(pid.compute(6.52, 1.0), 0.0);
        assert_eq!(pid.zone(), PidZone::Dead);

        let out = pid.compute(6.7, 1.0);
        assert_eq!(pid.zone(), PidZone::Close);
        assert!((out - 2.0).abs() < 1e-9);

        let out = pid.compute(6.0, 1.0);
        assert_eq!(pid.zone(), PidZone::Far);
        assert!((out - 10.0).abs() < 1e-9);
    }

    #[test]
    fn output_is_clamped_and_integral_does_not_wind_up() {
        let mut cfg = config();
        cfg.far = Gains { kp: 100.0, ki: 1.0, kd: 0.0 };
        let mut pid = ZonedPid::new(cfg, 1.8);

        for _ in 0..5 {
            let out = pid.compute(0.8, 10.0);
            assert_eq!(out, 50.0);
        }
        assert_eq!(pid.state().integral, 0.0);
    }

    #[test]
    fn saturation_keeps_integral_even_when_clamped() {
        let mut cfg = config();
        cfg.far = Gains { kp: 100.0, ki: 1.0, kd: 0.0 };
        let mut pid = ZonedPid::new(cfg, 1.8);
        pid.restore(&PidState { zone: PidZone::Far, integral: -8.0, prev_error: -1.0, setpoint: 1.8 });

        assert_eq!(pid.compute(0.8, 10.0), 50.0);
        assert_eq!(pid.state().integral, -8.0);
    }

    #[test]
    fn min_interval_gates_consecutive_outputs() {
        let mut cfg = config();
        cfg.min_interval_secs = 30.0;
        let mut pid = ZonedPid::new(cfg, 6.5);

        assert!(pid.compute(6.8, 1.0) > 0.0);
        assert_eq!(pid.compute(6.8, 10.0), 0.0);
        assert_eq!(pid.compute(6.8, 10.0), 0.0);
        assert!(pid.compute(6.8, 10.0) > 0.0);
    }

    #[test]
    fn restore_keeps_integral_within_bounds() {
        let mut pid = ZonedPid::new(config(), 6.5);
        pid.restore(&PidState { zone: PidZone::Far, integral: 99.0, prev_error: 0.4, setpoint: 6.0 });
        let state = pid.state();
        assert_eq!(state.integral, 10.0);
        assert_eq!(state.zone, PidZone::Far);
        assert_eq!(state.setpoint, 6.5);
    }

    #[test]
    fn dt_below_one_second_is_floored() {
        let mut cfg = config();
        cfg.close = Gains { kp: 0.0, ki: 0.0, kd: 1.0 };
        let mut pid = ZonedPid::new(cfg, 6.5);
        pid.compute(6.6, 1.0);
        let out = pid.compute(6.7, 0.001);
        assert!((out - 0.1).abs() < 1e-9);
    }
}
