//! Cooldown/trend oracle consulted before every correction.

use crate::models::CorrectionType;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct OracleDecision {
    pub apply: bool,
    pub reason: String,
}

impl OracleDecision {
    pub fn apply() -> Self {
        Self { apply: true, reason: "ok".into() }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self { apply: false, reason: reason.into() }
    }
}

#[async_trait]
pub trait CorrectionOracle: Send + Sync {
    async fn should_apply_correction(
        &self,
        zone_id: i64,
        correction_type: CorrectionType,
        current: f64,
        target: f64,
    ) -> OracleDecision;

    /// Called once per applied correction, whatever the delivery outcome.
    async fn record_correction(&self, zone_id: i64, correction_type: CorrectionType, current: f64, target: f64);
}

#[derive(Debug, Clone)]
pub struct CooldownSettings {
    pub cooldown: Duration,
    /// Fraction of the error recovered since the last correction above which
    /// the value is considered already converging.
    pub trend_recovery_ratio: f64,
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            trend_recovery_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastCorrection {
    at: Instant,
    error: f64,
}

/// In-process oracle: refuses inside the cooldown window, then refuses while
/// the error keeps shrinking on its own.
pub struct CooldownOracle {
    settings: CooldownSettings,
    last: Mutex<HashMap<(i64, CorrectionType), LastCorrection>>,
}

impl CooldownOracle {
    pub fn new(settings: CooldownSettings) -> Self {
        Self { settings, last: Mutex::new(HashMap::new()) }
    }
}

impl Default for CooldownOracle {
    fn default() -> Self {
        Self::new(CooldownSettings::default())
    }
}

#[async_trait]
impl CorrectionOracle for CooldownOracle {
    async fn should_apply_correction(
        &self,
        zone_id: i64,
        correction_type: CorrectionType,
        current: f64,
        target: f64,
    ) -> OracleDecision {
        let Some(last) = self.last.lock().get(&(zone_id, correction_type)).copied() else {
            return OracleDecision::apply();
        };

        let elapsed = last.at.elapsed();
        if elapsed < self.settings.cooldown {
            let remaining = self.settings.cooldown - elapsed;
            return OracleDecision::skip(format!("cooldown active ({}s remaining)", remaining.as_secs()));
        }

        let error = (current - target).abs();
        if last.error > 0.0 && error < last.error * (1.0 - self.settings.trend_recovery_ratio) {
            return OracleDecision::skip("value converging without intervention");
        }

        OracleDecision::apply()
    }

    async fn record_correction(&self, zone_id: i64, correction_type: CorrectionType, current: f64, target: f64) {
        self.last.lock().insert(
            (zone_id, correction_type),
            LastCorrection { at: Instant::now(), error: (current - target).abs() },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_then_releases() {
        let oracle = CooldownOracle::new(CooldownSettings {
            cooldown: Duration::from_secs(60),
            trend_recovery_ratio: 0.5,
        });
        assert!(oracle.should_apply_correction(1, CorrectionType::Ph, 6.8, 6.5).await.apply);

        oracle.record_correction(1, CorrectionType::Ph, 6.8, 6.5).await;
        let decision = oracle.should_apply_correction(1, CorrectionType::Ph, 6.8, 6.5).await;
        assert!(!decision.apply);
        assert!(decision.reason.contains("cooldown"));

        // other zone / metric are independent
        assert!(oracle.should_apply_correction(2, CorrectionType::Ph, 6.8, 6.5).await.apply);
        assert!(oracle.should_apply_correction(1, CorrectionType::Ec, 1.5, 1.8).await.apply);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(oracle.should_apply_correction(1, CorrectionType::Ph, 6.8, 6.5).await.apply);
    }

    #[tokio::test(start_paused = true)]
    async fn converging_value_is_left_alone() {
        let oracle = CooldownOracle::new(CooldownSettings {
            cooldown: Duration::from_secs(10),
            trend_recovery_ratio: 0.5,
        });
        oracle.record_correction(1, CorrectionType::Ec, 1.0, 1.8).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(!oracle.should_apply_correction(1, CorrectionType::Ec, 1.6, 1.8).await.apply);
        assert!(oracle.should_apply_correction(1, CorrectionType::Ec, 1.2, 1.8).await.apply);
    }
}
