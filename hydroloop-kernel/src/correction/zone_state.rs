//! Per-zone mutable state owned by one correction controller.

use super::pid::AdaptivePid;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Default)]
pub struct ZoneCorrectionState {
    pid: Option<Box<dyn AdaptivePid>>,
    last_tick: Option<Instant>,
    freshness_failures: u32,
}

/// Zone id → [`ZoneCorrectionState`], created on first access.
#[derive(Default)]
pub struct ZoneCorrectionStore {
    zones: HashMap<i64, ZoneCorrectionState>,
}

impl ZoneCorrectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn zone_mut(&mut self, zone_id: i64) -> &mut ZoneCorrectionState {
        self.zones.entry(zone_id).or_default()
    }

    pub fn has_pid(&self, zone_id: i64) -> bool {
        self.zones.get(&zone_id).is_some_and(|z| z.pid.is_some())
    }

    pub fn insert_pid(&mut self, zone_id: i64, pid: Box<dyn AdaptivePid>) {
        self.zone_mut(zone_id).pid = Some(pid);
    }

    pub fn pid_mut(&mut self, zone_id: i64) -> Option<&mut (dyn AdaptivePid + 'static)> {
        self.zones.get_mut(&zone_id).and_then(|z| z.pid.as_deref_mut())
    }

    /// Seconds since the previous tick of this zone, floored at 1.0.
    pub fn tick(&mut self, zone_id: i64, now: Instant) -> f64 {
        let zone = self.zone_mut(zone_id);
        let dt = zone
            .last_tick
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        zone.last_tick = Some(now);
        dt.max(1.0)
    }

    /// Increments and returns the consecutive freshness failure count.
    pub fn record_freshness_failure(&mut self, zone_id: i64) -> u32 {
        let zone = self.zone_mut(zone_id);
        zone.freshness_failures = zone.freshness_failures.saturating_add(1);
        zone.freshness_failures
    }

    pub fn reset_freshness(&mut self, zone_id: i64) {
        if let Some(zone) = self.zones.get_mut(&zone_id) {
            zone.freshness_failures = 0;
        }
    }

    pub fn freshness_failures(&self, zone_id: i64) -> u32 {
        self.zones.get(&zone_id).map(|z| z.freshness_failures).unwrap_or(0)
    }

    /// Drops everything known about a zone (zone deleted).
    pub fn invalidate_zone(&mut self, zone_id: i64) {
        self.zones.remove(&zone_id);
    }

    /// Drops the PID and its clock (PID config changed); counters survive.
    pub fn invalidate_pid(&mut self, zone_id: i64) {
        if let Some(zone) = self.zones.get_mut(&zone_id) {
            zone.pid = None;
            zone.last_tick = None;
        }
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::pid::{ZonedPid, ZonedPidConfig};
    use crate::models::CorrectionType;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn tick_is_floored_at_one_second() {
        let mut store = ZoneCorrectionStore::new();
        let t0 = Instant::now();
        assert_eq!(store.tick(1, t0), 1.0);
        assert_eq!(store.tick(1, t0 + Duration::from_millis(200)), 1.0);
        assert_eq!(store.tick(1, t0 + Duration::from_millis(5200)), 5.0);
    }

    #[test]
    fn freshness_counter_resets() {
        let mut store = ZoneCorrectionStore::new();
        assert_eq!(store.record_freshness_failure(4), 1);
        assert_eq!(store.record_freshness_failure(4), 2);
        store.reset_freshness(4);
        assert_eq!(store.freshness_failures(4), 0);
    }

    #[tokio::test]
    async fn invalidate_pid_keeps_counters() {
        let mut store = ZoneCorrectionStore::new();
        store.insert_pid(2, Box::new(ZonedPid::new(ZonedPidConfig::for_type(CorrectionType::Ph), 6.5)));
        store.record_freshness_failure(2);
        assert!(store.has_pid(2));

        store.invalidate_pid(2);
        assert!(!store.has_pid(2));
        assert_eq!(store.freshness_failures(2), 1);

        store.invalidate_zone(2);
        assert!(store.is_empty());
    }
}
