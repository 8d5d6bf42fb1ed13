/*!
Fixtures de zones pour les tests du contrôleur

`ZoneFixture` construit un `ZoneSnapshot` cohérent (cibles, télémétrie
horodatée maintenant, bindings d'actionneurs par rôle).
*/

use hydroloop_kernel::models::{ActuatorBinding, MetricTarget, NutrientComponent, NutritionConfig, ZoneSnapshot};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Horodatage RFC 3339 décalé de `age_secs` dans le passé
pub fn timestamp_ago(age_secs: i64) -> String {
    (OffsetDateTime::now_utc() - Duration::seconds(age_secs))
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub fn fresh_timestamp() -> String {
    timestamp_ago(0)
}

pub fn binding(node_uid: &str, channel: &str) -> ActuatorBinding {
    ActuatorBinding { node_uid: node_uid.to_string(), channel: channel.to_string(), ml_per_sec: None }
}

pub struct ZoneFixture {
    snapshot: ZoneSnapshot,
}

impl ZoneFixture {
    pub fn new(zone_id: i64) -> Self {
        Self {
            snapshot: ZoneSnapshot { zone_id, water_level_ok: true, ..Default::default() },
        }
    }

    /// Zone pH avec pompes acide/base sur `nd-ph-{zone}`
    pub fn ph(zone_id: i64, current: f64, target: f64) -> Self {
        let node = format!("nd-ph-{zone_id}");
        Self::new(zone_id)
            .with_ph_target(MetricTarget::Value(target))
            .with_reading("PH", current)
            .with_actuator("ph_acid_pump", binding(&node, "pump_acid"))
            .with_actuator("ph_base_pump", binding(&node, "pump_base"))
    }

    /// Zone EC avec les trois pompes nutritives sur `nd-ec-{zone}`
    pub fn ec(zone_id: i64, current: f64, target: f64) -> Self {
        let node = format!("nd-ec-{zone_id}");
        Self::new(zone_id)
            .with_ec_target(MetricTarget::Value(target))
            .with_reading("EC", current)
            .with_actuator("ec_npk_pump", binding(&node, "pump_npk"))
            .with_actuator("ec_calcium_pump", binding(&node, "pump_calcium"))
            .with_actuator("ec_micro_pump", binding(&node, "pump_micro"))
    }

    pub fn with_ph_target(mut self, target: MetricTarget) -> Self {
        self.snapshot.targets.ph = Some(target);
        self
    }

    pub fn with_ec_target(mut self, target: MetricTarget) -> Self {
        self.snapshot.targets.ec = Some(target);
        self
    }

    /// Valeur horodatée maintenant
    pub fn with_reading(self, metric: &str, value: f64) -> Self {
        self.with_reading_at(metric, value, fresh_timestamp())
    }

    pub fn with_reading_at(mut self, metric: &str, value: f64, ts: impl Into<String>) -> Self {
        self.snapshot.telemetry.insert(metric.to_string(), value);
        self.snapshot.telemetry_timestamps.insert(metric.to_string(), ts.into());
        self
    }

    pub fn without_timestamp(mut self, metric: &str) -> Self {
        self.snapshot.telemetry_timestamps.remove(metric);
        self
    }

    pub fn with_actuator(mut self, role: &str, binding: ActuatorBinding) -> Self {
        self.snapshot.actuators.insert(role.to_string(), binding);
        self
    }

    pub fn without_actuator(mut self, role: &str) -> Self {
        self.snapshot.actuators.remove(role);
        self
    }

    pub fn with_water_level(mut self, ok: bool) -> Self {
        self.snapshot.water_level_ok = ok;
        self
    }

    /// Ratios explicites (en %) par composant nutritif
    pub fn with_nutrient_ratios(mut self, ratios: &[(&str, f64)]) -> Self {
        let nutrition = self.snapshot.targets.nutrition.get_or_insert_with(NutritionConfig::default);
        for (component, pct) in ratios {
            nutrition.components.insert(
                component.to_string(),
                NutrientComponent { ratio_pct: Some(*pct), dose_ml_per_l: None },
            );
        }
        self
    }

    pub fn with_nutrition_control(mut self, dose_delay_sec: f64, ec_stop_tolerance: f64) -> Self {
        let nutrition = self.snapshot.targets.nutrition.get_or_insert_with(NutritionConfig::default);
        nutrition.dose_delay_sec = Some(dose_delay_sec);
        nutrition.ec_stop_tolerance = Some(ec_stop_tolerance);
        self
    }

    pub fn zone_id(&self) -> i64 {
        self.snapshot.zone_id
    }

    /// Snapshot courant, sans consommer la fixture
    pub fn snapshot(&self) -> ZoneSnapshot {
        self.snapshot.clone()
    }

    /// Nodes utilisés par les bindings (pour les affecter à la zone dans le store)
    pub fn node_uids(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.snapshot.actuators.values().map(|b| b.node_uid.clone()).collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn build(self) -> ZoneSnapshot {
        self.snapshot
    }
}

impl From<ZoneFixture> for ZoneSnapshot {
    fn from(fixture: ZoneFixture) -> Self {
        fixture.build()
    }
}

