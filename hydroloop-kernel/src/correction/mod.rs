/**
 * CORRECTION CONTROLLER - Décision et application des corrections pH / EC
 *
 * RÔLE :
 * Décide si une zone doit être corrigée, de combien, et sur quel actionneur ;
 * puis pousse la ou les commandes dans le CommandBus en boucle fermée.
 *
 * FONCTIONNEMENT (check_and_correct) :
 * 1. Valeur courante + cible (target/min/max)      → None si absentes
 * 2. Gate de fraîcheur fail-closed                 → événement + compteur + alerte
 * 3. Dans [min, max]                               → None
 * 4. PID de la zone (création paresseuse + restauration de l'état persisté)
 * 5. |diff| ≤ dead_zone                            → None
 * 6. Oracle cooldown/tendance                      → *_CORRECTION_SKIPPED
 * 7. Niveau d'eau bas                              → None
 * 8. Direction (acid/base, nutrients/dilute)       → dilute refusé
 * 9. Actionneurs par rôle uniquement (jamais la map legacy des nodes)
 * 10. dt = max(1.0, now − last_tick) ; sortie PID nulle → None
 * 11. EC : batch NPK / Calcium / Micro
 * 12. Commande finale (dose | run_pump) + métadonnées d'audit
 *
 * FONCTIONNEMENT (apply_correction) :
 * Batch publié séquentiellement avec recheck EC entre les doses, puis
 * bookkeeping inconditionnel (cooldown, événements, état PID, décision).
 * Seul `DeliveryError::BreakerOpen` remonte à l'appelant.
 */

pub mod cooldown;
pub mod dosing;
pub mod freshness;
pub mod pid;
pub mod zone_state;

use crate::bus::{ClosedLoopOutcome, CommandBus};
use crate::config::CorrectionSettings;
use crate::error::DeliveryError;
use crate::events::{self, alerts};
use crate::models::{
    ActuatorBinding, Command, CommandAction, CorrectionKind, CorrectionType, DecisionContext, DecisionLogEntry,
    DoseParams, ResolvedTarget, RunPumpParams, ZoneSnapshot,
};
use crate::ports::{AlertSink, Store};
use cooldown::CorrectionOracle;
use dosing::{duration_ms, resolve_ratios, round3, split_dose};
use freshness::check_freshness;
use pid::PidFactory;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use zone_state::ZoneCorrectionStore;

/// One pump of a multi-component EC batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchComponent {
    pub component: String,
    pub role: String,
    pub ratio_pct: f64,
    pub ml: f64,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NutritionControl {
    pub dose_delay_sec: f64,
    pub ec_stop_tolerance: f64,
}

/// Output of a positive correction decision.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionCommand {
    pub zone_id: i64,
    pub correction_type: CorrectionType,
    pub kind: CorrectionKind,
    pub node_uid: String,
    pub channel: String,
    pub action: CommandAction,
    pub ml: f64,
    pub current: f64,
    pub target: ResolvedTarget,
    pub diff: f64,
    /// Ordered sub-commands for EC dosing; empty for a single command.
    pub batch_commands: Vec<BatchComponent>,
    pub nutrition_control: Option<NutritionControl>,
    pub event_details: Value,
    pub context: DecisionContext,
}

impl CorrectionCommand {
    pub fn event_type(&self) -> &'static str {
        events::corrected(self.correction_type)
    }

    pub fn command(&self) -> Command {
        Command::new(self.node_uid.clone(), self.channel.clone(), self.action.clone())
            .with_event_type(self.event_type())
    }

    pub fn is_batch(&self) -> bool {
        !self.batch_commands.is_empty()
    }
}

/// What `apply_correction` managed to deliver.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub outcomes: Vec<ClosedLoopOutcome>,
    pub stopped_early: bool,
}

impl ApplyOutcome {
    pub fn submitted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.command_submitted).count()
    }

    pub fn confirmed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.command_effect_confirmed).count()
    }
}

pub struct CorrectionController {
    correction_type: CorrectionType,
    settings: CorrectionSettings,
    pid_factory: Arc<dyn PidFactory>,
    oracle: Arc<dyn CorrectionOracle>,
    store: Arc<dyn Store>,
    alerts: Arc<dyn AlertSink>,
    zones: ZoneCorrectionStore,
}

impl CorrectionController {
    pub fn new(
        correction_type: CorrectionType,
        settings: CorrectionSettings,
        pid_factory: Arc<dyn PidFactory>,
        oracle: Arc<dyn CorrectionOracle>,
        store: Arc<dyn Store>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            correction_type,
            settings,
            pid_factory,
            oracle,
            store,
            alerts,
            zones: ZoneCorrectionStore::new(),
        }
    }

    pub fn correction_type(&self) -> CorrectionType {
        self.correction_type
    }

    pub fn settings(&self) -> &CorrectionSettings {
        &self.settings
    }

    pub fn freshness_failures(&self, zone_id: i64) -> u32 {
        self.zones.freshness_failures(zone_id)
    }

    /// Zone deleted: forget its PID, clock and counters.
    pub fn invalidate_zone(&mut self, zone_id: i64) {
        self.zones.invalidate_zone(zone_id);
    }

    /// PID config changed: the next cycle rebuilds the PID.
    pub fn invalidate_pid(&mut self, zone_id: i64) {
        self.zones.invalidate_pid(zone_id);
    }

    async fn skip(&self, zone_id: i64, event_type: &str, details: Value) {
        tracing::info!(zone_id, correction_type = %self.correction_type, event_type, %details, "correction skipped");
        events::emit(self.store.as_ref(), zone_id, event_type, details).await;
    }

    /// Freshness gate; `false` means the cycle must stop.
    async fn telemetry_is_fresh(&mut self, snapshot: &ZoneSnapshot) -> bool {
        let zone_id = snapshot.zone_id;
        let metric = self.correction_type.metric();
        let raw = snapshot.telemetry_timestamps.get(metric).map(String::as_str);

        let err = match check_freshness(
            raw,
            OffsetDateTime::now_utc(),
            Duration::from_secs(self.settings.max_telemetry_age_secs),
            Duration::from_secs(self.settings.max_clock_skew_secs),
        ) {
            Ok(_) => {
                self.zones.reset_freshness(zone_id);
                return true;
            }
            Err(e) => e,
        };

        let failures = self.zones.record_freshness_failure(zone_id);
        let event_type = if err.is_stale() {
            events::correction_skipped_stale(self.correction_type)
        } else {
            events::CORRECTION_SKIPPED_FRESHNESS_CHECK_FAILED
        };
        let details = json!({
            "correction_type": self.correction_type.metric(),
            "reason": err.to_string(),
            "timestamp": raw,
            "max_age_secs": self.settings.max_telemetry_age_secs,
            "consecutive_failures": failures,
        });
        self.skip(zone_id, event_type, details.clone()).await;

        if failures == self.settings.freshness_alert_threshold.max(1) {
            events::raise(self.alerts.as_ref(), Some(zone_id), alerts::FRESHNESS_CHECK_FAILED, details).await;
        }
        false
    }

    /// Creates the zone PID on first use, restoring any persisted state.
    async fn prepare_pid(&mut self, zone_id: i64, setpoint: f64) {
        if let Some(pid) = self.zones.pid_mut(zone_id) {
            pid.update_setpoint(setpoint);
            return;
        }

        let mut pid = self.pid_factory.create(zone_id, self.correction_type, setpoint);
        match self.store.load_pid_state(zone_id, self.correction_type).await {
            Ok(Some(state)) => {
                pid.restore(&state);
                tracing::debug!(zone_id, integral = state.integral, "restored PID state");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(zone_id, error = %e, "failed to load PID state, starting fresh"),
        }
        pid.update_setpoint(setpoint);
        self.zones.insert_pid(zone_id, pid);
    }

    fn classify(&self, diff: f64) -> CorrectionKind {
        let below = diff < -self.settings.direction_threshold;
        match (self.correction_type, below) {
            (CorrectionType::Ph, true) => CorrectionKind::AddBase,
            (CorrectionType::Ph, false) => CorrectionKind::AddAcid,
            (CorrectionType::Ec, true) => CorrectionKind::AddNutrients,
            (CorrectionType::Ec, false) => CorrectionKind::Dilute,
        }
    }

    fn roles_for(kind: CorrectionKind) -> &'static [&'static str] {
        match kind {
            CorrectionKind::AddAcid => &["ph_acid_pump"],
            CorrectionKind::AddBase => &["ph_base_pump"],
            CorrectionKind::AddNutrients => &["ec_npk_pump", "ec_calcium_pump", "ec_micro_pump"],
            CorrectionKind::Dilute => &[],
        }
    }

    fn ml_per_sec(&self, binding: &ActuatorBinding) -> f64 {
        binding
            .ml_per_sec
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(self.settings.default_ml_per_sec)
    }

    pub async fn check_and_correct(&mut self, snapshot: &ZoneSnapshot) -> Option<CorrectionCommand> {
        let zone_id = snapshot.zone_id;
        let ty = self.correction_type;

        let current = snapshot.telemetry.get(ty.metric()).copied()?;
        let target = snapshot.targets.for_type(ty)?.resolve();

        if !self.telemetry_is_fresh(snapshot).await {
            return None;
        }

        if current >= target.min && current <= target.max {
            tracing::debug!(zone_id, %ty, current, "value within target band");
            return None;
        }

        self.prepare_pid(zone_id, target.target).await;

        let diff = current - target.target;
        if diff.abs() <= self.settings.dead_zone {
            tracing::debug!(zone_id, %ty, diff, "inside dead zone");
            return None;
        }

        let decision = self.oracle.should_apply_correction(zone_id, ty, current, target.target).await;
        if !decision.apply {
            let details = json!({
                "correction_type": ty.metric(),
                "reason": decision.reason,
                "current_value": current,
                "target_value": target.target,
            });
            self.skip(zone_id, events::correction_skipped(ty), details).await;
            return None;
        }

        if !snapshot.water_level_ok {
            let details = json!({"correction_type": ty.metric(), "reason": "water_level_low"});
            self.skip(zone_id, events::correction_skipped(ty), details).await;
            return None;
        }

        let kind = self.classify(diff);
        if kind == CorrectionKind::Dilute {
            let details = json!({
                "correction_type": ty.metric(),
                "reason": "dilute_not_supported",
                "current_value": current,
                "target_value": target.target,
            });
            self.skip(zone_id, events::correction_skipped(ty), details).await;
            return None;
        }

        let roles = Self::roles_for(kind);
        let missing: Vec<&str> = roles.iter().copied().filter(|r| !snapshot.actuators.contains_key(*r)).collect();
        if !missing.is_empty() {
            if snapshot.nodes.values().any(|n| n.node_type.to_ascii_lowercase().contains(ty.target_key())) {
                tracing::warn!(zone_id, ?missing, "legacy node map has a candidate but is never used for dosing");
            }
            let details = json!({
                "correction_type": ty.metric(),
                "reason": "actuator_binding_missing",
                "correction_kind": kind.as_str(),
                "missing_roles": missing,
            });
            self.skip(zone_id, events::correction_skipped(ty), details).await;
            return None;
        }

        let dt = self.zones.tick(zone_id, Instant::now());
        let pid = self.zones.pid_mut(zone_id)?;
        let output = pid.compute(current, dt);
        let pid_zone = pid.zone();
        let pid_state = pid.state();

        let ml = round3(output.abs());
        events::emit(
            self.store.as_ref(),
            zone_id,
            events::PID_OUTPUT,
            json!({
                "correction_type": ty.metric(),
                "current_value": current,
                "target_value": target.target,
                "diff": diff,
                "output": output,
                "zone": pid_zone,
                "dt_seconds": dt,
                "integral": pid_state.integral,
            }),
        )
        .await;
        if ml <= 0.0 {
            tracing::debug!(zone_id, %ty, output, "PID output is zero, nothing to do");
            return None;
        }

        let context = DecisionContext {
            telemetry: snapshot.telemetry.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            current_value: Some(current),
            target_value: Some(target.target),
            diff: Some(diff),
            reason: format!("{} {} ml ({} zone)", kind.as_str(), ml, pid_zone.as_str()),
            correction_type: Some(ty),
            pid_zone: Some(pid_zone),
            pid_output: Some(output),
            pid_integral: Some(pid_state.integral),
            pid_prev_error: Some(pid_state.prev_error),
            trace_id: Some(uuid::Uuid::new_v4().to_string()),
        };

        let nutrition = snapshot.targets.nutrition.as_ref();
        let event_type = events::corrected(ty);
        let (node_uid, channel, action, batch_commands) = if kind == CorrectionKind::AddNutrients {
            let ratios = resolve_ratios(nutrition);
            let mut batch = Vec::with_capacity(roles.len());
            // zero shares (0 % ratio or rounding) are left out of the batch
            for dose in split_dose(ml, &ratios).into_iter().filter(|d| d.ml > 0.0) {
                let binding = snapshot.actuators.get(dose.role)?;
                let action = CommandAction::RunPump(RunPumpParams {
                    kind: Some(kind.as_str().to_string()),
                    ml: Some(dose.ml),
                    duration_ms: Some(duration_ms(dose.ml, self.ml_per_sec(binding))),
                    component: Some(dose.component.to_string()),
                    ratio_pct: Some(round3(dose.ratio_pct)),
                });
                batch.push(BatchComponent {
                    component: dose.component.to_string(),
                    role: dose.role.to_string(),
                    ratio_pct: dose.ratio_pct,
                    ml: dose.ml,
                    command: Command::new(binding.node_uid.clone(), binding.channel.clone(), action)
                        .with_event_type(event_type),
                });
            }
            tracing::debug!(zone_id, source = ratios.source.as_str(), "resolved nutrient ratios");
            let first = batch.first()?;
            (
                first.command.node_uid.clone(),
                first.command.channel.clone(),
                first.command.action.clone(),
                batch,
            )
        } else {
            let role = roles.first()?;
            let binding = snapshot.actuators.get(*role)?;
            let action = if role.starts_with("ph_") {
                CommandAction::Dose(DoseParams { kind: kind.as_str().to_string(), ml: Some(ml) })
            } else {
                CommandAction::RunPump(RunPumpParams {
                    kind: Some(kind.as_str().to_string()),
                    ml: Some(ml),
                    duration_ms: Some(duration_ms(ml, self.ml_per_sec(binding))),
                    ..Default::default()
                })
            };
            (binding.node_uid.clone(), binding.channel.clone(), action, Vec::new())
        };

        let nutrition_control = nutrition
            .filter(|n| n.dose_delay_sec.is_some() || n.ec_stop_tolerance.is_some())
            .map(|n| NutritionControl {
                dose_delay_sec: n.dose_delay_sec.unwrap_or(self.settings.dose_delay_sec),
                ec_stop_tolerance: n.ec_stop_tolerance.unwrap_or(self.settings.ec_stop_tolerance),
            });

        let mut event_details = json!({
            "correction_type": ty.metric(),
            "current_value": current,
            "target_value": target.target,
            "target_min": target.min,
            "target_max": target.max,
            "diff": diff,
            "pid_output": output,
            "pid_zone": pid_zone,
            "dt_seconds": dt,
            "correction_kind": kind.as_str(),
            "ml": ml,
            "node_uid": node_uid,
            "channel": channel,
        });
        if !batch_commands.is_empty() {
            event_details["batch_commands"] = json!(batch_commands
                .iter()
                .map(|b| json!({"component": b.component, "ml": b.ml, "ratio_pct": b.ratio_pct}))
                .collect::<Vec<_>>());
        }
        if let Some(control) = nutrition_control {
            event_details["nutrition_control"] = json!(control);
        }

        tracing::info!(zone_id, %ty, kind = kind.as_str(), ml, pid_zone = pid_zone.as_str(), "correction decided");

        Some(CorrectionCommand {
            zone_id,
            correction_type: ty,
            kind,
            node_uid,
            channel,
            action,
            ml,
            current,
            target,
            diff,
            batch_commands,
            nutrition_control,
            event_details,
            context,
        })
    }

    /// Publishes the correction and records its outcome.
    ///
    /// Bookkeeping always runs; a breaker-open error is returned afterwards so
    /// the caller can isolate this actuator path.
    pub async fn apply_correction(
        &mut self,
        command: &CorrectionCommand,
        bus: &CommandBus,
    ) -> Result<ApplyOutcome, DeliveryError> {
        let zone_id = command.zone_id;
        let mut outcome = ApplyOutcome::default();
        let mut escaped = None;

        if command.is_batch() {
            let control = command.nutrition_control.unwrap_or(NutritionControl {
                dose_delay_sec: self.settings.dose_delay_sec,
                ec_stop_tolerance: self.settings.ec_stop_tolerance,
            });
            let last = command.batch_commands.len() - 1;

            for (i, component) in command.batch_commands.iter().enumerate() {
                let result = bus
                    .publish_controller_command_closed_loop(zone_id, &component.command, &command.context, None)
                    .await;
                let confirmed = match result {
                    Ok(res) => {
                        let confirmed = res.command_effect_confirmed;
                        outcome.outcomes.push(res);
                        confirmed
                    }
                    Err(e) => {
                        escaped = Some(e);
                        break;
                    }
                };

                if i == last {
                    break;
                }
                let remaining: Vec<&str> =
                    command.batch_commands[i + 1..].iter().map(|b| b.component.as_str()).collect();

                if !confirmed {
                    outcome.stopped_early = true;
                    events::emit(
                        self.store.as_ref(),
                        zone_id,
                        events::EC_COMPONENT_BATCH_STOPPED,
                        json!({
                            "reason": "component_not_confirmed",
                            "component": component.component,
                            "remaining": remaining,
                        }),
                    )
                    .await;
                    break;
                }

                if command.correction_type != CorrectionType::Ec {
                    continue;
                }

                tokio::time::sleep(Duration::from_secs_f64(control.dose_delay_sec.max(0.0))).await;
                let threshold = command.target.target - control.ec_stop_tolerance;
                let latest = match self.store.latest_metric(zone_id, CorrectionType::Ec.metric()).await {
                    Ok(sample) => sample.map(|s| s.value),
                    Err(e) => {
                        tracing::warn!(zone_id, error = %e, "EC recheck failed, continuing batch");
                        None
                    }
                };
                events::emit(
                    self.store.as_ref(),
                    zone_id,
                    events::EC_COMPONENT_RECHECK,
                    json!({
                        "component": component.component,
                        "ec": latest,
                        "target_value": command.target.target,
                        "stop_threshold": threshold,
                    }),
                )
                .await;

                if latest.is_some_and(|ec| ec >= threshold) {
                    outcome.stopped_early = true;
                    tracing::info!(zone_id, ?latest, threshold, "EC target reached, stopping batch");
                    events::emit(
                        self.store.as_ref(),
                        zone_id,
                        events::EC_COMPONENT_BATCH_STOPPED,
                        json!({
                            "reason": "target_reached",
                            "component": component.component,
                            "ec": latest,
                            "remaining": remaining,
                        }),
                    )
                    .await;
                    break;
                }
            }
        } else {
            match bus
                .publish_controller_command_closed_loop(zone_id, &command.command(), &command.context, None)
                .await
            {
                Ok(res) => outcome.outcomes.push(res),
                Err(e) => escaped = Some(e),
            }
        }

        self.record_outcome(command, &outcome).await;

        match escaped {
            Some(e) => {
                tracing::warn!(zone_id, error = %e, "correction interrupted by delivery fault");
                Err(e)
            }
            None => Ok(outcome),
        }
    }

    async fn record_outcome(&mut self, command: &CorrectionCommand, outcome: &ApplyOutcome) {
        let zone_id = command.zone_id;
        let ty = command.correction_type;

        self.oracle.record_correction(zone_id, ty, command.current, command.target.target).await;

        let mut details = command.event_details.clone();
        details["submitted"] = json!(outcome.submitted());
        details["confirmed"] = json!(outcome.confirmed());
        details["stopped_early"] = json!(outcome.stopped_early);
        events::emit(self.store.as_ref(), zone_id, command.event_type(), details.clone()).await;
        events::emit(
            self.store.as_ref(),
            zone_id,
            events::DOSING,
            json!({
                "correction_type": ty.metric(),
                "correction_kind": command.kind.as_str(),
                "ml": command.ml,
                "node_uid": command.node_uid,
                "channel": command.channel,
            }),
        )
        .await;

        if let (CorrectionType::Ph, Some(critical)) = (ty, self.settings.critical_diff) {
            let critical_event = if command.diff > critical {
                Some(events::PH_TOO_HIGH_DETECTED)
            } else if command.diff < -critical {
                Some(events::PH_TOO_LOW_DETECTED)
            } else {
                None
            };
            if let Some(event_type) = critical_event {
                events::emit(
                    self.store.as_ref(),
                    zone_id,
                    event_type,
                    json!({
                        "current_value": command.current,
                        "target_value": command.target.target,
                        "diff": command.diff,
                        "critical_diff": critical,
                    }),
                )
                .await;
            }
        }

        if let Some(state) = self.zones.pid_mut(zone_id).map(|pid| pid.state()) {
            if let Err(e) = self.store.save_pid_state(zone_id, ty, &state).await {
                tracing::warn!(zone_id, error = %e, "failed to persist PID state");
            }
        }

        let entry = DecisionLogEntry {
            zone_id,
            decision: format!("{}_correction", ty.target_key()),
            details,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.store.create_decision_log(&entry).await {
            tracing::warn!(zone_id, error = %e, "failed to write decision log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricTarget, PidZone, ZoneTargets};
    use crate::ports::MemoryStore;
    use async_trait::async_trait;
    use cooldown::OracleDecision;
    use pid::{AdaptivePid, PidState};
    use std::collections::HashMap;

    struct FixedPid {
        output: f64,
        setpoint: f64,
    }

    impl AdaptivePid for FixedPid {
        fn compute(&mut self, _current: f64, _dt: f64) -> f64 {
            self.output
        }
        fn zone(&self) -> PidZone {
            PidZone::Close
        }
        fn update_setpoint(&mut self, setpoint: f64) {
            self.setpoint = setpoint;
        }
        fn state(&self) -> PidState {
            PidState { zone: PidZone::Close, integral: 0.0, prev_error: 0.0, setpoint: self.setpoint }
        }
        fn restore(&mut self, _state: &PidState) {}
    }

    struct FixedFactory(f64);

    impl PidFactory for FixedFactory {
        fn create(&self, _zone_id: i64, _ty: CorrectionType, setpoint: f64) -> Box<dyn AdaptivePid> {
            Box::new(FixedPid { output: self.0, setpoint })
        }
    }

    struct Allow(bool);

    #[async_trait]
    impl CorrectionOracle for Allow {
        async fn should_apply_correction(&self, _: i64, _: CorrectionType, _: f64, _: f64) -> OracleDecision {
            if self.0 {
                OracleDecision::apply()
            } else {
                OracleDecision::skip("cooldown active")
            }
        }
        async fn record_correction(&self, _: i64, _: CorrectionType, _: f64, _: f64) {}
    }

    fn now_ts() -> String {
        OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap()
    }

    fn ph_snapshot(current: f64) -> ZoneSnapshot {
        ZoneSnapshot {
            zone_id: 1,
            targets: ZoneTargets {
                ph: Some(MetricTarget::Band { target: 6.5, min: Some(6.4), max: Some(6.6) }),
                ..Default::default()
            },
            telemetry: HashMap::from([("PH".to_string(), current)]),
            telemetry_timestamps: HashMap::from([("PH".to_string(), now_ts())]),
            water_level_ok: true,
            actuators: HashMap::from([(
                "ph_acid_pump".to_string(),
                ActuatorBinding { node_uid: "nd-ph".into(), channel: "acid".into(), ml_per_sec: None },
            )]),
            ..Default::default()
        }
    }

    fn controller(store: Arc<MemoryStore>, output: f64, allow: bool) -> CorrectionController {
        let settings = CorrectionSettings { dead_zone: 0.2, critical_diff: Some(1.0), ..Default::default() };
        CorrectionController::new(
            CorrectionType::Ph,
            settings,
            Arc::new(FixedFactory(output)),
            Arc::new(Allow(allow)),
            store.clone(),
            store,
        )
    }

    #[tokio::test]
    async fn acid_dose_when_ph_is_high() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller(store.clone(), 3.0, true);

        let cmd = ctl.check_and_correct(&ph_snapshot(6.8)).await.unwrap();
        assert_eq!(cmd.kind, CorrectionKind::AddAcid);
        assert_eq!(cmd.command().cmd(), "dose");
        assert_eq!(cmd.action, CommandAction::Dose(DoseParams { kind: "add_acid".into(), ml: Some(3.0) }));
        assert_eq!(cmd.event_type(), "PH_CORRECTED");
        assert_eq!(store.events_of(events::PID_OUTPUT).len(), 1);
    }

    #[tokio::test]
    async fn base_dose_when_ph_is_low() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller(store.clone(), -2.0, true);
        let mut snap = ph_snapshot(6.1);
        snap.actuators.insert(
            "ph_base_pump".into(),
            ActuatorBinding { node_uid: "nd-ph".into(), channel: "base".into(), ml_per_sec: None },
        );

        let cmd = ctl.check_and_correct(&snap).await.unwrap();
        assert_eq!(cmd.kind, CorrectionKind::AddBase);
        assert_eq!(cmd.channel, "base");
        assert_eq!(cmd.ml, 2.0);
    }

    #[tokio::test]
    async fn dead_zone_and_band_produce_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller(store.clone(), 3.0, true);
        assert!(ctl.check_and_correct(&ph_snapshot(6.55)).await.is_none());
        assert!(ctl.check_and_correct(&ph_snapshot(6.68)).await.is_none());
        assert!(store.events_of(events::PID_OUTPUT).is_empty());
    }

    #[tokio::test]
    async fn missing_timestamp_fails_closed_and_alerts_at_threshold() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller(store.clone(), 3.0, true);
        let mut snap = ph_snapshot(6.8);
        snap.telemetry_timestamps.clear();

        for _ in 0..3 {
            assert!(ctl.check_and_correct(&snap).await.is_none());
        }
        assert_eq!(store.events_of(events::CORRECTION_SKIPPED_FRESHNESS_CHECK_FAILED).len(), 3);
        assert_eq!(store.alerts_of(alerts::FRESHNESS_CHECK_FAILED).len(), 1);
        assert_eq!(ctl.freshness_failures(1), 3);

        assert!(ctl.check_and_correct(&ph_snapshot(6.8)).await.is_some());
        assert_eq!(ctl.freshness_failures(1), 0);
    }

    #[tokio::test]
    async fn stale_timestamp_emits_stale_event() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller(store.clone(), 3.0, true);
        let mut snap = ph_snapshot(6.8);
        snap.telemetry_timestamps.insert("PH".into(), "2020-01-01T00:00:00Z".into());

        assert!(ctl.check_and_correct(&snap).await.is_none());
        assert_eq!(store.events_of("PH_CORRECTION_SKIPPED_STALE_DATA").len(), 1);
    }

    #[tokio::test]
    async fn oracle_refusal_and_low_water_skip() {
        let store = Arc::new(MemoryStore::new());
        let mut refusing = controller(store.clone(), 3.0, false);
        assert!(refusing.check_and_correct(&ph_snapshot(6.8)).await.is_none());

        let mut ctl = controller(store.clone(), 3.0, true);
        let mut dry = ph_snapshot(6.8);
        dry.water_level_ok = false;
        assert!(ctl.check_and_correct(&dry).await.is_none());

        let skipped = store.events_of("PH_CORRECTION_SKIPPED");
        assert_eq!(skipped.len(), 2);
        assert_eq!(skipped[1].details["reason"], "water_level_low");
    }

    #[tokio::test]
    async fn legacy_nodes_are_never_a_fallback() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller(store.clone(), 3.0, true);
        let mut snap = ph_snapshot(6.8);
        snap.actuators.clear();
        snap.nodes.insert(
            "ph".into(),
            crate::models::NodeInfo { node_uid: "nd-ph".into(), node_type: "ph".into(), channel: Some("acid".into()) },
        );

        assert!(ctl.check_and_correct(&snap).await.is_none());
        let skipped = store.events_of("PH_CORRECTION_SKIPPED");
        assert_eq!(skipped[0].details["reason"], "actuator_binding_missing");
    }

    #[tokio::test]
    async fn zero_output_aborts_quietly() {
        let store = Arc::new(MemoryStore::new());
        let mut ctl = controller(store.clone(), 0.0, true);
        assert!(ctl.check_and_correct(&ph_snapshot(6.8)).await.is_none());
        assert_eq!(store.events_of(events::PID_OUTPUT).len(), 1);
        assert!(store.events_of("PH_CORRECTION_SKIPPED").is_empty());
    }

    #[tokio::test]
    async fn persisted_pid_state_is_restored_once() {
        let store = Arc::new(MemoryStore::new());
        store.put_pid_state(
            1,
            CorrectionType::Ph,
            PidState { zone: PidZone::Far, integral: 2.5, prev_error: 0.3, setpoint: 6.5 },
        );
        let settings = CorrectionSettings { dead_zone: 0.2, ..Default::default() };
        let mut ctl = CorrectionController::new(
            CorrectionType::Ph,
            settings,
            Arc::new(pid::ZonedPidFactory::default()),
            Arc::new(Allow(true)),
            store.clone(),
            store.clone(),
        );

        let cmd = ctl.check_and_correct(&ph_snapshot(6.8)).await.unwrap();
        assert!(cmd.context.pid_integral.unwrap() > 2.5);

        ctl.invalidate_zone(1);
        assert_eq!(ctl.freshness_failures(1), 0);
    }
}
