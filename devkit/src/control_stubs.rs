/*!
Stubs du côté contrôle : PID scripté et oracle statique

Le PID scripté renvoie une sortie fixe (ou une suite de sorties) et garde
la trace des `dt` reçus, ce qui permet de tester le contrôleur sans
dépendre des gains réels.
*/

use async_trait::async_trait;
use hydroloop_kernel::correction::cooldown::{CorrectionOracle, OracleDecision};
use hydroloop_kernel::correction::pid::{AdaptivePid, PidFactory, PidState};
use hydroloop_kernel::models::{CorrectionType, PidZone};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub struct ScriptedPid {
    outputs: VecDeque<f64>,
    last: f64,
    setpoint: f64,
    integral: f64,
    dts: Arc<Mutex<Vec<f64>>>,
}

impl AdaptivePid for ScriptedPid {
    fn compute(&mut self, current: f64, dt: f64) -> f64 {
        self.dts.lock().push(dt);
        if let Some(next) = self.outputs.pop_front() {
            self.last = next;
        }
        self.integral += (current - self.setpoint) * dt;
        self.last
    }

    fn zone(&self) -> PidZone {
        PidZone::Far
    }

    fn update_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    fn state(&self) -> PidState {
        PidState { zone: PidZone::Far, integral: self.integral, prev_error: 0.0, setpoint: self.setpoint }
    }

    fn restore(&mut self, state: &PidState) {
        self.integral = state.integral;
    }
}

/// Fabrique des `ScriptedPid` partageant le même journal de `dt`
#[derive(Clone)]
pub struct ScriptedPidFactory {
    outputs: Vec<f64>,
    dts: Arc<Mutex<Vec<f64>>>,
}

impl ScriptedPidFactory {
    /// Sortie constante
    pub fn fixed(output: f64) -> Self {
        Self::sequence(vec![output])
    }

    /// Sorties successives ; la dernière est répétée ensuite
    pub fn sequence(outputs: Vec<f64>) -> Self {
        Self { outputs, dts: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn dts(&self) -> Vec<f64> {
        self.dts.lock().clone()
    }
}

impl PidFactory for ScriptedPidFactory {
    fn create(&self, _zone_id: i64, _correction_type: CorrectionType, setpoint: f64) -> Box<dyn AdaptivePid> {
        Box::new(ScriptedPid {
            outputs: self.outputs.iter().copied().collect(),
            last: 0.0,
            setpoint,
            integral: 0.0,
            dts: self.dts.clone(),
        })
    }
}

/// Oracle qui accepte (ou refuse) toujours, et compte les corrections enregistrées
#[derive(Default)]
pub struct StaticOracle {
    refuse_with: Option<String>,
    recorded: Mutex<Vec<(i64, CorrectionType)>>,
}

impl StaticOracle {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn refuse(reason: impl Into<String>) -> Self {
        Self { refuse_with: Some(reason.into()), recorded: Mutex::new(Vec::new()) }
    }

    pub fn recorded(&self) -> Vec<(i64, CorrectionType)> {
        self.recorded.lock().clone()
    }
}

#[async_trait]
impl CorrectionOracle for StaticOracle {
    async fn should_apply_correction(
        &self,
        _zone_id: i64,
        _correction_type: CorrectionType,
        _current: f64,
        _target: f64,
    ) -> OracleDecision {
        match &self.refuse_with {
            Some(reason) => OracleDecision::skip(reason.clone()),
            None => OracleDecision::apply(),
        }
    }

    async fn record_correction(&self, zone_id: i64, correction_type: CorrectionType, _current: f64, _target: f64) {
        self.recorded.lock().push((zone_id, correction_type));
    }
}
