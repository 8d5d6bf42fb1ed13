/*!
Test Harness pour le kernel HydroLoop

Assemble un CommandBus complet sur un `MemoryStore` et une `MockGateway` :
- tracker, validateur, audit et breaker réels
- node simulé qui répond aux commandes trackées
- assertions sur les événements de zone et les alertes
*/

use crate::control_stubs::{ScriptedPidFactory, StaticOracle};
use crate::fixtures::ZoneFixture;
use crate::gateway_stub::MockGateway;
use anyhow::Result;
use hydroloop_kernel::bus::{BusSettings, CommandBus};
use hydroloop_kernel::circuit_breaker::{BreakerSettings, CircuitBreaker};
use hydroloop_kernel::config::{ClosedLoopConf, CorrectionSettings, ValidatorLimits};
use hydroloop_kernel::correction::CorrectionController;
use hydroloop_kernel::models::{CorrectionType, ZoneEventRecord};
use hydroloop_kernel::ports::MemoryStore;
use hydroloop_kernel::tracker::CommandTracker;
use hydroloop_kernel::validator::CommandValidator;
use std::sync::Arc;
use std::time::Duration;

/// Init logging pour tests (idempotent)
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

pub struct HarnessBuilder {
    greenhouse_uid: String,
    closed_loop: ClosedLoopConf,
    command_timeout: Duration,
    validator: ValidatorLimits,
    breaker: Option<BreakerSettings>,
}

impl HarnessBuilder {
    pub fn closed_loop_timeout(mut self, secs: u64) -> Self {
        self.closed_loop.timeout_secs = secs;
        self
    }

    pub fn rollback_on_timeout(mut self, enabled: bool) -> Self {
        self.closed_loop.rollback_on_timeout = enabled;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn validator(mut self, limits: ValidatorLimits) -> Self {
        self.validator = limits;
        self
    }

    pub fn with_breaker(mut self, settings: BreakerSettings) -> Self {
        self.breaker = Some(settings);
        self
    }

    pub fn build(self) -> TestHarness {
        init_tracing();

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let tracker = CommandTracker::new(store.clone(), store.clone(), self.command_timeout);
        gateway.attach_tracker(tracker.clone());

        let settings = BusSettings {
            greenhouse_uid: self.greenhouse_uid,
            source: "automation-engine".to_string(),
            closed_loop: self.closed_loop,
        };
        let mut bus = CommandBus::new(
            settings,
            store.clone(),
            store.clone(),
            gateway.clone(),
            tracker,
            CommandValidator::new(self.validator),
        );
        let breaker = self.breaker.map(|s| Arc::new(CircuitBreaker::new("command-gateway", s)));
        if let Some(breaker) = &breaker {
            bus = bus.with_breaker(breaker.clone());
        }

        TestHarness { store, gateway, bus, breaker }
    }
}

/// Harness de test complet : store mémoire + gateway mock + bus réel
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<MockGateway>,
    pub bus: CommandBus,
    pub breaker: Option<Arc<CircuitBreaker>>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            greenhouse_uid: "gh-test".to_string(),
            closed_loop: ClosedLoopConf { timeout_secs: 60, poll_interval_ms: 100, rollback_on_timeout: false },
            command_timeout: Duration::from_secs(30),
            validator: ValidatorLimits::default(),
            breaker: None,
        }
    }

    pub fn tracker(&self) -> &CommandTracker {
        self.bus.tracker()
    }

    /// Affecte au store tous les nodes référencés par la fixture
    pub fn register_zone(&self, fixture: &ZoneFixture) {
        let zone_id = fixture.zone_id();
        for node in fixture.node_uids() {
            self.store.assign_node(&node, zone_id);
        }
    }

    /// Contrôleur branché sur le store du harness
    pub fn controller(
        &self,
        correction_type: CorrectionType,
        pid: ScriptedPidFactory,
        oracle: Arc<StaticOracle>,
        settings: CorrectionSettings,
    ) -> CorrectionController {
        CorrectionController::new(
            correction_type,
            settings,
            Arc::new(pid),
            oracle,
            self.store.clone(),
            self.store.clone(),
        )
    }

    pub fn events(&self, event_type: &str) -> Vec<ZoneEventRecord> {
        self.store.events_of(event_type)
    }

    /// Dernier événement de ce type pour la zone
    pub fn expect_event(&self, zone_id: i64, event_type: &str) -> Result<ZoneEventRecord> {
        self.store
            .events_of(event_type)
            .into_iter()
            .filter(|e| e.zone_id == zone_id)
            .last()
            .ok_or_else(|| anyhow::anyhow!("no {event_type} event for zone {zone_id}"))
    }

    pub fn expect_no_event(&self, event_type: &str) -> Result<()> {
        let found = self.store.events_of(event_type).len();
        if found > 0 {
            anyhow::bail!("expected no {event_type} event, found {found}");
        }
        Ok(())
    }

    pub fn expect_alert(&self, code: &str) -> Result<()> {
        if self.store.alerts_of(code).is_empty() {
            anyhow::bail!("alert {code} not raised");
        }
        Ok(())
    }
}
