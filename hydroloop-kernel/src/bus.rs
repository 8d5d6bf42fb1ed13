/**
 * COMMAND BUS - Point de passage unique des commandes vers les actionneurs
 *
 * RÔLE :
 * Toute commande de contrôleur passe ici : vérification d'appartenance
 * node → zone, validation, tracking, publication HTTP derrière le circuit
 * breaker, audit systématique.
 *
 * FONCTIONNEMENT (publish_controller_command) :
 * 1. node_zone(node) == zone sinon refus + événement + alerte (fail-closed)
 * 2. CommandValidator                     → COMMAND_VALIDATION_FAILED
 * 3. CommandTracker.track_command         → sans cmd_id si le tracker est indisponible
 * 4. POST gateway via CircuitBreaker      → BreakerOpen / Transport / HttpStatus
 * 5. CommandAudit (toujours, quel que soit le résultat)
 * 6. Échec de publication + cmd_id        → SEND_FAILED immédiat
 *
 * BOUCLE FERMÉE :
 * Attend un statut terminal dans le tracker. Seul DONE confirme l'effet ;
 * tout le reste est une non-confirmation distincte et alertée.
 */

use crate::audit::CommandAudit;
use crate::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::config::{ClosedLoopConf, KernelConfig};
use crate::error::DeliveryError;
use crate::events::{self, alerts};
use crate::models::{Command, CommandStatus, DecisionContext};
use crate::ports::{AlertSink, Store};
use crate::rollback::CommandRollback;
use crate::tracker::CommandTracker;
use crate::transport::{CommandTransport, PublishRequest};
use crate::validator::CommandValidator;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub greenhouse_uid: String,
    pub source: String,
    pub closed_loop: ClosedLoopConf,
}

impl BusSettings {
    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self {
            greenhouse_uid: cfg.greenhouse_uid.clone(),
            source: cfg.gateway.source.clone(),
            closed_loop: cfg.closed_loop.clone(),
        }
    }
}

/// Accepted publication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReceipt {
    /// `None` when the tracker was unavailable.
    pub cmd_id: Option<String>,
    pub gateway_command_id: String,
}

/// Final status seen by the closed loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosedLoopStatus {
    Done,
    Error,
    Invalid,
    Busy,
    NoEffect,
    Timeout,
    SendFailed,
    TrackerUnavailable,
}

impl ClosedLoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosedLoopStatus::Done => "DONE",
            ClosedLoopStatus::Error => "ERROR",
            ClosedLoopStatus::Invalid => "INVALID",
            ClosedLoopStatus::Busy => "BUSY",
            ClosedLoopStatus::NoEffect => "NO_EFFECT",
            ClosedLoopStatus::Timeout => "TIMEOUT",
            ClosedLoopStatus::SendFailed => "SEND_FAILED",
            ClosedLoopStatus::TrackerUnavailable => "TRACKER_UNAVAILABLE",
        }
    }
}

impl From<CommandStatus> for ClosedLoopStatus {
    fn from(status: CommandStatus) -> Self {
        match status {
            CommandStatus::Done => ClosedLoopStatus::Done,
            CommandStatus::Error => ClosedLoopStatus::Error,
            CommandStatus::Invalid => ClosedLoopStatus::Invalid,
            CommandStatus::Busy => ClosedLoopStatus::Busy,
            CommandStatus::NoEffect => ClosedLoopStatus::NoEffect,
            CommandStatus::SendFailed => ClosedLoopStatus::SendFailed,
            CommandStatus::Timeout | CommandStatus::Pending | CommandStatus::Ack => ClosedLoopStatus::Timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedLoopOutcome {
    pub command_submitted: bool,
    pub command_effect_confirmed: bool,
    pub cmd_id: Option<String>,
    pub terminal_status: ClosedLoopStatus,
    pub error_code: Option<String>,
    pub error: Option<String>,
}

impl ClosedLoopOutcome {
    fn refused(status: ClosedLoopStatus, err: &DeliveryError) -> Self {
        Self {
            command_submitted: false,
            command_effect_confirmed: false,
            cmd_id: None,
            terminal_status: status,
            error_code: Some(err.code().to_string()),
            error: Some(err.to_string()),
        }
    }
}

pub struct CommandBus {
    settings: BusSettings,
    store: Arc<dyn Store>,
    alerts: Arc<dyn AlertSink>,
    transport: Arc<dyn CommandTransport>,
    validator: CommandValidator,
    tracker: CommandTracker,
    audit: CommandAudit,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl CommandBus {
    pub fn new(
        settings: BusSettings,
        store: Arc<dyn Store>,
        alerts: Arc<dyn AlertSink>,
        transport: Arc<dyn CommandTransport>,
        tracker: CommandTracker,
        validator: CommandValidator,
    ) -> Self {
        let audit = CommandAudit::new(store.clone(), alerts.clone());
        Self {
            settings,
            store,
            alerts,
            transport,
            validator,
            tracker,
            audit,
            breaker: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn tracker(&self) -> &CommandTracker {
        &self.tracker
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    async fn verify_ownership(&self, zone_id: i64, command: &Command) -> Result<(), DeliveryError> {
        let assigned = match self.store.node_zone(&command.node_uid).await {
            Ok(assigned) => assigned,
            Err(e) => {
                let details = json!({
                    "node_uid": command.node_uid,
                    "zone_id": zone_id,
                    "cmd": command.cmd(),
                    "reason": "node_lookup_failed",
                    "error": e.to_string(),
                });
                tracing::error!(zone_id, node_uid = %command.node_uid, error = %e, "node lookup failed, command refused");
                events::emit(self.store.as_ref(), zone_id, events::COMMAND_ZONE_NODE_MISMATCH, details.clone()).await;
                events::raise(self.alerts.as_ref(), Some(zone_id), alerts::NODE_LOOKUP_FAILED, details).await;
                return Err(DeliveryError::NodeLookup(e.to_string()));
            }
        };

        if assigned == Some(zone_id) {
            return Ok(());
        }

        let details = json!({
            "node_uid": command.node_uid,
            "zone_id": zone_id,
            "assigned_zone_id": assigned,
            "cmd": command.cmd(),
        });
        tracing::error!(zone_id, node_uid = %command.node_uid, ?assigned, "node does not belong to zone, command refused");
        events::emit(self.store.as_ref(), zone_id, events::COMMAND_ZONE_NODE_MISMATCH, details.clone()).await;
        events::raise(self.alerts.as_ref(), Some(zone_id), alerts::COMMAND_ZONE_NODE_MISMATCH, details).await;
        Err(DeliveryError::ZoneNodeMismatch {
            node_uid: command.node_uid.clone(),
            zone_id,
            assigned_zone: assigned,
        })
    }

    async fn send(&self, request: &PublishRequest) -> Result<crate::transport::PublishAck, DeliveryError> {
        match &self.breaker {
            Some(breaker) => breaker
                .call(|| self.transport.publish(request))
                .await
                .map_err(|e| match e {
                    BreakerError::Open { name } => DeliveryError::BreakerOpen { name },
                    BreakerError::Inner(inner) => inner,
                }),
            None => self.transport.publish(request).await,
        }
    }

    pub async fn publish_controller_command(
        &self,
        zone_id: i64,
        command: &Command,
        context: &DecisionContext,
    ) -> Result<PublishReceipt, DeliveryError> {
        self.verify_ownership(zone_id, command).await?;

        if let Err(e) = self.validator.validate(command) {
            let details = json!({
                "cmd": command.cmd(),
                "node_uid": command.node_uid,
                "channel": command.channel,
                "field": e.field,
                "error": e.message,
            });
            tracing::warn!(zone_id, cmd = command.cmd(), error = %e, "command validation failed");
            events::emit(self.store.as_ref(), zone_id, events::COMMAND_VALIDATION_FAILED, details.clone()).await;
            events::raise(self.alerts.as_ref(), Some(zone_id), alerts::COMMAND_VALIDATION_FAILED, details).await;
            return Err(e.into());
        }

        let cmd_id = match self.tracker.track_command(zone_id, command, context).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(zone_id, cmd = command.cmd(), error = %e, "tracker unavailable, publishing untracked");
                events::raise(
                    self.alerts.as_ref(),
                    Some(zone_id),
                    alerts::TRACKER_UNAVAILABLE,
                    json!({"cmd": command.cmd(), "node_uid": command.node_uid, "error": e.to_string()}),
                )
                .await;
                None
            }
        };

        let request = PublishRequest {
            cmd: command.cmd().to_string(),
            greenhouse_uid: self.settings.greenhouse_uid.clone(),
            zone_id,
            node_uid: command.node_uid.clone(),
            channel: command.channel.clone(),
            source: self.settings.source.clone(),
            params: command.action.params_json(),
            cmd_id: cmd_id.clone(),
            trace_id: Some(context.trace_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string())),
        };

        let result = self.send(&request).await;
        self.audit.audit_command(zone_id, command, context).await;

        match result {
            Ok(ack) => {
                tracing::info!(
                    zone_id,
                    cmd = command.cmd(),
                    node_uid = %command.node_uid,
                    channel = %command.channel,
                    cmd_id = ?cmd_id,
                    "command published"
                );
                Ok(PublishReceipt { cmd_id, gateway_command_id: ack.command_id })
            }
            Err(e) => {
                if let Some(id) = cmd_id.as_deref() {
                    self.tracker.mark_send_failed(id, e.to_string()).await;
                }
                tracing::warn!(zone_id, cmd = command.cmd(), code = e.code(), error = %e, "command publish failed");
                events::raise(
                    self.alerts.as_ref(),
                    Some(zone_id),
                    alerts::COMMAND_PUBLISH_FAILED,
                    json!({
                        "cmd": command.cmd(),
                        "node_uid": command.node_uid,
                        "cmd_id": cmd_id,
                        "error_code": e.code(),
                        "error": e.to_string(),
                    }),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Publishes then waits for the device-reported terminal status.
    ///
    /// `timeout` defaults to the configured closed-loop timeout plus the pump
    /// run time carried by the command. Only a breaker-open error is returned
    /// as `Err`; every other failure is a non-confirmed outcome.
    pub async fn publish_controller_command_closed_loop(
        &self,
        zone_id: i64,
        command: &Command,
        context: &DecisionContext,
        timeout: Option<Duration>,
    ) -> Result<ClosedLoopOutcome, DeliveryError> {
        let outcome = match self.publish_controller_command(zone_id, command, context).await {
            Err(e) if e.is_breaker_open() => return Err(e),
            Err(e @ DeliveryError::Validation(_)) => ClosedLoopOutcome::refused(ClosedLoopStatus::Invalid, &e),
            Err(e) => ClosedLoopOutcome::refused(ClosedLoopStatus::SendFailed, &e),
            Ok(PublishReceipt { cmd_id: None, .. }) => ClosedLoopOutcome {
                command_submitted: true,
                command_effect_confirmed: false,
                cmd_id: None,
                terminal_status: ClosedLoopStatus::TrackerUnavailable,
                error_code: Some("tracker_unavailable".into()),
                error: Some("command published without tracking id".into()),
            },
            Ok(PublishReceipt { cmd_id: Some(cmd_id), .. }) => {
                let timeout = timeout.unwrap_or_else(|| self.default_closed_loop_timeout(command));
                let status = self.wait_terminal(&cmd_id, timeout).await;
                let terminal_status = ClosedLoopStatus::from(status);
                let confirmed = terminal_status == ClosedLoopStatus::Done;
                ClosedLoopOutcome {
                    command_submitted: true,
                    command_effect_confirmed: confirmed,
                    cmd_id: Some(cmd_id),
                    terminal_status,
                    error_code: (!confirmed).then(|| terminal_status.as_str().to_ascii_lowercase()),
                    error: None,
                }
            }
        };

        if !outcome.command_effect_confirmed {
            self.report_not_confirmed(zone_id, command, &outcome).await;
        }
        Ok(outcome)
    }

    fn default_closed_loop_timeout(&self, command: &Command) -> Duration {
        let run = command
            .action
            .duration_ms()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or_default();
        self.settings.closed_loop.timeout() + run
    }

    async fn wait_terminal(&self, cmd_id: &str, timeout: Duration) -> CommandStatus {
        let deadline = Instant::now() + timeout;
        let poll = self.settings.closed_loop.poll_interval();
        loop {
            if let Some(status) = self.tracker.get_status(cmd_id).await {
                if status.is_terminal() {
                    return status;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return CommandStatus::Timeout;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn report_not_confirmed(&self, zone_id: i64, command: &Command, outcome: &ClosedLoopOutcome) {
        tracing::warn!(
            zone_id,
            cmd = command.cmd(),
            node_uid = %command.node_uid,
            status = outcome.terminal_status.as_str(),
            "command effect not confirmed"
        );
        events::raise(
            self.alerts.as_ref(),
            Some(zone_id),
            alerts::COMMAND_EFFECT_NOT_CONFIRMED,
            json!({
                "cmd": command.cmd(),
                "node_uid": command.node_uid,
                "channel": command.channel,
                "cmd_id": outcome.cmd_id,
                "status": outcome.terminal_status,
                "error": outcome.error,
            }),
        )
        .await;

        if outcome.terminal_status == ClosedLoopStatus::Timeout && self.settings.closed_loop.rollback_on_timeout {
            CommandRollback::execute(self, zone_id, command, outcome.cmd_id.as_deref(), "timeout").await;
        }
    }
}
