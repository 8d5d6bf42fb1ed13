/**
 * COMMAND TRACKER - Cycle de vie des commandes envoyées aux nodes
 *
 * RÔLE :
 * Associe un `cmd_id` unique à chaque commande, garde l'entrée en mémoire tant
 * que le node n'a pas répondu et persiste chaque transition dans le store.
 *
 * FONCTIONNEMENT :
 * - track_command : ligne PENDING durable + entrée mémoire + watcher de timeout
 * - apply_device_status : ACK (non terminal) ou statut terminal remonté par le node
 * - watcher : si rien n'arrive avant l'échéance → TIMEOUT + événement + alerte
 * - Toute confirmation retire l'entrée mémoire ; la ligne durable reste pour l'audit
 *
 * CONCURRENCE :
 * Le watcher est annulé exactement une fois par la confirmation. S'il se
 * réveille malgré tout, l'entrée n'existe plus et il sort sans rien faire.
 */

use crate::events::{self, alerts};
use crate::models::{Command, CommandRecord, CommandStatus, CommandUpdate, DecisionContext};
use crate::ports::{AlertSink, Store, StoreError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct PendingCommand {
    zone_id: i64,
    command: Command,
    status: CommandStatus,
    started: Instant,
    timeout: Duration,
    watcher: Option<JoinHandle<()>>,
}

struct TrackerInner {
    store: Arc<dyn Store>,
    alerts: Arc<dyn AlertSink>,
    default_timeout: Duration,
    pending: Mutex<HashMap<String, PendingCommand>>,
}

/// Cheap to clone; clones share the pending map.
#[derive(Clone)]
pub struct CommandTracker {
    inner: Arc<TrackerInner>,
}

impl CommandTracker {
    pub fn new(store: Arc<dyn Store>, alerts: Arc<dyn AlertSink>, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                store,
                alerts,
                default_timeout,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Timeout for one command; pump runs get their own duration on top.
    pub fn timeout_for(&self, command: &Command) -> Duration {
        let run = command
            .action
            .duration_ms()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or_default();
        self.inner.default_timeout + run
    }

    pub async fn track_command(
        &self,
        zone_id: i64,
        command: &Command,
        context: &DecisionContext,
    ) -> Result<String, StoreError> {
        let cmd_id = uuid::Uuid::new_v4().to_string();
        let record = CommandRecord {
            cmd_id: cmd_id.clone(),
            zone_id,
            command: command.clone(),
            status: CommandStatus::Pending,
            sent_at: OffsetDateTime::now_utc(),
            completed_at: None,
            response: None,
            error: None,
            latency_seconds: None,
            context: context.clone(),
        };
        self.inner.store.insert_command(&record).await?;

        let timeout = self.timeout_for(command);
        self.inner.pending.lock().insert(
            cmd_id.clone(),
            PendingCommand {
                zone_id,
                command: command.clone(),
                status: CommandStatus::Pending,
                started: Instant::now(),
                timeout,
                watcher: None,
            },
        );

        let watcher = spawn_watcher(Arc::downgrade(&self.inner), cmd_id.clone(), timeout);
        match self.inner.pending.lock().get_mut(&cmd_id) {
            Some(entry) => entry.watcher = Some(watcher),
            None => watcher.abort(),
        }

        tracing::debug!(zone_id, cmd_id = %cmd_id, cmd = command.cmd(), timeout_secs = timeout.as_secs_f64(), "command tracked");
        Ok(cmd_id)
    }

    /// Binary confirmation: DONE on success, ERROR otherwise.
    pub async fn confirm_command(
        &self,
        cmd_id: &str,
        success: bool,
        response: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let status = if success { CommandStatus::Done } else { CommandStatus::Error };
        self.finish(cmd_id, status, response, error).await
    }

    /// Applies a status reported by the device. Returns `false` for unknown
    /// or already finished commands.
    pub async fn apply_device_status(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        response: Option<Value>,
        error: Option<String>,
    ) -> bool {
        match status {
            CommandStatus::Pending => false,
            CommandStatus::Ack => {
                let known = match self.inner.pending.lock().get_mut(cmd_id) {
                    Some(entry) => {
                        entry.status = CommandStatus::Ack;
                        true
                    }
                    None => false,
                };
                if !known {
                    tracing::debug!(cmd_id, "ACK for unknown or finished command ignored");
                    return false;
                }
                let update = CommandUpdate {
                    cmd_id: cmd_id.to_string(),
                    status: CommandStatus::Ack,
                    completed_at: None,
                    response,
                    error: None,
                    latency_seconds: None,
                };
                if let Err(e) = self.inner.store.update_command(&update).await {
                    tracing::warn!(cmd_id, error = %e, "failed to persist ACK");
                }
                true
            }
            terminal => self.finish(cmd_id, terminal, response, error).await,
        }
    }

    pub async fn mark_send_failed(&self, cmd_id: &str, error: impl Into<String>) -> bool {
        self.finish(cmd_id, CommandStatus::SendFailed, None, Some(error.into())).await
    }

    /// In-memory status first, then the durable row.
    pub async fn get_status(&self, cmd_id: &str) -> Option<CommandStatus> {
        if let Some(entry) = self.inner.pending.lock().get(cmd_id) {
            return Some(entry.status);
        }
        match self.inner.store.get_command(cmd_id).await {
            Ok(record) => record.map(|r| r.status),
            Err(e) => {
                tracing::warn!(cmd_id, error = %e, "command status lookup failed");
                None
            }
        }
    }

    pub async fn get_record(&self, cmd_id: &str) -> Result<Option<CommandRecord>, StoreError> {
        self.inner.store.get_command(cmd_id).await
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, cmd_id: &str) -> bool {
        self.inner.pending.lock().contains_key(cmd_id)
    }

    async fn finish(
        &self,
        cmd_id: &str,
        status: CommandStatus,
        response: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let Some(mut entry) = self.inner.pending.lock().remove(cmd_id) else {
            tracing::info!(cmd_id, %status, "late or unknown confirmation ignored");
            return false;
        };
        if let Some(watcher) = entry.watcher.take() {
            watcher.abort();
        }
        self.inner.persist_terminal(cmd_id, &entry, status, response, error).await;
        true
    }
}

impl TrackerInner {
    async fn persist_terminal(
        &self,
        cmd_id: &str,
        entry: &PendingCommand,
        status: CommandStatus,
        response: Option<Value>,
        error: Option<String>,
    ) {
        let latency = entry.started.elapsed().as_secs_f64();
        let update = CommandUpdate {
            cmd_id: cmd_id.to_string(),
            status,
            completed_at: Some(OffsetDateTime::now_utc()),
            response,
            error,
            latency_seconds: Some(latency),
        };
        if let Err(e) = self.store.update_command(&update).await {
            tracing::warn!(cmd_id, %status, error = %e, "failed to persist command status");
        }
        tracing::info!(
            zone_id = entry.zone_id,
            cmd_id,
            cmd = entry.command.cmd(),
            %status,
            latency_seconds = latency,
            "command finished"
        );
    }

    async fn expire(&self, cmd_id: &str) {
        // the watcher is the running task: never abort it from here
        let Some(entry) = self.pending.lock().remove(cmd_id) else {
            return;
        };
        self.persist_terminal(cmd_id, &entry, CommandStatus::Timeout, None, Some("timeout".into()))
            .await;

        let details = json!({
            "cmd_id": cmd_id,
            "node_uid": entry.command.node_uid,
            "channel": entry.command.channel,
            "cmd": entry.command.cmd(),
            "timeout_secs": entry.timeout.as_secs_f64(),
        });
        events::emit(self.store.as_ref(), entry.zone_id, events::COMMAND_TIMEOUT, details.clone()).await;
        events::raise(self.alerts.as_ref(), Some(entry.zone_id), alerts::COMMAND_TIMEOUT, details).await;
    }
}

fn spawn_watcher(inner: Weak<TrackerInner>, cmd_id: String, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(&cmd_id).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandAction, RelayParams, RunPumpParams};
    use crate::ports::MemoryStore;

    fn relay() -> Command {
        Command::new("nd-1", "fan", CommandAction::SetRelay(RelayParams { state: Some(true) }))
    }

    fn tracker(store: &Arc<MemoryStore>) -> CommandTracker {
        CommandTracker::new(store.clone(), store.clone(), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_completes_and_cancels_timeout() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let id = tracker.track_command(3, &relay(), &DecisionContext::default()).await.unwrap();
        assert_eq!(tracker.get_status(&id).await, Some(CommandStatus::Pending));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.confirm_command(&id, true, Some(json!({"ok": true})), None).await);
        assert_eq!(tracker.pending_count(), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;

        let row = store.get_command(&id).await.unwrap().unwrap();
        assert_eq!(row.status, CommandStatus::Done);
        assert!(row.latency_seconds.unwrap() >= 2.0);
        assert!(store.events_of(events::COMMAND_TIMEOUT).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let id = tracker.track_command(3, &relay(), &DecisionContext::default()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(tracker.get_status(&id).await, Some(CommandStatus::Timeout));
        let row = store.get_command(&id).await.unwrap().unwrap();
        assert_eq!(row.error.as_deref(), Some("timeout"));
        assert_eq!(store.events_of(events::COMMAND_TIMEOUT).len(), 1);
        assert_eq!(store.alerts_of(alerts::COMMAND_TIMEOUT).len(), 1);

        // late confirmation is ignored
        assert!(!tracker.confirm_command(&id, true, None, None).await);
        assert_eq!(tracker.get_status(&id).await, Some(CommandStatus::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_keeps_command_pending() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let id = tracker.track_command(3, &relay(), &DecisionContext::default()).await.unwrap();

        assert!(tracker.apply_device_status(&id, CommandStatus::Ack, None, None).await);
        assert_eq!(tracker.get_status(&id).await, Some(CommandStatus::Ack));
        assert!(tracker.is_pending(&id));

        assert!(tracker.apply_device_status(&id, CommandStatus::Busy, None, Some("pump busy".into())).await);
        assert_eq!(tracker.get_status(&id).await, Some(CommandStatus::Busy));
    }

    #[tokio::test(start_paused = true)]
    async fn pump_duration_extends_timeout() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let pump = Command::new(
            "nd-1",
            "npk",
            CommandAction::RunPump(RunPumpParams { duration_ms: Some(20_000), ..Default::default() }),
        );
        assert_eq!(tracker.timeout_for(&pump), Duration::from_secs(50));

        let id = tracker.track_command(3, &pump, &DecisionContext::default()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(tracker.is_pending(&id));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(tracker.get_status(&id).await, Some(CommandStatus::Timeout));
    }

    #[tokio::test]
    async fn unavailable_store_refuses_tracking() {
        let store = Arc::new(MemoryStore::new());
        store.fail_commands(true);
        let tracker = tracker(&store);
        assert!(tracker.track_command(3, &relay(), &DecisionContext::default()).await.is_err());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(&store);
        let id = tracker.track_command(3, &relay(), &DecisionContext::default()).await.unwrap();
        assert!(tracker.mark_send_failed(&id, "gateway 502").await);
        let row = store.get_command(&id).await.unwrap().unwrap();
        assert_eq!(row.status, CommandStatus::SendFailed);
        assert_eq!(row.error.as_deref(), Some("gateway 502"));
    }
}
