/*!
Mock de la gateway de commandes

Remplace `HttpGateway` dans les tests : enregistre chaque requête publiée,
peut échouer sur demande et simule le node qui répond au `cmd_id` tracké.
*/

use async_trait::async_trait;
use hydroloop_kernel::error::DeliveryError;
use hydroloop_kernel::models::CommandStatus;
use hydroloop_kernel::tracker::CommandTracker;
use hydroloop_kernel::transport::{CommandTransport, PublishAck, PublishRequest};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Réponse simulée du node après une publication acceptée
#[derive(Debug, Clone, Copy)]
pub struct DeviceReply {
    pub status: CommandStatus,
    pub delay: Duration,
}

#[derive(Default)]
pub struct MockGateway {
    requests: Mutex<Vec<PublishRequest>>,
    failures: Mutex<u32>,
    down: Mutex<bool>,
    tracker: Mutex<Option<CommandTracker>>,
    replies: Mutex<VecDeque<DeviceReply>>,
    default_reply: Mutex<Option<DeviceReply>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Branche le tracker que le "node" utilise pour répondre
    pub fn attach_tracker(&self, tracker: CommandTracker) {
        *self.tracker.lock() = Some(tracker);
    }

    /// Les `n` prochaines publications échouent en HTTP 503
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock() = n;
    }

    /// Gateway injoignable jusqu'à nouvel ordre
    pub fn set_down(&self, down: bool) {
        *self.down.lock() = down;
    }

    /// Statut renvoyé pour chaque commande acceptée (hors file scriptée)
    pub fn always_reply(&self, status: CommandStatus) {
        *self.default_reply.lock() = Some(DeviceReply { status, delay: Duration::ZERO });
    }

    /// Ajoute une réponse scriptée, consommée dans l'ordre des publications
    pub fn push_reply(&self, status: CommandStatus, delay: Duration) {
        self.replies.lock().push_back(DeviceReply { status, delay });
    }

    /// Plus aucune réponse : les commandes finiront en TIMEOUT
    pub fn stay_silent(&self) {
        self.replies.lock().clear();
        *self.default_reply.lock() = None;
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Millilitres publiés, dans l'ordre
    pub fn published_ml(&self) -> Vec<f64> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| r.params.get("ml").and_then(|v| v.as_f64()))
            .collect()
    }

    fn next_reply(&self) -> Option<DeviceReply> {
        self.replies.lock().pop_front().or(*self.default_reply.lock())
    }
}

#[async_trait]
impl CommandTransport for MockGateway {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishAck, DeliveryError> {
        let seq = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };
        tracing::debug!(cmd = %request.cmd, node_uid = %request.node_uid, seq, "[MOCK] gateway publish");

        if *self.down.lock() {
            return Err(DeliveryError::Transport("connection refused".into()));
        }
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(DeliveryError::HttpStatus { status: 503, body: "gateway overloaded".into() });
            }
        }

        let tracker = self.tracker.lock().clone();
        if let (Some(tracker), Some(cmd_id)) = (tracker, request.cmd_id.clone()) {
            if let Some(reply) = self.next_reply() {
                tokio::spawn(async move {
                    if !reply.delay.is_zero() {
                        tokio::time::sleep(reply.delay).await;
                    }
                    tracker.apply_device_status(&cmd_id, reply.status, None, None).await;
                });
            }
        }

        Ok(PublishAck { command_id: format!("gw-{seq}") })
    }
}
