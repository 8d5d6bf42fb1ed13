//! MQTT listener feeding device command responses into the tracker.
//!
//! Topic filter `hydro/+/+/+/+/command_response`, payload
//! `{cmd_id, status, details?, error?}`.

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::models::CommandStatus;
use crate::tracker::CommandTracker;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::task::{self, JoinHandle};

#[derive(Debug, Deserialize)]
struct RawResponse {
    cmd_id: String,
    status: String,
    #[serde(default)]
    details: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub cmd_id: String,
    pub status: CommandStatus,
    pub details: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown status '{0}'")]
    UnknownStatus(String),
    #[error("empty cmd_id")]
    MissingId,
}

pub fn parse_command_response(payload: &[u8]) -> Result<CommandResponse, ResponseError> {
    let raw: RawResponse = serde_json::from_slice(payload)?;
    if raw.cmd_id.trim().is_empty() {
        return Err(ResponseError::MissingId);
    }
    let status = CommandStatus::parse(&raw.status).ok_or(ResponseError::UnknownStatus(raw.status))?;
    Ok(CommandResponse {
        cmd_id: raw.cmd_id,
        status,
        details: raw.details,
        error: raw.error,
    })
}

/// Applies one response; returns whether the tracker knew the command.
pub async fn handle_response(tracker: &CommandTracker, topic: &str, payload: &[u8]) -> bool {
    match parse_command_response(payload) {
        Ok(resp) => {
            tracing::debug!(topic, cmd_id = %resp.cmd_id, status = %resp.status, "command response received");
            tracker
                .apply_device_status(&resp.cmd_id, resp.status, resp.details, resp.error)
                .await
        }
        Err(e) => {
            tracing::warn!(topic, error = %e, "invalid command response");
            false
        }
    }
}

pub fn spawn_response_listener(conf: MqttConf, tracker: CommandTracker, health: HealthTracker) -> JoinHandle<()> {
    task::spawn(async move {
        let mut opts = MqttOptions::new("hydroloop-kernel", &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        health.mark_mqtt_connecting();
        if let Err(e) = client.subscribe(&conf.response_topic, QoS::AtLeastOnce).await {
            tracing::error!(error = ?e, topic = %conf.response_topic, "MQTT subscribe failed");
            return;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    tracing::info!(host = %conf.host, port = conf.port, "MQTT connected");
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic.ends_with("/command_response") => {
                    handle_response(&tracker, &p.topic, &p.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = ?e, "MQTT error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Command, CommandAction, DecisionContext, RelayParams};
    use crate::ports::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn parses_status_aliases_and_details() {
        let resp =
            parse_command_response(br#"{"cmd_id":"c-1","status":"done","details":{"ml":3.0}}"#).unwrap();
        assert_eq!(resp.status, CommandStatus::Done);
        assert_eq!(resp.details.unwrap()["ml"], 3.0);

        assert!(matches!(
            parse_command_response(br#"{"cmd_id":"c-1","status":"exploded"}"#),
            Err(ResponseError::UnknownStatus(_))
        ));
        assert!(matches!(
            parse_command_response(br#"{"cmd_id":"","status":"DONE"}"#),
            Err(ResponseError::MissingId)
        ));
        assert!(parse_command_response(b"garbage").is_err());
    }

    #[tokio::test]
    async fn response_completes_tracked_command() {
        let store = Arc::new(MemoryStore::new());
        let tracker = CommandTracker::new(store.clone(), store.clone(), Duration::from_secs(30));
        let cmd = Command::new("nd-1", "fan", CommandAction::SetRelay(RelayParams { state: Some(true) }));
        let id = tracker.track_command(1, &cmd, &DecisionContext::default()).await.unwrap();

        let payload = format!(r#"{{"cmd_id":"{id}","status":"NO_EFFECT","error":"relay stuck"}}"#);
        assert!(handle_response(&tracker, "hydro/gh-1/z1/nd-1/fan/command_response", payload.as_bytes()).await);
        assert_eq!(tracker.get_status(&id).await, Some(CommandStatus::NoEffect));

        // duplicates are ignored
        assert!(!handle_response(&tracker, "hydro/gh-1/z1/nd-1/fan/command_response", payload.as_bytes()).await);
    }
}
