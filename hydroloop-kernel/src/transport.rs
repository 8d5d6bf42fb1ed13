//! Command transport towards the device gateway.
//!
//! `POST {base_url}/commands` with a bearer token; only HTTP 200 carrying
//! `{data: {command_id}}` counts as accepted.

use crate::config::GatewayConf;
use crate::error::DeliveryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Body of the gateway publish call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishRequest {
    pub cmd: String,
    pub greenhouse_uid: String,
    pub zone_id: i64,
    pub node_uid: String,
    pub channel: String,
    pub source: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishAck {
    pub command_id: String,
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishAck, DeliveryError>;
}

#[derive(Deserialize)]
struct GatewayEnvelope {
    data: Option<GatewayData>,
}

#[derive(Deserialize)]
struct GatewayData {
    command_id: Option<Value>,
}

pub struct HttpGateway {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpGateway {
    pub fn new(conf: &GatewayConf) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout_secs.max(1)))
            .build()
            .map_err(|e| DeliveryError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/commands", conf.base_url.trim_end_matches('/')),
            token: conf.token.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Extracts `data.command_id` (string or number) from a gateway answer.
pub fn parse_gateway_ack(body: &str) -> Result<PublishAck, DeliveryError> {
    let envelope: GatewayEnvelope =
        serde_json::from_str(body).map_err(|e| DeliveryError::InvalidResponse(e.to_string()))?;
    let command_id = match envelope.data.and_then(|d| d.command_id) {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(DeliveryError::InvalidResponse("missing data.command_id".into())),
    };
    Ok(PublishAck { command_id })
}

#[async_trait]
impl CommandTransport for HttpGateway {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishAck, DeliveryError> {
        let mut http = self.client.post(&self.endpoint).json(request);
        if let Some(token) = self.token.as_deref() {
            http = http.bearer_auth(token);
        }
        if let Some(trace_id) = request.trace_id.as_deref() {
            http = http.header("X-Trace-Id", trace_id);
        }

        let response = http.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Transport(format!("gateway request timed out: {e}"))
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status != reqwest::StatusCode::OK {
            return Err(DeliveryError::HttpStatus { status: status.as_u16(), body });
        }

        let ack = parse_gateway_ack(&body)?;
        tracing::debug!(
            cmd = %request.cmd,
            node_uid = %request.node_uid,
            command_id = %ack.command_id,
            "gateway accepted command"
        );
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_accepts_string_or_numeric_id() {
        assert_eq!(parse_gateway_ack(r#"{"data":{"command_id":"gw-9"}}"#).unwrap().command_id, "gw-9");
        assert_eq!(parse_gateway_ack(r#"{"data":{"command_id":42}}"#).unwrap().command_id, "42");
    }

    #[test]
    fn ack_without_id_is_invalid() {
        for body in [r#"{"data":{}}"#, r#"{"status":"ok"}"#, "not json", r#"{"data":{"command_id":""}}"#] {
            assert!(matches!(parse_gateway_ack(body), Err(DeliveryError::InvalidResponse(_))), "{body}");
        }
    }

    #[test]
    fn request_omits_absent_ids() {
        let req = PublishRequest {
            cmd: "dose".into(),
            greenhouse_uid: "gh-1".into(),
            zone_id: 3,
            node_uid: "nd-ph".into(),
            channel: "acid".into(),
            source: "automation-engine".into(),
            params: json!({"type": "add_acid", "ml": 3.0}),
            cmd_id: None,
            trace_id: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("cmd_id").is_none());
        assert_eq!(value["params"]["ml"], 3.0);
    }

    #[test]
    fn endpoint_is_normalized() {
        let conf = GatewayConf { base_url: "http://gw:9300/".into(), ..GatewayConf::default() };
        assert_eq!(HttpGateway::new(&conf).unwrap().endpoint(), "http://gw:9300/commands");
    }
}
