//! `graphql-ws` realtime subscriber. Runs its own connect/reconnect loop
//! in a background task; the caller drives it through a small command
//! channel and observes notifications/lifecycle through an event
//! channel, mirroring the shape of a gateway client event loop but
//! re-targeted at the `graphql-ws` envelope instead of a bespoke one.

#![forbid(unsafe_code)]

use agent_proto::Notification;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);
static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("invalid realtime endpoint: {0}")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Notification(Notification),
    Reconnected,
    Terminal,
}

enum ControlMsg {
    Subscribe(String),
    Disconnect,
}

pub struct RealtimeClient {
    control_tx: mpsc::UnboundedSender<ControlMsg>,
}

impl RealtimeClient {
    /// Spawns the connect/reconnect loop and returns a handle plus the
    /// event receiver. The first connection attempt happens inside the
    /// background task; callers that need to know whether it succeeded
    /// should watch for the first event or a `Terminal` without one.
    pub fn start(endpoint: String, api_key: String) -> (Self, mpsc::UnboundedReceiver<RealtimeEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(endpoint, api_key, control_rx, event_tx));
        (Self { control_tx }, event_rx)
    }

    pub fn subscribe(&self, tenant_code: impl Into<String>) {
        let _ = self.control_tx.send(ControlMsg::Subscribe(tenant_code.into()));
    }

    pub fn disconnect(&self) {
        let _ = self.control_tx.send(ControlMsg::Disconnect);
    }
}

/// `header`/`payload` query params per the `graphql-ws`-over-websocket
/// handshake: base64(JSON) of connection metadata and an empty init
/// payload.
fn build_ws_url(endpoint: &str, api_key: &str) -> Result<String, RealtimeError> {
    let mut url = url::Url::parse(endpoint).map_err(|e| RealtimeError::InvalidUrl(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => url.scheme(),
        other => return Err(RealtimeError::InvalidUrl(format!("unsupported scheme: {other}"))),
    };
    url.set_scheme(scheme).map_err(|_| RealtimeError::InvalidUrl(endpoint.to_string()))?;

    let host = url.host_str().ok_or_else(|| RealtimeError::InvalidUrl(endpoint.to_string()))?.to_string();
    let mut path = url.path().trim_end_matches('/').to_string();
    path.push_str("/realtime");
    url.set_path(&path);

    let header = json!({"host": host, "x-api-key": api_key, "content-type": "application/json"});
    let payload = json!({});
    let engine = base64::engine::general_purpose::STANDARD;
    let header_b64 = engine.encode(header.to_string());
    let payload_b64 = engine.encode(payload.to_string());
    url.set_query(Some(&format!("header={header_b64}&payload={payload_b64}")));
    Ok(url.to_string())
}

async fn run(
    endpoint: String,
    api_key: String,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    event_tx: mpsc::UnboundedSender<RealtimeEvent>,
) {
    let mut attempt = 0u32;
    let mut tenant_code: Option<String> = None;
    let mut reconnecting = false;

    loop {
        let outcome = connect_and_run(&endpoint, &api_key, &mut control_rx, &event_tx, &mut tenant_code, reconnecting).await;
        match outcome {
            ConnectionOutcome::UserDisconnected => {
                let _ = event_tx.send(RealtimeEvent::Terminal);
                return;
            }
            ConnectionOutcome::Dropped { established } => {
                if established {
                    attempt = 0;
                }
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    tracing::warn!("realtime client giving up after {attempt} attempts");
                    let _ = event_tx.send(RealtimeEvent::Terminal);
                    return;
                }
                let delay = Duration::from_millis(1000 * 2u64.pow(attempt - 1));
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting realtime client");
                tokio::time::sleep(delay).await;
                reconnecting = true;
            }
        }
    }
}

enum ConnectionOutcome {
    UserDisconnected,
    Dropped { established: bool },
}

async fn connect_and_run(
    endpoint: &str,
    api_key: &str,
    control_rx: &mut mpsc::UnboundedReceiver<ControlMsg>,
    event_tx: &mpsc::UnboundedSender<RealtimeEvent>,
    tenant_code: &mut Option<String>,
    was_reconnecting: bool,
) -> ConnectionOutcome {
    let url = match build_ws_url(endpoint, api_key) {
        Ok(u) => u,
        Err(e) => {
            tracing::error!(error = %e, "invalid realtime endpoint");
            return ConnectionOutcome::Dropped { established: false };
        }
    };

    let mut request = match url.into_client_request() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "invalid realtime endpoint");
            return ConnectionOutcome::Dropped { established: false };
        }
    };
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("graphql-ws"));

    let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "realtime connect failed");
            return ConnectionOutcome::Dropped { established: false };
        }
    };

    let (mut write, mut read) = ws_stream.split();

    if write.send(Message::Text(json!({"type": "connection_init"}).to_string())).await.is_err() {
        return ConnectionOutcome::Dropped { established: false };
    }

    let mut ka_timeout = DEFAULT_KEEPALIVE_TIMEOUT;
    let mut acked = false;
    while !acked {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if frame.get("type").and_then(|v| v.as_str()) == Some("connection_ack") {
                    if let Some(ms) = frame.get("payload").and_then(|p| p.get("connectionTimeoutMs")).and_then(|v| v.as_u64()) {
                        ka_timeout = Duration::from_millis(ms);
                    }
                    acked = true;
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return ConnectionOutcome::Dropped { established: false },
        }
    }

    if was_reconnecting {
        let _ = event_tx.send(RealtimeEvent::Reconnected);
    }

    if let Some(tc) = tenant_code.clone() {
        let _ = send_start(&mut write, &tc).await;
    }

    let mut ka_deadline = Instant::now() + ka_timeout;
    let mut subscription_active = tenant_code.is_some();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        match frame.get("type").and_then(|v| v.as_str()) {
                            Some("ka") => { ka_deadline = Instant::now() + ka_timeout; }
                            Some("data") => {
                                ka_deadline = Instant::now() + ka_timeout;
                                if let Some(notif) = frame
                                    .get("payload")
                                    .and_then(|p| p.get("data"))
                                    .and_then(|d| d.get("onMessage"))
                                    .cloned()
                                {
                                    if let Ok(notification) = serde_json::from_value::<Notification>(notif) {
                                        let _ = event_tx.send(RealtimeEvent::Notification(notification));
                                    }
                                }
                            }
                            Some("complete") => { subscription_active = false; }
                            Some("start_ack") | Some("error") => {
                                tracing::debug!(frame = %agent_proto::logging::redact(&text), "realtime control frame");
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return ConnectionOutcome::Dropped { established: true },
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "realtime read error");
                        return ConnectionOutcome::Dropped { established: true };
                    }
                }
            }
            _ = tokio::time::sleep_until(ka_deadline) => {
                tracing::warn!("realtime keep-alive deadline expired, closing");
                let _ = write.close().await;
                return ConnectionOutcome::Dropped { established: true };
            }
            control = control_rx.recv() => {
                match control {
                    Some(ControlMsg::Subscribe(tc)) => {
                        *tenant_code = Some(tc.clone());
                        if send_start(&mut write, &tc).await.is_ok() {
                            subscription_active = true;
                        }
                    }
                    Some(ControlMsg::Disconnect) => {
                        if subscription_active {
                            let _ = write.send(Message::Text(json!({"type": "stop"}).to_string())).await;
                        }
                        let _ = write.close().await;
                        return ConnectionOutcome::UserDisconnected;
                    }
                    None => {
                        let _ = write.close().await;
                        return ConnectionOutcome::UserDisconnected;
                    }
                }
            }
        }
    }
}

async fn send_start(
    write: &mut futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >,
    tenant_code: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let subscription_id = format!("sub-{}", SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::Relaxed));
    let frame = json!({
        "id": subscription_id,
        "type": "start",
        "payload": {
            "query": "subscription OnMessage($tenantCode: String!) { onMessage(tenantCode: $tenantCode) }",
            "variables": { "tenantCode": tenant_code },
        }
    });
    write.send(Message::Text(frame.to_string())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ws_url_upgrades_scheme_and_appends_realtime_path() {
        let url = build_ws_url("https://api.example.com/gateway", "key123").unwrap();
        assert!(url.starts_with("wss://api.example.com/gateway/realtime?"));
        assert!(url.contains("header="));
        assert!(url.contains("payload="));
    }

    #[test]
    fn build_ws_url_rejects_unsupported_scheme() {
        let result = build_ws_url("ftp://example.com", "key");
        assert!(result.is_err());
    }

    #[test]
    fn build_ws_url_header_decodes_to_expected_fields() {
        let url = build_ws_url("http://localhost:8080", "secret").unwrap();
        let header_param = url.split("header=").nth(1).unwrap().split('&').next().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(header_param).unwrap();
        let header: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(header["x-api-key"], json!("secret"));
        assert_eq!(header["host"], json!("localhost"));
    }
}
