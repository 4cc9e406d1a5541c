//! Typed HTTP client for the control-plane's fixed endpoint set. Every
//! mutating and read call goes through [`request_with_retry`], so the
//! retry policy lives in one place instead of being copy-pasted per
//! endpoint.

#![forbid(unsafe_code)]

use agent_proto::{
    AwsCredentialsResponse, ChatChunk, Command, CommandResult, CommandSummary, ConnectionStatusRequest,
    HeartbeatRequest, HeartbeatResponse, ProjectConfig, RegisterRequest, RegisterResponse, VersionResponse,
};
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("control plane returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self { http, base_url: base_url.into(), token: token.into() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn request_with_retry<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R, ClientError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self
                .http
                .request(method.clone(), self.url(path))
                .header("Authorization", format!("Bearer {}", self.token))
                .header("Content-Type", "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }

            let outcome = request.send().await;
            let should_retry = match &outcome {
                Err(_) => true,
                Ok(response) => {
                    let status = response.status();
                    status == StatusCode::REQUEST_TIMEOUT
                        || status == StatusCode::TOO_MANY_REQUESTS
                        || status.is_server_error()
                }
            };

            if should_retry && attempt < MAX_ATTEMPTS {
                let delay = backoff_delay(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, path, "retrying control-plane request");
                tokio::time::sleep(delay).await;
                continue;
            }

            let response = outcome?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ClientError::Status { status, body });
            }
            return Ok(response.json::<R>().await?);
        }
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        self.request_with_retry(Method::POST, "/api/agent/register", Some(request)).await
    }

    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, ClientError> {
        self.request_with_retry(Method::POST, "/api/agent/heartbeat", Some(request)).await
    }

    pub async fn pending_commands(&self) -> Result<Vec<CommandSummary>, ClientError> {
        self.request_with_retry::<(), _>(Method::GET, "/api/agent/commands/pending", None).await
    }

    pub async fn fetch_command(&self, command_id: &str) -> Result<Command, ClientError> {
        self.request_with_retry::<(), _>(Method::GET, &format!("/api/agent/commands/{command_id}"), None)
            .await
    }

    pub async fn submit_result(&self, command_id: &str, result: &CommandResult) -> Result<(), ClientError> {
        self.request_with_retry::<_, serde_json::Value>(
            Method::POST,
            &format!("/api/agent/commands/{command_id}/result"),
            Some(result),
        )
        .await?;
        Ok(())
    }

    pub async fn submit_chunk(&self, command_id: &str, chunk: &ChatChunk) -> Result<(), ClientError> {
        self.request_with_retry::<_, serde_json::Value>(
            Method::POST,
            &format!("/api/agent/commands/{command_id}/chunks"),
            Some(chunk),
        )
        .await?;
        Ok(())
    }

    pub async fn version(&self, channel: &str) -> Result<VersionResponse, ClientError> {
        self.request_with_retry::<(), _>(Method::GET, &format!("/api/agent/version?channel={channel}"), None)
            .await
    }

    pub async fn connection_status(&self, request: &ConnectionStatusRequest) -> Result<(), ClientError> {
        self.request_with_retry::<_, serde_json::Value>(Method::POST, "/api/agent/connection-status", Some(request))
            .await?;
        Ok(())
    }

    pub async fn config(&self) -> Result<serde_json::Value, ClientError> {
        self.request_with_retry::<(), _>(Method::GET, "/api/agent/config", None).await
    }

    pub async fn project_config(&self) -> Result<ProjectConfig, ClientError> {
        self.request_with_retry::<(), _>(Method::GET, "/api/agent/project-config", None).await
    }

    pub async fn aws_credentials(&self, account_id: &str) -> Result<AwsCredentialsResponse, ClientError> {
        self.request_with_retry::<(), _>(
            Method::GET,
            &format!("/api/agent/aws-credentials?accountId={account_id}"),
            None,
        )
        .await
    }
}

/// `base·2^attempt` with jitter uniform in `[0.5, 1.0]` of that value.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_MS * 2u64.pow(attempt.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_millis((exp as f64 * jitter) as u64)
}
