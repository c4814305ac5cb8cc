//! HTTP transport to remote platform agents
//!
//! Each platform agent exposes `POST {base_url}/publish` accepting a JSON
//! [`PublishRequest`] and answering `{"platform_post_id": "..."}`. The access
//! token is sent as a bearer header.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::error::PublishError;
use crate::gateway::{PublishGateway, PublishRequest};
use crate::types::Platform;

#[derive(Debug, Deserialize)]
struct PublishResponse {
    platform_post_id: String,
}

pub struct AgentGateway {
    http: reqwest::Client,
    agents: HashMap<Platform, String>,
}

impl AgentGateway {
    /// `timeout` bounds each HTTP exchange; the dispatcher applies its own
    /// deadline on top.
    pub fn new(agents: HashMap<Platform, String>, timeout: Duration) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Unknown(format!("Failed to build HTTP client: {}", e)))?;

        let agents = agents
            .into_iter()
            .map(|(platform, url)| (platform, url.trim_end_matches('/').to_string()))
            .collect();

        Ok(Self { http, agents })
    }

    fn endpoint(&self, platform: Platform) -> Result<String, PublishError> {
        self.agents
            .get(&platform)
            .map(|base| format!("{}/publish", base))
            .ok_or_else(|| {
                PublishError::PlatformRejected(format!("No agent configured for {}", platform))
            })
    }
}

/// Map an HTTP status from a platform agent onto the publish error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> PublishError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::AuthExpired(detail),
        StatusCode::TOO_MANY_REQUESTS => PublishError::RateLimited(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => PublishError::Timeout(detail),
        s if s.is_client_error() => PublishError::PlatformRejected(detail),
        _ => PublishError::Unknown(detail),
    }
}

fn classify_transport(error: reqwest::Error) -> PublishError {
    if error.is_timeout() {
        PublishError::Timeout(error.to_string())
    } else {
        PublishError::Unknown(error.to_string())
    }
}

#[async_trait]
impl PublishGateway for AgentGateway {
    async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError> {
        let url = self.endpoint(request.platform)?;
        debug!(post_id = %request.post_id, platform = %request.platform, %url, "sending publish request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(request.access_token.expose())
            .json(request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body.trim()));
        }

        let parsed: PublishResponse = response.json().await.map_err(|e| {
            PublishError::Unknown(format!("Invalid response from {} agent: {}", request.platform, e))
        })?;
        Ok(parsed.platform_post_id)
    }

    fn name(&self) -> &str {
        "agent"
    }
}
