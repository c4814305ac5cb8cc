//! Analytics sink abstraction
//!
//! The reporting forwarder emits one [`ReportEvent`] per destination success.
//! The sink is fire-and-forget from the user's point of view: failures are
//! retried and logged by the forwarder, never surfaced.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::info;

use crate::error::SinkError;
use crate::types::ReportEvent;

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Emit one report event
    ///
    /// Returning `Ok` confirms the sink accepted the event.
    async fn report_published(&self, event: &ReportEvent) -> Result<(), SinkError>;
}

/// Posts report events to `{base_url}/reports`
pub struct HttpAnalyticsSink {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyticsSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Unreachable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!("{}/reports", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalyticsSink {
    async fn report_published(&self, event: &ReportEvent) -> Result<(), SinkError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(event)
            .send()
            .await
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(SinkError::Unreachable(s.to_string()))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(SinkError::Rejected(format!("{}: {}", s, body.trim())))
            }
        }
    }
}

/// Sink that only logs events, used when no analytics endpoint is configured
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl AnalyticsSink for LogSink {
    async fn report_published(&self, event: &ReportEvent) -> Result<(), SinkError> {
        info!(
            post_id = %event.post_id,
            user_id = %event.user_id,
            platform = %event.platform,
            platform_post_id = %event.platform_post_id,
            publish_time = %event.publish_time,
            "post published"
        );
        Ok(())
    }
}

/// In-memory sink recording every accepted event
#[derive(Default)]
pub struct MockSink {
    accepted: Mutex<Vec<ReportEvent>>,
    failures: Mutex<VecDeque<SinkError>>,
    attempts: Mutex<usize>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `times` emissions as unreachable
    pub fn fail_times(self, times: usize) -> Self {
        self.failures.lock().unwrap().extend(
            (0..times).map(|i| SinkError::Unreachable(format!("scripted failure {}", i + 1))),
        );
        self
    }

    /// Events the sink confirmed
    pub fn events(&self) -> Vec<ReportEvent> {
        self.accepted.lock().unwrap().clone()
    }

    /// Emission calls, including failed ones
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl AnalyticsSink for MockSink {
    async fn report_published(&self, event: &ReportEvent) -> Result<(), SinkError> {
        *self.attempts.lock().unwrap() += 1;

        let scripted = self.failures.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        self.accepted.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use chrono::Utc;

    fn event() -> ReportEvent {
        ReportEvent {
            post_id: "post-1".to_string(),
            user_id: "user-1".to_string(),
            platform: Platform::Facebook,
            platform_post_id: "fb-1".to_string(),
            publish_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_mock_sink_records_events() {
        let sink = MockSink::new();
        sink.report_published(&event()).await.unwrap();

        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.events()[0].platform_post_id, "fb-1");
        assert_eq!(sink.attempts(), 1);
    }

    #[tokio::test]
    async fn test_mock_sink_scripted_failures() {
        let sink = MockSink::new().fail_times(2);

        assert!(sink.report_published(&event()).await.is_err());
        assert!(sink.report_published(&event()).await.is_err());
        assert!(sink.report_published(&event()).await.is_ok());

        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_log_sink_accepts() {
        assert!(LogSink.report_published(&event()).await.is_ok());
    }

    #[test]
    fn test_http_sink_endpoint() {
        let sink = HttpAnalyticsSink::new("http://localhost:8010/", Duration::from_secs(5)).unwrap();
        assert_eq!(sink.endpoint(), "http://localhost:8010/reports");
    }
}
