//! Mock publish gateway for testing
//!
//! Simulates platform agents in-process: scripted failures per platform,
//! artificial latency, and call accounting. Available in all builds so the
//! integration tests can drive the dispatcher without network access.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::error::PublishError;
use crate::gateway::{PublishGateway, PublishRequest};
use crate::types::Platform;

/// A request as seen by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub post_id: String,
    pub platform: Platform,
    pub text: String,
    pub credential_ref: String,
    pub token: String,
}

#[derive(Default)]
pub struct MockGateway {
    scripted: Mutex<HashMap<Platform, VecDeque<PublishError>>>,
    always_fail: HashMap<Platform, PublishError>,
    delays: HashMap<Platform, Duration>,
    calls: Mutex<Vec<RecordedPublish>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockGateway {
    /// A gateway on which every publish succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls for `platform`, then succeed
    pub fn fail_times(self, platform: Platform, times: usize, error: PublishError) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .entry(platform)
            .or_default()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    /// Fail every call for `platform`
    pub fn always_fail(mut self, platform: Platform, error: PublishError) -> Self {
        self.always_fail.insert(platform, error);
        self
    }

    /// Delay every call for `platform`
    pub fn with_delay(mut self, platform: Platform, delay: Duration) -> Self {
        self.delays.insert(platform, delay);
        self
    }

    pub fn call_count(&self, platform: Platform) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.platform == platform)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedPublish> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of publish calls observed running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishGateway for MockGateway {
    async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError> {
        self.calls.lock().unwrap().push(RecordedPublish {
            post_id: request.post_id.clone(),
            platform: request.platform,
            text: request.content.text().to_string(),
            credential_ref: request.credential_ref.to_string(),
            token: request.access_token.expose().to_string(),
        });

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(&request.platform) {
            sleep(*delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.always_fail.get(&request.platform) {
            return Err(error.clone());
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.platform)
            .and_then(|queue| queue.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        Ok(format!(
            "{}:mock-{}",
            request.platform,
            uuid::Uuid::new_v4()
        ))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdaptedContent;
    use crate::credentials::AccessToken;
    use crate::types::CredentialRef;

    fn request(platform: Platform) -> PublishRequest {
        PublishRequest {
            post_id: "post-1".to_string(),
            platform,
            content: AdaptedContent::Twitter {
                text: "hello".to_string(),
                media: vec![],
            },
            credential_ref: CredentialRef::new("tw-ref"),
            access_token: AccessToken::new("tw-token"),
        }
    }

    #[tokio::test]
    async fn test_mock_success() {
        let gateway = MockGateway::new();
        let id = gateway.publish(&request(Platform::Twitter)).await.unwrap();

        assert!(id.starts_with("twitter:mock-"));
        assert_eq!(gateway.call_count(Platform::Twitter), 1);

        let calls = gateway.calls();
        assert_eq!(calls[0].text, "hello");
        assert_eq!(calls[0].token, "tw-token");
    }

    #[tokio::test]
    async fn test_mock_fail_times_then_succeed() {
        let gateway = MockGateway::new().fail_times(
            Platform::Twitter,
            2,
            PublishError::RateLimited("slow down".to_string()),
        );

        assert!(gateway.publish(&request(Platform::Twitter)).await.is_err());
        assert!(gateway.publish(&request(Platform::Twitter)).await.is_err());
        assert!(gateway.publish(&request(Platform::Twitter)).await.is_ok());
        assert_eq!(gateway.call_count(Platform::Twitter), 3);
    }

    #[tokio::test]
    async fn test_mock_always_fail() {
        let gateway = MockGateway::new().always_fail(
            Platform::Twitter,
            PublishError::AuthExpired("token expired".to_string()),
        );

        for _ in 0..5 {
            let err = gateway.publish(&request(Platform::Twitter)).await.unwrap_err();
            assert!(matches!(err, PublishError::AuthExpired(_)));
        }
    }

    #[tokio::test]
    async fn test_mock_delay() {
        let gateway =
            MockGateway::new().with_delay(Platform::Twitter, Duration::from_millis(30));

        let start = std::time::Instant::now();
        gateway.publish(&request(Platform::Twitter)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(gateway.peak_concurrency(), 1);
    }
}
