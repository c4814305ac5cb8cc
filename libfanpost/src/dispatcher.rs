//! Fan-out/fan-in publish orchestration
//!
//! For each released post the dispatcher runs every destination as an
//! independent concurrent job:
//!
//! 1. resolve the credential reference
//! 2. adapt the content once and cache it on the attempt
//! 3. publish through the gateway, retrying with backoff up to the ceiling
//!
//! A destination that fails at any step ends `Failed` on its own; siblings
//! are never aborted. Every transition goes through the post's lock, which
//! recomputes the post status, and the resulting snapshot is persisted
//! after the lock is released.
//!
//! System-wide concurrency is capped by a semaphore: ready posts wait for a
//! permit instead of being dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::adapter::{AdaptedContent, ContentAdapter};
use crate::credentials::CredentialResolver;
use crate::db::Database;
use crate::error::PublishError;
use crate::forwarder::ReportForwarder;
use crate::gateway::{PublishGateway, PublishRequest};
use crate::registry::{PostHandle, PostRegistry};
use crate::retry::RetryPolicy;
use crate::types::{
    CredentialRef, DestinationAttempt, FailureReason, Platform, PostStatus, ReportEvent,
};

pub struct Dispatcher {
    gateway: Arc<dyn PublishGateway>,
    credentials: Arc<dyn CredentialResolver>,
    adapter: ContentAdapter,
    forwarder: Arc<ReportForwarder>,
    db: Database,
    registry: PostRegistry,
    policy: RetryPolicy,
    publish_timeout: Duration,
    in_flight: Arc<Semaphore>,
}

/// Post fields every destination job reads
struct PostContext {
    post_id: String,
    user_id: String,
    raw_content: String,
    media_references: Vec<String>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn PublishGateway>,
        credentials: Arc<dyn CredentialResolver>,
        adapter: ContentAdapter,
        forwarder: Arc<ReportForwarder>,
        db: Database,
        registry: PostRegistry,
        policy: RetryPolicy,
        publish_timeout: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            gateway,
            credentials,
            adapter,
            forwarder,
            db,
            registry,
            policy,
            publish_timeout,
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Drive every open destination of a released post to a terminal outcome
    pub async fn dispatch(&self, handle: PostHandle) {
        let (ctx, destinations) = {
            let post = handle.lock().await;
            if post.status() != PostStatus::Dispatching {
                debug!(post_id = %post.id, status = %post.status(), "post is not dispatching, skipping");
                return;
            }
            let destinations: Vec<(Platform, CredentialRef)> = post
                .attempts()
                .iter()
                .filter(|a| !a.is_terminal())
                .map(|a| (a.platform, a.credential_ref.clone()))
                .collect();
            let ctx = PostContext {
                post_id: post.id.clone(),
                user_id: post.user_id.clone(),
                raw_content: post.raw_content.clone(),
                media_references: post.media_references.clone(),
            };
            (ctx, destinations)
        };

        info!(
            post_id = %ctx.post_id,
            "Dispatching post to {} platform(s)",
            destinations.len()
        );

        let jobs = destinations
            .into_iter()
            .map(|(platform, credential_ref)| {
                self.run_destination(&handle, &ctx, platform, credential_ref)
            });
        join_all(jobs).await;

        let status = handle.lock().await.status();
        if status.is_terminal() {
            self.registry.evict(&ctx.post_id).await;
        }
        info!(post_id = %ctx.post_id, %status, "dispatch finished");
    }

    async fn run_destination(
        &self,
        handle: &PostHandle,
        ctx: &PostContext,
        platform: Platform,
        credential_ref: CredentialRef,
    ) {
        let access_token = match self
            .credentials
            .resolve(&ctx.user_id, platform, &credential_ref)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(post_id = %ctx.post_id, %platform, error = %e, "credential unavailable");
                self.fail(
                    handle,
                    platform,
                    FailureReason::CredentialUnavailable {
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let Some(content) = self.adapted_content(handle, ctx, platform).await else {
            return;
        };

        let request = PublishRequest {
            post_id: ctx.post_id.clone(),
            platform,
            content,
            credential_ref,
            access_token,
        };

        loop {
            let ceiling = self.policy.ceiling;
            let Some(attempt) = self
                .transition(handle, platform, |a| a.start_attempt(ceiling))
                .await
                .flatten()
            else {
                return;
            };

            debug!(post_id = %ctx.post_id, %platform, attempt, "publishing");
            let result = match timeout(self.publish_timeout, self.gateway.publish(&request)).await {
                Ok(result) => result,
                Err(_) => Err(PublishError::Timeout(format!(
                    "no response after {:?}",
                    self.publish_timeout
                ))),
            };

            match result {
                Ok(platform_post_id) => {
                    let publish_time = Utc::now();
                    let first = self
                        .transition(handle, platform, |a| {
                            a.succeed(platform_post_id.clone(), publish_time)
                        })
                        .await
                        .unwrap_or(false);

                    info!(
                        post_id = %ctx.post_id,
                        %platform,
                        %platform_post_id,
                        attempt,
                        "published"
                    );

                    if first {
                        self.forwarder
                            .forward(&ReportEvent {
                                post_id: ctx.post_id.clone(),
                                user_id: ctx.user_id.clone(),
                                platform,
                                platform_post_id,
                                publish_time,
                            })
                            .await;
                    }
                    return;
                }
                Err(e) if self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        post_id = %ctx.post_id,
                        %platform,
                        attempt,
                        error = %e,
                        "publish failed, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        post_id = %ctx.post_id,
                        %platform,
                        attempts = attempt,
                        error = %e,
                        "publish failed permanently"
                    );
                    self.fail(handle, platform, FailureReason::Publish { error: e })
                        .await;
                    return;
                }
            }
        }
    }

    /// Cached adapted content, producing and storing it on first use
    async fn adapted_content(
        &self,
        handle: &PostHandle,
        ctx: &PostContext,
        platform: Platform,
    ) -> Option<AdaptedContent> {
        let cached = {
            let post = handle.lock().await;
            post.attempt(platform)
                .and_then(|a| a.adapted_content().cloned())
        };
        if cached.is_some() {
            return cached;
        }

        match self
            .adapter
            .adapt(platform, &ctx.raw_content, &ctx.media_references)
        {
            Ok(content) => {
                let stored = content.clone();
                self.transition(handle, platform, move |a| a.set_adapted_content(stored))
                    .await;
                Some(content)
            }
            Err(e) => {
                warn!(post_id = %ctx.post_id, %platform, error = %e, "content rejected");
                self.fail(
                    handle,
                    platform,
                    FailureReason::ContentRejected {
                        message: e.to_string(),
                    },
                )
                .await;
                None
            }
        }
    }

    async fn fail(&self, handle: &PostHandle, platform: Platform, reason: FailureReason) {
        self.transition(handle, platform, |a| a.fail(reason)).await;
    }

    /// Apply one attempt transition under the post lock and persist the result
    async fn transition<R>(
        &self,
        handle: &PostHandle,
        platform: Platform,
        f: impl FnOnce(&mut DestinationAttempt) -> R,
    ) -> Option<R> {
        let (result, snapshot) = {
            let mut post = handle.lock().await;
            let result = post.update_attempt(platform, f)?;
            (result, post.clone())
        };

        if let Err(e) = self.db.save_post(&snapshot).await {
            warn!(post_id = %snapshot.id, error = %e, "failed to persist post snapshot");
        }
        Some(result)
    }

    /// Wait for an in-flight slot and dispatch `handle` on `tasks`
    async fn spawn_dispatch(self: &Arc<Self>, tasks: &mut JoinSet<()>, handle: PostHandle) {
        let permit = match self.in_flight.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "dispatch semaphore closed");
                return;
            }
        };

        let dispatcher = Arc::clone(self);
        tasks.spawn(async move {
            dispatcher.dispatch(handle).await;
            drop(permit);
        });
    }

    /// Dispatch released posts until the channel closes or `shutdown` fires
    ///
    /// Posts already released when shutdown fires are still dispatched, and
    /// every started dispatch is awaited before returning.
    pub async fn run(
        self: &Arc<Self>,
        rx: &mut mpsc::UnboundedReceiver<PostHandle>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(handle) => self.spawn_dispatch(&mut tasks, handle).await,
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "dispatch task failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, waiting for {} dispatch(es)", tasks.len());
                        break;
                    }
                }
            }
        }

        while let Ok(handle) = rx.try_recv() {
            self.spawn_dispatch(&mut tasks, handle).await;
        }
        drain(&mut tasks).await;
    }

    /// Dispatch everything currently queued on `rx` and wait for completion
    pub async fn run_until_idle(self: &Arc<Self>, rx: &mut mpsc::UnboundedReceiver<PostHandle>) {
        let mut tasks = JoinSet::new();
        while let Ok(handle) = rx.try_recv() {
            self.spawn_dispatch(&mut tasks, handle).await;
        }
        drain(&mut tasks).await;
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "dispatch task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialResolver;
    use crate::gateway::mock::MockGateway;
    use crate::sink::MockSink;
    use crate::types::{AttemptOutcome, OutcomeKind, Post};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        gateway: Arc<MockGateway>,
        sink: Arc<MockSink>,
        registry: PostRegistry,
        db: Database,
        _temp: TempDir,
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            ceiling: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: true,
        }
    }

    async fn harness(gateway: MockGateway, publish_timeout: Duration) -> Harness {
        let temp = TempDir::new().unwrap();
        let db = Database::new(temp.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        let gateway = Arc::new(gateway);
        let sink = Arc::new(MockSink::new());
        let registry = PostRegistry::new();
        let credentials = StaticCredentialResolver::new()
            .with_token("fb", "fb-token")
            .with_token("tw", "tw-token")
            .with_token("ig", "ig-token");
        let forwarder = Arc::new(ReportForwarder::new(sink.clone(), db.clone(), fast_policy()));

        let dispatcher = Arc::new(Dispatcher::new(
            gateway.clone(),
            Arc::new(credentials),
            ContentAdapter::new(),
            forwarder,
            db.clone(),
            registry.clone(),
            fast_policy(),
            publish_timeout,
            4,
        ));

        Harness {
            dispatcher,
            gateway,
            sink,
            registry,
            db,
            _temp: temp,
        }
    }

    async fn released(h: &Harness, platforms: &[(Platform, &str)], media: Vec<String>) -> PostHandle {
        let post = Post::new(
            "user-1".to_string(),
            "Launch day #rust".to_string(),
            media,
            platforms.iter().map(|(p, _)| *p).collect(),
            Utc::now(),
            platforms
                .iter()
                .map(|(p, r)| (*p, CredentialRef::new(*r)))
                .collect::<BTreeMap<_, _>>(),
        )
        .unwrap();
        let handle = h.registry.insert(post).await;
        assert!(handle.lock().await.release());
        handle
    }

    #[tokio::test]
    async fn test_retries_reuse_adapted_content() {
        let gateway = MockGateway::new().fail_times(
            Platform::Twitter,
            2,
            PublishError::RateLimited("slow down".to_string()),
        );
        let h = harness(gateway, Duration::from_secs(5)).await;
        let handle = released(&h, &[(Platform::Twitter, "tw")], vec![]).await;

        h.dispatcher.dispatch(handle.clone()).await;

        let post = handle.lock().await;
        assert_eq!(post.status(), PostStatus::Published);
        let attempt = post.attempt(Platform::Twitter).unwrap();
        assert_eq!(attempt.attempt_count(), 3);

        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.text == calls[0].text));
        assert!(calls.iter().all(|c| c.token == "tw-token"));
        assert_eq!(
            attempt.adapted_content().map(|c| c.text().to_string()),
            Some(calls[0].text.clone())
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let gateway =
            MockGateway::new().with_delay(Platform::Facebook, Duration::from_millis(200));
        let h = harness(gateway, Duration::from_millis(10)).await;
        let handle = released(&h, &[(Platform::Facebook, "fb")], vec![]).await;

        h.dispatcher.dispatch(handle.clone()).await;

        let post = handle.lock().await;
        assert_eq!(post.status(), PostStatus::Failed);
        let attempt = post.attempt(Platform::Facebook).unwrap();
        assert_eq!(attempt.attempt_count(), 3);
        assert!(matches!(
            attempt.outcome(),
            AttemptOutcome::Failed {
                reason: FailureReason::Publish {
                    error: PublishError::Timeout(_)
                }
            }
        ));
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_content_rejection_isolated() {
        let h = harness(MockGateway::new(), Duration::from_secs(5)).await;
        let handle = released(
            &h,
            &[(Platform::Instagram, "ig"), (Platform::Facebook, "fb")],
            vec![],
        )
        .await;

        h.dispatcher.dispatch(handle.clone()).await;

        let view = handle.lock().await.view();
        assert_eq!(view.status, PostStatus::PartiallyPublished);

        let instagram = view.destination(Platform::Instagram).unwrap();
        assert_eq!(instagram.outcome, OutcomeKind::Failed);
        assert_eq!(instagram.attempt_count, 0);
        assert!(instagram
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("ContentRejected"));

        assert_eq!(h.gateway.call_count(Platform::Instagram), 0);
        assert_eq!(h.gateway.call_count(Platform::Facebook), 1);
    }

    #[tokio::test]
    async fn test_terminal_post_persisted_and_evicted() {
        let h = harness(MockGateway::new(), Duration::from_secs(5)).await;
        let handle = released(&h, &[(Platform::Facebook, "fb")], vec![]).await;
        let id = handle.lock().await.id.clone();

        h.dispatcher.dispatch(handle).await;

        assert!(h.registry.get(&id).await.is_none());
        let stored = h.db.get_post(&id).await.unwrap().unwrap();
        assert_eq!(stored.status(), PostStatus::Published);
        assert!(stored
            .attempt(Platform::Facebook)
            .unwrap()
            .platform_post_id()
            .is_some());
    }

    #[tokio::test]
    async fn test_dispatch_skips_unreleased_post() {
        let h = harness(MockGateway::new(), Duration::from_secs(5)).await;
        let post = Post::new(
            "user-1".to_string(),
            "hello".to_string(),
            vec![],
            vec![Platform::Facebook],
            Utc::now(),
            BTreeMap::from([(Platform::Facebook, CredentialRef::new("fb"))]),
        )
        .unwrap();
        let handle = h.registry.insert(post).await;

        h.dispatcher.dispatch(handle.clone()).await;

        assert_eq!(handle.lock().await.status(), PostStatus::Pending);
        assert_eq!(h.gateway.total_calls(), 0);
    }
}
