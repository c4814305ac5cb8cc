//! Time-ordered release of pending posts
//!
//! The scheduler owns an index of pending posts ordered by due time. A tick
//! releases every post whose `scheduled_at <= now`: the post is claimed with
//! [`Post::release`] under its own lock and its handle is pushed onto the
//! dispatch channel. The claim is the only thing that decides whether a post
//! is handed over, so a post can never be released twice, and a tick never
//! waits for the dispatcher.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{FanpostError, Result};
use crate::registry::{PostHandle, PostRegistry};
use crate::types::{Post, PostStatus};

type IndexEntry = (DateTime<Utc>, String);

pub struct Scheduler {
    index: Mutex<BTreeSet<IndexEntry>>,
    registry: PostRegistry,
    db: Database,
    release_tx: mpsc::UnboundedSender<PostHandle>,
}

impl Scheduler {
    pub fn new(
        registry: PostRegistry,
        db: Database,
        release_tx: mpsc::UnboundedSender<PostHandle>,
    ) -> Self {
        Self {
            index: Mutex::new(BTreeSet::new()),
            registry,
            db,
            release_tx,
        }
    }

    /// Accept a pending post and index it by due time
    ///
    /// The post is stored before it becomes visible to the tick loop.
    ///
    /// # Errors
    ///
    /// - `InvalidSchedule` if the post has no target platform or is not pending
    /// - `Database` if the post cannot be stored
    pub async fn submit(&self, post: Post) -> Result<String> {
        if post.target_platforms.is_empty() {
            return Err(FanpostError::InvalidSchedule(
                "At least one target platform is required".to_string(),
            ));
        }
        if post.status() != PostStatus::Pending {
            return Err(FanpostError::InvalidSchedule(format!(
                "Post {} is {}, only pending posts can be scheduled",
                post.id,
                post.status()
            )));
        }

        self.db.save_post(&post).await?;

        let post_id = post.id.clone();
        let scheduled_at = post.scheduled_at;
        self.registry.insert(post).await;
        self.index.lock().await.insert((scheduled_at, post_id.clone()));

        info!(post_id = %post_id, %scheduled_at, "post scheduled");
        Ok(post_id)
    }

    /// Re-index a pending post loaded from storage
    pub async fn restore(&self, post: Post) {
        if post.status() != PostStatus::Pending {
            return;
        }
        let entry = (post.scheduled_at, post.id.clone());
        self.registry.insert(post).await;
        self.index.lock().await.insert(entry);
    }

    /// Hand a post found mid-dispatch straight back to the dispatcher
    ///
    /// Returns `false` if the post is not dispatching or no dispatcher is
    /// listening.
    pub async fn resume(&self, post: Post) -> bool {
        if post.status() != PostStatus::Dispatching {
            return false;
        }
        let post_id = post.id.clone();
        let handle = self.registry.insert(post).await;
        if self.release_tx.send(handle).is_err() {
            error!(post_id = %post_id, "dispatcher is gone, interrupted post will not be resumed");
            self.registry.evict(&post_id).await;
            return false;
        }
        debug!(post_id = %post_id, "interrupted post resumed");
        true
    }

    /// Cancel a pending post
    ///
    /// Cancelling an already cancelled post succeeds without effect.
    ///
    /// # Errors
    ///
    /// - `AlreadyDispatched` once the post has been released; state is unchanged
    /// - `PostNotFound` if no such post exists
    /// - `Database` if the cancellation cannot be stored; the post stays pending
    pub async fn cancel(&self, post_id: &str) -> Result<()> {
        let Some(handle) = self.registry.get(post_id).await else {
            return match self.db.get_post(post_id).await? {
                Some(post) if post.status() == PostStatus::Cancelled => Ok(()),
                Some(_) => Err(FanpostError::AlreadyDispatched(post_id.to_string())),
                None => Err(FanpostError::PostNotFound(post_id.to_string())),
            };
        };

        let entry = {
            let mut post = handle.lock().await;
            if post.status() == PostStatus::Cancelled {
                return Ok(());
            }
            let mut cancelled = post.clone();
            cancelled.cancel()?;
            // Held across the write so a tick cannot release the post meanwhile
            self.db.save_post(&cancelled).await?;
            *post = cancelled;
            (post.scheduled_at, post.id.clone())
        };

        self.index.lock().await.remove(&entry);
        self.registry.evict(post_id).await;

        info!(post_id = %post_id, "post cancelled");
        Ok(())
    }

    /// Number of posts waiting for their due time
    pub async fn pending_count(&self) -> usize {
        self.index.lock().await.len()
    }

    /// Release every post due at `now`, in due-time order
    ///
    /// Returns the number of posts handed to the dispatcher.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<IndexEntry> = {
            let mut index = self.index.lock().await;
            let due: Vec<IndexEntry> = index
                .iter()
                .take_while(|(at, _)| *at <= now)
                .cloned()
                .collect();
            for entry in &due {
                index.remove(entry);
            }
            due
        };

        let mut released = 0;
        for (_, post_id) in due {
            let Some(handle) = self.registry.get(&post_id).await else {
                debug!(post_id = %post_id, "due post no longer held, skipping");
                continue;
            };

            let snapshot = {
                let mut post = handle.lock().await;
                if !post.release() {
                    continue;
                }
                post.clone()
            };

            if let Err(e) = self.db.save_post(&snapshot).await {
                warn!(post_id = %post_id, error = %e, "failed to persist released post");
            }

            if self.release_tx.send(handle).is_err() {
                error!(post_id = %post_id, "dispatcher is gone, released post will not be dispatched");
                self.registry.evict(&post_id).await;
                continue;
            }

            debug!(post_id = %post_id, targets = snapshot.target_platforms.len(), "post released");
            released += 1;
        }

        if released > 0 {
            info!("Released {} post(s) for dispatch", released);
        }
        released
    }

    /// Tick every `interval` until `shutdown` flips to `true`
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping scheduler");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CredentialRef, Platform};
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Harness {
        scheduler: Scheduler,
        rx: mpsc::UnboundedReceiver<PostHandle>,
        db: Database,
        _temp: TempDir,
    }

    async fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let db = Database::new(temp.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(PostRegistry::new(), db.clone(), tx);
        Harness {
            scheduler,
            rx,
            db,
            _temp: temp,
        }
    }

    fn post_at(scheduled_at: DateTime<Utc>) -> Post {
        Post::new(
            "user-1".to_string(),
            "hello".to_string(),
            vec![],
            vec![Platform::Facebook, Platform::Twitter],
            scheduled_at,
            BTreeMap::from([
                (Platform::Facebook, CredentialRef::new("fb")),
                (Platform::Twitter, CredentialRef::new("tw")),
            ]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_past_due_post_released_on_next_tick() {
        let mut h = harness().await;
        let now = Utc::now();
        let id = h
            .scheduler
            .submit(post_at(now - ChronoDuration::hours(1)))
            .await
            .unwrap();

        assert_eq!(h.scheduler.tick(now).await, 1);

        let handle = h.rx.try_recv().unwrap();
        let post = handle.lock().await;
        assert_eq!(post.id, id);
        assert_eq!(post.status(), PostStatus::Dispatching);
        assert_eq!(post.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_future_post_waits() {
        let mut h = harness().await;
        let now = Utc::now();
        h.scheduler
            .submit(post_at(now + ChronoDuration::minutes(5)))
            .await
            .unwrap();

        assert_eq!(h.scheduler.tick(now).await, 0);
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.scheduler.pending_count().await, 1);

        assert_eq!(h.scheduler.tick(now + ChronoDuration::minutes(5)).await, 1);
    }

    #[tokio::test]
    async fn test_post_released_exactly_once() {
        let mut h = harness().await;
        let now = Utc::now();
        h.scheduler.submit(post_at(now)).await.unwrap();

        assert_eq!(h.scheduler.tick(now).await, 1);
        assert_eq!(h.scheduler.tick(now).await, 0);
        assert_eq!(h.scheduler.tick(now + ChronoDuration::hours(1)).await, 0);

        assert!(h.rx.try_recv().is_ok());
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_release_follows_due_order() {
        let mut h = harness().await;
        let now = Utc::now();
        let late = h
            .scheduler
            .submit(post_at(now - ChronoDuration::minutes(1)))
            .await
            .unwrap();
        let early = h
            .scheduler
            .submit(post_at(now - ChronoDuration::minutes(10)))
            .await
            .unwrap();

        assert_eq!(h.scheduler.tick(now).await, 2);
        let first = h.rx.try_recv().unwrap();
        let second = h.rx.try_recv().unwrap();
        assert_eq!(first.lock().await.id, early);
        assert_eq!(second.lock().await.id, late);
    }

    #[tokio::test]
    async fn test_cancel_pending_post() {
        let mut h = harness().await;
        let now = Utc::now();
        let id = h
            .scheduler
            .submit(post_at(now + ChronoDuration::minutes(5)))
            .await
            .unwrap();

        h.scheduler.cancel(&id).await.unwrap();
        assert_eq!(h.scheduler.pending_count().await, 0);

        let stored = h.db.get_post(&id).await.unwrap().unwrap();
        assert_eq!(stored.status(), PostStatus::Cancelled);

        // Cancelled posts are never released and cancelling again is a no-op
        assert_eq!(h.scheduler.tick(now + ChronoDuration::hours(1)).await, 0);
        assert!(h.rx.try_recv().is_err());
        assert!(h.scheduler.cancel(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_after_release_is_refused() {
        let h = harness().await;
        let now = Utc::now();
        let id = h.scheduler.submit(post_at(now)).await.unwrap();
        h.scheduler.tick(now).await;

        let result = h.scheduler.cancel(&id).await;
        assert!(matches!(result, Err(FanpostError::AlreadyDispatched(_))));

        let handle = h.scheduler.registry.get(&id).await.unwrap();
        assert_eq!(handle.lock().await.status(), PostStatus::Dispatching);
    }

    #[tokio::test]
    async fn test_failed_cancel_leaves_post_pending() {
        let h = harness().await;
        let now = Utc::now();
        let id = h
            .scheduler
            .submit(post_at(now + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        h.db.close().await;

        let result = h.scheduler.cancel(&id).await;
        assert!(matches!(result, Err(FanpostError::Database(_))));

        let handle = h.scheduler.registry.get(&id).await.unwrap();
        assert_eq!(handle.lock().await.status(), PostStatus::Pending);
        assert_eq!(h.scheduler.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_without_dispatcher_evicts_post() {
        let Harness {
            scheduler,
            rx,
            db,
            _temp,
        } = harness().await;
        let now = Utc::now();
        let id = scheduler.submit(post_at(now)).await.unwrap();
        drop(rx);

        assert_eq!(scheduler.tick(now).await, 0);
        assert!(scheduler.registry.get(&id).await.is_none());

        // Left for restart recovery
        let stored = db.get_post(&id).await.unwrap().unwrap();
        assert_eq!(stored.status(), PostStatus::Dispatching);
    }

    #[tokio::test]
    async fn test_resume_hands_post_to_dispatcher() {
        let mut h = harness().await;
        let mut post = post_at(Utc::now());
        let id = post.id.clone();

        assert!(!h.scheduler.resume(post.clone()).await);
        post.release();
        assert!(h.scheduler.resume(post).await);

        let handle = h.rx.try_recv().unwrap();
        assert_eq!(handle.lock().await.id, id);
        assert!(h.scheduler.registry.get(&id).await.is_some());
        assert_eq!(h.scheduler.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_post() {
        let h = harness().await;
        let result = h.scheduler.cancel("missing").await;
        assert!(matches!(result, Err(FanpostError::PostNotFound(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut h = harness().await;
        h.scheduler.submit(post_at(Utc::now())).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = h.scheduler;
        let task = tokio::spawn(async move {
            scheduler.run(Duration::from_millis(10), shutdown_rx).await;
        });

        let handle = tokio::time::timeout(Duration::from_secs(2), h.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.lock().await.status(), PostStatus::Dispatching);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
