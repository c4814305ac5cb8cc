//! Reporting forwarder
//!
//! Emits exactly one analytics report per `(post_id, platform)` success.
//! A key is claimed in memory before emission so concurrent redeliveries
//! cannot both reach the sink, and the durable [`ReportRecord`] is written
//! only after the sink confirmed the event. The key is dropped as soon as
//! the record is stored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::retry::RetryPolicy;
use crate::sink::AnalyticsSink;
use crate::types::{Platform, ReportEvent, ReportRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The sink confirmed the event and the record was stored
    Reported,
    /// A report for this destination already exists or is being emitted
    Duplicate,
    /// Every emission attempt failed; no record was created
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    InFlight,
    Confirmed,
}

pub struct ReportForwarder {
    sink: Arc<dyn AnalyticsSink>,
    db: Database,
    policy: RetryPolicy,
    keys: Mutex<HashMap<(String, Platform), KeyState>>,
}

impl ReportForwarder {
    pub fn new(sink: Arc<dyn AnalyticsSink>, db: Database, policy: RetryPolicy) -> Self {
        Self {
            sink,
            db,
            policy,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Report a destination's first success
    pub async fn forward(&self, event: &ReportEvent) -> ForwardOutcome {
        let key = (event.post_id.clone(), event.platform);

        {
            let mut keys = self.keys.lock().await;
            if keys.contains_key(&key) {
                debug!(post_id = %event.post_id, platform = %event.platform, "duplicate report suppressed");
                return ForwardOutcome::Duplicate;
            }
            keys.insert(key.clone(), KeyState::InFlight);
        }

        match self.db.has_report(&event.post_id, event.platform).await {
            Ok(true) => {
                self.keys.lock().await.remove(&key);
                debug!(post_id = %event.post_id, platform = %event.platform, "report already recorded");
                return ForwardOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(post_id = %event.post_id, platform = %event.platform, error = %e, "could not check report records");
            }
        }

        let mut attempt = 1;
        loop {
            match self.sink.report_published(event).await {
                Ok(()) => {
                    let record = ReportRecord {
                        post_id: event.post_id.clone(),
                        platform: event.platform,
                        platform_post_id: event.platform_post_id.clone(),
                        reported_at: Utc::now(),
                    };
                    // The stored record takes over deduplication
                    match self.db.record_report(&record).await {
                        Ok(_) => {
                            self.keys.lock().await.remove(&key);
                        }
                        Err(e) => {
                            warn!(post_id = %event.post_id, platform = %event.platform, error = %e, "failed to store report record");
                            self.keys.lock().await.insert(key, KeyState::Confirmed);
                        }
                    }
                    info!(post_id = %event.post_id, platform = %event.platform, "report emitted");
                    return ForwardOutcome::Reported;
                }
                Err(e) if self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        post_id = %event.post_id,
                        platform = %event.platform,
                        attempt,
                        error = %e,
                        "report emission failed, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.keys.lock().await.remove(&key);
                    warn!(
                        post_id = %event.post_id,
                        platform = %event.platform,
                        attempts = attempt,
                        error = %e,
                        "giving up on report emission"
                    );
                    return ForwardOutcome::Abandoned;
                }
            }
        }
    }
}
