//! Service facade for Fanpost
//!
//! `FanpostService` wires the scheduler, dispatcher, reporting forwarder and
//! database together and exposes the inbound operations: submit, cancel and
//! status read. Hosts call [`FanpostService::run`] to drive the tick loop and
//! the dispatch worker until shutdown.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use libfanpost::service::{FanpostService, SubmitRequest};
//! use libfanpost::Config;
//!
//! # async fn example() -> libfanpost::Result<()> {
//! let service = FanpostService::from_config(Config::load()?).await?;
//! service.recover().await?;
//!
//! let post_id = service
//!     .process_and_schedule_post(SubmitRequest {
//!         user_id: "user-1".to_string(),
//!         raw_content: "Launch day! #rust".to_string(),
//!         media_references: vec![],
//!         target_platforms: vec!["facebook".to_string(), "twitter".to_string()],
//!         scheduled_at: "30m".to_string(),
//!         credential_refs: HashMap::from([
//!             ("facebook".to_string(), "fb-page".to_string()),
//!             ("twitter".to_string(), "tw-main".to_string()),
//!         ]),
//!     })
//!     .await?;
//!
//! let view = service.get_post_status(&post_id).await?;
//! println!("{} is {}", view.post_id, view.status);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::credentials::{CredentialResolver, EnvCredentialResolver};
use crate::db::Database;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, FanpostError, PublishError, Result};
use crate::forwarder::{ForwardOutcome, ReportForwarder};
use crate::gateway::agent::AgentGateway;
use crate::gateway::PublishGateway;
use crate::registry::{PostHandle, PostRegistry};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::scheduling::parse_scheduled_at;
use crate::sink::{AnalyticsSink, HttpAnalyticsSink, LogSink};
use crate::types::{CredentialRef, FailureReason, Platform, Post, PostStatus, PostStatusView};

/// Inbound submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub user_id: String,
    pub raw_content: String,
    #[serde(default)]
    pub media_references: Vec<String>,
    #[serde(default)]
    pub target_platforms: Vec<String>,
    /// RFC 3339 timestamp, `now`, relative duration or natural language
    pub scheduled_at: String,
    /// Credential reference per platform identifier
    #[serde(default)]
    pub credential_refs: HashMap<String, String>,
}

/// What [`FanpostService::recover`] found in storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Pending posts put back on the schedule
    pub rescheduled: usize,
    /// Posts whose dispatch was cut short with publish calls in flight
    pub interrupted: usize,
    /// Posts handed back to the dispatcher for destinations never started
    pub resumed: usize,
    /// Successes reported now because no report record existed
    pub reports_replayed: usize,
}

pub struct FanpostService {
    db: Database,
    registry: PostRegistry,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    forwarder: Arc<ReportForwarder>,
    release_rx: Mutex<mpsc::UnboundedReceiver<PostHandle>>,
    tick_interval: Duration,
}

impl FanpostService {
    /// Build a service talking to the configured platform agents
    ///
    /// Credentials are read from `FANPOST_TOKEN_<REF>` environment variables.
    /// Reports go to `agents.analytics_url`, or to the log when unset.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration names an unknown platform
    /// - An HTTP client cannot be built
    /// - The database cannot be opened or migrated
    pub async fn from_config(config: Config) -> Result<Self> {
        let mut agents = HashMap::new();
        for (name, url) in &config.agents.publish {
            let platform = name.parse::<Platform>().map_err(|reason| {
                ConfigError::InvalidValue {
                    field: format!("agents.publish.{}", name),
                    reason,
                }
            })?;
            agents.insert(platform, url.clone());
        }

        let gateway = AgentGateway::new(agents, config.dispatch.publish_timeout())
            .map_err(|e: PublishError| invalid_client("agents.publish", e.to_string()))?;

        let sink: Arc<dyn AnalyticsSink> = match &config.agents.analytics_url {
            Some(url) => Arc::new(
                HttpAnalyticsSink::new(url, config.dispatch.publish_timeout())
                    .map_err(|e| invalid_client("agents.analytics_url", e.to_string()))?,
            ),
            None => Arc::new(LogSink),
        };

        let db_path = config.database_path();
        let db_path_str = db_path.to_str().ok_or_else(|| {
            FanpostError::Config(ConfigError::MissingField(
                "Invalid database path".to_string(),
            ))
        })?;
        let db = Database::new(db_path_str).await?;

        Self::with_components(
            &config,
            db,
            Arc::new(gateway),
            Arc::new(EnvCredentialResolver),
            sink,
        )
    }

    /// Build a service from explicit collaborators
    pub fn with_components(
        config: &Config,
        db: Database,
        gateway: Arc<dyn PublishGateway>,
        credentials: Arc<dyn CredentialResolver>,
        sink: Arc<dyn AnalyticsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let policy = RetryPolicy::from_config(&config.dispatch);
        let registry = PostRegistry::new();
        let (release_tx, release_rx) = mpsc::unbounded_channel();

        let forwarder = Arc::new(ReportForwarder::new(sink, db.clone(), policy.clone()));
        let scheduler = Arc::new(Scheduler::new(registry.clone(), db.clone(), release_tx));
        let dispatcher = Arc::new(Dispatcher::new(
            gateway,
            credentials,
            config.content_adapter()?,
            Arc::clone(&forwarder),
            db.clone(),
            registry.clone(),
            policy,
            config.dispatch.publish_timeout(),
            config.dispatch.max_in_flight,
        ));

        Ok(Self {
            db,
            registry,
            scheduler,
            dispatcher,
            forwarder,
            release_rx: Mutex::new(release_rx),
            tick_interval: config.scheduler.tick_interval(),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Validate and schedule a post, returning its ID
    ///
    /// # Errors
    ///
    /// - `InvalidSchedule` for an unparseable `scheduled_at`, no target
    ///   platform, or an unknown platform identifier
    /// - `CredentialUnavailable` when a target platform has no credential reference
    pub async fn process_and_schedule_post(&self, request: SubmitRequest) -> Result<String> {
        let mut targets = Vec::with_capacity(request.target_platforms.len());
        for name in &request.target_platforms {
            targets.push(name.parse::<Platform>().map_err(FanpostError::InvalidSchedule)?);
        }
        if targets.is_empty() {
            return Err(FanpostError::InvalidSchedule(
                "At least one target platform is required".to_string(),
            ));
        }

        let scheduled_at = parse_scheduled_at(&request.scheduled_at, Utc::now())?;

        let mut credential_refs = BTreeMap::new();
        for (name, reference) in request.credential_refs {
            let platform = name.parse::<Platform>().map_err(FanpostError::InvalidSchedule)?;
            if targets.contains(&platform) && !reference.trim().is_empty() {
                credential_refs.insert(platform, CredentialRef::new(reference));
            }
        }

        let post = Post::new(
            request.user_id,
            request.raw_content,
            request.media_references,
            targets,
            scheduled_at,
            credential_refs,
        )?;

        self.scheduler.submit(post).await
    }

    /// Cancel a pending post
    ///
    /// # Errors
    ///
    /// - `AlreadyDispatched` once dispatch has begun
    /// - `PostNotFound` for an unknown ID
    pub async fn cancel_post(&self, post_id: &str) -> Result<()> {
        self.scheduler.cancel(post_id).await
    }

    /// Current status of a post and each of its destinations
    pub async fn get_post_status(&self, post_id: &str) -> Result<PostStatusView> {
        if let Some(handle) = self.registry.get(post_id).await {
            return Ok(handle.lock().await.view());
        }

        self.db
            .get_post(post_id)
            .await?
            .map(|post| post.view())
            .ok_or_else(|| FanpostError::PostNotFound(post_id.to_string()))
    }

    /// Reload unfinished posts after a restart
    ///
    /// Pending posts are put back on the schedule; past-due ones are released
    /// on the next tick. For a post found mid-dispatch, destinations whose
    /// publish call may already have landed are failed rather than published
    /// a second time, and destinations never started are dispatched now.
    /// Every stored success without a report record is reported again.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for mut post in self.db.load_unfinished_posts().await? {
            if self.registry.get(&post.id).await.is_some() {
                continue;
            }

            match post.status() {
                PostStatus::Pending => {
                    self.scheduler.restore(post).await;
                    report.rescheduled += 1;
                }
                PostStatus::Dispatching => {
                    let closed = post.abandon_in_flight_attempts(FailureReason::Publish {
                        error: PublishError::Unknown(
                            "dispatch interrupted by restart".to_string(),
                        ),
                    });
                    if closed > 0 {
                        self.db.save_post(&post).await?;
                        warn!(
                            post_id = %post.id,
                            status = %post.status(),
                            "closed {} destination(s) interrupted by restart",
                            closed
                        );
                        report.interrupted += 1;
                    }
                    if self.scheduler.resume(post).await {
                        report.resumed += 1;
                    }
                }
                _ => {}
            }
        }

        for post in self.db.load_unreported_posts().await? {
            for event in post.report_events() {
                if self.forwarder.forward(&event).await == ForwardOutcome::Reported {
                    report.reports_replayed += 1;
                }
            }
        }

        if report != RecoveryReport::default() {
            info!(
                rescheduled = report.rescheduled,
                interrupted = report.interrupted,
                resumed = report.resumed,
                reports_replayed = report.reports_replayed,
                "recovered unfinished posts"
            );
        }
        Ok(report)
    }

    /// Run one tick now and wait for the resulting dispatches to finish
    ///
    /// Returns the number of posts released.
    pub async fn run_once(&self) -> usize {
        let released = self.scheduler.tick(Utc::now()).await;
        let mut rx = self.release_rx.lock().await;
        self.dispatcher.run_until_idle(&mut rx).await;
        released
    }

    /// Drive the tick loop and the dispatch worker until `shutdown` flips to `true`
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(tick_interval = ?self.tick_interval, "fanpost service running");

        let mut rx = self.release_rx.lock().await;
        tokio::join!(
            self.scheduler.run(self.tick_interval, shutdown.clone()),
            self.dispatcher.run(&mut rx, shutdown),
        );

        info!("fanpost service stopped");
    }
}

fn invalid_client(field: &str, reason: String) -> FanpostError {
    FanpostError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        reason,
    })
}
