//! Core types for Fanpost
//!
//! A [`Post`] owns one [`DestinationAttempt`] per target platform once it has
//! been released by the scheduler. The post-level [`PostStatus`] is never
//! assigned directly: every mutation of an attempt goes through
//! [`Post::update_attempt`], which recomputes the status from the attempt
//! outcomes with [`derive_status`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::AdaptedContent;
use crate::error::{FanpostError, PublishError, Result};

/// Supported destination platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Twitter,
    Instagram,
    Linkedin,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Facebook,
        Platform::Twitter,
        Platform::Instagram,
        Platform::Linkedin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
            Platform::Linkedin => "linkedin",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "facebook" => Ok(Platform::Facebook),
            "twitter" => Ok(Platform::Twitter),
            "instagram" => Ok(Platform::Instagram),
            "linkedin" => Ok(Platform::Linkedin),
            _ => Err(format!(
                "Unsupported platform: '{}'. Valid options: facebook, twitter, instagram, linkedin",
                s
            )),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to a per-destination credential, resolved at dispatch time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Pending,
    Dispatching,
    PartiallyPublished,
    Published,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Published
                | PostStatus::Failed
                | PostStatus::PartiallyPublished
                | PostStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Dispatching => "dispatching",
            PostStatus::PartiallyPublished => "partially_published",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a destination ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    CredentialUnavailable { message: String },
    ContentRejected { message: String },
    Publish { error: PublishError },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CredentialUnavailable { message } => {
                write!(f, "CredentialUnavailable: {}", message)
            }
            FailureReason::ContentRejected { message } => {
                write!(f, "ContentRejected: {}", message)
            }
            FailureReason::Publish { error } => write!(f, "{}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttemptOutcome {
    NotStarted,
    InFlight,
    Succeeded,
    Failed { reason: FailureReason },
}

impl AttemptOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded | AttemptOutcome::Failed { .. })
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            AttemptOutcome::NotStarted => OutcomeKind::NotStarted,
            AttemptOutcome::InFlight => OutcomeKind::InFlight,
            AttemptOutcome::Succeeded => OutcomeKind::Succeeded,
            AttemptOutcome::Failed { .. } => OutcomeKind::Failed,
        }
    }
}

/// Payload-free view of an [`AttemptOutcome`], used in status reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    NotStarted,
    InFlight,
    Succeeded,
    Failed,
}

/// One platform's publish lifecycle for one post
///
/// Only the dispatcher mutates an attempt, and only through the transition
/// methods below. Once the outcome is terminal every transition is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationAttempt {
    pub platform: Platform,
    pub credential_ref: CredentialRef,
    adapted_content: Option<AdaptedContent>,
    attempt_count: u32,
    outcome: AttemptOutcome,
    platform_post_id: Option<String>,
    last_error: Option<String>,
    published_at: Option<DateTime<Utc>>,
}

impl DestinationAttempt {
    pub fn new(platform: Platform, credential_ref: CredentialRef) -> Self {
        Self {
            platform,
            credential_ref,
            adapted_content: None,
            attempt_count: 0,
            outcome: AttemptOutcome::NotStarted,
            platform_post_id: None,
            last_error: None,
            published_at: None,
        }
    }

    pub fn adapted_content(&self) -> Option<&AdaptedContent> {
        self.adapted_content.as_ref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn outcome(&self) -> &AttemptOutcome {
        &self.outcome
    }

    pub fn platform_post_id(&self) -> Option<&str> {
        self.platform_post_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }

    /// Fix the adapted content. Content is produced once and never replaced.
    pub fn set_adapted_content(&mut self, content: AdaptedContent) -> bool {
        if self.adapted_content.is_some() || self.outcome != AttemptOutcome::NotStarted {
            return false;
        }
        self.adapted_content = Some(content);
        true
    }

    /// Start the next publish attempt, returning its 1-based number.
    ///
    /// Returns `None` when the attempt is terminal or `ceiling` attempts
    /// have already been made.
    pub fn start_attempt(&mut self, ceiling: u32) -> Option<u32> {
        if self.is_terminal() || self.attempt_count >= ceiling {
            return None;
        }
        self.attempt_count += 1;
        self.outcome = AttemptOutcome::InFlight;
        Some(self.attempt_count)
    }

    /// Record success. Returns `true` only on the first transition to `Succeeded`.
    pub fn succeed(&mut self, platform_post_id: String, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.outcome = AttemptOutcome::Succeeded;
        self.platform_post_id = Some(platform_post_id);
        self.published_at = Some(at);
        true
    }

    /// Record terminal failure. Returns `false` if the attempt was already terminal.
    pub fn fail(&mut self, reason: FailureReason) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.last_error = Some(reason.to_string());
        self.outcome = AttemptOutcome::Failed { reason };
        true
    }
}

/// Post-level status as a pure function of cancellation and attempt outcomes
pub fn derive_status(cancelled: bool, attempts: &[DestinationAttempt]) -> PostStatus {
    if cancelled {
        return PostStatus::Cancelled;
    }
    if attempts.is_empty() {
        return PostStatus::Pending;
    }
    if !attempts.iter().all(|a| a.is_terminal()) {
        return PostStatus::Dispatching;
    }

    let succeeded = attempts
        .iter()
        .filter(|a| a.outcome == AttemptOutcome::Succeeded)
        .count();

    if succeeded == attempts.len() {
        PostStatus::Published
    } else if succeeded == 0 {
        PostStatus::Failed
    } else {
        PostStatus::PartiallyPublished
    }
}

/// The unit of scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub raw_content: String,
    pub media_references: Vec<String>,
    pub target_platforms: Vec<Platform>,
    pub credential_refs: BTreeMap<Platform, CredentialRef>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    attempts: Vec<DestinationAttempt>,
    cancelled: bool,
    status: PostStatus,
    revision: u64,
}

impl Post {
    /// Build a new pending post
    ///
    /// Target platforms are deduplicated keeping first-seen order.
    ///
    /// # Errors
    ///
    /// - `InvalidSchedule` if no target platform is given
    /// - `CredentialUnavailable` if a target platform has no credential reference
    pub fn new(
        user_id: String,
        raw_content: String,
        media_references: Vec<String>,
        target_platforms: Vec<Platform>,
        scheduled_at: DateTime<Utc>,
        credential_refs: BTreeMap<Platform, CredentialRef>,
    ) -> Result<Self> {
        let mut targets: Vec<Platform> = Vec::with_capacity(target_platforms.len());
        for platform in target_platforms {
            if !targets.contains(&platform) {
                targets.push(platform);
            }
        }

        if targets.is_empty() {
            return Err(FanpostError::InvalidSchedule(
                "At least one target platform is required".to_string(),
            ));
        }

        if let Some(missing) = targets.iter().find(|p| !credential_refs.contains_key(p)) {
            return Err(FanpostError::CredentialUnavailable { platform: *missing });
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            raw_content,
            media_references,
            target_platforms: targets,
            credential_refs,
            scheduled_at,
            created_at: Utc::now(),
            attempts: Vec::new(),
            cancelled: false,
            status: PostStatus::Pending,
            revision: 0,
        })
    }

    pub fn status(&self) -> PostStatus {
        self.status
    }

    pub fn attempts(&self) -> &[DestinationAttempt] {
        &self.attempts
    }

    pub fn attempt(&self, platform: Platform) -> Option<&DestinationAttempt> {
        self.attempts.iter().find(|a| a.platform == platform)
    }

    /// Monotonic counter bumped on every state change, used to order snapshots
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Claim the post for dispatch: `Pending -> Dispatching`.
    ///
    /// Creates one `NotStarted` attempt per target platform. Returns `false`
    /// if the post was already released or cancelled, which is what keeps a
    /// post from being handed to the dispatcher twice.
    pub fn release(&mut self) -> bool {
        if self.status != PostStatus::Pending {
            return false;
        }

        self.attempts = self
            .target_platforms
            .iter()
            .filter_map(|platform| {
                self.credential_refs
                    .get(platform)
                    .map(|cref| DestinationAttempt::new(*platform, cref.clone()))
            })
            .collect();
        self.recompute();
        true
    }

    /// Cancel a pending post. Cancelling twice is a no-op.
    pub fn cancel(&mut self) -> Result<()> {
        match self.status {
            PostStatus::Pending => {
                self.cancelled = true;
                self.recompute();
                Ok(())
            }
            PostStatus::Cancelled => Ok(()),
            _ => Err(FanpostError::AlreadyDispatched(self.id.clone())),
        }
    }

    /// Apply a transition to one destination and recompute the post status
    pub fn update_attempt<R>(
        &mut self,
        platform: Platform,
        f: impl FnOnce(&mut DestinationAttempt) -> R,
    ) -> Option<R> {
        let attempt = self.attempts.iter_mut().find(|a| a.platform == platform)?;
        let result = f(attempt);
        self.recompute();
        Some(result)
    }

    /// Fail every destination whose publish call may already have been issued
    ///
    /// `NotStarted` destinations are left open so they can still be
    /// dispatched. Returns the number of destinations closed.
    pub fn abandon_in_flight_attempts(&mut self, reason: FailureReason) -> usize {
        let in_flight: Vec<Platform> = self
            .attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::InFlight)
            .map(|a| a.platform)
            .collect();
        for platform in &in_flight {
            self.update_attempt(*platform, |a| a.fail(reason.clone()));
        }
        in_flight.len()
    }

    /// Number of destinations that ended `Succeeded`
    pub fn succeeded_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Succeeded)
            .count()
    }

    /// Report events for every succeeded destination
    pub fn report_events(&self) -> Vec<ReportEvent> {
        self.attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Succeeded)
            .filter_map(|a| {
                Some(ReportEvent {
                    post_id: self.id.clone(),
                    user_id: self.user_id.clone(),
                    platform: a.platform,
                    platform_post_id: a.platform_post_id.clone()?,
                    publish_time: a.published_at?,
                })
            })
            .collect()
    }

    /// Recompute the cached status after loading a stored snapshot
    pub(crate) fn refresh_status(&mut self) {
        self.status = derive_status(self.cancelled, &self.attempts);
    }

    fn recompute(&mut self) {
        self.status = derive_status(self.cancelled, &self.attempts);
        self.revision += 1;
    }

    pub fn view(&self) -> PostStatusView {
        let per_platform = if self.attempts.is_empty() {
            self.target_platforms
                .iter()
                .map(|platform| DestinationView {
                    platform: *platform,
                    outcome: OutcomeKind::NotStarted,
                    attempt_count: 0,
                    platform_post_id: None,
                    last_error: None,
                })
                .collect()
        } else {
            self.attempts
                .iter()
                .map(|a| DestinationView {
                    platform: a.platform,
                    outcome: a.outcome.kind(),
                    attempt_count: a.attempt_count,
                    platform_post_id: a.platform_post_id.clone(),
                    last_error: a.last_error.clone(),
                })
                .collect()
        };

        PostStatusView {
            post_id: self.id.clone(),
            status: self.status,
            scheduled_at: self.scheduled_at,
            per_platform,
        }
    }
}

/// Result of `get_post_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostStatusView {
    pub post_id: String,
    pub status: PostStatus,
    pub scheduled_at: DateTime<Utc>,
    pub per_platform: Vec<DestinationView>,
}

impl PostStatusView {
    pub fn destination(&self, platform: Platform) -> Option<&DestinationView> {
        self.per_platform.iter().find(|d| d.platform == platform)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationView {
    pub platform: Platform,
    pub outcome: OutcomeKind,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Event sent to the analytics sink for a destination's first success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEvent {
    pub post_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub platform_post_id: String,
    pub publish_time: DateTime<Utc>,
}

/// Idempotency record for a confirmed report, keyed by `(post_id, platform)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub post_id: String,
    pub platform: Platform,
    pub platform_post_id: String,
    pub reported_at: DateTime<Utc>,
}
