//! Publish gateway abstraction
//!
//! The dispatcher talks to every platform agent through the single
//! [`PublishGateway`] trait. One call is one `(post, platform)` attempt; the
//! platform-specific payload travels as [`AdaptedContent`], tagged by
//! platform.
//!
//! - [`agent::AgentGateway`]: HTTP client for remote platform agents
//! - [`mock::MockGateway`]: scriptable in-process gateway for tests

use async_trait::async_trait;
use serde::Serialize;

use crate::adapter::AdaptedContent;
use crate::credentials::AccessToken;
use crate::error::PublishError;
use crate::types::{CredentialRef, Platform};

pub mod agent;
pub mod mock;

/// Everything a platform agent needs for one publish attempt
///
/// The access token never appears in the serialized body; transports send it
/// out of band (e.g. as a bearer header).
#[derive(Debug, Serialize)]
pub struct PublishRequest {
    pub post_id: String,
    pub platform: Platform,
    pub content: AdaptedContent,
    pub credential_ref: CredentialRef,
    #[serde(skip)]
    pub access_token: AccessToken,
}

/// Uniform publish contract implemented by every platform agent transport
#[async_trait]
pub trait PublishGateway: Send + Sync {
    /// Publish one adapted post to one platform
    ///
    /// Returns the platform-specific post ID.
    ///
    /// # Errors
    ///
    /// Returns a classified [`PublishError`]. The dispatcher applies its own
    /// deadline on top of this call and reports an elapsed deadline as
    /// `PublishError::Timeout`.
    async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError>;

    /// Short identifier used in logs
    fn name(&self) -> &str;
}
