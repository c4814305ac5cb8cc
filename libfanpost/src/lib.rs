//! Fanpost - scheduling and multi-platform publish orchestration
//!
//! This library holds posts until their scheduled time, fans each one out to
//! its target platforms through a uniform publish gateway, tracks every
//! destination independently, derives a post-level status from those
//! outcomes, and reports each destination success to an analytics sink
//! exactly once.

pub mod adapter;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod scheduling;
pub mod service;
pub mod sink;
pub mod types;

// Re-export commonly used types
pub use adapter::{AdaptedContent, ContentAdapter};
pub use config::Config;
pub use db::Database;
pub use error::{FanpostError, PublishError, Result};
pub use service::{FanpostService, SubmitRequest};
pub use types::{
    derive_status, CredentialRef, OutcomeKind, Platform, Post, PostStatus, PostStatusView,
};
