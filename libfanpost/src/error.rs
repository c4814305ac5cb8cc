//! Error types for Fanpost

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Platform;

pub type Result<T> = std::result::Result<T, FanpostError>;

#[derive(Error, Debug)]
pub enum FanpostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Credential unavailable for {platform}")]
    CredentialUnavailable { platform: Platform },

    #[error("Post {0} has already been dispatched")]
    AlreadyDispatched(String),

    #[error("Post not found: {0}")]
    PostNotFound(String),
}

impl FanpostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FanpostError::InvalidSchedule(_) | FanpostError::CredentialUnavailable { .. } => 3,
            FanpostError::Config(_) => 2,
            FanpostError::Database(_) => 1,
            FanpostError::AlreadyDispatched(_) | FanpostError::PostNotFound(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt post snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Classified failure of a single publish attempt against a platform agent
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum PublishError {
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Rejected by platform: {0}")]
    PlatformRejected(String),

    #[error("Publish timed out: {0}")]
    Timeout(String),

    #[error("Unknown publish failure: {0}")]
    Unknown(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("No usable credential for {platform}: {reason}")]
    Unavailable { platform: Platform, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdaptError {
    #[error("{platform} requires at least one media reference")]
    MediaRequired { platform: Platform },

    #[error("Nothing left to publish on {platform} after adaptation")]
    EmptyContent { platform: Platform },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Analytics sink unreachable: {0}")]
    Unreachable(String),

    #[error("Analytics sink rejected report: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_schedule() {
        let error = FanpostError::InvalidSchedule("no target platforms".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_credential_unavailable() {
        let error = FanpostError::CredentialUnavailable {
            platform: Platform::Twitter,
        };
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = FanpostError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_already_dispatched() {
        let error = FanpostError::AlreadyDispatched("abc".to_string());
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting() {
        let error = FanpostError::InvalidSchedule("Could not parse schedule string: soon".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid schedule: Could not parse schedule string: soon"
        );

        let error = FanpostError::CredentialUnavailable {
            platform: Platform::Facebook,
        };
        assert_eq!(error.to_string(), "Credential unavailable for facebook");
    }

    #[test]
    fn test_publish_error_formatting() {
        let rate = PublishError::RateLimited("429 from agent".to_string());
        assert_eq!(rate.to_string(), "Rate limit exceeded: 429 from agent");

        let timeout = PublishError::Timeout("no response after 30s".to_string());
        assert!(timeout.to_string().contains("timed out"));
    }

    #[test]
    fn test_publish_error_serializes_with_kind() {
        let error = PublishError::PlatformRejected("duplicate status".to_string());
        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"platform_rejected","message":"duplicate status"}"#
        );

        let back: PublishError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, error);
    }

    #[test]
    fn test_error_conversion_from_config_error() {
        let config_error = ConfigError::MissingField("test".to_string());
        let error: FanpostError = config_error.into();
        assert!(matches!(error, FanpostError::Config(_)));
    }

    #[test]
    fn test_error_conversion_from_db_error() {
        let db_error = DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "test",
        ));
        let error: FanpostError = db_error.into();
        assert!(matches!(error, FanpostError::Database(_)));
    }

    #[test]
    fn test_adapt_error_names_platform() {
        let error = AdaptError::MediaRequired {
            platform: Platform::Instagram,
        };
        assert_eq!(
            error.to_string(),
            "instagram requires at least one media reference"
        );
    }
}
