//! Credential reference resolution
//!
//! Token acquisition and secure storage live outside this crate. The core
//! only turns a [`CredentialRef`] into a usable [`AccessToken`] at dispatch
//! time through a [`CredentialResolver`].

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CredentialError;
use crate::types::{CredentialRef, Platform};

/// A resolved access token. The value is zeroed on drop and redacted in `Debug`.
#[derive(Debug)]
pub struct AccessToken(SecretString);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Resolves a credential reference into an access token
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns `CredentialError::Unavailable` when the reference cannot be
    /// turned into a usable token (unknown, revoked, store unreachable).
    async fn resolve(
        &self,
        user_id: &str,
        platform: Platform,
        credential_ref: &CredentialRef,
    ) -> Result<AccessToken, CredentialError>;
}

/// Resolves references from an in-memory table
///
/// Useful for tests and for embedding with pre-provisioned tokens.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialResolver {
    tokens: HashMap<String, String>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, credential_ref: &str, token: &str) -> Self {
        self.tokens
            .insert(credential_ref.to_string(), token.to_string());
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(
        &self,
        _user_id: &str,
        platform: Platform,
        credential_ref: &CredentialRef,
    ) -> Result<AccessToken, CredentialError> {
        self.tokens
            .get(credential_ref.as_str())
            .map(|token| AccessToken::new(token.clone()))
            .ok_or_else(|| CredentialError::Unavailable {
                platform,
                reason: format!("unknown credential reference '{}'", credential_ref),
            })
    }
}

/// Resolves `ref` from the environment variable `FANPOST_TOKEN_<REF>`
///
/// The reference is upper-cased and every non-alphanumeric character is
/// replaced with `_`, so `fb-page.main` reads `FANPOST_TOKEN_FB_PAGE_MAIN`.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialResolver;

impl EnvCredentialResolver {
    pub fn variable_name(credential_ref: &CredentialRef) -> String {
        let suffix: String = credential_ref
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("FANPOST_TOKEN_{}", suffix)
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(
        &self,
        _user_id: &str,
        platform: Platform,
        credential_ref: &CredentialRef,
    ) -> Result<AccessToken, CredentialError> {
        let variable = Self::variable_name(credential_ref);
        match std::env::var(&variable) {
            Ok(token) if !token.trim().is_empty() => Ok(AccessToken::new(token.trim())),
            _ => Err(CredentialError::Unavailable {
                platform,
                reason: format!("{} is not set", variable),
            }),
        }
    }
}
