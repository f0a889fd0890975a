//! Bearer-token authentication seam.
//!
//! The real OIDC flow lives outside the core; the hub only needs a subject
//! for each token. Deployments wire a real verifier through the trait; the
//! static map covers configured service tokens and the dev fallback accepts
//! any non-empty token as its own subject.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("token rejected")]
    Rejected,
}

/// Resolve a bearer token to a subject identifier.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<String, AuthError>;
}

/// Fixed token → subject map from configuration.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::Rejected)
    }
}

/// Development fallback: any non-empty token authenticates as itself.
pub struct DevAuthenticator;

#[async_trait]
impl Authenticator for DevAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        Ok(token.to_string())
    }
}

/// Pick the authenticator for the configured token set.
pub fn from_token_map(tokens: HashMap<String, String>) -> std::sync::Arc<dyn Authenticator> {
    if tokens.is_empty() {
        std::sync::Arc::new(DevAuthenticator)
    } else {
        std::sync::Arc::new(StaticTokenAuthenticator::new(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_map_resolves_subjects() {
        let mut tokens = HashMap::new();
        tokens.insert("tok-a".to_string(), "alice".to_string());
        let auth = StaticTokenAuthenticator::new(tokens);

        assert_eq!(auth.authenticate("tok-a").await.unwrap(), "alice");
        assert!(auth.authenticate("tok-b").await.is_err());
    }

    #[tokio::test]
    async fn dev_authenticator_requires_non_empty() {
        let auth = DevAuthenticator;
        assert_eq!(auth.authenticate("anything").await.unwrap(), "anything");
        assert!(matches!(
            auth.authenticate("").await,
            Err(AuthError::Missing)
        ));
    }
}
