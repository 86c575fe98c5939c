//! Bearer token verification
//!
//! The gateway consumes token verification through the [`TokenVerifier`]
//! trait; the store behind it is replaceable. [`StaticTokenVerifier`] is
//! the default implementation, loading a JSON map of opaque tokens to
//! usernames at startup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Result of a successful token check
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub username: Option<String>,
}

/// Opaque bearer-token verification
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `None` means the token is unknown (maps to 403 at the edge)
    async fn verify(&self, token: &str) -> Option<VerifiedToken>;
}

/// Token store backed by a JSON file of `{"<token>": "<username>"}` pairs
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Option<String>>,
}

impl StaticTokenVerifier {
    /// Load from `path`. A missing or unreadable file yields an empty store
    /// (every request is rejected) with a warning, not a startup failure.
    pub fn load(path: &Path) -> Self {
        let tokens = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, Option<String>>>(&contents)
            {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!("Failed to parse token file {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) => {
                warn!(
                    "Token file {} not readable ({}); all API requests will be rejected",
                    path.display(),
                    e
                );
                HashMap::new()
            }
        };

        info!("Loaded {} bearer tokens", tokens.len());
        Self { tokens }
    }

    pub fn from_pairs<I, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, Option<T>)>,
        T: Into<String>,
    {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(token, user)| (token.into(), user.map(Into::into)))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<VerifiedToken> {
        self.tokens.get(token).map(|username| VerifiedToken {
            username: username.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_token_verifies_with_username() {
        let verifier =
            StaticTokenVerifier::from_pairs([("tok-1", Some("svc-account")), ("tok-2", None)]);

        let verified = verifier.verify("tok-1").await.unwrap();
        assert_eq!(verified.username.as_deref(), Some("svc-account"));

        let anonymous = verifier.verify("tok-2").await.unwrap();
        assert!(anonymous.username.is_none());
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let verifier = StaticTokenVerifier::from_pairs([("tok-1", Some("svc-account"))]);
        assert!(verifier.verify("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_store() {
        let verifier =
            StaticTokenVerifier::load(Path::new("/definitely/not/here/tokens.json"));
        assert!(verifier.verify("anything").await.is_none());
    }
}
