//! Access-token supply.
//!
//! The engine never caches a bearer token. It asks a [`TokenProvider`] on
//! every connect attempt and every history fetch, so rotated tokens are
//! picked up across reconnects.

// Rust guideline compliant 2026-02

use async_trait::async_trait;

/// Source of the bearer token used to authenticate against the backend.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return the current access token.
    ///
    /// # Errors
    ///
    /// Returns an error if no token is available (e.g. the user signed out).
    async fn access_token(&self) -> anyhow::Result<String>;
}

/// A fixed token. Handy for the CLI and for tests.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        if self.0.is_empty() {
            anyhow::bail!("no access token configured");
        }
        Ok(self.0.clone())
    }
}

/// Any `Fn() -> Option<String>` is a token provider; `None` means signed out.
#[async_trait]
impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    async fn access_token(&self) -> anyhow::Result<String> {
        self().ok_or_else(|| anyhow::anyhow!("token provider returned no token"))
    }
}
