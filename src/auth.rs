//! Bearer-token boundary for the platform API.
//!
//! The transfer code never performs a login itself. It asks a
//! [`TokenSource`] for the current token and, after a 401, for a fresh one.

use async_trait::async_trait;

use crate::error::TransferError;

/// Supplies access tokens for platform requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a token believed to be valid.
    async fn valid_token(&self) -> Result<String, TransferError>;

    /// Forces a refresh after the server rejected the current token.
    async fn refresh(&self) -> Result<String, TransferError>;
}

/// Fixed token, for scripts and tests. Refreshing returns the same value.
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    /// Wraps an already issued token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn valid_token(&self) -> Result<String, TransferError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String, TransferError> {
        Ok(self.token.clone())
    }
}
