//! Credentials and the delegated token-exchange collaborator.
//!
//! The engine only ever sees a [`Credential`]: an opaque bearer string sent
//! once per connection in the `auth` envelope. Where that string comes from
//! (an issued API key, or an access token produced by a delegated exchange)
//! is the caller's business.

use async_trait::async_trait;

/// Opaque bearer secret. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for placing on the wire.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Access/refresh pair produced by a delegated authorization exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl From<TokenPair> for Credential {
    fn from(pair: TokenPair) -> Self {
        Self(pair.access_token)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("exchange rejected: {0}")]
    Rejected(String),
    #[error("exchange unavailable: {0}")]
    Unavailable(String),
}

/// Trades a one-time secret (e.g. an authorization code) for tokens.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn authenticate_with_credential(&self, secret: &str) -> Result<TokenPair, ExchangeError>;
}

/// Obtain a session credential through `exchange`.
///
/// # Errors
///
/// Propagates the exchange failure; an empty access token is reported as
/// [`ExchangeError::Rejected`].
pub async fn credential_from_exchange(
    exchange: &dyn TokenExchange,
    secret: &str,
) -> Result<Credential, ExchangeError> {
    let pair = exchange.authenticate_with_credential(secret).await?;
    if pair.access_token.trim().is_empty() {
        return Err(ExchangeError::Rejected("empty access token".to_owned()));
    }
    Ok(pair.into())
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
