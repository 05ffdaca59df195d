//! Bearer tokens and the provider capability that supplies them.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use thiserror::Error;

/// A bearer token for the connection handshake, valid until `expires_at`.
#[derive(Clone, Debug)]
pub struct AccessToken {
    token: String,
    expires_at: SystemTime,
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("access token invalid: {0}")]
    Invalid(String),

    #[error("access token provider error: {0}")]
    Provider(Box<dyn std::error::Error + Send + Sync>),
}

/// Supplies a valid bearer token on demand, refreshing it over external I/O
/// when necessary. Queried on every (re)connect attempt.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&mut self) -> Result<AccessToken, TokenError>;

    /// Forces the next [`access_token`](Self::access_token) call to refresh.
    fn invalidate(&mut self);
}

impl AccessToken {
    pub fn new(token: &str, expires_at: SystemTime) -> Result<Self, TokenError> {
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(TokenError::Invalid(
                "token is empty or contains whitespace".to_string(),
            ));
        }

        Ok(Self {
            token: token.to_owned(),
            expires_at,
        })
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    /// Time remaining until expiry.
    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_tokens() {
        let expires_at = SystemTime::now() + Duration::from_secs(60);
        assert!(AccessToken::new("", expires_at).is_err());
        assert!(AccessToken::new("two words", expires_at).is_err());
        assert!(AccessToken::new("a1b2c3", expires_at).is_ok());
    }

    #[test]
    fn expires_at_the_deadline() {
        let fresh =
            AccessToken::new("token", SystemTime::now() + Duration::from_secs(60)).unwrap();
        assert!(!fresh.is_expired());
        assert!(fresh.time_to_live() > Duration::ZERO);

        let stale =
            AccessToken::new("token", SystemTime::now() - Duration::from_secs(1)).unwrap();
        assert!(stale.is_expired());
        assert_eq!(stale.time_to_live(), Duration::ZERO);
    }
}
