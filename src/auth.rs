//! OAuth2 client-credentials token provider.
//!
//! Implements [`AccessTokenProvider`] over HTTP: a fresh bearer token is
//! requested from the token endpoint whenever the cached one is absent or
//! about to expire, so every (re)connect attempt carries valid credentials.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{
    config::Config,
    token::{AccessToken, AccessTokenProvider, TokenError},
};

/// Refresh this long before actual expiry. Prevents handing out a token
/// with only a few seconds on the clock.
const EXPIRATION_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Token endpoint response for a client-credentials grant.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Caching token provider backed by an OAuth2 token endpoint.
pub struct OAuthSession {
    http_client: reqwest::Client,
    token_endpoint: Url,
    client_id: String,
    client_secret: String,
    token: Option<AccessToken>,
}

impl OAuthSession {
    pub fn new(config: &Config) -> Result<Self> {
        let credentials = &config.credentials;
        if credentials.client_id.is_empty() || credentials.client_secret.is_empty() {
            return Err(AuthError::Assertion(
                "client credentials are empty".to_string(),
            ));
        }

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(60))
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            http_client,
            token_endpoint: credentials.token_endpoint.clone(),
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            token: None,
        })
    }

    async fn refresh(&self) -> Result<AccessToken> {
        debug!("requesting access token from {}", self.token_endpoint);

        let response = self
            .http_client
            .post(self.token_endpoint.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<TokenResponse>()
            .await?;

        let time_to_live = Duration::from_secs(
            response
                .expires_in
                .saturating_sub(EXPIRATION_THRESHOLD.as_secs()),
        );
        debug!("access token time to live: {} seconds", time_to_live.as_secs());

        AccessToken::new(&response.access_token, SystemTime::now() + time_to_live)
            .map_err(|e| AuthError::Assertion(e.to_string()))
    }
}

#[async_trait]
impl AccessTokenProvider for OAuthSession {
    async fn access_token(&mut self) -> std::result::Result<AccessToken, TokenError> {
        if let Some(token) = &self.token {
            if !token.is_expired() {
                return Ok(token.clone());
            }
            debug!("cached access token expired");
        }

        let token = self.refresh().await?;
        self.token = Some(token.clone());
        Ok(token)
    }

    fn invalidate(&mut self) {
        self.token = None;
    }
}

impl From<AuthError> for TokenError {
    fn from(e: AuthError) -> Self {
        Self::Provider(e.into())
    }
}
