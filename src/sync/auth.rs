//! Credential contracts and OAuth token management.
//!
//! The browser login dance lives outside this crate; what is implemented here
//! is the token-refresh contract: stored tokens are reused while fresh,
//! refreshed through the OAuth endpoint when close to expiry, and concurrent
//! refreshes for one account coalesce into a single in-flight request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Failed to read token file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse token: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("No credentials configured for account {0}")]
    NoCredentials(String),
    #[error("Token has expired")]
    TokenExpired,
    #[error("No refresh token available")]
    NoRefreshToken,
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("OAuth error: {0}")]
    OAuthError(String),
}

/// Supplies a bearer credential for REST provider calls.
#[async_trait]
pub trait BearerTokenSource: Send + Sync {
    async fn bearer_token(&self, account_id: &str) -> Result<String, AuthError>;
}

/// Basic-auth credentials for a CalDAV account. Secret resolution (plain
/// value vs. external command) happens before these reach this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct CalDavCredentials {
    pub server_url: String,
    pub username: String,
    pub secret: String,
}

pub trait CalDavCredentialSource: Send + Sync {
    fn credentials(&self, account_id: &str) -> Result<CalDavCredentials, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenInfo {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
}

impl TokenInfo {
    pub fn new(access_token: String, expires_in_seconds: i64) -> Self {
        Self {
            access_token,
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_seconds),
            token_type: "Bearer".to_string(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: String) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }

    pub fn needs_refresh(&self) -> bool {
        let buffer = chrono::Duration::minutes(5);
        self.expires_at <= Utc::now() + buffer
    }
}

pub struct TokenStorage {
    path: PathBuf,
}

impl TokenStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save_token(&self, token: &TokenInfo) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(token)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn load_token(&self) -> Result<TokenInfo, AuthError> {
        let content = std::fs::read_to_string(&self.path)?;
        let token: TokenInfo = serde_json::from_str(&content)?;
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
    pub token_cache: PathBuf,
}

/// Token source for one REST account. Holding the refresh behind an async
/// mutex means overlapping callers wait for the one in-flight refresh and
/// then reuse its result from storage.
pub struct OAuthTokenSource {
    account_id: String,
    config: OAuthConfig,
    storage: TokenStorage,
    client: reqwest::Client,
    refresh_lock: Mutex<()>,
}

impl OAuthTokenSource {
    pub fn new(account_id: impl Into<String>, config: OAuthConfig) -> Self {
        let storage = TokenStorage::new(config.token_cache.clone());
        Self {
            account_id: account_id.into(),
            config,
            storage,
            client: reqwest::Client::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    async fn refresh(&self, stale: &TokenInfo) -> Result<TokenInfo, AuthError> {
        let refresh_token = stale
            .refresh_token
            .as_ref()
            .ok_or(AuthError::NoRefreshToken)?;

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        tracing::info!("Refreshing access token for {}", self.account_id);

        let response = self
            .client
            .post(&self.config.token_endpoint)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            tracing::error!("Token refresh failed for {}: {}", self.account_id, error_text);
            return Err(AuthError::OAuthError(error_text));
        }

        let token_response: TokenResponse = response.json().await?;
        let new_token = TokenInfo::new(token_response.access_token, token_response.expires_in)
            .with_refresh_token(
                token_response
                    .refresh_token
                    .unwrap_or_else(|| refresh_token.clone()),
            );

        self.storage.save_token(&new_token)?;
        Ok(new_token)
    }
}

#[async_trait]
impl BearerTokenSource for OAuthTokenSource {
    async fn bearer_token(&self, account_id: &str) -> Result<String, AuthError> {
        if account_id != self.account_id {
            return Err(AuthError::NoCredentials(account_id.to_string()));
        }

        let token = self.storage.load_token()?;
        if !token.needs_refresh() {
            return Ok(token.access_token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        let token = self.storage.load_token()?;
        if !token.needs_refresh() {
            return Ok(token.access_token);
        }

        let refreshed = self.refresh(&token).await?;
        Ok(refreshed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_token() -> TokenInfo {
        TokenInfo::new("test_access_token".to_string(), 3600)
    }

    fn create_expired_token() -> TokenInfo {
        TokenInfo {
            access_token: "expired_token".to_string(),
            refresh_token: Some("refresh_token".to_string()),
            expires_at: Utc::now() - chrono::Duration::hours(1),
            token_type: "Bearer".to_string(),
        }
    }

    #[test]
    fn new_token_is_valid() {
        assert!(create_test_token().is_valid());
    }

    #[test]
    fn expired_token_is_not_valid() {
        assert!(!create_expired_token().is_valid());
    }

    #[test]
    fn token_close_to_expiry_needs_refresh() {
        let token = TokenInfo {
            access_token: "token".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Utc::now() + chrono::Duration::minutes(3),
            token_type: "Bearer".to_string(),
        };

        assert!(token.is_valid());
        assert!(token.needs_refresh());
    }

    #[test]
    fn fresh_token_does_not_need_refresh() {
        assert!(!create_test_token().needs_refresh());
    }

    #[test]
    fn save_and_load_round_trips_through_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = TokenStorage::new(temp_dir.path().join("token.json"));
        let original = create_test_token().with_refresh_token("refresh".to_string());

        storage.save_token(&original).unwrap();
        let loaded = storage.load_token().unwrap();

        assert_eq!(loaded, original);
    }

    #[test]
    fn load_without_file_returns_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = TokenStorage::new(temp_dir.path().join("missing.json"));

        assert!(storage.load_token().is_err());
    }

    #[tokio::test]
    async fn valid_stored_token_is_returned_without_refresh() {
        let temp_dir = TempDir::new().unwrap();
        let config = OAuthConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            token_endpoint: "http://localhost:1/never-called".to_string(),
            token_cache: temp_dir.path().join("token.json"),
        };
        let source = OAuthTokenSource::new("me@example.com", config);
        source.storage.save_token(&create_test_token()).unwrap();

        let token = source.bearer_token("me@example.com").await.unwrap();

        assert_eq!(token, "test_access_token");
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = OAuthConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            token_endpoint: "http://localhost:1/never-called".to_string(),
            token_cache: temp_dir.path().join("token.json"),
        };
        let source = OAuthTokenSource::new("me@example.com", config);

        let result = source.bearer_token("other@example.com").await;

        assert!(matches!(result, Err(AuthError::NoCredentials(_))));
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = OAuthConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            token_endpoint: "http://localhost:1/never-called".to_string(),
            token_cache: temp_dir.path().join("token.json"),
        };
        let source = OAuthTokenSource::new("me@example.com", config);
        let mut token = create_expired_token();
        token.refresh_token = None;
        source.storage.save_token(&token).unwrap();

        let result = source.bearer_token("me@example.com").await;

        assert!(matches!(result, Err(AuthError::NoRefreshToken)));
    }
}
