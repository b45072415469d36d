//! Token refresh: exchanges a refresh token for a new token pair

use crate::credential_store::CredentialStore;
use crate::error::{error_message, ClientError, Result};
use crate::mirror::CookieMirror;
use crate::types::{RefreshRequest, TokenPair};
use reqwest::{Client, Url};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Performs one refresh call
///
/// Implementations never retry and never write the credential store; the caller
/// decides what to do with the result.
pub trait TokenRefresher: Send + Sync + 'static {
    fn refresh(&self) -> impl Future<Output = Result<TokenPair>> + Send;
}

/// A place a refresh token may be read from
pub trait RefreshTokenSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn refresh_token(&self) -> Option<String>;
}

impl RefreshTokenSource for CredentialStore {
    fn name(&self) -> &'static str {
        "credential_store"
    }

    fn refresh_token(&self) -> Option<String> {
        CredentialStore::refresh_token(self)
    }
}

impl RefreshTokenSource for CookieMirror {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn refresh_token(&self) -> Option<String> {
        CookieMirror::refresh_token(self)
    }
}

/// Refresh-token sources tried in a fixed priority order
#[derive(Clone, Default)]
pub struct RefreshTokenSources {
    sources: Vec<Arc<dyn RefreshTokenSource>>,
}

impl RefreshTokenSources {
    pub fn new(sources: Vec<Arc<dyn RefreshTokenSource>>) -> Self {
        Self { sources }
    }

    /// First non-empty refresh token, in priority order
    pub fn resolve(&self) -> Option<String> {
        self.sources.iter().find_map(|source| {
            let token = source.refresh_token().filter(|t| !t.is_empty())?;
            debug!(source = source.name(), "Resolved refresh token");
            Some(token)
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Refreshes tokens against the backend's refresh endpoint
pub struct HttpTokenRefresher {
    http_client: Client,
    refresh_url: Url,
    sources: RefreshTokenSources,
}

impl HttpTokenRefresher {
    pub fn new(http_client: Client, refresh_url: Url, sources: RefreshTokenSources) -> Self {
        Self {
            http_client,
            refresh_url,
            sources,
        }
    }

    pub fn sources(&self) -> &RefreshTokenSources {
        &self.sources
    }
}

impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self) -> Result<TokenPair> {
        let refresh_token = self
            .sources
            .resolve()
            .ok_or_else(|| ClientError::Refresh("No refresh token available".to_string()))?;

        let response = self
            .http_client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(|e| ClientError::Refresh(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Refresh(e.to_string()))?;

        if !status.is_success() {
            let message = error_message(status, &body);
            warn!(status = %status, error = %message, "Token refresh rejected");
            return Err(ClientError::Refresh(format!("status {status}: {message}")));
        }

        let tokens: TokenPair = serde_json::from_slice(&body)
            .map_err(|e| ClientError::Refresh(format!("Malformed refresh response: {e}")))?;

        info!(expires_in = tokens.expires_in, "Token refreshed");
        Ok(tokens)
    }
}
