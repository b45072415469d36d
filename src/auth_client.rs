//! Authenticated API client with single-flight token refresh

use crate::config::ClientConfig;
use crate::credential_store::{CredentialBackend, CredentialStore, MemoryBackend};
use crate::error::{ClientError, Result};
use crate::mirror::{CookieMirror, CredentialMirror};
use crate::refresher::{HttpTokenRefresher, RefreshTokenSource, RefreshTokenSources, TokenRefresher};
use crate::session::{Admission, LeaderGuard, Outcome, RefreshGate};
use crate::types::{CredentialRecord, UserProfile};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Method, query, body and extra headers for one API call
///
/// The body is kept as a JSON value so the request can be rebuilt for a replay.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: HeaderMap,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn post(body: Value) -> Self {
        Self::new(Method::POST).with_body(body)
    }

    pub fn put(body: Value) -> Self {
        Self::new(Method::PUT).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Parse a response: JSON on success, flattened `detail` on failure
///
/// An empty success body parses as JSON `null`, so `()` and `Option<T>` work.
pub(crate) async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await?;

    if !status.is_success() {
        return Err(ClientError::from_error_body(status, &body));
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_slice(&body)?)
}

/// API client that manages the session's tokens
///
/// Attaches the stored bearer token to every call. On 401/403 it refreshes the
/// token through a single-flight gate and replays the call once.
pub struct SessionClient<R: TokenRefresher = HttpTokenRefresher> {
    config: ClientConfig,
    http_client: Client,
    store: CredentialStore,
    refresher: R,
    refresh_sources: RefreshTokenSources,
    /// Single-flight gate shared by every refresh this client performs
    gate: RefreshGate,
}

impl SessionClient<HttpTokenRefresher> {
    /// Create a client holding its credentials in memory
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        Self::with_backend(config, Arc::new(MemoryBackend::new()))
    }

    /// Create a client persisting credentials through `backend`
    ///
    /// Tokens are mirrored into the HTTP client's cookie jar. Refresh tokens are
    /// looked up in the store first, then in the cookie jar.
    pub fn with_backend(config: ClientConfig, backend: Arc<dyn CredentialBackend>) -> Result<Arc<Self>> {
        config.validate()?;

        let origin = config.resolve("/")?;
        let cookies = CookieMirror::new(origin);
        let http_client = Client::builder()
            .cookie_provider(cookies.jar())
            .timeout(config.request_timeout)
            .build()?;

        let store = CredentialStore::new(backend)
            .with_mirrors(vec![Arc::new(cookies.clone()) as Arc<dyn CredentialMirror>]);
        let refresh_sources = RefreshTokenSources::new(vec![
            Arc::new(store.clone()) as Arc<dyn RefreshTokenSource>,
            Arc::new(cookies),
        ]);
        let refresher = HttpTokenRefresher::new(http_client.clone(), config.refresh_url()?, refresh_sources.clone());

        Ok(Arc::new(Self {
            config,
            http_client,
            store,
            refresher,
            refresh_sources,
            gate: RefreshGate::new(),
        }))
    }
}

impl<R: TokenRefresher> SessionClient<R> {
    /// Create a client around a custom refresher
    pub fn with_refresher(config: ClientConfig, store: CredentialStore, refresher: R) -> Result<Arc<Self>> {
        config.validate()?;

        let http_client = Client::builder().timeout(config.request_timeout).build()?;
        let refresh_sources = RefreshTokenSources::new(vec![Arc::new(store.clone()) as Arc<dyn RefreshTokenSource>]);

        Ok(Arc::new(Self {
            config,
            http_client,
            store,
            refresher,
            refresh_sources,
            gate: RefreshGate::new(),
        }))
    }

    /// Perform an authenticated call and parse its JSON response
    ///
    /// `resource` is a path joined to the base URL, or an absolute URL.
    pub async fn execute<T: DeserializeOwned>(&self, resource: &str, options: RequestOptions) -> Result<T> {
        let response = self.send_authorized(resource, &options).await?;
        parse_response(response).await
    }

    /// Perform an authenticated call and return the final response unparsed
    ///
    /// On 401/403 the token is refreshed and the call replayed exactly once; the
    /// replay's response is returned whatever its status.
    pub async fn send_authorized(&self, resource: &str, options: &RequestOptions) -> Result<Response> {
        let url = self.config.resolve(resource)?;
        let token = self.store.access_token();

        let response = self.build_request(&url, options, token.as_deref()).send().await?;
        if !is_auth_failure(response.status()) {
            return Ok(response);
        }

        debug!(
            status = %response.status(),
            url = %url,
            "Authorization failed, refreshing token"
        );

        let fresh_token = self.refresh_access_token(token.as_deref()).await?;
        let retry = self.build_request(&url, options, Some(&fresh_token)).send().await?;
        Ok(retry)
    }

    /// Perform an unauthenticated call and parse its JSON response
    pub async fn execute_public<T: DeserializeOwned>(&self, resource: &str, options: RequestOptions) -> Result<T> {
        let url = self.config.resolve(resource)?;
        let response = self.build_request(&url, &options, None).send().await?;
        parse_response(response).await
    }

    fn build_request(&self, url: &Url, options: &RequestOptions, token: Option<&str>) -> RequestBuilder {
        let mut headers = options.headers.clone();
        if token.is_some() {
            headers.remove(AUTHORIZATION);
        }

        let mut request = self
            .http_client
            .request(options.method.clone(), url.clone())
            .headers(headers);

        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Obtain a fresh access token through the single-flight gate
    ///
    /// `rejected` is the token the server just refused. If the store already holds
    /// a different token, another caller refreshed in the meantime and that token is
    /// used without a network call. A waiter whose leader was cancelled re-enters
    /// the gate and may lead the next round itself.
    async fn refresh_access_token(&self, rejected: Option<&str>) -> Result<String> {
        loop {
            let guard = match self.gate.admit() {
                Admission::Leader(guard) => guard,
                Admission::Waiter(rx) => match rx.await {
                    Ok(Outcome::Refreshed(token)) => return Ok(token),
                    Ok(Outcome::Expired) => return Err(ClientError::SessionExpired),
                    Ok(Outcome::Failed(reason)) => return Err(ClientError::Persist(reason)),
                    Ok(Outcome::Abandoned) | Err(_) => {
                        debug!("Refresh leader went away, re-entering gate");
                        continue;
                    }
                },
            };

            return self.lead_refresh(guard, rejected).await;
        }
    }

    async fn lead_refresh(&self, guard: LeaderGuard<'_>, rejected: Option<&str>) -> Result<String> {
        if let Some(current) = self.store.access_token() {
            if rejected != Some(current.as_str()) {
                debug!("Token already rotated, replaying with stored token");
                guard.succeed(&current);
                return Ok(current);
            }
        }

        match self.refresher.refresh().await {
            Ok(tokens) => {
                let record = CredentialRecord::issue(tokens, self.store.user(), Utc::now());
                let access_token = record.access_token.clone();

                match guard.commit(|| self.store.save(record)) {
                    None => {
                        debug!("Session ended during refresh, discarding new tokens");
                        Err(ClientError::SessionExpired)
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Failed to persist refreshed credentials");
                        guard.fail(e.to_string());
                        Err(e)
                    }
                    Some(Ok(())) => {
                        let woken = guard.succeed(&access_token);
                        info!(waiters = woken, "Session refreshed");
                        Ok(access_token)
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, ending session");
                if guard.is_current() {
                    if let Err(clear_err) = self.store.clear() {
                        warn!(error = %clear_err, "Failed to clear credentials");
                    }
                }
                let expired = guard.expire();
                debug!(waiters = expired, "Expired queued requests");
                Err(ClientError::SessionExpired)
            }
        }
    }

    /// Refresh the stored session through the shared gate
    ///
    /// Joins an in-flight refresh if there is one.
    pub async fn refresh_session(&self) -> Result<String> {
        let current = self.store.access_token();
        self.refresh_access_token(current.as_deref()).await
    }

    /// Refresh the stored session without consulting the gate
    ///
    /// May overlap a request-driven refresh; whichever pair is persisted last wins.
    /// On failure the credentials are cleared and the refresh error returned.
    pub async fn refresh_session_ungated(&self) -> Result<String> {
        match self.refresher.refresh().await {
            Ok(tokens) => {
                let record = CredentialRecord::issue(tokens, self.store.user(), Utc::now());
                let access_token = record.access_token.clone();
                self.store.save(record)?;
                Ok(access_token)
            }
            Err(e) => {
                if let Err(clear_err) = self.store.clear() {
                    warn!(error = %clear_err, "Failed to clear credentials");
                }
                Err(e)
            }
        }
    }

    /// Persist credentials obtained from a login or OAuth callback
    pub fn start_session(&self, record: CredentialRecord) -> Result<()> {
        self.store.save(record)
    }

    /// Drop the session: clear credentials and reject any queued requests
    pub fn end_session(&self) -> Result<()> {
        self.gate.reset();
        self.store.clear()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    pub fn stored_user(&self) -> Option<UserProfile> {
        self.store.user()
    }

    pub fn stored_token(&self) -> Option<String> {
        self.store.access_token()
    }

    /// Refresh token from the first source that has one
    pub fn stored_refresh_token(&self) -> Option<String> {
        self.refresh_sources.resolve()
    }

    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.store.expires_at()
    }

    /// Check whether the stored token expires within `threshold`
    ///
    /// Returns true when no expiry is known.
    pub fn is_token_expiring_soon(&self, threshold: Duration) -> bool {
        let Some(record) = self.store.get() else {
            return true;
        };
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => record.expires_within(Utc::now(), threshold),
            Err(_) => true,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Get the credential store (for advanced usage)
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn gate(&self) -> &RefreshGate {
        &self.gate
    }
}
