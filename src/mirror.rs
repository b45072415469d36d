//! Best-effort companion copies of the credential record
//!
//! A mirror makes the current tokens visible outside the primary store, e.g. as
//! cookies the backend can read. Mirror failures are never fatal.

use crate::error::{ClientError, Result};
use crate::types::{CredentialRecord, UserProfile};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use std::sync::Arc;
use tracing::debug;
use url::form_urlencoded;

const ACCESS_COOKIE: &str = "access_token";
const REFRESH_COOKIE: &str = "refresh_token";
const USER_COOKIE: &str = "user";
const ACCESS_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;
const REFRESH_MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;

/// Companion artifact kept in sync with the credential store
pub trait CredentialMirror: Send + Sync {
    fn publish(&self, record: &CredentialRecord) -> Result<()>;

    /// Invalidate the mirrored copy; must be safe to call when nothing is mirrored
    fn revoke(&self) -> Result<()>;
}

/// Mirrors tokens into a cookie jar shared with the HTTP client
///
/// Every request the client sends to the API origin carries the mirrored cookies.
#[derive(Clone)]
pub struct CookieMirror {
    jar: Arc<Jar>,
    origin: Url,
}

impl CookieMirror {
    pub fn new(origin: Url) -> Self {
        Self {
            jar: Arc::new(Jar::default()),
            origin,
        }
    }

    /// Jar to install on the `reqwest::Client` via `cookie_provider`
    pub fn jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar)
    }

    /// Read a single cookie value for the API origin
    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.origin)?;
        let header = header.to_str().ok()?;

        header.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name && !value.is_empty()).then(|| value.to_string())
        })
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.cookie(REFRESH_COOKIE)
    }

    pub fn access_token(&self) -> Option<String> {
        self.cookie(ACCESS_COOKIE)
    }

    /// Profile from the `user` cookie (URL-encoded JSON)
    pub fn user(&self) -> Option<UserProfile> {
        let raw = self.cookie(USER_COOKIE)?;
        let (json, _) = form_urlencoded::parse(raw.as_bytes()).next()?;
        match serde_json::from_str(&json) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable user cookie");
                None
            }
        }
    }

    fn set(&self, name: &str, value: &str, max_age_secs: u64) -> Result<()> {
        if value.contains(';') || value.contains(char::is_whitespace) {
            return Err(ClientError::InvalidResponse(format!(
                "{name} is not representable as a cookie value"
            )));
        }
        self.jar
            .add_cookie_str(&format!("{name}={value}; Path=/; Max-Age={max_age_secs}"), &self.origin);
        Ok(())
    }

    fn expire(&self, name: &str) {
        self.jar.add_cookie_str(
            &format!("{name}=; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT"),
            &self.origin,
        );
    }
}

impl CredentialMirror for CookieMirror {
    fn publish(&self, record: &CredentialRecord) -> Result<()> {
        self.set(ACCESS_COOKIE, &record.access_token, ACCESS_MAX_AGE_SECS)?;
        self.set(REFRESH_COOKIE, &record.refresh_token, REFRESH_MAX_AGE_SECS)?;

        match &record.user {
            Some(user) => {
                let json = serde_json::to_string(user)?;
                let encoded: String = form_urlencoded::byte_serialize(json.as_bytes()).collect();
                self.set(USER_COOKIE, &encoded, ACCESS_MAX_AGE_SECS)
            }
            None => {
                self.expire(USER_COOKIE);
                Ok(())
            }
        }
    }

    fn revoke(&self) -> Result<()> {
        self.expire(ACCESS_COOKIE);
        self.expire(REFRESH_COOKIE);
        self.expire(USER_COOKIE);
        Ok(())
    }
}
