//! Type definitions for credentials and the auth wire format

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Token pair returned by `/auth/refresh`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime of the access token in seconds, relative to receipt
    pub expires_in: i64,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Login and OAuth-callback response: a token pair plus the user's profile
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: UserProfile,
}

/// Cached profile snapshot of the logged-in user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub trust_level: i32,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_silenced: bool,
    /// 0 = not enrolled, 1 = enrolled in the beta program
    #[serde(default)]
    pub beta: i32,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_login_at: Option<String>,
}

/// Persisted identity state
///
/// Always replaced as a whole. Build one with [`CredentialRecord::issue`] so that
/// `expires_at` is derived from the server-reported lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

impl CredentialRecord {
    /// Build a record from a freshly received token pair
    pub fn issue(tokens: TokenPair, user: Option<UserProfile>, now: DateTime<Utc>) -> Self {
        let lifetime = Duration::try_seconds(tokens.expires_in.max(0)).unwrap_or(Duration::MAX);
        Self {
            expires_at: now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            user,
        }
    }

    /// Time left until the access token expires (negative once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Check whether the token expires within `threshold` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.checked_add_signed(threshold)
            .map_or(true, |deadline| deadline >= self.expires_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}
