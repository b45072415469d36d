//! Typed wrappers for the dashboard's REST endpoints

use crate::auth_client::{RequestOptions, SessionClient};
use crate::error::Result;
use crate::refresher::TokenRefresher;
use crate::types::{CredentialRecord, LoginResponse, UserProfile};
use chrono::Utc;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// `{success, data}` wrapper used by the plugin API
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    #[allow(dead_code)]
    success: bool,
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogoutResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BetaStatus {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub beta: i32,
}

/// Shared-pool account managed through the plugin API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub cookie_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// 0 = disabled, 1 = enabled
    pub status: i32,
    /// 0 = dedicated, 1 = shared
    pub is_shared: i32,
    #[serde(default)]
    pub need_refresh: Option<bool>,
    #[serde(default)]
    pub project_id_0: Option<String>,
    #[serde(default)]
    pub is_restricted: Option<bool>,
    #[serde(default)]
    pub paid_tier: Option<bool>,
    #[serde(default)]
    pub ineligible: Option<bool>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_used_at: Option<String>,
    #[serde(default)]
    pub quotas: Option<Value>,
}

/// Provider redirect for starting an OAuth login
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthInitiate {
    pub authorization_url: String,
    pub state: String,
}

/// Kiro account bound to the user
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KiroAccount {
    pub account_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub provider: String,
    /// 0 = dedicated, 1 = shared
    pub is_shared: i32,
    /// 0 = disabled, 1 = enabled
    pub status: i32,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KiroBalance {
    pub available: f64,
    pub total_limit: f64,
    pub current_usage: f64,
    pub is_trial: bool,
    pub reset_date: String,
    #[serde(default)]
    pub free_trial_expiry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KiroUsage {
    pub usage_limit: f64,
    pub free_trial_limit: f64,
    pub current_usage: f64,
    pub free_trial_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KiroAccountBalance {
    pub account_id: String,
    pub account_name: String,
    pub email: String,
    pub subscription: String,
    pub balance: KiroBalance,
    pub raw_data: KiroUsage,
}

fn account_path(cookie_id: &str) -> String {
    format!("/api/plugin-api/accounts/{cookie_id}")
}

fn kiro_account_path(account_id: i64) -> String {
    format!("/api/kiro/accounts/{account_id}")
}

impl<R: TokenRefresher> SessionClient<R> {
    /// Username/password login; starts a session on success
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let login: LoginResponse = self
            .execute_public(
                "/api/auth/login",
                RequestOptions::post(json!({ "username": username, "password": password })),
            )
            .await?;

        self.save_login(&login)?;
        Ok(login)
    }

    /// Start the SSO flow; send the user to the returned `authorization_url`
    pub async fn initiate_sso_login(&self) -> Result<OAuthInitiate> {
        self.execute_public("/api/auth/sso/initiate", RequestOptions::get()).await
    }

    /// Start the GitHub OAuth flow
    pub async fn initiate_github_login(&self) -> Result<OAuthInitiate> {
        self.execute_public("/api/auth/github/login", RequestOptions::get()).await
    }

    /// Complete the SSO flow with the provider's `code` and `state`
    pub async fn sso_callback(&self, code: &str, state: &str) -> Result<LoginResponse> {
        let login: LoginResponse = self
            .execute_public(
                "/api/auth/sso/callback",
                RequestOptions::get().with_query("code", code).with_query("state", state),
            )
            .await?;

        self.save_login(&login)?;
        Ok(login)
    }

    /// Complete the GitHub OAuth flow
    pub async fn github_callback(&self, code: &str, state: &str) -> Result<LoginResponse> {
        let login: LoginResponse = self
            .execute_public(
                "/api/auth/github/callback",
                RequestOptions::post(json!({ "code": code, "state": state })),
            )
            .await?;

        self.save_login(&login)?;
        Ok(login)
    }

    fn save_login(&self, login: &LoginResponse) -> Result<()> {
        let record = CredentialRecord::issue(login.tokens.clone(), Some(login.user.clone()), Utc::now());
        self.start_session(record)?;
        info!(user = %login.user.username, "Logged in");
        Ok(())
    }

    /// Revoke the session server-side; local credentials are cleared regardless
    pub async fn logout(&self) -> Result<LogoutResponse> {
        let mut options = RequestOptions::post(json!({ "refresh_token": self.stored_refresh_token() }));
        if let Some(token) = self.stored_token() {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                options = options.with_header(AUTHORIZATION, value);
            }
        }

        let result = self.execute_public("/api/auth/logout", options).await;

        if let Err(e) = self.end_session() {
            warn!(error = %e, "Failed to clear credentials on logout");
        }
        result
    }

    pub async fn current_user(&self) -> Result<UserProfile> {
        self.execute("/api/auth/me", RequestOptions::get()).await
    }

    pub async fn join_beta(&self) -> Result<BetaStatus> {
        self.execute("/api/auth/join-beta", RequestOptions::new(reqwest::Method::POST))
            .await
    }

    pub async fn beta_status(&self) -> Result<BetaStatus> {
        self.execute("/api/auth/beta-status", RequestOptions::get()).await
    }

    /// Check whether a username (email) is registered; errors count as "no"
    pub async fn username_exists(&self, username: &str) -> bool {
        #[derive(Deserialize)]
        struct Exists {
            #[serde(default)]
            exists: bool,
        }

        match self
            .execute_public::<Exists>(
                "/api/auth/check-username",
                RequestOptions::get().with_query("username", username),
            )
            .await
        {
            Ok(found) => found.exists,
            Err(e) => {
                warn!(error = %e, "Username check failed");
                false
            }
        }
    }

    pub async fn accounts(&self) -> Result<Vec<Account>> {
        let envelope: Envelope<Vec<Account>> = self
            .execute("/api/plugin-api/accounts", RequestOptions::get())
            .await?;
        Ok(envelope.data)
    }

    pub async fn account(&self, cookie_id: &str) -> Result<Account> {
        let envelope: Envelope<Account> = self.execute(&account_path(cookie_id), RequestOptions::get()).await?;
        Ok(envelope.data)
    }

    pub async fn delete_account(&self, cookie_id: &str) -> Result<Value> {
        let envelope: Envelope<Value> = self
            .execute(&account_path(cookie_id), RequestOptions::delete())
            .await?;
        Ok(envelope.data)
    }

    /// Enable (1) or disable (0) an account
    pub async fn update_account_status(&self, cookie_id: &str, status: i32) -> Result<Value> {
        let envelope: Envelope<Value> = self
            .execute(
                &format!("{}/status", account_path(cookie_id)),
                RequestOptions::put(json!({ "status": status })),
            )
            .await?;
        Ok(envelope.data)
    }

    pub async fn update_account_name(&self, cookie_id: &str, name: &str) -> Result<Value> {
        let envelope: Envelope<Value> = self
            .execute(
                &format!("{}/name", account_path(cookie_id)),
                RequestOptions::put(json!({ "name": name })),
            )
            .await?;
        Ok(envelope.data)
    }

    /// Per-model quota details of an account; the shape is server-defined
    pub async fn account_quotas(&self, cookie_id: &str) -> Result<Value> {
        let envelope: Envelope<Value> = self
            .execute(&format!("{}/quotas", account_path(cookie_id)), RequestOptions::get())
            .await?;
        Ok(envelope.data)
    }

    /// Enable (1) or disable (0) one model's quota on an account
    pub async fn update_quota_status(&self, cookie_id: &str, model_name: &str, status: i32) -> Result<Value> {
        let envelope: Envelope<Value> = self
            .execute(
                &format!("{}/quotas/{model_name}/status", account_path(cookie_id)),
                RequestOptions::put(json!({ "status": status })),
            )
            .await?;
        Ok(envelope.data)
    }

    pub async fn kiro_accounts(&self) -> Result<Vec<KiroAccount>> {
        let envelope: Envelope<Vec<KiroAccount>> = self
            .execute("/api/kiro/accounts", RequestOptions::get())
            .await?;
        Ok(envelope.data)
    }

    pub async fn kiro_account(&self, account_id: i64) -> Result<KiroAccount> {
        let envelope: Envelope<KiroAccount> = self
            .execute(&kiro_account_path(account_id), RequestOptions::get())
            .await?;
        Ok(envelope.data)
    }

    pub async fn delete_kiro_account(&self, account_id: i64) -> Result<Value> {
        let envelope: Envelope<Value> = self
            .execute(&kiro_account_path(account_id), RequestOptions::delete())
            .await?;
        Ok(envelope.data)
    }

    pub async fn update_kiro_account_status(&self, account_id: i64, status: i32) -> Result<Value> {
        let envelope: Envelope<Value> = self
            .execute(
                &format!("{}/status", kiro_account_path(account_id)),
                RequestOptions::put(json!({ "status": status })),
            )
            .await?;
        Ok(envelope.data)
    }

    pub async fn update_kiro_account_name(&self, account_id: i64, account_name: &str) -> Result<Value> {
        let envelope: Envelope<Value> = self
            .execute(
                &format!("{}/name", kiro_account_path(account_id)),
                RequestOptions::put(json!({ "account_name": account_name })),
            )
            .await?;
        Ok(envelope.data)
    }

    pub async fn kiro_account_balance(&self, account_id: i64) -> Result<KiroAccountBalance> {
        let envelope: Envelope<KiroAccountBalance> = self
            .execute(&format!("{}/balance", kiro_account_path(account_id)), RequestOptions::get())
            .await?;
        Ok(envelope.data)
    }

    pub async fn health_check(&self) -> Result<serde_json::Map<String, Value>> {
        self.execute_public("/api/health", RequestOptions::get()).await
    }
}
