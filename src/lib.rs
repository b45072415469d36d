//! ShareHub Rust Client
//!
//! A Rust client library for the ShareHub account-sharing API, with bearer
//! authentication, single-flight token refresh, and proactive renewal before expiry.

pub mod api;
pub mod auth_client;
pub mod chat;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod mirror;
pub mod refresher;
pub mod scheduler;
pub mod session;
pub mod types;

pub use api::{Account, BetaStatus, KiroAccount, KiroAccountBalance, KiroBalance, KiroUsage, LogoutResponse, OAuthInitiate};
pub use auth_client::{RequestOptions, SessionClient};
pub use chat::{ChatCompletionRequest, ChatMessage, ChatStream, ContentPart, ImageUrl, MessageContent};
pub use config::{ClientConfig, RenewalConfig};
pub use credential_store::{CredentialBackend, CredentialStore, FileBackend, MemoryBackend};
pub use error::{ClientError, Result};
pub use mirror::{CookieMirror, CredentialMirror};
pub use refresher::{HttpTokenRefresher, RefreshTokenSource, RefreshTokenSources, TokenRefresher};
pub use scheduler::{RenewalHandle, RenewalScheduler};
pub use session::{Outcome, RefreshGate};
pub use types::{CredentialRecord, LoginResponse, TokenPair, UserProfile};
