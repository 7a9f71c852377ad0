//! Account model and the persistence seam
//!
//! Persistent account storage is an external collaborator; this module owns
//! the record shape and the `AccountStore` trait, plus an in-memory
//! implementation for tests and single-node deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod store;

pub use store::{AccountStore, MemoryAccountStore, StoreError};

use crate::auth::oauth::providers::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Local,
    OAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Unverified,
    Suspended,
}

/// Credential block for password accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCredentials {
    pub password_hash: String,
    #[serde(default)]
    pub failed_login_attempts: u32,
    #[serde(default)]
    pub lockout_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub two_factor_enabled: bool,
    #[serde(default)]
    pub two_factor_secret: Option<String>,
    /// SHA-256 hex digests; plaintext codes are shown once at enrollment.
    #[serde(default)]
    pub backup_code_hashes: Vec<String>,
}

impl LocalCredentials {
    pub fn new(password_hash: String) -> Self {
        Self {
            password_hash,
            failed_login_attempts: 0,
            lockout_until: None,
            two_factor_enabled: false,
            two_factor_secret: None,
            backup_code_hashes: Vec::new(),
        }
    }
}

/// Identity block for provider-backed accounts. `granted_scopes` is an
/// additive history of non-baseline scopes the user has ever consented to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthIdentity {
    pub provider: Provider,
    pub provider_user_id: String,
    #[serde(default)]
    pub granted_scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "account_kind")]
pub enum AccountKind {
    Local(LocalCredentials),
    OAuth(OAuthIdentity),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Stored lowercase; lookups normalize before comparing.
    pub email: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub image_url: Option<String>,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    /// Bumped by the store on every successful save; saves carrying a stale
    /// version are rejected.
    pub version: u64,
    pub kind: AccountKind,
}

impl Account {
    pub fn new_local(email: &str, username: Option<String>, password_hash: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.to_lowercase(),
            username,
            display_name: None,
            image_url: None,
            status: AccountStatus::Unverified,
            created_at: Utc::now(),
            version: 0,
            kind: AccountKind::Local(LocalCredentials::new(password_hash)),
        }
    }

    pub fn new_oauth(
        email: &str,
        display_name: Option<String>,
        image_url: Option<String>,
        identity: OAuthIdentity,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.to_lowercase(),
            username: None,
            display_name,
            image_url,
            // Provider accounts arrive with a verified email
            status: AccountStatus::Active,
            created_at: Utc::now(),
            version: 0,
            kind: AccountKind::OAuth(identity),
        }
    }

    pub fn account_type(&self) -> AccountType {
        match &self.kind {
            AccountKind::Local(_) => AccountType::Local,
            AccountKind::OAuth(_) => AccountType::OAuth,
        }
    }
}
