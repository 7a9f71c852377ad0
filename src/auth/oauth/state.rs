//! Ephemeral state carried across OAuth redirects
//!
//! Each artifact kind lives in its own store namespace and is redeemed
//! exactly once via `take`. Every record also carries its own `expires_at`
//! so consumers can reject an entry the store has not evicted yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::EphemeralObject;

use super::providers::{Provider, ProviderIdentity};

pub const OAUTH_FLOW_TTL: Duration = Duration::from_secs(600);
pub const PENDING_TTL: Duration = Duration::from_secs(600);
pub const PERMISSION_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
    SignUp,
    SignIn,
    Permission,
}

/// CSRF state minted at flow start and redeemed at the provider callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthFlowState {
    pub provider: Provider,
    pub auth_type: AuthType,
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthFlowState {
    pub fn new(provider: Provider, auth_type: AuthType, redirect_url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            provider,
            auth_type,
            redirect_url,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(OAUTH_FLOW_TTL).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

impl EphemeralObject for OAuthFlowState {
    fn store_prefix() -> &'static str {
        "oauth_flow"
    }

    fn default_ttl() -> Duration {
        OAUTH_FLOW_TTL
    }
}

/// Verified provider identity parked between the callback and the explicit
/// signup confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpPendingState {
    pub provider: Provider,
    pub identity: ProviderIdentity,
    pub redirect_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl SignUpPendingState {
    pub fn new(provider: Provider, identity: ProviderIdentity, redirect_url: Option<String>) -> Self {
        Self {
            provider,
            identity,
            redirect_url,
            expires_at: Utc::now() + chrono::Duration::from_std(PENDING_TTL).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

impl EphemeralObject for SignUpPendingState {
    fn store_prefix() -> &'static str {
        "signup_pending"
    }

    fn default_ttl() -> Duration {
        PENDING_TTL
    }
}

/// Same shape as signup, parked between the callback and the signin
/// completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInPendingState {
    pub provider: Provider,
    pub identity: ProviderIdentity,
    pub redirect_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl SignInPendingState {
    pub fn new(provider: Provider, identity: ProviderIdentity, redirect_url: Option<String>) -> Self {
        Self {
            provider,
            identity,
            redirect_url,
            expires_at: Utc::now() + chrono::Duration::from_std(PENDING_TTL).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

impl EphemeralObject for SignInPendingState {
    fn store_prefix() -> &'static str {
        "signin_pending"
    }

    fn default_ttl() -> Duration {
        PENDING_TTL
    }
}

/// Re-consent sub-flow state. Carries the resolved account id so the
/// permission callback binds new grants to the right account without
/// re-deriving it from the provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionState {
    pub provider: Provider,
    pub account_id: String,
    pub service: String,
    pub scope_level: String,
    /// Scope strings resolved at flow start, requested at the provider.
    pub scopes: Vec<String>,
    pub redirect_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl PermissionState {
    pub fn new(
        provider: Provider,
        account_id: String,
        service: String,
        scope_level: String,
        scopes: Vec<String>,
        redirect_url: Option<String>,
    ) -> Self {
        Self {
            provider,
            account_id,
            service,
            scope_level,
            scopes,
            redirect_url,
            expires_at: Utc::now()
                + chrono::Duration::from_std(PERMISSION_TTL).unwrap_or_default(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

impl EphemeralObject for PermissionState {
    fn store_prefix() -> &'static str {
        "permission"
    }

    fn default_ttl() -> Duration {
        PERMISSION_TTL
    }
}
