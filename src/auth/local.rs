//! Local credential authentication
//!
//! Identifier resolution, Argon2id password verification, failed-attempt
//! lockout, and the single-use password-reset and email-verification tokens.
//! Unknown identifier and wrong password produce the same generic failure;
//! nothing here confirms whether an email is registered.

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::account::{Account, AccountKind, AccountStatus, AccountStore, LocalCredentials, StoreError};
use crate::cache::{CacheManager, EphemeralObject};
use crate::config::LocalAuthConfig;
use crate::error::AppError;

use super::two_factor::TwoFactorService;

const MAX_SAVE_RETRIES: usize = 3;

pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Password hashing failed: {e}")))
}

pub fn verify_password(password: &str, password_hash: &str) -> Result<bool, AppError> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|e| AppError::Internal(format!("Stored password hash is invalid: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Outbound mail is an external collaborator.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_password_reset(&self, email: &str, token: &str) -> Result<(), AppError>;
    async fn send_email_verification(&self, email: &str, token: &str) -> Result<(), AppError>;
}

/// Default mailer that only logs; deployments plug in a real transport.
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send_password_reset(&self, email: &str, _token: &str) -> Result<(), AppError> {
        tracing::info!(email, "password reset email requested");
        Ok(())
    }

    async fn send_email_verification(&self, email: &str, _token: &str) -> Result<(), AppError> {
        tracing::info!(email, "verification email requested");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordResetToken {
    pub account_id: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl EphemeralObject for PasswordResetToken {
    fn store_prefix() -> &'static str {
        "password_reset"
    }

    fn default_ttl() -> Duration {
        Duration::from_secs(3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailVerificationToken {
    pub account_id: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl EphemeralObject for EmailVerificationToken {
    fn store_prefix() -> &'static str {
        "email_verification"
    }

    fn default_ttl() -> Duration {
        Duration::from_secs(86400)
    }
}

#[derive(Debug)]
pub enum LocalAuthOutcome {
    Authenticated(Account),
    /// Credentials were correct but the account requires a second factor;
    /// no session exists until it is presented.
    TwoFactorRequired { temp_token: String },
}

pub struct LocalAuthenticator {
    accounts: Arc<dyn AccountStore>,
    cache: Arc<CacheManager>,
    two_factor: Arc<TwoFactorService>,
    mailer: Arc<dyn Mailer>,
    settings: LocalAuthConfig,
}

impl LocalAuthenticator {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        cache: Arc<CacheManager>,
        two_factor: Arc<TwoFactorService>,
        mailer: Arc<dyn Mailer>,
        settings: LocalAuthConfig,
    ) -> Self {
        Self {
            accounts,
            cache,
            two_factor,
            mailer,
            settings,
        }
    }

    pub async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<LocalAuthOutcome, AppError> {
        let account = self
            .accounts
            .find_by_identifier(identifier)
            .await?
            .ok_or_else(|| AppError::AuthFailed("unknown identifier".to_string()))?;
        let AccountKind::Local(creds) = &account.kind else {
            // Provider accounts have no password; indistinguishable from a
            // wrong one
            return Err(AppError::AuthFailed(
                "password login against a provider account".to_string(),
            ));
        };

        match account.status {
            AccountStatus::Suspended => return Err(AppError::AccountSuspended),
            AccountStatus::Unverified => return Err(AppError::AccountUnverified),
            AccountStatus::Active => {}
        }

        if let Some(until) = creds.lockout_until {
            if until > Utc::now() {
                return Err(AppError::AccountLocked);
            }
        }

        if !verify_password(password, &creds.password_hash)? {
            let attempts = self.record_failed_attempt(&account.id).await?;
            tracing::warn!(account_id = %account.id, attempts, "failed password attempt");
            return Err(AppError::AuthFailed("password mismatch".to_string()));
        }

        let account = self.reset_attempt_counter(account).await?;

        let AccountKind::Local(creds) = &account.kind else {
            return Err(AppError::Internal("account kind changed mid-login".to_string()));
        };
        if creds.two_factor_enabled {
            let temp_token = self.two_factor.issue_temp_token(&account).await?;
            return Ok(LocalAuthOutcome::TwoFactorRequired { temp_token });
        }

        Ok(LocalAuthOutcome::Authenticated(account))
    }

    /// Bump the failure counter under the store's version CAS. Re-reads and
    /// retries on conflict so concurrent failures cannot blow past the
    /// threshold unnoticed.
    async fn record_failed_attempt(&self, account_id: &str) -> Result<u32, AppError> {
        for _ in 0..MAX_SAVE_RETRIES {
            let Some(mut account) = self.accounts.find_by_id(account_id).await? else {
                return Err(AppError::AuthFailed("account vanished".to_string()));
            };
            let AccountKind::Local(creds) = &mut account.kind else {
                return Err(AppError::AuthFailed("not a password account".to_string()));
            };

            creds.failed_login_attempts += 1;
            let attempts = creds.failed_login_attempts;
            if attempts >= self.settings.max_failed_attempts {
                creds.lockout_until =
                    Some(Utc::now() + chrono::Duration::minutes(self.settings.lockout_minutes));
                tracing::warn!(account_id, attempts, "account locked out");
            }

            match self.accounts.save(&account).await {
                Ok(_) => return Ok(attempts),
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Failed-attempt update lost the version race repeatedly".to_string(),
        ))
    }

    async fn reset_attempt_counter(&self, account: Account) -> Result<Account, AppError> {
        {
            let AccountKind::Local(creds) = &account.kind else {
                return Ok(account);
            };
            if creds.failed_login_attempts == 0 && creds.lockout_until.is_none() {
                return Ok(account);
            }
        }

        let mut current = account;
        for _ in 0..MAX_SAVE_RETRIES {
            let AccountKind::Local(creds) = &mut current.kind else {
                return Ok(current);
            };
            creds.failed_login_attempts = 0;
            creds.lockout_until = None;

            match self.accounts.save(&current).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::VersionConflict) => {
                    current = self
                        .accounts
                        .find_by_id(&current.id)
                        .await?
                        .ok_or_else(|| AppError::AuthFailed("account vanished".to_string()))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Attempt-counter reset lost the version race repeatedly".to_string(),
        ))
    }

    /// Anti-enumeration: succeeds outwardly whether or not the email maps to
    /// an account.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), AppError> {
        let Some(account) = self.accounts.find_by_email(email).await? else {
            tracing::debug!("password reset requested for unknown email");
            return Ok(());
        };
        if !matches!(account.kind, AccountKind::Local(_)) {
            return Ok(());
        }

        let token = Uuid::new_v4().to_string();
        let reset = PasswordResetToken {
            account_id: account.id.clone(),
            email: account.email.clone(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        self.cache
            .store::<PasswordResetToken>()
            .put(&token, &reset)
            .await?;
        self.mailer.send_password_reset(&account.email, &token).await
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AppError> {
        if new_password.len() < self.settings.min_password_length {
            return Err(AppError::Validation(format!(
                "Password must be at least {} characters",
                self.settings.min_password_length
            )));
        }

        let store = self.cache.store::<PasswordResetToken>();
        let reset = store
            .take(token)
            .await?
            .ok_or_else(|| AppError::InvalidState("reset token absent or consumed".to_string()))?;
        if Utc::now() > reset.expires_at {
            return Err(AppError::InvalidState("reset token expired".to_string()));
        }

        let password_hash = hash_password(new_password)?;
        for _ in 0..MAX_SAVE_RETRIES {
            let mut account = self
                .accounts
                .find_by_id(&reset.account_id)
                .await?
                .ok_or(AppError::UserNotFound)?;
            // Email re-checked at consumption; a changed address voids the token
            if account.email != reset.email {
                return Err(AppError::InvalidState(
                    "reset token email mismatch".to_string(),
                ));
            }
            let AccountKind::Local(creds) = &mut account.kind else {
                return Err(AppError::InvalidState(
                    "reset token for a provider account".to_string(),
                ));
            };

            creds.password_hash = password_hash.clone();
            creds.failed_login_attempts = 0;
            creds.lockout_until = None;

            match self.accounts.save(&account).await {
                Ok(_) => {
                    // Void any other outstanding reset tokens for this account
                    let account_id = reset.account_id.clone();
                    store
                        .delete_where(|t| t.account_id == account_id)
                        .await?;
                    tracing::info!(account_id = %reset.account_id, "password reset completed");
                    return Ok(());
                }
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Password reset lost the version race repeatedly".to_string(),
        ))
    }

    pub async fn request_email_verification(&self, account_id: &str) -> Result<(), AppError> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or(AppError::UserNotFound)?;
        if account.status != AccountStatus::Unverified {
            return Err(AppError::Validation(
                "Account email is already verified".to_string(),
            ));
        }

        let token = Uuid::new_v4().to_string();
        let verification = EmailVerificationToken {
            account_id: account.id.clone(),
            email: account.email.clone(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
        };
        self.cache
            .store::<EmailVerificationToken>()
            .put(&token, &verification)
            .await?;
        self.mailer
            .send_email_verification(&account.email, &token)
            .await
    }

    pub async fn verify_email(&self, token: &str) -> Result<(), AppError> {
        let verification = self
            .cache
            .store::<EmailVerificationToken>()
            .take(token)
            .await?
            .ok_or_else(|| {
                AppError::InvalidState("verification token absent or consumed".to_string())
            })?;
        if Utc::now() > verification.expires_at {
            return Err(AppError::InvalidState(
                "verification token expired".to_string(),
            ));
        }

        for _ in 0..MAX_SAVE_RETRIES {
            let mut account = self
                .accounts
                .find_by_id(&verification.account_id)
                .await?
                .ok_or(AppError::UserNotFound)?;
            if account.email != verification.email {
                return Err(AppError::InvalidState(
                    "verification token email mismatch".to_string(),
                ));
            }
            if account.status != AccountStatus::Unverified {
                return Ok(());
            }

            account.status = AccountStatus::Active;
            match self.accounts.save(&account).await {
                Ok(_) => {
                    tracing::info!(account_id = %account.id, "email verified");
                    return Ok(());
                }
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Email verification lost the version race repeatedly".to_string(),
        ))
    }

    /// Register a password account. It starts `Unverified` and gets a
    /// verification email.
    pub async fn register(
        &self,
        email: &str,
        username: Option<String>,
        password: &str,
    ) -> Result<Account, AppError> {
        if password.len() < self.settings.min_password_length {
            return Err(AppError::Validation(format!(
                "Password must be at least {} characters",
                self.settings.min_password_length
            )));
        }
        if self.accounts.find_by_email(email).await?.is_some() {
            return Err(AppError::UserExists);
        }

        let account = Account::new_local(email, username, hash_password(password)?);
        let account = self.accounts.create(&account).await.map_err(|e| match e {
            StoreError::AlreadyExists => AppError::UserExists,
            other => AppError::Store(other),
        })?;

        self.request_email_verification(&account.id).await?;
        Ok(account)
    }
}

impl LocalCredentials {
    pub fn is_locked_out(&self) -> bool {
        self.lockout_until.is_some_and(|until| until > Utc::now())
    }
}
