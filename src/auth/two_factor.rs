//! Two-factor sub-flow
//!
//! A successful password check on a 2FA account parks a short-lived temp
//! token instead of a session. Presenting that token with a valid TOTP or
//! backup code completes the login. The temp token is consumed atomically on
//! success and a used-marked copy is written back for the remaining TTL, so
//! a replay reads "already used" while a racing redemption reads "not found".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::account::{Account, AccountKind, AccountStore, StoreError};
use crate::cache::{CacheManager, EphemeralObject};
use crate::error::AppError;

const TEMP_TOKEN_TTL: Duration = Duration::from_secs(300);
const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 8;
const MAX_SAVE_RETRIES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoFactorTempToken {
    pub account_id: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub is_used: bool,
}

impl EphemeralObject for TwoFactorTempToken {
    fn store_prefix() -> &'static str {
        "two_factor_temp"
    }

    fn default_ttl() -> Duration {
        TEMP_TOKEN_TTL
    }
}

#[derive(Debug)]
pub struct TwoFactorSuccess {
    pub account: Account,
    /// Only reported on the backup-code path.
    pub backup_codes_remaining: Option<usize>,
}

pub struct TwoFactorService {
    accounts: Arc<dyn AccountStore>,
    cache: Arc<CacheManager>,
    issuer: String,
}

impl TwoFactorService {
    pub fn new(accounts: Arc<dyn AccountStore>, cache: Arc<CacheManager>, issuer: String) -> Self {
        Self {
            accounts,
            cache,
            issuer,
        }
    }

    pub async fn issue_temp_token(&self, account: &Account) -> Result<String, AppError> {
        let token = Uuid::new_v4().to_string();
        let temp = TwoFactorTempToken {
            account_id: account.id.clone(),
            email: account.email.clone(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(TEMP_TOKEN_TTL).unwrap_or_default(),
            is_used: false,
        };
        self.cache
            .store::<TwoFactorTempToken>()
            .put(&token, &temp)
            .await?;
        Ok(token)
    }

    /// Complete the second factor. A wrong code leaves the temp token alive
    /// for a retry; a correct code consumes it exactly once.
    pub async fn verify_two_factor(
        &self,
        temp_token: &str,
        code: &str,
    ) -> Result<TwoFactorSuccess, AppError> {
        let store = self.cache.store::<TwoFactorTempToken>();
        let temp = store.get(temp_token).await?.ok_or_else(|| {
            AppError::InvalidState("two-factor token absent or expired".to_string())
        })?;
        if temp.is_used {
            return Err(AppError::InvalidState(
                "two-factor token already used".to_string(),
            ));
        }
        if Utc::now() > temp.expires_at {
            return Err(AppError::InvalidState(
                "two-factor token expired".to_string(),
            ));
        }

        let account = self
            .accounts
            .find_by_id(&temp.account_id)
            .await?
            .ok_or(AppError::UserNotFound)?;
        {
            let AccountKind::Local(creds) = &account.kind else {
                return Err(AppError::InvalidState(
                    "two-factor token for a provider account".to_string(),
                ));
            };
            if !creds.two_factor_enabled {
                return Err(AppError::InvalidState(
                    "two-factor no longer enabled".to_string(),
                ));
            }
        }

        let backup_codes_remaining =
            if code.len() == 6 && code.chars().all(|c| c.is_ascii_digit()) {
                self.check_totp(&account, code)?;
                None
            } else if code.len() == BACKUP_CODE_LEN {
                Some(self.consume_backup_code(&account.id, code).await?)
            } else {
                return Err(AppError::AuthFailed("malformed two-factor code".to_string()));
            };

        // Atomic take decides concurrent redemption
        let consumed = store.take(temp_token).await?.ok_or_else(|| {
            AppError::InvalidState("two-factor token absent or expired".to_string())
        })?;

        // Park a used-marked copy for the remaining TTL so replays are
        // reported distinctly from never-existed tokens
        let remaining = (consumed.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        let mut used = consumed;
        used.is_used = true;
        store
            .put_with_ttl(temp_token, &used, remaining.max(Duration::from_secs(1)))
            .await?;

        // Re-read so the caller sees the post-consumption record
        let account = self
            .accounts
            .find_by_id(&used.account_id)
            .await?
            .ok_or(AppError::UserNotFound)?;
        Ok(TwoFactorSuccess {
            account,
            backup_codes_remaining,
        })
    }

    fn check_totp(&self, account: &Account, code: &str) -> Result<(), AppError> {
        let AccountKind::Local(creds) = &account.kind else {
            return Err(AppError::InvalidState(
                "two-factor token for a provider account".to_string(),
            ));
        };
        let secret = creds.two_factor_secret.as_deref().ok_or_else(|| {
            AppError::Internal("two-factor enabled without a secret".to_string())
        })?;

        let totp = self.build_totp(secret, &account.email)?;
        let valid = totp.check_current(code).unwrap_or(false);
        if !valid {
            return Err(AppError::AuthFailed("invalid two-factor code".to_string()));
        }
        Ok(())
    }

    /// Match the code against the stored hashes and persist the removal
    /// before reporting success. Returns how many codes remain.
    async fn consume_backup_code(&self, account_id: &str, code: &str) -> Result<usize, AppError> {
        let code_hash = hash_backup_code(code);
        for _ in 0..MAX_SAVE_RETRIES {
            let mut account = self
                .accounts
                .find_by_id(account_id)
                .await?
                .ok_or(AppError::UserNotFound)?;
            let AccountKind::Local(creds) = &mut account.kind else {
                return Err(AppError::InvalidState(
                    "two-factor token for a provider account".to_string(),
                ));
            };

            let before = creds.backup_code_hashes.len();
            creds.backup_code_hashes.retain(|h| h != &code_hash);
            if creds.backup_code_hashes.len() == before {
                return Err(AppError::AuthFailed("invalid backup code".to_string()));
            }
            let remaining = creds.backup_code_hashes.len();

            match self.accounts.save(&account).await {
                Ok(_) => return Ok(remaining),
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Backup-code removal lost the version race repeatedly".to_string(),
        ))
    }

    fn build_totp(&self, secret_base32: &str, account_email: &str) -> Result<TOTP, AppError> {
        let secret_bytes = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| AppError::Internal(format!("Invalid two-factor secret: {e:?}")))?;
        TOTP::new(
            Algorithm::SHA1,
            6,
            1, // accept one step of clock skew either way
            30,
            secret_bytes,
            Some(self.issuer.clone()),
            account_email.to_string(),
        )
        .map_err(|e| AppError::Internal(format!("TOTP construction failed: {e}")))
    }

    /// Fresh base32 secret for enrollment.
    pub fn generate_secret() -> String {
        Secret::generate_secret().to_encoded().to_string()
    }

    /// Plaintext codes for one-time display plus the hashes to store.
    pub fn generate_backup_codes() -> (Vec<String>, Vec<String>) {
        use rand::Rng;
        const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        let mut rng = rand::thread_rng();

        let codes: Vec<String> = (0..BACKUP_CODE_COUNT)
            .map(|_| {
                (0..BACKUP_CODE_LEN)
                    .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                    .collect()
            })
            .collect();
        let hashes = codes.iter().map(|c| hash_backup_code(c)).collect();
        (codes, hashes)
    }

    /// Flip 2FA on after the user proves the authenticator works. Returns
    /// the plaintext backup codes for one-time display.
    pub async fn enable_two_factor(
        &self,
        account_id: &str,
        secret_base32: &str,
        code: &str,
    ) -> Result<Vec<String>, AppError> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or(AppError::UserNotFound)?;
        let totp = self.build_totp(secret_base32, &account.email)?;
        if !totp.check_current(code).unwrap_or(false) {
            return Err(AppError::AuthFailed("invalid two-factor code".to_string()));
        }

        let (codes, hashes) = Self::generate_backup_codes();
        for _ in 0..MAX_SAVE_RETRIES {
            let mut account = self
                .accounts
                .find_by_id(account_id)
                .await?
                .ok_or(AppError::UserNotFound)?;
            let AccountKind::Local(creds) = &mut account.kind else {
                return Err(AppError::Validation(
                    "Two-factor applies to password accounts only".to_string(),
                ));
            };
            creds.two_factor_enabled = true;
            creds.two_factor_secret = Some(secret_base32.to_string());
            creds.backup_code_hashes = hashes.clone();

            match self.accounts.save(&account).await {
                Ok(_) => return Ok(codes),
                Err(StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Two-factor enrollment lost the version race repeatedly".to_string(),
        ))
    }
}

pub fn hash_backup_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}
