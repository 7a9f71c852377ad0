//! Incremental OAuth-scope reconciliation
//!
//! OAuth accounts keep an additive history of every non-baseline scope the
//! user has consented to. At signin the scopes on the fresh provider token
//! are compared against that history; anything missing triggers re-consent.
//! The history never shrinks: scopes revoked at the provider stay recorded
//! until a failed provider call forces a new consent round.

use std::sync::Arc;

use crate::account::{AccountKind, AccountStore};
use crate::error::AppError;

/// Identity scopes present on every token; never part of the comparison.
pub const BASELINE_SCOPES: &[&str] = &["openid", "email", "profile"];

/// Full-URL aliases some providers report for the baseline scopes.
const BASELINE_SCOPE_URLS: &[&str] = &[
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

pub fn is_baseline_scope(scope: &str) -> bool {
    BASELINE_SCOPES.contains(&scope) || BASELINE_SCOPE_URLS.contains(&scope)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScopeCheck {
    pub needs_additional_scopes: bool,
    /// Previously granted scopes absent from the current token, sorted.
    pub missing_scopes: Vec<String>,
}

#[derive(Clone)]
pub struct ScopeReconciler {
    accounts: Arc<dyn AccountStore>,
}

impl ScopeReconciler {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }

    /// Stored-minus-current, baseline excluded on both sides.
    pub async fn check_additional_scopes(
        &self,
        account_id: &str,
        token_scopes: &[String],
    ) -> Result<ScopeCheck, AppError> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or(AppError::UserNotFound)?;
        let AccountKind::OAuth(identity) = &account.kind else {
            return Err(AppError::Validation(
                "Scope reconciliation applies to OAuth accounts only".to_string(),
            ));
        };

        let mut missing_scopes: Vec<String> = identity
            .granted_scopes
            .iter()
            .filter(|stored| !is_baseline_scope(stored))
            .filter(|stored| !token_scopes.iter().any(|current| &current == stored))
            .cloned()
            .collect();
        missing_scopes.sort();

        Ok(ScopeCheck {
            needs_additional_scopes: !missing_scopes.is_empty(),
            missing_scopes,
        })
    }

    /// Merge the token's non-baseline scopes into the stored history.
    /// Persists only when something new appeared; returns whether it did.
    /// Saves run under the store's version CAS and retry on conflict.
    pub async fn update_account_scopes(
        &self,
        account_id: &str,
        token_scopes: &[String],
    ) -> Result<bool, AppError> {
        const MAX_SAVE_RETRIES: usize = 3;

        for _ in 0..MAX_SAVE_RETRIES {
            let mut account = self
                .accounts
                .find_by_id(account_id)
                .await?
                .ok_or(AppError::UserNotFound)?;
            let AccountKind::OAuth(identity) = &mut account.kind else {
                return Err(AppError::Validation(
                    "Scope reconciliation applies to OAuth accounts only".to_string(),
                ));
            };

            let mut changed = false;
            for scope in token_scopes {
                if is_baseline_scope(scope) {
                    continue;
                }
                if !identity.granted_scopes.contains(scope) {
                    identity.granted_scopes.push(scope.clone());
                    changed = true;
                }
            }
            if !changed {
                return Ok(false);
            }

            match self.accounts.save(&account).await {
                Ok(_) => return Ok(true),
                Err(crate::account::StoreError::VersionConflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Internal(
            "Scope update lost the version race repeatedly".to_string(),
        ))
    }
}
