use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use super::Account;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("account not found")]
    NotFound,
    #[error("account already exists")]
    AlreadyExists,
    #[error("version conflict")]
    VersionConflict,
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence seam for account records.
///
/// `save` is a compare-and-swap on `Account::version`: the write succeeds
/// only if the stored version still matches the one the caller read, and the
/// stored copy comes back with the version bumped. Callers that lose the race
/// re-read and retry.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Account>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>>;

    /// Email or username lookup, for the local login form.
    async fn find_by_identifier(&self, identifier: &str) -> StoreResult<Option<Account>>;

    async fn create(&self, account: &Account) -> StoreResult<Account>;

    async fn save(&self, account: &Account) -> StoreResult<Account>;
}

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Account>> {
        Ok(self.accounts.read().await.get(id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let email = email.to_lowercase();
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| a.email == email)
            .cloned())
    }

    async fn find_by_identifier(&self, identifier: &str) -> StoreResult<Option<Account>> {
        let email = identifier.to_lowercase();
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| a.email == email || a.username.as_deref() == Some(identifier))
            .cloned())
    }

    async fn create(&self, account: &Account) -> StoreResult<Account> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.id)
            || accounts.values().any(|a| a.email == account.email)
        {
            return Err(StoreError::AlreadyExists);
        }
        accounts.insert(account.id.clone(), account.clone());
        Ok(account.clone())
    }

    async fn save(&self, account: &Account) -> StoreResult<Account> {
        let mut accounts = self.accounts.write().await;
        let current = accounts.get(&account.id).ok_or(StoreError::NotFound)?;
        if current.version != account.version {
            return Err(StoreError::VersionConflict);
        }
        let mut updated = account.clone();
        updated.version += 1;
        accounts.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }
}
