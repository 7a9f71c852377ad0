//! Session issuance, request-token verification, and session cookies

use cookie::{Cookie, SameSite};
use serde::Serialize;
use std::sync::Arc;

use crate::account::{Account, AccountKind, AccountType};
use crate::error::AppError;

use super::jwt::TokenCodec;
use super::oauth::providers::ProviderTokens;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

#[derive(Debug, Clone, Serialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub account_id: String,
    pub account_type: AccountType,
}

#[derive(Clone)]
pub struct SessionService {
    codec: Arc<TokenCodec>,
}

impl SessionService {
    pub fn new(codec: Arc<TokenCodec>) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Access + refresh pair for the account. OAuth accounts must bring
    /// fresh provider tokens to wrap; a missing provider refresh token is a
    /// provider configuration problem (offline access not requested).
    pub fn issue_session(
        &self,
        account: &Account,
        provider_tokens: Option<&ProviderTokens>,
    ) -> Result<SessionTokens, AppError> {
        match &account.kind {
            AccountKind::Local(_) => Ok(SessionTokens {
                access_token: self.codec.sign_local(&account.id, false)?,
                refresh_token: self.codec.sign_local(&account.id, true)?,
            }),
            AccountKind::OAuth(_) => {
                let tokens = provider_tokens.ok_or_else(|| {
                    AppError::Internal(
                        "OAuth session issuance requires provider tokens".to_string(),
                    )
                })?;
                let refresh = tokens
                    .refresh_token
                    .as_deref()
                    .unwrap_or(tokens.access_token.as_str());
                Ok(SessionTokens {
                    access_token: self.codec.sign_oauth(
                        &account.id,
                        &tokens.access_token,
                        None,
                        false,
                    )?,
                    refresh_token: self.codec.sign_oauth(
                        &account.id,
                        &tokens.access_token,
                        Some(refresh),
                        true,
                    )?,
                })
            }
        }
    }

    /// Verify a token presented on a request path that names an account.
    /// A valid token for a different account is a hard failure, not a
    /// fallthrough.
    pub fn verify_request_token(
        &self,
        token: &str,
        expected_account_id: &str,
        is_refresh: bool,
    ) -> Result<VerifiedToken, AppError> {
        // Family is dictated by the claims; try local first, then OAuth
        let claims = match self.codec.verify(token, AccountType::Local, is_refresh) {
            Ok(claims) => claims,
            Err(AppError::TokenInvalid(_)) => {
                self.codec.verify(token, AccountType::OAuth, is_refresh)?
            }
            Err(e) => return Err(e),
        };

        if claims.sub != expected_account_id {
            tracing::warn!(
                expected = expected_account_id,
                "token subject does not match the requested account"
            );
            return Err(AppError::AuthFailed("token subject mismatch".to_string()));
        }

        Ok(VerifiedToken {
            account_id: claims.sub,
            account_type: claims.account_type,
        })
    }

    /// Path-scoped session cookies. The access cookie covers the account's
    /// API subtree; the refresh cookie is only ever sent to the refresh
    /// endpoint.
    pub fn session_cookies(
        &self,
        account_id: &str,
        tokens: &SessionTokens,
    ) -> (Cookie<'static>, Cookie<'static>) {
        let access = Cookie::build((ACCESS_COOKIE, tokens.access_token.clone()))
            .path(format!("/{account_id}"))
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Lax)
            .max_age(cookie::time::Duration::seconds(
                self.codec.access_ttl().as_secs() as i64,
            ))
            .build();

        let refresh = Cookie::build((REFRESH_COOKIE, tokens.refresh_token.clone()))
            .path(format!("/{account_id}/account/refreshToken"))
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Lax)
            .max_age(cookie::time::Duration::seconds(
                self.codec.refresh_ttl().as_secs() as i64,
            ))
            .build();

        (access, refresh)
    }
}
