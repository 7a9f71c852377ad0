//! Session token codec
//!
//! Two token families share one signing key and one claim shape. Local
//! tokens carry only the account binding; OAuth tokens additionally wrap the
//! provider's own access or refresh token so downstream calls can use it
//! without a second lookup. A token of one family never verifies as the
//! other, and an access token never verifies where a refresh token is
//! expected.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::account::AccountType;
use crate::config::JwtConfig;
use crate::error::AppError;
use crate::health::{HealthCheckResult, HealthChecker};

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub iat: usize,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_refresh_token: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_refresh_token: Option<String>,
}

/// Verified local token.
#[derive(Debug, Clone)]
pub struct LocalTokenData {
    pub account_id: String,
}

/// Verified OAuth access token with the wrapped provider access token.
#[derive(Debug, Clone)]
pub struct OAuthTokenData {
    pub account_id: String,
    pub provider_access_token: String,
}

/// Verified OAuth refresh token with the wrapped provider refresh token.
#[derive(Debug, Clone)]
pub struct OAuthRefreshData {
    pub account_id: String,
    pub provider_refresh_token: String,
}

pub struct TokenCodec {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    pub fn new(config: &JwtConfig) -> Result<Self, AppError> {
        let algorithm = parse_algorithm(&config.algorithm)?;
        Ok(Self {
            algorithm,
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            access_ttl: Duration::from_secs(config.access_token_ttl),
            refresh_ttl: Duration::from_secs(config.refresh_token_ttl),
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn sign(&self, claims: &SessionClaims) -> Result<String, AppError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Token signing failed: {e}")))
    }

    fn base_claims(&self, account_id: &str, account_type: AccountType, is_refresh: bool) -> SessionClaims {
        let now = Utc::now().timestamp() as usize;
        let ttl = if is_refresh {
            self.refresh_ttl
        } else {
            self.access_ttl
        };
        SessionClaims {
            sub: account_id.to_string(),
            account_type,
            iat: now,
            exp: now + ttl.as_secs() as usize,
            is_refresh_token: is_refresh,
            oauth_access_token: None,
            oauth_refresh_token: None,
        }
    }

    pub fn sign_local(&self, account_id: &str, is_refresh: bool) -> Result<String, AppError> {
        let claims = self.base_claims(account_id, AccountType::Local, is_refresh);
        self.sign(&claims)
    }

    pub fn sign_oauth(
        &self,
        account_id: &str,
        provider_access_token: &str,
        provider_refresh_token: Option<&str>,
        is_refresh: bool,
    ) -> Result<String, AppError> {
        let mut claims = self.base_claims(account_id, AccountType::OAuth, is_refresh);
        if is_refresh {
            let refresh = provider_refresh_token.ok_or_else(|| {
                AppError::Internal("OAuth refresh token requires a provider refresh token".to_string())
            })?;
            claims.oauth_refresh_token = Some(refresh.to_string());
        } else {
            claims.oauth_access_token = Some(provider_access_token.to_string());
        }
        self.sign(&claims)
    }

    fn decode_claims(&self, token: &str, validate_exp: bool) -> Result<SessionClaims, AppError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AppError::TokenExpired,
                _ => AppError::TokenInvalid(e.to_string()),
            })
    }

    /// Decode and enforce the family and refresh context. Mismatches are
    /// hard failures even when the signature is valid.
    pub fn verify(
        &self,
        token: &str,
        expected_type: AccountType,
        expect_refresh: bool,
    ) -> Result<SessionClaims, AppError> {
        let claims = self.decode_claims(token, true)?;
        if claims.account_type != expected_type {
            return Err(AppError::TokenInvalid("token type mismatch".to_string()));
        }
        if claims.is_refresh_token != expect_refresh {
            return Err(AppError::TokenInvalid(
                "token refresh context mismatch".to_string(),
            ));
        }
        Ok(claims)
    }

    pub fn verify_local(&self, token: &str) -> Result<LocalTokenData, AppError> {
        let claims = self.verify(token, AccountType::Local, false)?;
        Ok(LocalTokenData {
            account_id: claims.sub,
        })
    }

    pub fn verify_oauth(&self, token: &str) -> Result<OAuthTokenData, AppError> {
        let claims = self.verify(token, AccountType::OAuth, false)?;
        let provider_access_token = claims
            .oauth_access_token
            .ok_or_else(|| AppError::TokenInvalid("missing wrapped access token".to_string()))?;
        Ok(OAuthTokenData {
            account_id: claims.sub,
            provider_access_token,
        })
    }

    pub fn verify_oauth_refresh(&self, token: &str) -> Result<OAuthRefreshData, AppError> {
        let claims = self.verify(token, AccountType::OAuth, true)?;
        let provider_refresh_token = claims
            .oauth_refresh_token
            .ok_or_else(|| AppError::TokenInvalid("missing wrapped refresh token".to_string()))?;
        Ok(OAuthRefreshData {
            account_id: claims.sub,
            provider_refresh_token,
        })
    }

    /// Expiry probe that still checks the signature. Malformed or forged
    /// tokens are errors, not "expired".
    pub fn is_expired(&self, token: &str) -> Result<bool, AppError> {
        let claims = self.decode_claims(token, false)?;
        Ok((Utc::now().timestamp() as usize) >= claims.exp)
    }
}

fn parse_algorithm(name: &str) -> Result<Algorithm, AppError> {
    // Shared-secret HMAC only; asymmetric families need a key pair this
    // service does not manage.
    match name {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(AppError::Validation(format!(
            "Unsupported JWT algorithm: {other}"
        ))),
    }
}

pub struct TokenCodecHealthChecker {
    codec: Arc<TokenCodec>,
}

impl TokenCodecHealthChecker {
    pub fn new(codec: Arc<TokenCodec>) -> Self {
        Self { codec }
    }
}

#[async_trait::async_trait]
impl HealthChecker for TokenCodecHealthChecker {
    fn name(&self) -> &str {
        "jwt"
    }

    async fn check(&self) -> HealthCheckResult {
        // Sign-then-verify self test
        let result = self
            .codec
            .sign_local("health-check", false)
            .and_then(|token| self.codec.verify_local(&token));
        match result {
            Ok(_) => HealthCheckResult::healthy(),
            Err(err) => HealthCheckResult::unhealthy(format!("JWT self-test failed: {err}")),
        }
    }
}
