use async_trait::async_trait;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse as OAuth2TokenResponse, TokenUrl,
    basic::BasicClient,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use crate::config::{Config, OAuthProviderConfig};
use crate::error::AppError;

// Avoid oauth2 type madness
pub type Oauth2Client =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Microsoft,
    Facebook,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Microsoft => "microsoft",
            Provider::Facebook => "facebook",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Google => "Google",
            Provider::Microsoft => "Microsoft",
            Provider::Facebook => "Facebook",
        }
    }

    /// Resolve a (service, access level) request into provider scope
    /// strings. Already-qualified scope strings pass through untouched.
    pub fn scopes_for(&self, service: &str, level: &str) -> Result<Vec<String>, AppError> {
        if service.contains("://") || service.contains('.') {
            return Ok(vec![service.to_string()]);
        }
        let scope = match self {
            Provider::Google => match (service, level) {
                ("drive", "readonly") => "https://www.googleapis.com/auth/drive.readonly",
                ("drive", "full") => "https://www.googleapis.com/auth/drive",
                ("gmail", "readonly") => "https://www.googleapis.com/auth/gmail.readonly",
                ("gmail", "send") => "https://www.googleapis.com/auth/gmail.send",
                ("gmail", "full") => "https://mail.google.com/",
                ("calendar", "readonly") => {
                    "https://www.googleapis.com/auth/calendar.readonly"
                }
                ("calendar", "full") => "https://www.googleapis.com/auth/calendar",
                ("contacts", "readonly") => {
                    "https://www.googleapis.com/auth/contacts.readonly"
                }
                ("contacts", "full") => "https://www.googleapis.com/auth/contacts",
                _ => {
                    return Err(AppError::Validation(format!(
                        "Unknown Google service/level: {service}/{level}"
                    )));
                }
            },
            Provider::Microsoft => match (service, level) {
                ("mail", "readonly") => "Mail.Read",
                ("mail", "send") => "Mail.Send",
                ("mail", "full") => "Mail.ReadWrite",
                ("files", "readonly") => "Files.Read",
                ("files", "full") => "Files.ReadWrite",
                ("calendar", "readonly") => "Calendars.Read",
                ("calendar", "full") => "Calendars.ReadWrite",
                ("contacts", "readonly") => "Contacts.Read",
                _ => {
                    return Err(AppError::Validation(format!(
                        "Unknown Microsoft service/level: {service}/{level}"
                    )));
                }
            },
            // Facebook permissions are flat names; the service is the scope
            Provider::Facebook => return Ok(vec![service.to_string()]),
        };
        Ok(vec![scope.to_string()])
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(Provider::Google),
            "microsoft" => Ok(Provider::Microsoft),
            "facebook" => Ok(Provider::Facebook),
            other => Err(AppError::InvalidProvider(other.to_string())),
        }
    }
}

/// Raw tokens returned by a provider's token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Scopes the provider reports as granted for this token.
    pub scopes: Vec<String>,
}

/// Profile and tokens obtained from a completed code exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderIdentity {
    pub provider_user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub image_url: Option<String>,
    pub tokens: ProviderTokens,
}

/// Seam to the identity provider: URL construction, code exchange with
/// profile fetch, and provider-token refresh. The provider side is opaque;
/// everything behind this trait can be mocked in tests.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn provider(&self) -> Provider;

    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        redirect_uri: &str,
    ) -> Result<String, AppError>;

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderIdentity, AppError>;

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<ProviderTokens, AppError>;
}

/// `oauth2`-crate implementation over the configured endpoints.
pub struct OAuth2IdentityProvider {
    provider: Provider,
    config: OAuthProviderConfig,
    client: Oauth2Client,
}

impl OAuth2IdentityProvider {
    pub fn new(provider: Provider, config: OAuthProviderConfig) -> Result<Self, AppError> {
        let client = create_oauth_client(&config, provider.as_str())?;
        Ok(Self {
            provider,
            config,
            client,
        })
    }

    fn http_client() -> Result<reqwest::Client, AppError> {
        reqwest::ClientBuilder::new()
            // Following redirects opens the client up to SSRF vulnerabilities.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(format!("reqwest build error: {e}")))
    }

    async fn get_user_info(&self, access_token: &str) -> Result<Value, AppError> {
        let user_info_url = self.config.user_info_url.as_deref().ok_or_else(|| {
            AppError::Internal(format!(
                "User info URL not configured for provider '{}'",
                self.provider
            ))
        })?;

        let response = reqwest::Client::new()
            .get(user_info_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("User info request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::AuthFailed(format!(
                "User info request returned {}",
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::Internal(format!("User info parse failed: {e}")))
    }

    fn extract_identity(&self, user_info: &Value, tokens: ProviderTokens) -> Result<ProviderIdentity, AppError> {
        let user_id_field = self.config.user_id_field.as_deref().unwrap_or("id");
        let email_field = self.config.email_field.as_deref().unwrap_or("email");

        let provider_user_id = user_info
            .get(user_id_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::AuthFailed("User ID not found in provider response".to_string())
            })?;

        let email = user_info
            .get(email_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::AuthFailed("Email not found in provider response".to_string())
            })?;

        let name = user_info
            .get("name")
            .and_then(|v| v.as_str())
            .or_else(|| user_info.get("display_name").and_then(|v| v.as_str()))
            .or_else(|| user_info.get("displayName").and_then(|v| v.as_str()))
            .map(|s| s.to_string());

        // Google returns a flat URL, Facebook nests it under picture.data
        let image_url = user_info
            .get("picture")
            .and_then(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .or_else(|| {
                        v.get("data")
                            .and_then(|d| d.get("url"))
                            .and_then(|u| u.as_str())
                            .map(|s| s.to_string())
                    })
            });

        Ok(ProviderIdentity {
            provider_user_id: provider_user_id.to_string(),
            email: email.to_string(),
            name,
            image_url,
            tokens,
        })
    }
}

#[async_trait]
impl IdentityProvider for OAuth2IdentityProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        redirect_uri: &str,
    ) -> Result<String, AppError> {
        let redirect = RedirectUrl::new(redirect_uri.to_string()).map_err(|e| {
            AppError::Validation(format!("Invalid redirect URI: {e}"))
        })?;

        let state = state.to_string();
        let (authorization_url, _csrf_token) = self
            .client
            .clone()
            .set_redirect_uri(redirect)
            .authorize_url(|| CsrfToken::new(state))
            .add_scopes(scopes.iter().map(|s| Scope::new(s.clone())))
            .url();

        Ok(authorization_url.to_string())
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderIdentity, AppError> {
        let redirect = RedirectUrl::new(redirect_uri.to_string()).map_err(|e| {
            AppError::Validation(format!("Invalid redirect URI: {e}"))
        })?;
        let http_client = Self::http_client()?;

        let token_result = self
            .client
            .clone()
            .set_redirect_uri(redirect)
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&http_client)
            .await
            .map_err(|e| AppError::AuthFailed(format!("Token exchange failed: {e}")))?;

        let scopes = token_result
            .scopes()
            .map(|s| s.iter().map(|scope| scope.to_string()).collect())
            .unwrap_or_else(|| self.config.scopes.clone());

        let tokens = ProviderTokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result
                .refresh_token()
                .map(|t| t.secret().clone()),
            scopes,
        };

        let user_info = self.get_user_info(&tokens.access_token).await?;
        self.extract_identity(&user_info, tokens)
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<ProviderTokens, AppError> {
        let http_client = Self::http_client()?;

        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&http_client)
            .await
            .map_err(|e| AppError::AuthFailed(format!("Token refresh failed: {e}")))?;

        let scopes = token_result
            .scopes()
            .map(|s| s.iter().map(|scope| scope.to_string()).collect())
            .unwrap_or_default();

        Ok(ProviderTokens {
            access_token: token_result.access_token().secret().clone(),
            // Providers may rotate the refresh token; fall back to the old one
            refresh_token: token_result
                .refresh_token()
                .map(|t| t.secret().clone())
                .or_else(|| Some(refresh_token.to_string())),
            scopes,
        })
    }
}

/// Build the oauth2 client for a single provider.
pub fn create_oauth_client(
    config: &OAuthProviderConfig,
    provider_name: &str,
) -> Result<Oauth2Client, AppError> {
    let auth_url = AuthUrl::new(
        config
            .authorization_url
            .clone()
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Authorization URL not configured for provider '{provider_name}'"
                ))
            })?,
    )
    .map_err(|e| {
        AppError::Validation(format!(
            "Invalid authorization URL for provider '{provider_name}': {e}"
        ))
    })?;

    let token_url = TokenUrl::new(config.token_url.clone().ok_or_else(|| {
        AppError::Validation(format!(
            "Token URL not configured for provider '{provider_name}'"
        ))
    })?)
    .map_err(|e| {
        AppError::Validation(format!(
            "Invalid token URL for provider '{provider_name}': {e}"
        ))
    })?;

    Ok(
        BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url),
    )
}

/// Instantiate an identity provider per configured entry. Config keys that
/// are not recognized provider names are rejected at startup.
pub fn initialize_identity_providers(
    config: &Config,
) -> Result<HashMap<Provider, Arc<dyn IdentityProvider>>, AppError> {
    let mut providers: HashMap<Provider, Arc<dyn IdentityProvider>> = HashMap::new();
    for (name, provider_config) in &config.oauth.providers {
        let provider = Provider::from_str(name)?;
        let identity_provider =
            OAuth2IdentityProvider::new(provider, provider_config.clone())?;
        providers.insert(provider, Arc::new(identity_provider));
    }
    Ok(providers)
}
