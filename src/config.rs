use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::cache::CacheConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub local_auth: LocalAuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    /// Access token lifetime in seconds.
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl: u64,
    /// Refresh token lifetime in seconds.
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl: u64,
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_access_token_ttl() -> u64 {
    3600 // 1 hour
}

fn default_refresh_token_ttl() -> u64 {
    604800 // 7 days
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Public base URL of this service, used to build callback URLs.
    #[serde(default = "default_redirect_base_url")]
    pub redirect_base_url: String,
    /// Keyed by provider name: "google", "microsoft", "facebook".
    #[serde(default)]
    pub providers: HashMap<String, OAuthProviderConfig>,
}

fn default_redirect_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl OAuthConfig {
    pub fn callback_url(&self, provider: &str) -> String {
        format!(
            "{}/auth/{}/callback",
            self.redirect_base_url.trim_end_matches('/'),
            provider
        )
    }

    pub fn permission_callback_url(&self, provider: &str) -> String {
        format!(
            "{}/auth/permission/{}/callback",
            self.redirect_base_url.trim_end_matches('/'),
            provider
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub user_info_url: Option<String>,
    #[serde(default = "default_provider_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub user_id_field: Option<String>,
    #[serde(default)]
    pub email_field: Option<String>,
    /// Microsoft only; substituted into the tenant endpoints.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

fn default_provider_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "email".to_string(),
        "profile".to_string(),
    ]
}

impl OAuthProviderConfig {
    /// Fill in well-known endpoints and claim fields for the predefined
    /// providers. Explicit values from config win.
    pub fn apply_provider_defaults(&mut self, provider: &str) {
        match provider {
            "google" => {
                self.authorization_url.get_or_insert_with(|| {
                    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
                });
                self.token_url
                    .get_or_insert_with(|| "https://oauth2.googleapis.com/token".to_string());
                self.user_info_url.get_or_insert_with(|| {
                    "https://www.googleapis.com/oauth2/v2/userinfo".to_string()
                });
                self.user_id_field.get_or_insert_with(|| "id".to_string());
                self.email_field.get_or_insert_with(|| "email".to_string());
            }
            "microsoft" => {
                let tenant = self.tenant_id.as_deref().unwrap_or("common").to_string();
                self.authorization_url.get_or_insert_with(|| {
                    format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize")
                });
                self.token_url.get_or_insert_with(|| {
                    format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token")
                });
                self.user_info_url
                    .get_or_insert_with(|| "https://graph.microsoft.com/v1.0/me".to_string());
                self.user_id_field.get_or_insert_with(|| "id".to_string());
                self.email_field
                    .get_or_insert_with(|| "userPrincipalName".to_string());
            }
            "facebook" => {
                self.authorization_url.get_or_insert_with(|| {
                    "https://www.facebook.com/v18.0/dialog/oauth".to_string()
                });
                self.token_url.get_or_insert_with(|| {
                    "https://graph.facebook.com/v18.0/oauth/access_token".to_string()
                });
                self.user_info_url.get_or_insert_with(|| {
                    "https://graph.facebook.com/me?fields=id,name,email,picture".to_string()
                });
                self.user_id_field.get_or_insert_with(|| "id".to_string());
                self.email_field.get_or_insert_with(|| "email".to_string());
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAuthConfig {
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    /// Lockout window in minutes after the attempt threshold is hit.
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    /// Issuer label shown in authenticator apps.
    #[serde(default = "default_two_factor_issuer")]
    pub two_factor_issuer: String,
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_lockout_minutes() -> i64 {
    15
}

fn default_min_password_length() -> usize {
    8
}

fn default_two_factor_issuer() -> String {
    "Workspace".to_string()
}

impl Default for LocalAuthConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: default_max_failed_attempts(),
            lockout_minutes: default_lockout_minutes(),
            min_password_length: default_min_password_length(),
            two_factor_issuer: default_two_factor_issuer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            jwt: JwtConfig {
                secret: "change-me".to_string(),
                algorithm: default_jwt_algorithm(),
                access_token_ttl: default_access_token_ttl(),
                refresh_token_ttl: default_refresh_token_ttl(),
            },
            cache: CacheConfig::default(),
            oauth: OAuthConfig {
                redirect_base_url: default_redirect_base_url(),
                providers: HashMap::new(),
            },
            local_auth: LocalAuthConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(config::Config::try_from(&Config::default())?);

        if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(
            Environment::with_prefix("WORKSPACE")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.apply_provider_defaults();
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(config::Config::try_from(&Config::default())?);

        if path.as_ref().exists() {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        builder = builder.add_source(
            Environment::with_prefix("WORKSPACE")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.apply_provider_defaults();
        Ok(config)
    }

    fn apply_provider_defaults(&mut self) {
        for (name, provider) in self.oauth.providers.iter_mut() {
            provider.apply_provider_defaults(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.jwt.algorithm, "HS256");
        assert_eq!(config.jwt.access_token_ttl, 3600);
        assert_eq!(config.jwt.refresh_token_ttl, 604800);
        assert_eq!(config.local_auth.max_failed_attempts, 5);
        assert_eq!(config.local_auth.lockout_minutes, 15);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_load_from_yaml_file() {
        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 4000
jwt:
  secret: "file-secret"
  access_token_ttl: 1800
logging:
  level: "warn"
oauth:
  redirect_base_url: "https://auth.example.com/"
  providers:
    google:
      client_id: "gid"
      client_secret: "gsecret"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = Config::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.jwt.secret, "file-secret");
        assert_eq!(config.jwt.access_token_ttl, 1800);
        assert_eq!(config.logging.level, "warn");

        let google = config.oauth.providers.get("google").unwrap();
        assert_eq!(google.client_id, "gid");
        // Predefined endpoints filled in
        assert_eq!(
            google.authorization_url.as_deref(),
            Some("https://accounts.google.com/o/oauth2/v2/auth")
        );
        assert_eq!(google.email_field.as_deref(), Some("email"));
        assert_eq!(
            google.scopes,
            vec!["openid", "email", "profile"]
        );
    }

    #[test]
    fn test_callback_urls_trim_trailing_slash() {
        let oauth = OAuthConfig {
            redirect_base_url: "https://auth.example.com/".to_string(),
            providers: HashMap::new(),
        };
        assert_eq!(
            oauth.callback_url("google"),
            "https://auth.example.com/auth/google/callback"
        );
        assert_eq!(
            oauth.permission_callback_url("google"),
            "https://auth.example.com/auth/permission/google/callback"
        );
    }

    #[test]
    fn test_microsoft_defaults_use_tenant() {
        let mut provider = OAuthProviderConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            authorization_url: None,
            token_url: None,
            user_info_url: None,
            scopes: default_provider_scopes(),
            user_id_field: None,
            email_field: None,
            tenant_id: Some("my-tenant".to_string()),
        };
        provider.apply_provider_defaults("microsoft");
        assert_eq!(
            provider.authorization_url.as_deref(),
            Some("https://login.microsoftonline.com/my-tenant/oauth2/v2.0/authorize")
        );
        assert_eq!(
            provider.email_field.as_deref(),
            Some("userPrincipalName")
        );
    }

    #[test]
    fn test_explicit_config_wins_over_defaults() {
        let mut provider = OAuthProviderConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            authorization_url: Some("https://example.com/authorize".to_string()),
            token_url: None,
            user_info_url: None,
            scopes: default_provider_scopes(),
            user_id_field: None,
            email_field: None,
            tenant_id: None,
        };
        provider.apply_provider_defaults("google");
        assert_eq!(
            provider.authorization_url.as_deref(),
            Some("https://example.com/authorize")
        );
        assert_eq!(
            provider.token_url.as_deref(),
            Some("https://oauth2.googleapis.com/token")
        );
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let config = Config::load_from_file("nonexistent.yaml").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
    }
}
