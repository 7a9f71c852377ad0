use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, header},
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use workspace_auth::account::{Account, AccountKind, AccountStatus, AccountStore, OAuthIdentity};
use workspace_auth::auth::local::hash_password;
use workspace_auth::auth::oauth::{
    IdentityProvider, OAuthFlowCoordinator, Provider, ProviderIdentity, ProviderTokens,
};
use workspace_auth::error::AppError;
use workspace_auth::{Config, Server};

pub const TEST_JWT_SECRET: &str = "integration-test-secret-key";

/// Scripted identity provider: `exchange_code` hands back whatever identity
/// was last set, so tests control what the "provider" says.
pub struct MockIdentityProvider {
    provider: Provider,
    identity: Mutex<ProviderIdentity>,
}

impl MockIdentityProvider {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            identity: Mutex::new(ProviderIdentity {
                provider_user_id: "mock-user-1".to_string(),
                email: "mock@example.com".to_string(),
                name: Some("Mock User".to_string()),
                image_url: None,
                tokens: ProviderTokens {
                    access_token: "mock-access".to_string(),
                    refresh_token: Some("mock-refresh".to_string()),
                    scopes: vec![
                        "openid".to_string(),
                        "email".to_string(),
                        "profile".to_string(),
                    ],
                },
            }),
        }
    }

    pub fn set_identity(&self, identity: ProviderIdentity) {
        *self.identity.lock().unwrap() = identity;
    }

    pub fn set_email(&self, email: &str) {
        self.identity.lock().unwrap().email = email.to_string();
    }

    pub fn set_granted_scopes(&self, scopes: &[&str]) {
        self.identity.lock().unwrap().tokens.scopes =
            scopes.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        redirect_uri: &str,
    ) -> Result<String, AppError> {
        Ok(format!(
            "https://provider.test/authorize?state={state}&scope={}&redirect_uri={redirect_uri}",
            scopes.join("+"),
        ))
    }

    async fn exchange_code(
        &self,
        _code: &str,
        _redirect_uri: &str,
    ) -> Result<ProviderIdentity, AppError> {
        Ok(self.identity.lock().unwrap().clone())
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<ProviderTokens, AppError> {
        Ok(ProviderTokens {
            access_token: "refreshed-access".to_string(),
            refresh_token: Some(refresh_token.to_string()),
            scopes: vec![],
        })
    }
}

/// In-process server with the Google provider replaced by a mock.
pub struct TestHarness {
    pub server: Server,
    pub app: Router,
    pub google: Arc<MockIdentityProvider>,
}

impl TestHarness {
    pub async fn new() -> Self {
        let mut config = Config::default();
        config.jwt.secret = TEST_JWT_SECRET.to_string();

        let mut server = Server::new(config).await.unwrap();

        let google = Arc::new(MockIdentityProvider::new(Provider::Google));
        let mut providers: HashMap<Provider, Arc<dyn IdentityProvider>> = HashMap::new();
        providers.insert(Provider::Google, google.clone());
        server.oauth = Arc::new(OAuthFlowCoordinator::new(
            server.config.clone(),
            server.accounts.clone(),
            server.cache.clone(),
            server.sessions.clone(),
            providers,
        ));

        let app = server.create_app();
        Self {
            server,
            app,
            google,
        }
    }

    pub async fn request(&self, request: Request<Body>) -> axum::response::Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> axum::response::Response {
        self.request(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> axum::response::Response {
        self.request(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
    }

    pub async fn post_json_with_auth(
        &self,
        uri: &str,
        token: &str,
        body: Value,
    ) -> axum::response::Response {
        self.request(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
    }

    /// Seed an active local account, bypassing email verification.
    pub async fn seed_local_account(&self, email: &str, password: &str) -> Account {
        let mut account =
            Account::new_local(email, None, hash_password(password).unwrap());
        account.status = AccountStatus::Active;
        self.server.accounts.create(&account).await.unwrap()
    }

    /// Seed an OAuth account with the given stored grant history.
    pub async fn seed_oauth_account(&self, email: &str, scopes: &[&str]) -> Account {
        let account = Account::new_oauth(
            email,
            Some("Seeded User".to_string()),
            None,
            OAuthIdentity {
                provider: Provider::Google,
                provider_user_id: format!("g-{email}"),
                granted_scopes: scopes.iter().map(|s| s.to_string()).collect(),
            },
        );
        self.server.accounts.create(&account).await.unwrap()
    }

    /// Mutate a seeded local account's credentials in place.
    pub async fn update_local_credentials(
        &self,
        account: &Account,
        mutate: impl FnOnce(&mut workspace_auth::account::LocalCredentials),
    ) -> Account {
        let mut account = self
            .server
            .accounts
            .find_by_id(&account.id)
            .await
            .unwrap()
            .unwrap();
        let AccountKind::Local(creds) = &mut account.kind else {
            panic!("not a local account");
        };
        mutate(creds);
        self.server.accounts.save(&account).await.unwrap()
    }
}

pub async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// All Set-Cookie values on a response.
#[allow(dead_code)]
pub fn set_cookies(response: &axum::response::Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}
