//! OAuth handshake state machine
//!
//! Every hop between redirects is carried by a single-use token in the
//! ephemeral store: flow state across the provider redirect, pending state
//! between the callback and the explicit signup/signin completion, and
//! permission state across the re-consent redirect. Consumption is atomic,
//! so a replayed or raced token fails with `InvalidState`.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::account::{Account, AccountKind, AccountStore, OAuthIdentity};
use crate::cache::CacheManager;
use crate::config::Config;
use crate::error::AppError;

use super::super::scopes::{ScopeReconciler, is_baseline_scope};
use super::super::session::{SessionService, SessionTokens};
use super::providers::{IdentityProvider, Provider};
use super::state::{
    AuthType, OAuthFlowState, PermissionState, SignInPendingState, SignUpPendingState,
};

#[derive(Debug, Serialize)]
pub struct BeginFlowResponse {
    pub authorization_url: String,
    pub state: String,
    pub provider: Provider,
}

#[derive(Debug)]
pub enum CallbackOutcome {
    SignUpPending {
        pending_token: String,
        redirect_url: Option<String>,
    },
    SignInPending {
        pending_token: String,
        redirect_url: Option<String>,
    },
}

#[derive(Debug)]
pub struct SignupResult {
    pub account_id: String,
    pub session: SessionTokens,
    pub redirect_url: Option<String>,
}

#[derive(Debug)]
pub enum SigninResult {
    Session {
        account_id: String,
        session: SessionTokens,
        redirect_url: Option<String>,
    },
    /// A previously granted scope is missing from the fresh token; the
    /// client must send the user through re-consent before a session exists.
    NeedsConsent {
        account_id: String,
        authorization_url: String,
        state: String,
        missing_scopes: Vec<String>,
    },
}

#[derive(Debug)]
pub struct PermissionResult {
    pub account_id: String,
    pub session: SessionTokens,
    pub redirect_url: Option<String>,
}

pub struct OAuthFlowCoordinator {
    config: Arc<Config>,
    accounts: Arc<dyn AccountStore>,
    cache: Arc<CacheManager>,
    sessions: Arc<SessionService>,
    scopes: ScopeReconciler,
    providers: HashMap<Provider, Arc<dyn IdentityProvider>>,
}

impl OAuthFlowCoordinator {
    pub fn new(
        config: Arc<Config>,
        accounts: Arc<dyn AccountStore>,
        cache: Arc<CacheManager>,
        sessions: Arc<SessionService>,
        providers: HashMap<Provider, Arc<dyn IdentityProvider>>,
    ) -> Self {
        let scopes = ScopeReconciler::new(accounts.clone());
        Self {
            config,
            accounts,
            cache,
            sessions,
            scopes,
            providers,
        }
    }

    fn identity_provider(
        &self,
        provider: Provider,
    ) -> Result<&Arc<dyn IdentityProvider>, AppError> {
        self.providers
            .get(&provider)
            .ok_or_else(|| AppError::InvalidProvider(provider.to_string()))
    }

    /// Identity scopes requested on every flow start.
    fn configured_scopes(&self, provider: Provider) -> Vec<String> {
        self.config
            .oauth
            .providers
            .get(provider.as_str())
            .map(|p| p.scopes.clone())
            .unwrap_or_else(|| {
                vec![
                    "openid".to_string(),
                    "email".to_string(),
                    "profile".to_string(),
                ]
            })
    }

    /// Mint flow state and build the provider authorization URL.
    pub async fn begin_oauth_flow(
        &self,
        provider: Provider,
        auth_type: AuthType,
        redirect_url: Option<String>,
    ) -> Result<BeginFlowResponse, AppError> {
        let identity_provider = self.identity_provider(provider)?;

        let state = Uuid::new_v4().to_string();
        let flow_state = OAuthFlowState::new(provider, auth_type, redirect_url);
        self.cache
            .store::<OAuthFlowState>()
            .put(&state, &flow_state)
            .await?;

        let authorization_url = identity_provider.authorization_url(
            &state,
            &self.configured_scopes(provider),
            &self.config.oauth.callback_url(provider.as_str()),
        )?;

        tracing::debug!(%provider, auth_type = ?auth_type, "started OAuth flow");
        Ok(BeginFlowResponse {
            authorization_url,
            state,
            provider,
        })
    }

    /// Redeem the flow state, exchange the code, and park the verified
    /// identity behind a fresh pending token.
    pub async fn complete_oauth_callback(
        &self,
        provider: Provider,
        state_token: &str,
        code: &str,
    ) -> Result<CallbackOutcome, AppError> {
        let flow_state = self
            .cache
            .store::<OAuthFlowState>()
            .take(state_token)
            .await?
            .ok_or_else(|| AppError::InvalidState("flow state absent or consumed".to_string()))?;

        if flow_state.provider != provider {
            return Err(AppError::InvalidState(
                "state token provider mismatch".to_string(),
            ));
        }
        if flow_state.is_expired() {
            return Err(AppError::InvalidState("flow state expired".to_string()));
        }

        let identity = self
            .identity_provider(provider)?
            .exchange_code(code, &self.config.oauth.callback_url(provider.as_str()))
            .await?;

        let pending_token = Uuid::new_v4().to_string();
        match flow_state.auth_type {
            AuthType::SignUp => {
                let pending =
                    SignUpPendingState::new(provider, identity, flow_state.redirect_url.clone());
                self.cache
                    .store::<SignUpPendingState>()
                    .put(&pending_token, &pending)
                    .await?;
                Ok(CallbackOutcome::SignUpPending {
                    pending_token,
                    redirect_url: flow_state.redirect_url,
                })
            }
            AuthType::SignIn => {
                let pending =
                    SignInPendingState::new(provider, identity, flow_state.redirect_url.clone());
                self.cache
                    .store::<SignInPendingState>()
                    .put(&pending_token, &pending)
                    .await?;
                Ok(CallbackOutcome::SignInPending {
                    pending_token,
                    redirect_url: flow_state.redirect_url,
                })
            }
            // Permission flows redeem through their own callback
            AuthType::Permission => Err(AppError::InvalidState(
                "permission state on the signin callback".to_string(),
            )),
        }
    }

    /// Create the account and issue the first session. The pending token is
    /// single-use; retrying a signup replays as `InvalidState`.
    pub async fn finish_signup(&self, pending_token: &str) -> Result<SignupResult, AppError> {
        let pending = self
            .cache
            .store::<SignUpPendingState>()
            .take(pending_token)
            .await?
            .ok_or_else(|| {
                AppError::InvalidState("signup state absent or consumed".to_string())
            })?;
        if pending.is_expired() {
            return Err(AppError::InvalidState("signup state expired".to_string()));
        }

        if self
            .accounts
            .find_by_email(&pending.identity.email)
            .await?
            .is_some()
        {
            return Err(AppError::UserExists);
        }

        let granted_scopes = pending
            .identity
            .tokens
            .scopes
            .iter()
            .filter(|s| !is_baseline_scope(s))
            .cloned()
            .collect();
        let account = Account::new_oauth(
            &pending.identity.email,
            pending.identity.name.clone(),
            pending.identity.image_url.clone(),
            OAuthIdentity {
                provider: pending.provider,
                provider_user_id: pending.identity.provider_user_id.clone(),
                granted_scopes,
            },
        );
        let account = self.accounts.create(&account).await.map_err(|e| match e {
            crate::account::StoreError::AlreadyExists => AppError::UserExists,
            other => AppError::Store(other),
        })?;

        let session = self
            .sessions
            .issue_session(&account, Some(&pending.identity.tokens))?;
        tracing::info!(account_id = %account.id, provider = %pending.provider, "account created");
        Ok(SignupResult {
            account_id: account.id,
            session,
            redirect_url: pending.redirect_url,
        })
    }

    /// Resolve the account, reconcile scopes, and either issue a session or
    /// short-circuit into the re-consent sub-flow.
    pub async fn finish_signin(&self, pending_token: &str) -> Result<SigninResult, AppError> {
        let pending = self
            .cache
            .store::<SignInPendingState>()
            .take(pending_token)
            .await?
            .ok_or_else(|| {
                AppError::InvalidState("signin state absent or consumed".to_string())
            })?;
        if pending.is_expired() {
            return Err(AppError::InvalidState("signin state expired".to_string()));
        }

        let account = self
            .accounts
            .find_by_email(&pending.identity.email)
            .await?
            .ok_or(AppError::UserNotFound)?;
        if !matches!(account.kind, AccountKind::OAuth(_)) {
            return Err(AppError::AuthFailed(
                "provider signin against a password account".to_string(),
            ));
        }

        let check = self
            .scopes
            .check_additional_scopes(&account.id, &pending.identity.tokens.scopes)
            .await?;
        if check.needs_additional_scopes {
            return self
                .begin_reconsent(
                    pending.provider,
                    &account.id,
                    check.missing_scopes,
                    pending.redirect_url,
                )
                .await;
        }

        self.scopes
            .update_account_scopes(&account.id, &pending.identity.tokens.scopes)
            .await?;
        let session = self
            .sessions
            .issue_session(&account, Some(&pending.identity.tokens))?;
        Ok(SigninResult::Session {
            account_id: account.id,
            session,
            redirect_url: pending.redirect_url,
        })
    }

    async fn begin_reconsent(
        &self,
        provider: Provider,
        account_id: &str,
        missing_scopes: Vec<String>,
        redirect_url: Option<String>,
    ) -> Result<SigninResult, AppError> {
        let mut requested = self.configured_scopes(provider);
        requested.extend(missing_scopes.iter().cloned());

        let state = Uuid::new_v4().to_string();
        let permission_state = PermissionState::new(
            provider,
            account_id.to_string(),
            "signin".to_string(),
            "reconsent".to_string(),
            requested.clone(),
            redirect_url,
        );
        self.cache
            .store::<PermissionState>()
            .put(&state, &permission_state)
            .await?;

        let authorization_url = self.identity_provider(provider)?.authorization_url(
            &state,
            &requested,
            &self
                .config
                .oauth
                .permission_callback_url(provider.as_str()),
        )?;

        tracing::info!(account_id, ?missing_scopes, "signin requires re-consent");
        Ok(SigninResult::NeedsConsent {
            account_id: account_id.to_string(),
            authorization_url,
            state,
            missing_scopes,
        })
    }

    /// Start an incremental-permission flow for an additional service grant.
    pub async fn begin_permission_flow(
        &self,
        account_id: &str,
        service: &str,
        scope_level: &str,
        redirect_url: Option<String>,
    ) -> Result<BeginFlowResponse, AppError> {
        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or(AppError::UserNotFound)?;
        let AccountKind::OAuth(identity) = &account.kind else {
            return Err(AppError::Validation(
                "Permission flows apply to OAuth accounts only".to_string(),
            ));
        };
        let provider = identity.provider;

        let mut requested = self.configured_scopes(provider);
        requested.extend(provider.scopes_for(service, scope_level)?);

        let state = Uuid::new_v4().to_string();
        let permission_state = PermissionState::new(
            provider,
            account.id.clone(),
            service.to_string(),
            scope_level.to_string(),
            requested.clone(),
            redirect_url,
        );
        self.cache
            .store::<PermissionState>()
            .put(&state, &permission_state)
            .await?;

        let authorization_url = self.identity_provider(provider)?.authorization_url(
            &state,
            &requested,
            &self
                .config
                .oauth
                .permission_callback_url(provider.as_str()),
        )?;

        Ok(BeginFlowResponse {
            authorization_url,
            state,
            provider,
        })
    }

    /// Redeem permission state: the new grant binds to the account recorded
    /// at flow start, never to whatever the provider response says.
    pub async fn complete_permission_callback(
        &self,
        provider: Provider,
        state_token: &str,
        code: &str,
    ) -> Result<PermissionResult, AppError> {
        let permission = self
            .cache
            .store::<PermissionState>()
            .take(state_token)
            .await?
            .ok_or_else(|| {
                AppError::InvalidState("permission state absent or consumed".to_string())
            })?;

        if permission.provider != provider {
            return Err(AppError::InvalidState(
                "state token provider mismatch".to_string(),
            ));
        }
        if permission.is_expired() {
            return Err(AppError::InvalidState(
                "permission state expired".to_string(),
            ));
        }

        let identity = self
            .identity_provider(provider)?
            .exchange_code(
                code,
                &self
                    .config
                    .oauth
                    .permission_callback_url(provider.as_str()),
            )
            .await?;

        let account = self
            .accounts
            .find_by_id(&permission.account_id)
            .await?
            .ok_or(AppError::UserNotFound)?;

        self.scopes
            .update_account_scopes(&account.id, &identity.tokens.scopes)
            .await?;
        let session = self
            .sessions
            .issue_session(&account, Some(&identity.tokens))?;
        tracing::info!(
            account_id = %account.id,
            service = %permission.service,
            "permission grant recorded"
        );
        Ok(PermissionResult {
            account_id: account.id,
            session,
            redirect_url: permission.redirect_url,
        })
    }

    /// Exchange a refresh token for a new session pair. OAuth accounts get
    /// a fresh provider access token via the wrapped provider refresh token.
    pub async fn refresh_session(
        &self,
        account_id: &str,
        refresh_jwt: &str,
    ) -> Result<SessionTokens, AppError> {
        self.sessions
            .verify_request_token(refresh_jwt, account_id, true)?;

        let account = self
            .accounts
            .find_by_id(account_id)
            .await?
            .ok_or(AppError::UserNotFound)?;

        match &account.kind {
            AccountKind::Local(_) => self.sessions.issue_session(&account, None),
            AccountKind::OAuth(identity) => {
                let refresh_data = self
                    .sessions
                    .codec()
                    .verify_oauth_refresh(refresh_jwt)?;
                let tokens = self
                    .identity_provider(identity.provider)?
                    .refresh_access_token(&refresh_data.provider_refresh_token)
                    .await?;
                self.sessions.issue_session(&account, Some(&tokens))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MemoryAccountStore;
    use crate::auth::jwt::TokenCodec;
    use crate::auth::oauth::providers::{ProviderIdentity, ProviderTokens};
    use crate::config::JwtConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockIdentityProvider {
        provider: Provider,
        identity: Mutex<ProviderIdentity>,
    }

    impl MockIdentityProvider {
        fn new(provider: Provider, identity: ProviderIdentity) -> Self {
            Self {
                provider,
                identity: Mutex::new(identity),
            }
        }

        fn set_identity(&self, identity: ProviderIdentity) {
            *self.identity.lock().unwrap() = identity;
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
                scopes.join("+")
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
            _refresh_token: &str,
        ) -> Result<ProviderTokens, AppError> {
            Ok(ProviderTokens {
                access_token: "refreshed-access".to_string(),
                refresh_token: Some("refreshed-refresh".to_string()),
                scopes: vec![],
            })
        }
    }

    fn test_identity(scopes: &[&str]) -> ProviderIdentity {
        ProviderIdentity {
            provider_user_id: "g-123".to_string(),
            email: "user@example.com".to_string(),
            name: Some("Test User".to_string()),
            image_url: None,
            tokens: ProviderTokens {
                access_token: "provider-access".to_string(),
                refresh_token: Some("provider-refresh".to_string()),
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    struct TestSetup {
        coordinator: OAuthFlowCoordinator,
        accounts: Arc<MemoryAccountStore>,
        mock: Arc<MockIdentityProvider>,
    }

    fn setup() -> TestSetup {
        let config = Arc::new(Config::default());
        let accounts = Arc::new(MemoryAccountStore::new());
        let cache = Arc::new(CacheManager::new_memory());
        let codec = TokenCodec::new(&JwtConfig {
            secret: "test-secret-key-for-unit-tests".to_string(),
            algorithm: "HS256".to_string(),
            access_token_ttl: 3600,
            refresh_token_ttl: 604800,
        })
        .unwrap();
        let sessions = Arc::new(SessionService::new(Arc::new(codec)));

        let mock = Arc::new(MockIdentityProvider::new(
            Provider::Google,
            test_identity(&["openid", "email", "profile"]),
        ));
        let mut providers: HashMap<Provider, Arc<dyn IdentityProvider>> = HashMap::new();
        providers.insert(Provider::Google, mock.clone());

        let coordinator = OAuthFlowCoordinator::new(
            config,
            accounts.clone(),
            cache,
            sessions,
            providers,
        );
        TestSetup {
            coordinator,
            accounts,
            mock,
        }
    }

    async fn signup(setup: &TestSetup) -> SignupResult {
        let begin = setup
            .coordinator
            .begin_oauth_flow(Provider::Google, AuthType::SignUp, None)
            .await
            .unwrap();
        let outcome = setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await
            .unwrap();
        let CallbackOutcome::SignUpPending { pending_token, .. } = outcome else {
            panic!("expected signup pending");
        };
        setup.coordinator.finish_signup(&pending_token).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let setup = setup();
        let result = setup
            .coordinator
            .begin_oauth_flow(Provider::Facebook, AuthType::SignUp, None)
            .await;
        assert!(matches!(result, Err(AppError::InvalidProvider(_))));
    }

    #[tokio::test]
    async fn test_state_token_single_redemption() {
        let setup = setup();
        let begin = setup
            .coordinator
            .begin_oauth_flow(Provider::Google, AuthType::SignUp, None)
            .await
            .unwrap();
        assert!(begin.authorization_url.contains(&begin.state));

        setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await
            .unwrap();

        // Replay of the same state token
        let replay = setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await;
        assert!(matches!(replay, Err(AppError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_callback_provider_mismatch_consumes_state() {
        let setup = setup();
        let begin = setup
            .coordinator
            .begin_oauth_flow(Provider::Google, AuthType::SignUp, None)
            .await
            .unwrap();

        let mismatch = setup
            .coordinator
            .complete_oauth_callback(Provider::Facebook, &begin.state, "code")
            .await;
        assert!(matches!(mismatch, Err(AppError::InvalidState(_))));

        // The mismatched redemption burned the token
        let retry = setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await;
        assert!(matches!(retry, Err(AppError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_signup_creates_account_and_session() {
        let setup = setup();
        let result = signup(&setup).await;

        let account = setup
            .accounts
            .find_by_id(&result.account_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.email, "user@example.com");
        assert!(matches!(account.kind, AccountKind::OAuth(_)));
        assert!(!result.session.access_token.is_empty());
    }

    #[tokio::test]
    async fn test_signup_pending_token_single_use() {
        let setup = setup();
        let begin = setup
            .coordinator
            .begin_oauth_flow(Provider::Google, AuthType::SignUp, None)
            .await
            .unwrap();
        let outcome = setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await
            .unwrap();
        let CallbackOutcome::SignUpPending { pending_token, .. } = outcome else {
            panic!("expected signup pending");
        };

        setup.coordinator.finish_signup(&pending_token).await.unwrap();
        // Browser retry of the signup POST
        let replay = setup.coordinator.finish_signup(&pending_token).await;
        assert!(matches!(replay, Err(AppError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_signup_existing_email_conflicts() {
        let setup = setup();
        signup(&setup).await;

        let begin = setup
            .coordinator
            .begin_oauth_flow(Provider::Google, AuthType::SignUp, None)
            .await
            .unwrap();
        let outcome = setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await
            .unwrap();
        let CallbackOutcome::SignUpPending { pending_token, .. } = outcome else {
            panic!("expected signup pending");
        };

        let result = setup.coordinator.finish_signup(&pending_token).await;
        assert!(matches!(result, Err(AppError::UserExists)));
    }

    #[tokio::test]
    async fn test_signin_unknown_account() {
        let setup = setup();
        let begin = setup
            .coordinator
            .begin_oauth_flow(Provider::Google, AuthType::SignIn, None)
            .await
            .unwrap();
        let outcome = setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await
            .unwrap();
        let CallbackOutcome::SignInPending { pending_token, .. } = outcome else {
            panic!("expected signin pending");
        };

        let result = setup.coordinator.finish_signin(&pending_token).await;
        assert!(matches!(result, Err(AppError::UserNotFound)));
    }

    #[tokio::test]
    async fn test_signin_happy_path() {
        let setup = setup();
        let created = signup(&setup).await;

        let begin = setup
            .coordinator
            .begin_oauth_flow(
                Provider::Google,
                AuthType::SignIn,
                Some("/dashboard".to_string()),
            )
            .await
            .unwrap();
        let outcome = setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await
            .unwrap();
        let CallbackOutcome::SignInPending {
            pending_token,
            redirect_url,
        } = outcome
        else {
            panic!("expected signin pending");
        };
        assert_eq!(redirect_url.as_deref(), Some("/dashboard"));

        let result = setup.coordinator.finish_signin(&pending_token).await.unwrap();
        let SigninResult::Session {
            account_id,
            redirect_url,
            ..
        } = result
        else {
            panic!("expected a session");
        };
        assert_eq!(account_id, created.account_id);
        assert_eq!(redirect_url.as_deref(), Some("/dashboard"));
    }

    #[tokio::test]
    async fn test_signin_missing_scope_short_circuits_to_reconsent() {
        let setup = setup();

        // First consent included a drive grant
        setup.mock.set_identity(test_identity(&[
            "openid",
            "https://www.googleapis.com/auth/drive.readonly",
        ]));
        let created = signup(&setup).await;

        // A later signin token no longer carries it
        setup.mock.set_identity(test_identity(&["openid", "email"]));
        let begin = setup
            .coordinator
            .begin_oauth_flow(Provider::Google, AuthType::SignIn, None)
            .await
            .unwrap();
        let outcome = setup
            .coordinator
            .complete_oauth_callback(Provider::Google, &begin.state, "code")
            .await
            .unwrap();
        let CallbackOutcome::SignInPending { pending_token, .. } = outcome else {
            panic!("expected signin pending");
        };

        let result = setup.coordinator.finish_signin(&pending_token).await.unwrap();
        let SigninResult::NeedsConsent {
            account_id,
            authorization_url,
            state,
            missing_scopes,
        } = result
        else {
            panic!("expected re-consent");
        };
        assert_eq!(account_id, created.account_id);
        assert_eq!(
            missing_scopes,
            vec!["https://www.googleapis.com/auth/drive.readonly".to_string()]
        );
        assert!(authorization_url.contains(&state));
        assert!(authorization_url.contains("drive.readonly"));

        // Completing re-consent binds the grant to the recorded account
        setup.mock.set_identity(test_identity(&[
            "openid",
            "https://www.googleapis.com/auth/drive.readonly",
        ]));
        let permission = setup
            .coordinator
            .complete_permission_callback(Provider::Google, &state, "code")
            .await
            .unwrap();
        assert_eq!(permission.account_id, created.account_id);
    }

    #[tokio::test]
    async fn test_permission_flow_roundtrip() {
        let setup = setup();
        let created = signup(&setup).await;

        let begin = setup
            .coordinator
            .begin_permission_flow(&created.account_id, "drive", "readonly", None)
            .await
            .unwrap();
        assert!(begin
            .authorization_url
            .contains("https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fdrive.readonly")
            || begin.authorization_url.contains("drive.readonly"));

        setup.mock.set_identity(test_identity(&[
            "openid",
            "https://www.googleapis.com/auth/drive.readonly",
        ]));
        let result = setup
            .coordinator
            .complete_permission_callback(Provider::Google, &begin.state, "code")
            .await
            .unwrap();
        assert_eq!(result.account_id, created.account_id);

        // The grant landed in the additive history
        let account = setup
            .accounts
            .find_by_id(&created.account_id)
            .await
            .unwrap()
            .unwrap();
        let AccountKind::OAuth(identity) = account.kind else {
            panic!("expected OAuth account");
        };
        assert!(identity
            .granted_scopes
            .contains(&"https://www.googleapis.com/auth/drive.readonly".to_string()));

        // Permission state is single-use too
        let replay = setup
            .coordinator
            .complete_permission_callback(Provider::Google, &begin.state, "code")
            .await;
        assert!(matches!(replay, Err(AppError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_permission_flow_rejects_local_account() {
        let setup = setup();
        let account = setup
            .accounts
            .create(&Account::new_local(
                "local@example.com",
                None,
                "hash".to_string(),
            ))
            .await
            .unwrap();

        let result = setup
            .coordinator
            .begin_permission_flow(&account.id, "drive", "readonly", None)
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_refresh_session_oauth() {
        let setup = setup();
        let created = signup(&setup).await;

        let refreshed = setup
            .coordinator
            .refresh_session(&created.account_id, &created.session.refresh_token)
            .await
            .unwrap();

        let data = setup
            .coordinator
            .sessions
            .codec()
            .verify_oauth(&refreshed.access_token)
            .unwrap();
        assert_eq!(data.provider_access_token, "refreshed-access");
    }

    #[tokio::test]
    async fn test_refresh_session_rejects_foreign_token() {
        let setup = setup();
        let created = signup(&setup).await;

        let result = setup
            .coordinator
            .refresh_session("other-account", &created.session.refresh_token)
            .await;
        assert!(matches!(result, Err(AppError::AuthFailed(_))));
    }
}
