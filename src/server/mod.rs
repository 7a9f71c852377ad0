use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    account::{AccountStore, MemoryAccountStore},
    auth::{
        LocalAuthenticator, SessionService, TokenCodec, TokenCodecHealthChecker, TracingMailer,
        TwoFactorService,
        oauth::{OAuthFlowCoordinator, initialize_identity_providers},
    },
    cache::CacheManager,
    config::Config,
    error::AppError,
    health::HealthService,
    routes::create_routes,
};

#[derive(Clone)]
pub struct Server {
    pub config: Arc<Config>,
    pub cache: Arc<CacheManager>,
    pub accounts: Arc<dyn AccountStore>,
    pub sessions: Arc<SessionService>,
    pub local_auth: Arc<LocalAuthenticator>,
    pub two_factor: Arc<TwoFactorService>,
    pub oauth: Arc<OAuthFlowCoordinator>,
    pub health_service: Arc<HealthService>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let codec = Arc::new(TokenCodec::new(&config.jwt)?);
        let sessions = Arc::new(SessionService::new(codec.clone()));

        let cache = Arc::new(CacheManager::new_from_config(&config.cache).await?);

        // Account persistence is an external collaborator; the in-memory
        // store backs single-node deployments and tests
        let accounts: Arc<dyn AccountStore> = Arc::new(MemoryAccountStore::new());

        let two_factor = Arc::new(TwoFactorService::new(
            accounts.clone(),
            cache.clone(),
            config.local_auth.two_factor_issuer.clone(),
        ));
        let local_auth = Arc::new(LocalAuthenticator::new(
            accounts.clone(),
            cache.clone(),
            two_factor.clone(),
            Arc::new(TracingMailer),
            config.local_auth.clone(),
        ));

        let providers = initialize_identity_providers(&config)?;
        let config = Arc::new(config);
        let oauth = Arc::new(OAuthFlowCoordinator::new(
            config.clone(),
            accounts.clone(),
            cache.clone(),
            sessions.clone(),
            providers,
        ));

        let health_service = Arc::new(HealthService::new());
        health_service.register(cache.clone()).await;
        health_service
            .register(Arc::new(TokenCodecHealthChecker::new(codec)))
            .await;

        Ok(Self {
            config,
            cache,
            accounts,
            sessions,
            local_auth,
            two_factor,
            oauth,
            health_service,
        })
    }

    pub fn create_app(&self) -> Router {
        create_routes(self.clone())
    }

    pub async fn run(self) -> Result<(), AppError> {
        let sweeper = self.cache.spawn_sweeper();

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| AppError::Internal(format!("Invalid server address: {e}")))?;
        let app = self.create_app();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to bind {addr}: {e}")))?;
        info!("listening on {addr}");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| AppError::Internal(format!("Server error: {e}")));

        sweeper.abort();
        result
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install ctrl-c handler");
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_new_with_defaults() {
        let server = Server::new(Config::default()).await.unwrap();
        assert_eq!(server.config.server.port, 3000);

        // Router builds without panicking
        let _app = server.create_app();
    }

    #[tokio::test]
    async fn test_health_checkers_registered() {
        let server = Server::new(Config::default()).await.unwrap();
        let response = server.health_service.check_health().await;
        assert!(response.checks.contains_key("cache"));
        assert!(response.checks.contains_key("jwt"));
    }
}
