pub mod flows;
pub mod providers;
pub mod state;

pub use flows::{
    BeginFlowResponse, CallbackOutcome, OAuthFlowCoordinator, PermissionResult, SigninResult,
    SignupResult,
};
pub use providers::{
    IdentityProvider, OAuth2IdentityProvider, Provider, ProviderIdentity, ProviderTokens,
    initialize_identity_providers,
};
pub use state::{AuthType, OAuthFlowState, PermissionState, SignInPendingState, SignUpPendingState};
