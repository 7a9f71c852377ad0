//! Authentication: token codec, OAuth flows, local credentials, two-factor,
//! scope reconciliation, and session issuance.

pub mod jwt;
pub mod local;
pub mod oauth;
pub mod scopes;
pub mod session;
pub mod two_factor;

pub use jwt::{SessionClaims, TokenCodec, TokenCodecHealthChecker};
pub use local::{LocalAuthOutcome, LocalAuthenticator, Mailer, TracingMailer};
pub use scopes::{ScopeCheck, ScopeReconciler};
pub use session::{SessionService, SessionTokens, VerifiedToken};
pub use two_factor::{TwoFactorService, TwoFactorSuccess};
