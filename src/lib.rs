//! Authentication and session-token service for the workspace APIs.
//!
//! Accounts sign in either with local credentials (Argon2id hashes, lockout,
//! optional TOTP second factor) or through an OAuth provider (Google,
//! Microsoft, Facebook). Sessions are JWTs: local sessions stand alone, OAuth
//! sessions wrap the provider's tokens. Short-lived handshake state such as
//! flow tokens and pending signups lives in a TTL-bounded ephemeral store
//! with single-shot redemption.

pub mod account;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod routes;
pub mod server;

pub use config::Config;
pub use error::AppError;
pub use server::Server;
