//! HTTP surface for the authentication flows.
//!
//! Session-issuing endpoints set the path-scoped cookies and also return the
//! token pair in the body for clients that do not use cookies.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use crate::auth::oauth::{AuthType, CallbackOutcome, Provider, SigninResult};
use crate::auth::session::{ACCESS_COOKIE, REFRESH_COOKIE, SessionTokens};
use crate::auth::{LocalAuthOutcome, SessionService};
use crate::error::AppError;
use crate::server::Server;

pub fn create_auth_routes() -> Router<Server> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/signup", post(finish_signup))
        .route("/auth/signin", post(finish_signin))
        .route("/auth/two-factor", post(verify_two_factor))
        .route("/auth/password-reset/request", post(request_password_reset))
        .route("/auth/password-reset", post(reset_password))
        .route(
            "/auth/email-verification/request",
            post(request_email_verification),
        )
        .route("/auth/email-verification", post(verify_email))
        .route(
            "/auth/permission/{provider}/callback",
            get(permission_callback),
        )
        .route("/auth/{provider}", get(begin_oauth))
        .route("/auth/{provider}/callback", get(oauth_callback))
        .route("/{account_id}/permission", post(begin_permission))
        .route("/{account_id}/two-factor/setup", get(two_factor_setup))
        .route("/{account_id}/two-factor/enable", post(enable_two_factor))
        .route("/{account_id}/account/refreshToken", post(refresh_session))
}

#[derive(Debug, Deserialize)]
struct BeginOAuthQuery {
    auth_type: AuthType,
    redirect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    state: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct PendingTokenRequest {
    pending_token: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    identifier: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    username: Option<String>,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TwoFactorRequest {
    temp_token: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct EnableTwoFactorRequest {
    secret: String,
    code: String,
}

#[derive(Debug, Deserialize)]
struct PasswordResetRequest {
    email: String,
}

#[derive(Debug, Deserialize)]
struct ResetPasswordRequest {
    token: String,
    new_password: String,
}

#[derive(Debug, Deserialize)]
struct EmailVerificationRequest {
    account_id: String,
}

#[derive(Debug, Deserialize)]
struct VerifyEmailRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
struct PermissionRequest {
    service: String,
    scope_level: String,
    redirect_url: Option<String>,
}

/// Set-Cookie pair plus a JSON body carrying the same tokens.
fn session_response(
    sessions: &SessionService,
    account_id: &str,
    tokens: &SessionTokens,
    mut body: serde_json::Value,
) -> Response {
    let (access, refresh) = sessions.session_cookies(account_id, tokens);
    if let Some(map) = body.as_object_mut() {
        map.insert("access_token".to_string(), json!(tokens.access_token));
        map.insert("refresh_token".to_string(), json!(tokens.refresh_token));
    }
    (
        AppendHeaders([
            (header::SET_COOKIE, access.to_string()),
            (header::SET_COOKIE, refresh.to_string()),
        ]),
        Json(body),
    )
        .into_response()
}

/// Bearer header first, then the named cookie.
fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Result<String, AppError> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Ok(token.to_string());
        }
    }
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some(value) = pair.trim().strip_prefix(cookie_name) {
                if let Some(value) = value.strip_prefix('=') {
                    return Ok(value.to_string());
                }
            }
        }
    }
    Err(AppError::AuthFailed("missing credentials".to_string()))
}

async fn begin_oauth(
    State(server): State<Server>,
    Path(provider): Path<String>,
    Query(query): Query<BeginOAuthQuery>,
) -> Result<Response, AppError> {
    let provider: Provider = provider.parse()?;
    if query.auth_type == AuthType::Permission {
        return Err(AppError::Validation(
            "Permission flows start from the account's permission endpoint".to_string(),
        ));
    }
    let response = server
        .oauth
        .begin_oauth_flow(provider, query.auth_type, query.redirect_url)
        .await?;
    Ok(Json(response).into_response())
}

async fn oauth_callback(
    State(server): State<Server>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, AppError> {
    let provider: Provider = provider.parse()?;
    let outcome = server
        .oauth
        .complete_oauth_callback(provider, &query.state, &query.code)
        .await?;
    let body = match outcome {
        CallbackOutcome::SignUpPending {
            pending_token,
            redirect_url,
        } => json!({
            "flow": "signup",
            "pending_token": pending_token,
            "redirect_url": redirect_url,
        }),
        CallbackOutcome::SignInPending {
            pending_token,
            redirect_url,
        } => json!({
            "flow": "signin",
            "pending_token": pending_token,
            "redirect_url": redirect_url,
        }),
    };
    Ok(Json(body).into_response())
}

async fn finish_signup(
    State(server): State<Server>,
    Json(request): Json<PendingTokenRequest>,
) -> Result<Response, AppError> {
    let result = server.oauth.finish_signup(&request.pending_token).await?;
    Ok(session_response(
        &server.sessions,
        &result.account_id,
        &result.session,
        json!({
            "account_id": result.account_id,
            "redirect_url": result.redirect_url,
        }),
    ))
}

async fn finish_signin(
    State(server): State<Server>,
    Json(request): Json<PendingTokenRequest>,
) -> Result<Response, AppError> {
    match server.oauth.finish_signin(&request.pending_token).await? {
        SigninResult::Session {
            account_id,
            session,
            redirect_url,
        } => Ok(session_response(
            &server.sessions,
            &account_id,
            &session,
            json!({
                "account_id": account_id,
                "redirect_url": redirect_url,
            }),
        )),
        SigninResult::NeedsConsent {
            account_id,
            authorization_url,
            state,
            missing_scopes,
        } => Ok(Json(json!({
            "needs_consent": true,
            "account_id": account_id,
            "authorization_url": authorization_url,
            "state": state,
            "missing_scopes": missing_scopes,
        }))
        .into_response()),
    }
}

async fn login(
    State(server): State<Server>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AppError> {
    match server
        .local_auth
        .authenticate(&request.identifier, &request.password)
        .await?
    {
        LocalAuthOutcome::Authenticated(account) => {
            let session = server.sessions.issue_session(&account, None)?;
            Ok(session_response(
                &server.sessions,
                &account.id,
                &session,
                json!({ "account_id": account.id }),
            ))
        }
        LocalAuthOutcome::TwoFactorRequired { temp_token } => Ok(Json(json!({
            "two_factor_required": true,
            "temp_token": temp_token,
        }))
        .into_response()),
    }
}

async fn register(
    State(server): State<Server>,
    Json(request): Json<RegisterRequest>,
) -> Result<Response, AppError> {
    let account = server
        .local_auth
        .register(&request.email, request.username, &request.password)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "account_id": account.id,
            "status": account.status,
        })),
    )
        .into_response())
}

async fn verify_two_factor(
    State(server): State<Server>,
    Json(request): Json<TwoFactorRequest>,
) -> Result<Response, AppError> {
    let success = server
        .two_factor
        .verify_two_factor(&request.temp_token, &request.code)
        .await?;
    let session = server.sessions.issue_session(&success.account, None)?;
    Ok(session_response(
        &server.sessions,
        &success.account.id,
        &session,
        json!({
            "account_id": success.account.id,
            "backup_codes_remaining": success.backup_codes_remaining,
        }),
    ))
}

async fn two_factor_setup(
    State(server): State<Server>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let token = extract_token(&headers, ACCESS_COOKIE)?;
    server
        .sessions
        .verify_request_token(&token, &account_id, false)?;
    Ok(Json(json!({
        "secret": crate::auth::TwoFactorService::generate_secret(),
    }))
    .into_response())
}

async fn enable_two_factor(
    State(server): State<Server>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<EnableTwoFactorRequest>,
) -> Result<Response, AppError> {
    let token = extract_token(&headers, ACCESS_COOKIE)?;
    server
        .sessions
        .verify_request_token(&token, &account_id, false)?;
    let backup_codes = server
        .two_factor
        .enable_two_factor(&account_id, &request.secret, &request.code)
        .await?;
    Ok(Json(json!({ "backup_codes": backup_codes })).into_response())
}

async fn request_password_reset(
    State(server): State<Server>,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Response, AppError> {
    server.local_auth.request_password_reset(&request.email).await?;
    // Identical response whether or not the email is known
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response())
}

async fn reset_password(
    State(server): State<Server>,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<Response, AppError> {
    server
        .local_auth
        .reset_password(&request.token, &request.new_password)
        .await?;
    Ok(Json(json!({ "status": "ok" })).into_response())
}

async fn request_email_verification(
    State(server): State<Server>,
    Json(request): Json<EmailVerificationRequest>,
) -> Result<Response, AppError> {
    server
        .local_auth
        .request_email_verification(&request.account_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response())
}

async fn verify_email(
    State(server): State<Server>,
    Json(request): Json<VerifyEmailRequest>,
) -> Result<Response, AppError> {
    server.local_auth.verify_email(&request.token).await?;
    Ok(Json(json!({ "status": "verified" })).into_response())
}

async fn begin_permission(
    State(server): State<Server>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PermissionRequest>,
) -> Result<Response, AppError> {
    let token = extract_token(&headers, ACCESS_COOKIE)?;
    server
        .sessions
        .verify_request_token(&token, &account_id, false)?;
    let response = server
        .oauth
        .begin_permission_flow(
            &account_id,
            &request.service,
            &request.scope_level,
            request.redirect_url,
        )
        .await?;
    Ok(Json(response).into_response())
}

async fn permission_callback(
    State(server): State<Server>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, AppError> {
    let provider: Provider = provider.parse()?;
    let result = server
        .oauth
        .complete_permission_callback(provider, &query.state, &query.code)
        .await?;
    Ok(session_response(
        &server.sessions,
        &result.account_id,
        &result.session,
        json!({
            "account_id": result.account_id,
            "redirect_url": result.redirect_url,
        }),
    ))
}

async fn refresh_session(
    State(server): State<Server>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let token = extract_token(&headers, REFRESH_COOKIE)?;
    let session = server.oauth.refresh_session(&account_id, &token).await?;
    Ok(session_response(
        &server.sessions,
        &account_id,
        &session,
        json!({ "account_id": account_id }),
    ))
}
