use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, patch, post, put},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::auth::dto::{
    ChangePasswordRequest, LoginRequest, MessageResponse, RegisterRequest, ThemeUpdateRequest,
    TokenResponse, UpdateProfileRequest, UserResponse,
};
use crate::auth::extractors::{ClientIp, CurrentUser};
use crate::auth::services;
use crate::error::AppError;
use crate::state::AppState;

pub const COOKIE_NAME: &str = "access_token";

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(get_me).put(update_me))
        .route("/auth/me/password", put(change_password))
        .route("/auth/me/theme", patch(change_theme))
}

fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Gate a request on the sliding-window budget for `ip` (optionally scoped
/// to an endpoint tag). Register, login and theme updates share the bare
/// client key with their own budgets; password change uses a tagged key.
fn check_rate_limit(
    state: &AppState,
    ip: &str,
    max_requests: usize,
    window_seconds: u64,
    endpoint: Option<&str>,
) -> Result<(), AppError> {
    let key = match endpoint {
        Some(tag) => format!("{ip}:{tag}"),
        None => ip.to_owned(),
    };
    if state
        .limiter
        .check_and_record(&key, max_requests, Duration::from_secs(window_seconds))
    {
        warn!(ip, endpoint = endpoint.unwrap_or("global"), "rate limit exceeded");
        return Err(AppError::RateLimited);
    }
    Ok(())
}

fn validate_email_field(email: &str) -> Result<(), AppError> {
    if !is_valid_email(email) {
        return Err(AppError::Validation("Invalid email".into()));
    }
    Ok(())
}

fn validate_password_field(password: &str) -> Result<(), AppError> {
    if password.len() < 8 || password.len() > 255 {
        return Err(AppError::Validation(
            "Password must be between 8 and 255 characters".into(),
        ));
    }
    Ok(())
}

fn validate_full_name(full_name: Option<&str>) -> Result<(), AppError> {
    if full_name.is_some_and(|n| n.len() > 255) {
        return Err(AppError::Validation("Full name too long".into()));
    }
    Ok(())
}

fn validate_registration(payload: &RegisterRequest) -> Result<(), AppError> {
    validate_email_field(&payload.email)?;
    if payload.username.len() < 3 || payload.username.len() > 100 {
        return Err(AppError::Validation(
            "Username must be between 3 and 100 characters".into(),
        ));
    }
    validate_password_field(&payload.password)?;
    validate_full_name(payload.full_name.as_deref())
}

fn session_cookie(state: &AppState, token: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(COOKIE_NAME, token);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(state.tokens.default_ttl());
    cookie.set_secure(state.config.is_production());
    cookie
}

#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    check_rate_limit(&state, &ip, 3, 60, None)?;
    validate_registration(&payload)?;

    let user = services::register_user(
        &*state.users,
        &payload.email,
        &payload.username,
        &payload.password,
        payload.full_name,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(user.into())))
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<TokenResponse>), AppError> {
    check_rate_limit(&state, &ip, 5, 60, None)?;

    // Unknown username and wrong password are indistinguishable here.
    let user = services::authenticate_user(&*state.users, &payload.username, &payload.password)
        .await?
        .ok_or_else(|| {
            warn!(username = %payload.username, "login failed");
            AppError::InvalidCredential("Incorrect username or password".into())
        })?;

    let token = services::issue_session(&state.tokens, &user)?;
    let jar = jar.add(session_cookie(&state, token.clone()));

    info!(user_id = %user.id, username = %user.username, "user logged in");
    Ok((jar, Json(TokenResponse::bearer(token))))
}

#[instrument(skip_all)]
pub async fn logout(jar: CookieJar) -> (CookieJar, Json<MessageResponse>) {
    let mut cookie = Cookie::from(COOKIE_NAME);
    cookie.set_path("/");
    let jar = jar.remove(cookie);
    info!("user logged out");
    (
        jar,
        Json(MessageResponse {
            message: "Logged out successfully",
        }),
    )
}

#[instrument(skip_all)]
pub async fn get_me(CurrentUser(user): CurrentUser) -> Json<UserResponse> {
    Json(user.into())
}

#[instrument(skip_all)]
pub async fn update_me(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<UserResponse>, AppError> {
    if let Some(email) = payload.email.as_deref() {
        validate_email_field(email)?;
    }
    validate_full_name(payload.full_name.as_deref())?;

    let updated =
        services::update_profile(&*state.users, &user, payload.email, payload.full_name).await?;
    Ok(Json(updated.into()))
}

#[instrument(skip_all)]
pub async fn change_password(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    check_rate_limit(&state, &ip, 3, 60, Some("password_change"))?;

    validate_password_field(&payload.new_password)?;
    if payload.new_password != payload.confirm_password {
        return Err(AppError::Validation("Passwords do not match".into()));
    }

    services::change_password(
        &*state.users,
        &user,
        &payload.current_password,
        &payload.new_password,
    )
    .await?;

    Ok(Json(MessageResponse {
        message: "Password changed successfully",
    }))
}

#[instrument(skip_all)]
pub async fn change_theme(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<ThemeUpdateRequest>,
) -> Result<Json<UserResponse>, AppError> {
    check_rate_limit(&state, &ip, 10, 60, None)?;

    let updated = services::change_theme(&*state.users, &user, payload.theme_preference).await?;
    Ok(Json(updated.into()))
}
