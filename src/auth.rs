use crate::api::ApiError;
use crate::models::User;
use crate::settings::Settings;
use crate::staging::Pipeline;
use crate::store::Store;
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 6;
const MAX_USERNAME_LEN: usize = 32;

// ── Request/response types ─────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserResponse,
}

/// What clients get to see of a user. Never the hash.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub guest: bool,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        UserResponse {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            guest: user.guest,
        }
    }
}

// ── JWT ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,        // user id
    pub username: String,
    pub exp: usize,       // expiry timestamp
    pub iat: usize,       // issued at
}

/// The authenticated caller. Passed explicitly into every store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub username: String,
}

// ── Shared state ───────────────────────────────────────────────

pub struct AppState {
    pub store: Store,
    pub pipeline: Pipeline,
    pub settings: Settings,
}

pub type SharedState = Arc<AppState>;

// ── Helpers ────────────────────────────────────────────────────

pub fn create_token(settings: &Settings, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let expiry = now + Duration::minutes(settings.jwt_expiration_in_minutes);

    let claims = Claims {
        sub: user.id,
        username: user.username.clone(),
        exp: expiry.timestamp() as usize,
        iat: now.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
    )
}

pub fn verify_token(settings: &Settings, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// Resolve a bearer token to a session for a user that still exists.
pub fn session_from_token(state: &AppState, token: &str) -> Result<Session, ApiError> {
    let claims = verify_token(&state.settings, token)
        .map_err(|_| ApiError::Unauthorized("Invalid token".to_string()))?;

    let known = state.store.read(|w| w.users.contains_key(&claims.sub));
    if !known {
        return Err(ApiError::Unauthorized("User not found".to_string()));
    }
    Ok(Session { user_id: claims.sub, username: claims.username })
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

fn issue(state: &AppState, user: &User) -> Result<Json<LoginResponse>, ApiError> {
    let token = create_token(&state.settings, user)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(LoginResponse { token, user: UserResponse::from(user) }))
}

// ── Handlers ───────────────────────────────────────────────────

pub async fn register(
    State(state): State<SharedState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<LoginResponse>), ApiError> {
    let username = payload.username.trim().to_lowercase();
    if username.is_empty() || username.len() > MAX_USERNAME_LEN || username.contains(char::is_whitespace) {
        return Err(ApiError::BadRequest("Invalid username".to_string()));
    }
    if payload.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!("Password must be at least {MIN_PASSWORD_LEN} characters")));
    }

    let display_name = payload.display_name
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| username.clone());
    let user = state.store.insert_user(User {
        id: Uuid::new_v4(),
        username,
        display_name,
        password_hash: hash_password(&payload.password)?,
        guest: false,
        created_at: Utc::now(),
    })?;

    Ok((StatusCode::CREATED, issue(&state, &user)?))
}

pub async fn login(
    State(state): State<SharedState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let username = payload.username.trim().to_lowercase();
    let user = state.store.read(|w| w.get_user_by_username(&username).cloned())
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".to_string()))?;

    if !verify_password(&payload.password, &user.password_hash) {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    info!(username = %user.username, "logged in");
    issue(&state, &user)
}

/// A throwaway account with no password. Its token is the only way back in.
pub async fn guest(State(state): State<SharedState>) -> Result<(StatusCode, Json<LoginResponse>), ApiError> {
    let id = Uuid::new_v4();
    let user = state.store.insert_user(User {
        id,
        username: format!("guest-{}", &id.simple().to_string()[..8]),
        display_name: "Guest".to_string(),
        password_hash: String::new(),
        guest: true,
        created_at: Utc::now(),
    })?;

    Ok((StatusCode::CREATED, issue(&state, &user)?))
}

pub async fn logout() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing or invalid token".to_string()))?;

    let session = session_from_token(&state, token)?;
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}
