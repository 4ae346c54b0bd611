use axum::{extract::State, Json};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::{prelude::*, PgConnection};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    auth::{password, AuthenticatedUser},
    error::{AppError, AppResult},
    models::{Company, NewRefreshToken, RefreshToken, User},
    routes::users::{to_user_response, UserResponse},
    schema::{companies, refresh_tokens, users},
    state::AppState,
};

use crate::schema::refresh_tokens::dsl as refresh_dsl;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub mobile: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    pub user: UserResponse,
}

#[derive(Serialize)]
pub struct TokenPairResponse {
    pub access: String,
    pub refresh: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Deserialize, Default)]
pub struct LogoutRequest {
    pub refresh: Option<String>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    if payload.mobile.trim().is_empty() || payload.password.is_empty() {
        return Err(AppError::bad_request("mobile number and password required"));
    }

    let mut conn = state.db()?;

    let user: User = match users::table
        .filter(users::mobile.eq(payload.mobile.trim()))
        .first(&mut conn)
    {
        Ok(user) => user,
        Err(diesel::result::Error::NotFound) => return Err(AppError::unauthorized()),
        Err(err) => return Err(AppError::from(err)),
    };

    let valid = password::verify_password(&payload.password, &user.password_hash)
        .map_err(|_| AppError::unauthorized())?;
    if !valid {
        return Err(AppError::unauthorized());
    }

    if !user.is_active {
        return Err(AppError::forbidden("account is disabled"));
    }

    let access = state.jwt.generate_token(&user).map_err(AppError::from)?;
    let refresh = issue_refresh_token(&state, &mut conn, user.id)?;

    let company_name = load_company_name(&mut conn, user.company_id)?;
    Ok(Json(LoginResponse {
        access,
        refresh,
        user: to_user_response(user, company_name),
    }))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<TokenPairResponse>> {
    let hashed = hash_refresh_token(&payload.refresh);
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();

    let token = match refresh_dsl::refresh_tokens
        .filter(refresh_dsl::token_hash.eq(&hashed))
        .filter(refresh_dsl::revoked_at.is_null())
        .filter(refresh_dsl::expires_at.gt(now))
        .first::<RefreshToken>(&mut conn)
    {
        Ok(token) => token,
        Err(diesel::result::Error::NotFound) => return Err(AppError::unauthorized()),
        Err(err) => return Err(AppError::from(err)),
    };

    diesel::update(refresh_dsl::refresh_tokens.filter(refresh_dsl::id.eq(token.id)))
        .set((
            refresh_dsl::revoked_at.eq(now),
            refresh_dsl::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    let user: User = users::table
        .find(token.user_id)
        .first(&mut conn)
        .map_err(AppError::from)?;

    if !user.is_active {
        return Err(AppError::forbidden("account is disabled"));
    }

    let access = state.jwt.generate_token(&user).map_err(AppError::from)?;
    let refresh = issue_refresh_token(&state, &mut conn, user.id)?;

    Ok(Json(TokenPairResponse { access, refresh }))
}

/// Revocation is best effort; a stale or unknown token still logs out.
pub async fn logout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    payload: Option<Json<LogoutRequest>>,
) -> AppResult<Json<Value>> {
    let now = Utc::now().naive_utc();

    if let Ok(mut conn) = state.db() {
        let refresh = payload.and_then(|Json(body)| body.refresh);
        if let Some(value) = refresh {
            let hashed = hash_refresh_token(&value);
            let _ = diesel::update(
                refresh_dsl::refresh_tokens
                    .filter(refresh_dsl::token_hash.eq(hashed))
                    .filter(refresh_dsl::user_id.eq(user.user_id))
                    .filter(refresh_dsl::revoked_at.is_null()),
            )
            .set((
                refresh_dsl::revoked_at.eq(now),
                refresh_dsl::updated_at.eq(now),
            ))
            .execute(&mut conn);
        }
    }

    Ok(Json(json!({ "message": "logged out successfully" })))
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserResponse>> {
    let mut conn = state.db()?;
    let row: User = users::table.find(user.user_id).first(&mut conn)?;
    let company_name = load_company_name(&mut conn, row.company_id)?;
    Ok(Json(to_user_response(row, company_name)))
}

fn issue_refresh_token(
    state: &AppState,
    conn: &mut PgConnection,
    user_id: Uuid,
) -> AppResult<String> {
    let now = Utc::now();
    let value = generate_refresh_token();
    let expires_at = now + ChronoDuration::days(state.config.refresh_token_expiry_days);

    let new_refresh = NewRefreshToken {
        id: Uuid::new_v4(),
        user_id,
        token_hash: hash_refresh_token(&value),
        issued_at: now.naive_utc(),
        expires_at: expires_at.naive_utc(),
    };

    diesel::insert_into(refresh_tokens::table)
        .values(&new_refresh)
        .execute(conn)?;

    Ok(value)
}

fn load_company_name(
    conn: &mut PgConnection,
    company_id: Option<Uuid>,
) -> AppResult<Option<String>> {
    let Some(company_id) = company_id else {
        return Ok(None);
    };
    let company: Company = companies::table.find(company_id).first(conn)?;
    Ok(Some(company.name))
}

fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
