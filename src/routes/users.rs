use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use diesel::{prelude::*, result::DatabaseErrorKind, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::access::{self, ROLE_USER};
use crate::auth::{password, AuthenticatedUser};
use crate::error::{AppError, AppResult};
use crate::models::{Company, NewUser, User};
use crate::schema::{companies, users};
use crate::state::AppState;

pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub mobile: String,
    pub username: String,
    pub company: Option<Uuid>,
    pub company_name: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub mobile: String,
    pub password: String,
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub mobile: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

/// The login name is derived from the company and the mobile number at
/// creation time and never recomputed afterwards.
pub fn derive_username(company_name: &str, mobile: &str) -> String {
    let company = company_name.to_lowercase().replace(' ', "");
    format!("{company}@{mobile}")
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<UserResponse>>> {
    access::require_company_admin(&user)?;

    let Some(company_id) = user.company_id else {
        return Ok(Json(vec![]));
    };

    let mut conn = state.db()?;
    let company: Company = companies::table.find(company_id).first(&mut conn)?;
    let rows: Vec<User> = users::table
        .filter(users::company_id.eq(company_id))
        .order(users::mobile.asc())
        .load(&mut conn)?;

    let response = rows
        .into_iter()
        .map(|row| to_user_response(row, Some(company.name.clone())))
        .collect();

    Ok(Json(response))
}

pub async fn create_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    access::require_company_admin(&user)?;
    let company_id = access::require_company(&user)?;

    let mobile = payload.mobile.trim().to_string();
    if mobile.is_empty() {
        return Err(AppError::bad_request("mobile number is required"));
    }
    if payload.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AppError::bad_request(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    let role = payload.role.unwrap_or_else(|| ROLE_USER.to_string());
    if !access::is_valid_role(&role) {
        return Err(AppError::bad_request(format!("invalid role '{role}'")));
    }

    let mut conn = state.db()?;
    let company: Company = companies::table.find(company_id).first(&mut conn)?;

    let new_user = NewUser {
        id: Uuid::new_v4(),
        company_id: Some(company_id),
        role,
        username: derive_username(&company.name, &mobile),
        mobile,
        password_hash: password::hash_password(&payload.password)?,
        is_active: true,
    };

    match diesel::insert_into(users::table)
        .values(&new_user)
        .execute(&mut conn)
    {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(AppError::bad_request("mobile number already in use"));
        }
        Err(err) => return Err(AppError::from(err)),
    }

    let created: User = users::table.find(new_user.id).first(&mut conn)?;
    info!(user_id = %created.id, company_id = %company_id, "user created");

    Ok((
        StatusCode::CREATED,
        Json(to_user_response(created, Some(company.name))),
    ))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserResponse>> {
    access::require_company_admin(&user)?;
    let company_id = access::require_company(&user)?;

    let mut conn = state.db()?;
    let target = find_company_user(&mut conn, company_id, user_id)?;
    access::ensure_same_company(&user, target.company_id)?;

    let company: Company = companies::table.find(company_id).first(&mut conn)?;
    Ok(Json(to_user_response(target, Some(company.name))))
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateUserRequest>,
) -> AppResult<Json<UserResponse>> {
    access::require_company_admin(&user)?;
    let company_id = access::require_company(&user)?;

    let mut conn = state.db()?;
    let target = find_company_user(&mut conn, company_id, user_id)?;
    access::ensure_same_company(&user, target.company_id)?;

    let mobile = match payload.mobile {
        Some(ref value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(AppError::bad_request("mobile number must not be empty"));
            }
            Some(trimmed.to_string())
        }
        None => None,
    };

    if let Some(ref role) = payload.role {
        if !access::is_valid_role(role) {
            return Err(AppError::bad_request(format!("invalid role '{role}'")));
        }
    }

    if mobile.is_none() && payload.role.is_none() && payload.is_active.is_none() {
        let company: Company = companies::table.find(company_id).first(&mut conn)?;
        return Ok(Json(to_user_response(target, Some(company.name))));
    }

    let changeset = UpdateUserChangeset {
        mobile: mobile.as_deref(),
        role: payload.role.as_deref(),
        is_active: payload.is_active,
        updated_at: Utc::now().naive_utc(),
    };

    match diesel::update(users::table.find(target.id))
        .set(&changeset)
        .execute(&mut conn)
    {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            return Err(AppError::bad_request("mobile number already in use"));
        }
        Err(err) => return Err(AppError::from(err)),
    }

    let updated: User = users::table.find(target.id).first(&mut conn)?;
    let company: Company = companies::table.find(company_id).first(&mut conn)?;
    Ok(Json(to_user_response(updated, Some(company.name))))
}

pub async fn deactivate_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<StatusCode> {
    access::require_company_admin(&user)?;
    let company_id = access::require_company(&user)?;

    let mut conn = state.db()?;
    let target = find_company_user(&mut conn, company_id, user_id)?;
    access::ensure_same_company(&user, target.company_id)?;

    // Admins may deactivate themselves but not a fellow admin.
    if target.role == access::ROLE_COMPANY_ADMIN && target.id != user.user_id {
        return Err(AppError::forbidden("cannot deactivate another company admin"));
    }

    diesel::update(users::table.find(target.id))
        .set((
            users::is_active.eq(false),
            users::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    info!(user_id = %target.id, company_id = %company_id, "user deactivated");
    Ok(StatusCode::NO_CONTENT)
}

fn find_company_user(
    conn: &mut PgConnection,
    company_id: Uuid,
    user_id: Uuid,
) -> AppResult<User> {
    users::table
        .filter(users::id.eq(user_id))
        .filter(users::company_id.eq(company_id))
        .first(conn)
        .map_err(AppError::from)
}

#[derive(AsChangeset)]
#[diesel(table_name = users)]
struct UpdateUserChangeset<'a> {
    mobile: Option<&'a str>,
    role: Option<&'a str>,
    is_active: Option<bool>,
    updated_at: chrono::NaiveDateTime,
}

pub(crate) fn to_user_response(user: User, company_name: Option<String>) -> UserResponse {
    UserResponse {
        id: user.id,
        mobile: user.mobile,
        username: user.username,
        company: user.company_id,
        company_name,
        role: user.role,
        is_active: user.is_active,
        created_at: super::documents::to_iso(user.created_at),
    }
}
