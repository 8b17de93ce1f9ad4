use axum::{
    extract::{FromRef, Path, Query, State},
    http::{header::SET_COOKIE, HeaderName, StatusCode},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use time::{macros::format_description, macros::time, Date};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{
            AdminUserQuery, ChangePasswordRequest, ForgotPasswordRequest, LoginRequest,
            ProfileResponse, PublicUser, RegisterRequest, ResetPasswordRequest,
            UpdateUserRequest, UserListResponse,
        },
        repo::{UserFilter, UserSortKey},
        repo_types::User,
        services::{
            clear_session_cookie, generate_one_time_token, hash_password, hash_token,
            is_valid_email, require_admin, require_elevated, session_cookie, verify_password,
            AuthUser, JwtKeys,
        },
    },
    error::ApiError,
    pagination::{total_pages, PageQuery},
    state::AppState,
    tasks::repo_types::Task,
};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/login-status", get(login_status))
        .route("/user", get(get_user).patch(update_user))
        .route("/verify-email", post(verify_email))
        .route("/verify-user/:token", post(verify_user))
        .route("/forgot-password", post(forgot_password))
        .route("/reset-password/:token", post(reset_password))
        .route("/change-password", patch(change_password))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id", delete(delete_user))
        .route("/:user_id/profile", get(user_profile))
}

type SetCookie = [(HeaderName, String); 1];

fn login_response(state: &AppState, user: User) -> Result<(SetCookie, Json<PublicUser>), ApiError> {
    let keys = JwtKeys::from_ref(state);
    let token = keys.sign(user.id).map_err(ApiError::Internal)?;
    let cookie = session_cookie(&token, keys.ttl);
    Ok(([(SET_COOKIE, cookie)], Json(user.into())))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<(StatusCode, SetCookie, Json<PublicUser>), ApiError> {
    payload.email = payload.email.trim().to_lowercase();
    let name = payload.name.trim();

    if name.is_empty() {
        return Err(ApiError::Validation("Name is required".into()));
    }
    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::Validation("Invalid email".into()));
    }
    if payload.password.len() < 6 {
        return Err(ApiError::Validation(
            "Password must be at least 6 characters".into(),
        ));
    }

    if User::find_by_email(&state.db, &payload.email)
        .await
        .map_err(ApiError::Internal)?
        .is_some()
    {
        warn!(email = %payload.email, "email already registered");
        return Err(ApiError::Validation("Email already registered".into()));
    }

    let hash = hash_password(&payload.password).map_err(ApiError::Internal)?;
    let user = User::create(&state.db, name, &payload.email, &hash)
        .await
        .map_err(ApiError::Internal)?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    let (cookie, body) = login_response(&state, user)?;
    Ok((StatusCode::CREATED, cookie, body))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> Result<(SetCookie, Json<PublicUser>), ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    // One message for unknown email and bad password alike.
    let invalid = || ApiError::Auth("Invalid credentials".into());

    let user = User::find_by_email(&state.db, &payload.email)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(invalid)?;

    let ok =
        verify_password(&payload.password, &user.password_hash).map_err(ApiError::Internal)?;
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err(invalid());
    }

    info!(user_id = %user.id, "user logged in");
    login_response(&state, user)
}

#[instrument]
pub async fn logout() -> (SetCookie, Json<Value>) {
    (
        [(SET_COOKIE, clear_session_cookie())],
        Json(json!({ "message": "Logged out" })),
    )
}

/// Always 200. `user` is the caller's profile when the session cookie holds
/// a valid token, `null` otherwise.
pub async fn login_status(
    State(state): State<AppState>,
    auth: Option<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let user = match auth {
        Some(AuthUser(user_id)) => User::find_by_id(&state.db, user_id)
            .await
            .map_err(ApiError::Internal)?
            .map(PublicUser::from),
        None => None,
    };
    Ok(Json(json!({ "user": user })))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, ApiError> {
    let user = User::find_by_id(&state.db, user_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Auth("Invalid or expired token".into()))?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<Json<PublicUser>, ApiError> {
    if let Some(name) = &payload.name {
        if name.trim().is_empty() {
            return Err(ApiError::Validation("Name cannot be empty".into()));
        }
    }
    let user = User::update_profile(&state.db, user_id, payload.name.as_deref().map(str::trim))
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Auth("Invalid or expired token".into()))?;
    Ok(Json(user.into()))
}

#[instrument(skip(state))]
pub async fn verify_email(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let user = User::find_by_id(&state.db, user_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Auth("Invalid or expired token".into()))?;

    if user.email_verified {
        return Err(ApiError::Validation("Email already verified".into()));
    }

    let token = generate_one_time_token();
    User::set_verification_token(&state.db, user.id, &hash_token(&token))
        .await
        .map_err(ApiError::Internal)?;

    let link = format!("{}/verify-user/{}", client_base(&state), token);
    state
        .mailer
        .send(&user.email, "Verify your email", &link)
        .await
        .map_err(ApiError::Internal)?;

    info!(user_id = %user.id, "verification email dispatched");
    Ok(Json(json!({ "message": "Verification email sent" })))
}

#[instrument(skip(state, token))]
pub async fn verify_user(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = User::consume_verification_token(&state.db, &hash_token(&token))
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Auth("Invalid verification token".into()))?;

    info!(user_id = %user.id, "email verified");
    Ok(Json(json!({ "message": "Email verified" })))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    let email = payload.email.trim().to_lowercase();

    // Success-shaped either way, so the endpoint cannot be used to discover
    // which emails are registered.
    if let Some(user) = User::find_by_email(&state.db, &email)
        .await
        .map_err(ApiError::Internal)?
    {
        let token = generate_one_time_token();
        let expires = time::OffsetDateTime::now_utc()
            + time::Duration::minutes(state.config.reset_token_ttl_minutes);
        User::set_reset_token(&state.db, user.id, &hash_token(&token), expires)
            .await
            .map_err(ApiError::Internal)?;

        let link = format!("{}/reset-password/{}", client_base(&state), token);
        state
            .mailer
            .send(&user.email, "Reset your password", &link)
            .await
            .map_err(ApiError::Internal)?;
        info!(user_id = %user.id, "password reset email dispatched");
    }

    Ok(Json(json!({
        "message": "If that email is registered, a reset link has been sent"
    })))
}

#[instrument(skip(state, token, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.password.len() < 6 {
        return Err(ApiError::Validation(
            "Password must be at least 6 characters".into(),
        ));
    }

    let new_hash = hash_password(&payload.password).map_err(ApiError::Internal)?;
    let user = User::consume_reset_token(&state.db, &hash_token(&token), &new_hash)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Auth("Invalid or expired reset token".into()))?;

    info!(user_id = %user.id, "password reset");
    Ok(Json(json!({ "message": "Password reset successfully" })))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.new_password.len() < 6 {
        return Err(ApiError::Validation(
            "Password must be at least 6 characters".into(),
        ));
    }

    let user = User::find_by_id(&state.db, user_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::Auth("Invalid or expired token".into()))?;

    let ok = verify_password(&payload.old_password, &user.password_hash)
        .map_err(ApiError::Internal)?;
    if !ok {
        return Err(ApiError::Auth("Invalid password".into()));
    }

    let new_hash = hash_password(&payload.new_password).map_err(ApiError::Internal)?;
    User::set_password(&state.db, user.id, &new_hash)
        .await
        .map_err(ApiError::Internal)?;

    info!(user_id = %user.id, "password changed");
    Ok(Json(json!({ "message": "Password changed" })))
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(caller_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.db, caller_id).await?;

    let deleted = User::delete_by_id(&state.db, id)
        .await
        .map_err(ApiError::Internal)?;
    if !deleted {
        return Err(ApiError::NotFound("User not found".into()));
    }

    info!(user_id = %id, "user deleted by admin");
    Ok(Json(json!({ "message": "User deleted successfully" })))
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(caller_id): AuthUser,
    Query(q): Query<AdminUserQuery>,
) -> Result<Json<UserListResponse>, ApiError> {
    require_elevated(&state.db, caller_id).await?;

    let filter = UserFilter {
        name: q.name,
        email: q.email,
        role: q.role,
        created_from: q
            .start_date
            .as_deref()
            .map(parse_day)
            .transpose()?
            .map(|d| d.with_time(time!(00:00:00)).assume_utc()),
        created_until: q
            .end_date
            .as_deref()
            .map(parse_day)
            .transpose()?
            .map(|d| d.with_time(time!(23:59:59.999999999)).assume_utc()),
    };
    let sort = UserSortKey::parse(q.sort_by.as_deref());
    let descending = sort_descending(q.sort_by.as_deref(), q.sort_order.as_deref());
    let page = PageQuery {
        page: q.page.unwrap_or(1),
        limit: q.limit.unwrap_or(10),
    }
    .normalized();

    let total = User::count(&state.db, &filter)
        .await
        .map_err(ApiError::Internal)?;
    let users = User::search(
        &state.db,
        &filter,
        sort,
        descending,
        page.limit,
        page.offset(),
    )
    .await
    .map_err(ApiError::Internal)?;

    Ok(Json(UserListResponse {
        total_users: total,
        total_pages: total_pages(total, page.limit),
        current_page: page.page,
        users: users.into_iter().map(PublicUser::from).collect(),
    }))
}

#[instrument(skip(state))]
pub async fn user_profile(
    State(state): State<AppState>,
    AuthUser(caller_id): AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ProfileResponse>, ApiError> {
    require_elevated(&state.db, caller_id).await?;

    let user = User::find_by_id(&state.db, user_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
    let tasks = Task::all_by_owner(&state.db, user_id)
        .await
        .map_err(ApiError::Internal)?;

    Ok(Json(ProfileResponse {
        user: user.into(),
        tasks,
    }))
}

fn client_base(state: &AppState) -> String {
    state
        .config
        .client_url
        .clone()
        .unwrap_or_else(|| "http://localhost:3000".into())
}

/// An explicit `sortBy` sorts ascending unless `sortOrder=desc`; without one
/// the listing falls back to newest-first.
fn sort_descending(sort_by: Option<&str>, sort_order: Option<&str>) -> bool {
    match sort_by {
        Some(_) => sort_order == Some("desc"),
        None => true,
    }
}

/// Inclusive date bounds come in as `YYYY-MM-DD`.
fn parse_day(raw: &str) -> Result<Date, ApiError> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map_err(|_| ApiError::Validation(format!("Invalid date: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_day_accepts_iso_dates_only() {
        assert!(parse_day("2024-03-09").is_ok());
        assert!(parse_day("03/09/2024").is_err());
        assert!(parse_day("yesterday").is_err());
    }

    #[test]
    fn end_date_bound_covers_whole_day() {
        let d = parse_day("2024-03-09").unwrap();
        let until = d.with_time(time!(23:59:59.999999999)).assume_utc();
        let from = d.with_time(time!(00:00:00)).assume_utc();
        assert!(until > from);
        assert_eq!(until.date(), from.date());
    }

    #[test]
    fn explicit_sort_key_defaults_ascending() {
        assert!(!sort_descending(Some("name"), None));
        assert!(!sort_descending(Some("name"), Some("asc")));
        assert!(sort_descending(Some("name"), Some("desc")));
        // No key: newest first.
        assert!(sort_descending(None, None));
        assert!(sort_descending(None, Some("asc")));
    }

    #[tokio::test]
    async fn login_status_without_session_is_null_user() {
        let state = AppState::fake();
        let Json(body) = login_status(State(state), None).await.unwrap();
        assert_eq!(body, json!({ "user": null }));
    }

    #[sqlx::test]
    async fn login_status_with_session_returns_user(pool: sqlx::PgPool) {
        let state = AppState::fake_with_db(pool);
        let user = User::create(&state.db, "Ada", "ada@example.com", "hash")
            .await
            .unwrap();

        let Json(body) = login_status(State(state), Some(AuthUser(user.id)))
            .await
            .unwrap();
        assert_eq!(body["user"]["email"], "ada@example.com");
        assert!(body["user"].get("passwordHash").is_none());
    }
}
