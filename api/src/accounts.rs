use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use blog_shared::{
    ChangeEmail, ChangePassword, ChangeRoles, FieldError, ForgotPassword, LoginUser, RegisterUser,
    ResetPassword, TokenPair, UpdateUser, User,
};
use chrono::{Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::{self, Actor, Claims, ADMINISTRATOR, ROLES, USER},
    cache::keys,
    config::AppConfig,
    db,
    error::{respond, AppError},
    extract::{Json, Query},
    jobs::Job,
    mailer, AppState,
};

const MIN_PASSWORD_LEN: usize = 8;

// ── Queries ──

enum Lookup<'a> {
    Id(i64),
    Email(&'a str),
    UserName(&'a str),
}

fn roles_of(conn: &Connection, user_id: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT role FROM user_roles WHERE user_id = ?1 ORDER BY role")?;
    let roles = stmt.query_map([user_id], |row| row.get::<_, String>(0))?;
    roles.collect()
}

fn find_user(conn: &Connection, lookup: Lookup<'_>) -> Result<Option<User>, AppError> {
    let (column, value): (&str, Box<dyn rusqlite::ToSql>) = match lookup {
        Lookup::Id(id) => ("id", Box::new(id)),
        Lookup::Email(email) => ("email", Box::new(email.to_string())),
        Lookup::UserName(name) => ("user_name", Box::new(name.to_string())),
    };
    let user = conn
        .query_row(
            &format!(
                "SELECT id, user_name, email, first_name, last_name,
                        phone_country_code, phone_number, email_confirmed
                 FROM users WHERE {column} = ?1"
            ),
            [value],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    user_name: row.get(1)?,
                    email: row.get(2)?,
                    first_name: row.get(3)?,
                    last_name: row.get(4)?,
                    phone_country_code: row.get(5)?,
                    phone_number: row.get(6)?,
                    email_confirmed: row.get(7)?,
                    roles: Vec::new(),
                })
            },
        )
        .optional()?;

    match user {
        None => Ok(None),
        Some(mut user) => {
            user.roles = roles_of(conn, user.id)?;
            Ok(Some(user))
        }
    }
}

fn require_user(conn: &Connection, lookup: Lookup<'_>) -> Result<User, AppError> {
    find_user(conn, lookup)?.ok_or(AppError::NotFound("User"))
}

/// Signs a fresh access token and rotates the stored refresh token.
fn issue_tokens(conn: &Connection, config: &AppConfig, user: &User) -> Result<TokenPair, AppError> {
    let claims = Claims::new(
        user.id,
        &user.user_name,
        &user.email,
        user.roles.clone(),
        config.jwt_expiry_minutes,
    );
    let access_token = auth::sign(&claims, &config.jwt_secret)?;
    let refresh_token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let expiry = Utc::now().naive_utc() + Duration::days(config.refresh_token_days);

    conn.execute(
        "UPDATE users SET refresh_token = ?2, refresh_token_expiry = ?3 WHERE id = ?1",
        params![user.id, refresh_token, expiry],
    )?;
    Ok(TokenPair {
        access_token,
        refresh_token,
    })
}

fn validate_registration(body: &RegisterUser) -> Result<(), AppError> {
    let mut errors = Vec::new();
    if body.user_name.trim().is_empty() {
        errors.push(FieldError::new("userName", "User name is required"));
    }
    if !body.email.contains('@') {
        errors.push(FieldError::new("email", "A valid email is required"));
    }
    errors.extend(password_error("password", &body.password));
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(errors))
    }
}

fn password_error(field: &str, password: &str) -> Option<FieldError> {
    (password.chars().count() < MIN_PASSWORD_LEN).then(|| {
        FieldError::new(
            field,
            format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        )
    })
}

/// Country codes are `+` and one to three digits; numbers are ten digits.
fn validate_profile(body: &UpdateUser) -> Result<(), AppError> {
    let digits = |s: &str, range: std::ops::RangeInclusive<usize>| {
        range.contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
    };
    let mut errors = Vec::new();
    if let Some(code) = &body.phone_country_code {
        if !code.strip_prefix('+').is_some_and(|d| digits(d, 1..=3)) {
            errors.push(FieldError::new(
                "phoneCountryCode",
                "Invalid country code format. Use '+' followed by 1-3 digits",
            ));
        }
    }
    if let Some(number) = &body.phone_number {
        if !digits(number, 10..=10) {
            errors.push(FieldError::new("phoneNumber", "Phone number must be exactly 10 digits"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(errors))
    }
}

fn ids(conn: &Connection, sql: &str, user_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([user_id], |row| row.get::<_, i64>(0))?;
    rows.collect()
}

fn validate_roles(roles: &[String]) -> Result<(), AppError> {
    if roles.is_empty() {
        return Err(AppError::invalid("roles", "At least one role is required"));
    }
    match roles.iter().find(|r| !ROLES.contains(&r.as_str())) {
        Some(unknown) => Err(AppError::invalid("roles", format!("Unknown role {unknown}"))),
        None => Ok(()),
    }
}

// ── Handlers ──

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterUser>,
) -> Result<impl IntoResponse, AppError> {
    validate_registration(&body)?;
    let password_hash = auth::hash_password(&body.password)?;
    let token = Uuid::new_v4().to_string();

    let is_admin = state
        .config
        .admin_email
        .as_deref()
        .is_some_and(|admin| admin.eq_ignore_ascii_case(body.email.trim()));

    let confirmation_token = token.clone();
    let user = db::run(&state.db, move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO users (user_name, email, password_hash, first_name, last_name, confirmation_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                body.user_name.trim(),
                body.email.trim(),
                password_hash,
                body.first_name.trim(),
                body.last_name.trim(),
                confirmation_token,
            ],
        )
        .map_err(|e| AppError::on_unique(e, "An account with this email or user name already exists"))?;
        let id = tx.last_insert_rowid();

        tx.execute("INSERT INTO user_roles (user_id, role) VALUES (?1, ?2)", params![id, USER])?;
        if is_admin {
            tx.execute(
                "INSERT INTO user_roles (user_id, role) VALUES (?1, ?2)",
                params![id, ADMINISTRATOR],
            )?;
        }
        let user = require_user(&tx, Lookup::Id(id))?;
        tx.commit()?;
        Ok(user)
    })
    .await?;

    let link = mailer::confirmation_link(&state.config.public_url, &token, &user.email);
    state.jobs.enqueue(Job::SendEmail(mailer::registration_confirmation(
        &user.email,
        &user.user_name,
        &link,
    )));

    tracing::info!(user_id = user.id, admin = is_admin, "user registered");
    Ok(respond(StatusCode::CREATED, user, "Registration successful. Check your email to confirm your account"))
}

#[derive(Deserialize)]
pub struct ConfirmParams {
    token: String,
    email: String,
}

/// GET /api/auth/confirm-email?token=&email=
pub async fn confirm_email(
    State(state): State<AppState>,
    Query(params): Query<ConfirmParams>,
) -> Result<impl IntoResponse, AppError> {
    let user = db::run(&state.db, move |conn| {
        let user = require_user(conn, Lookup::Email(&params.email))?;
        let stored: Option<String> = conn.query_row(
            "SELECT confirmation_token FROM users WHERE id = ?1",
            [user.id],
            |row| row.get(0),
        )?;
        if user.email_confirmed {
            return Ok(user);
        }
        if stored.as_deref() != Some(params.token.as_str()) {
            return Err(AppError::invalid("token", "Invalid confirmation token"));
        }
        conn.execute(
            "UPDATE users SET email_confirmed = 1, confirmation_token = NULL,
                 date_modified = datetime('now')
             WHERE id = ?1",
            [user.id],
        )?;
        require_user(conn, Lookup::Id(user.id))
    })
    .await?;

    tracing::info!(user_id = user.id, "email confirmed");
    Ok(respond(StatusCode::OK, user, "Email confirmed successfully"))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginUser>,
) -> Result<impl IntoResponse, AppError> {
    let config = Arc::clone(&state.config);
    let tokens = db::run(&state.db, move |conn| {
        let stored: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE user_name = ?1",
                [body.user_name.trim()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let id = match stored {
            Some((id, hash)) if auth::verify_password(&body.password, &hash) => id,
            _ => return Err(AppError::Unauthorized("Invalid user name or password")),
        };
        let user = require_user(conn, Lookup::Id(id))?;
        issue_tokens(conn, &config, &user)
    })
    .await?;

    Ok(respond(StatusCode::OK, tokens, "Login successful"))
}

/// POST /api/auth/refresh-token
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(body): Json<TokenPair>,
) -> Result<impl IntoResponse, AppError> {
    let claims = auth::verify(&body.access_token, &state.config.jwt_secret, false)
        .ok_or_else(|| AppError::invalid("accessToken", "Invalid access token"))?;

    let config = Arc::clone(&state.config);
    let tokens = db::run(&state.db, move |conn| {
        let stored: Option<(Option<String>, Option<NaiveDateTime>)> = conn
            .query_row(
                "SELECT refresh_token, refresh_token_expiry FROM users WHERE id = ?1",
                [claims.sub],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let valid = matches!(
            stored,
            Some((Some(token), Some(expiry)))
                if token == body.refresh_token && expiry > Utc::now().naive_utc()
        );
        if !valid {
            return Err(AppError::invalid("refreshToken", "Invalid or expired refresh token"));
        }
        let user = require_user(conn, Lookup::Id(claims.sub))?;
        issue_tokens(conn, &config, &user)
    })
    .await?;

    Ok(respond(StatusCode::OK, tokens, "Token refreshed successfully"))
}

/// GET /api/auth/me
pub async fn me(State(state): State<AppState>, actor: Actor) -> Result<impl IntoResponse, AppError> {
    let user = db::run(&state.db, move |conn| require_user(conn, Lookup::Id(actor.id))).await?;
    Ok(respond(StatusCode::OK, user, "User retrieved successfully"))
}

/// GET /api/auth/users
pub async fn list_users(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;
    let users = db::run(&state.db, |conn| {
        let ids = {
            let mut stmt = conn.prepare("SELECT id FROM users ORDER BY user_name")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        ids.into_iter()
            .map(|id| require_user(conn, Lookup::Id(id)))
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;
    Ok(respond(StatusCode::OK, users, "Users retrieved successfully"))
}

/// POST /api/auth/roles/add
pub async fn add_roles(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<ChangeRoles>,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;
    validate_roles(&body.roles)?;

    let user = db::run(&state.db, move |conn| {
        let user = require_user(conn, Lookup::Email(&body.email))?;
        for role in &body.roles {
            conn.execute(
                "INSERT OR IGNORE INTO user_roles (user_id, role) VALUES (?1, ?2)",
                params![user.id, role],
            )?;
        }
        require_user(conn, Lookup::Id(user.id))
    })
    .await?;

    tracing::info!(user_id = user.id, roles = ?user.roles, "roles added");
    Ok(respond(StatusCode::OK, user, "Roles added successfully"))
}

/// POST /api/auth/roles/remove
pub async fn remove_roles(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<ChangeRoles>,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;
    validate_roles(&body.roles)?;

    let user = db::run(&state.db, move |conn| {
        let user = require_user(conn, Lookup::Email(&body.email))?;
        for role in &body.roles {
            conn.execute(
                "DELETE FROM user_roles WHERE user_id = ?1 AND role = ?2",
                params![user.id, role],
            )?;
        }
        require_user(conn, Lookup::Id(user.id))
    })
    .await?;

    tracing::info!(user_id = user.id, roles = ?user.roles, "roles removed");
    Ok(respond(StatusCode::OK, user, "Roles removed successfully"))
}

#[derive(Deserialize)]
pub struct EmailParam {
    email: String,
}

/// DELETE /api/auth/users?email=
///
/// Posts and comments survive their author's deletion without an owner. The
/// author's votes go with the account.
pub async fn delete_user(
    State(state): State<AppState>,
    actor: Actor,
    Query(params): Query<EmailParam>,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;

    let (user, post_ids, comment_ids) = db::run(&state.db, move |conn| {
        let tx = conn.transaction()?;
        let user = require_user(&tx, Lookup::Email(&params.email))?;
        let post_ids = ids(
            &tx,
            "SELECT id FROM posts WHERE user_id = ?1
             UNION SELECT post_id FROM comments WHERE user_id = ?1
             UNION SELECT c.post_id FROM comment_votes v
                 JOIN comments c ON c.id = v.comment_id WHERE v.user_id = ?1",
            user.id,
        )?;
        let comment_ids = ids(
            &tx,
            "SELECT id FROM comments WHERE user_id = ?1
             UNION SELECT comment_id FROM comment_votes WHERE user_id = ?1",
            user.id,
        )?;
        tx.execute("DELETE FROM users WHERE id = ?1", [user.id])?;
        tx.commit()?;
        Ok((user, post_ids, comment_ids))
    })
    .await?;

    state
        .cache
        .remove_all(
            post_ids
                .iter()
                .copied()
                .map(keys::post)
                .chain(comment_ids.iter().copied().map(keys::comment)),
        )
        .await;

    tracing::info!(user_id = user.id, by = actor.id, "user deleted");
    Ok(respond(StatusCode::OK, (), "User deleted successfully"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleParam {
    role_name: String,
}

/// GET /api/auth/users/roles?roleName=
pub async fn users_in_role(
    State(state): State<AppState>,
    actor: Actor,
    Query(params): Query<RoleParam>,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;
    let users = db::run(&state.db, move |conn| {
        let ids = {
            let mut stmt = conn.prepare(
                "SELECT u.id FROM users u JOIN user_roles r ON r.user_id = u.id
                 WHERE r.role = ?1 ORDER BY u.user_name",
            )?;
            let ids = stmt
                .query_map([&params.role_name], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        ids.into_iter()
            .map(|id| require_user(conn, Lookup::Id(id)))
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;
    Ok(respond(StatusCode::OK, users, "Users retrieved successfully"))
}

/// GET /api/auth/user-roles?email=
pub async fn user_roles(
    State(state): State<AppState>,
    actor: Actor,
    Query(params): Query<EmailParam>,
) -> Result<impl IntoResponse, AppError> {
    actor.require_admin()?;
    let user = db::run(&state.db, move |conn| require_user(conn, Lookup::Email(&params.email))).await?;
    Ok(respond(StatusCode::OK, user.roles, "User roles retrieved successfully"))
}

/// PATCH /api/auth/update-user
pub async fn update_user(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<UpdateUser>,
) -> Result<impl IntoResponse, AppError> {
    validate_profile(&body)?;
    let user = db::run(&state.db, move |conn| {
        conn.execute(
            "UPDATE users SET first_name = COALESCE(?2, first_name),
                 last_name = COALESCE(?3, last_name),
                 phone_country_code = COALESCE(?4, phone_country_code),
                 phone_number = COALESCE(?5, phone_number),
                 date_modified = datetime('now')
             WHERE id = ?1",
            params![
                actor.id,
                body.first_name.as_deref().map(str::trim),
                body.last_name.as_deref().map(str::trim),
                body.phone_country_code,
                body.phone_number,
            ],
        )?;
        require_user(conn, Lookup::Id(actor.id))
    })
    .await?;

    tracing::info!(user_id = user.id, "profile updated");
    Ok(respond(StatusCode::OK, user, "User updated successfully"))
}

/// POST /api/auth/change-password
pub async fn change_password(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<ChangePassword>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(error) = password_error("newPassword", &body.new_password) {
        return Err(AppError::Validation(vec![error]));
    }
    let user_id = actor.id;
    db::run(&state.db, move |conn| {
        let hash: String = conn
            .query_row("SELECT password_hash FROM users WHERE id = ?1", [user_id], |row| row.get(0))
            .optional()?
            .ok_or(AppError::NotFound("User"))?;
        if !auth::verify_password(&body.current_password, &hash) {
            return Err(AppError::invalid("currentPassword", "Current password is incorrect"));
        }
        let new_hash = auth::hash_password(&body.new_password)?;
        conn.execute(
            "UPDATE users SET password_hash = ?2, refresh_token = NULL, refresh_token_expiry = NULL,
                 date_modified = datetime('now')
             WHERE id = ?1",
            params![user_id, new_hash],
        )?;
        Ok(())
    })
    .await?;

    tracing::info!(user_id, "password changed");
    Ok(respond(StatusCode::OK, (), "Password changed successfully"))
}

/// POST /api/auth/forgot-password
///
/// Answers the same whether or not the email belongs to an account.
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(body): Json<ForgotPassword>,
) -> Result<impl IntoResponse, AppError> {
    let token = Uuid::new_v4().to_string();
    let expiry = Utc::now().naive_utc() + Duration::minutes(state.config.reset_token_minutes);

    let reset_token = token.clone();
    let user = db::run(&state.db, move |conn| {
        let Some(user) = find_user(conn, Lookup::Email(body.email.trim()))? else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE users SET reset_token = ?2, reset_token_expiry = ?3 WHERE id = ?1",
            params![user.id, reset_token, expiry],
        )?;
        Ok(Some(user))
    })
    .await?;

    match user {
        Some(user) => {
            let link = mailer::password_reset_link(&state.config.public_url, &token, &user.email);
            state
                .jobs
                .enqueue(Job::SendEmail(mailer::password_reset(&user.email, &user.user_name, &link)));
            tracing::info!(user_id = user.id, "password reset requested");
        }
        None => tracing::info!("password reset requested for unknown email"),
    }
    Ok(respond(
        StatusCode::OK,
        (),
        "If an account exists for this email, a password reset link has been sent",
    ))
}

#[derive(Deserialize)]
pub struct ResetParams {
    email: String,
    token: String,
}

/// GET /api/auth/reset-password?email=&token=
///
/// Landing target of the emailed link. Hands the pair back for the client to
/// submit with the new password.
pub async fn reset_password_form(Query(params): Query<ResetParams>) -> impl IntoResponse {
    respond(
        StatusCode::OK,
        serde_json::json!({ "email": params.email, "token": params.token }),
        "Submit a new password with this token",
    )
}

/// POST /api/auth/reset-password
pub async fn reset_password(
    State(state): State<AppState>,
    Json(body): Json<ResetPassword>,
) -> Result<impl IntoResponse, AppError> {
    let mut errors: Vec<FieldError> = password_error("newPassword", &body.new_password)
        .into_iter()
        .collect();
    if body.confirm_password != body.new_password {
        errors.push(FieldError::new("confirmPassword", "Password fields do not match"));
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let user = db::run(&state.db, move |conn| {
        let user = require_user(conn, Lookup::Email(body.email.trim()))?;
        let (token, expiry): (Option<String>, Option<NaiveDateTime>) = conn.query_row(
            "SELECT reset_token, reset_token_expiry FROM users WHERE id = ?1",
            [user.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let valid = matches!(
            (token, expiry),
            (Some(token), Some(expiry)) if token == body.token && expiry > Utc::now().naive_utc()
        );
        if !valid {
            return Err(AppError::invalid("token", "Invalid or expired password reset token"));
        }

        let hash = auth::hash_password(&body.new_password)?;
        conn.execute(
            "UPDATE users SET password_hash = ?2, reset_token = NULL, reset_token_expiry = NULL,
                 refresh_token = NULL, refresh_token_expiry = NULL, date_modified = datetime('now')
             WHERE id = ?1",
            params![user.id, hash],
        )?;
        Ok(user)
    })
    .await?;

    tracing::info!(user_id = user.id, "password reset");
    Ok(respond(StatusCode::OK, (), "Password successfully changed"))
}

/// POST /api/auth/change-email
///
/// The new address takes effect once its owner follows the emailed link.
pub async fn change_email(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<ChangeEmail>,
) -> Result<impl IntoResponse, AppError> {
    let new_email = body.new_email.trim().to_string();
    if !new_email.contains('@') {
        return Err(AppError::invalid("newEmail", "A valid email is required"));
    }
    let token = Uuid::new_v4().to_string();

    let (pending, change_token) = (new_email.clone(), token.clone());
    let user = db::run(&state.db, move |conn| {
        let user = require_user(conn, Lookup::Id(actor.id))?;
        if user.email.eq_ignore_ascii_case(&pending) {
            return Err(AppError::invalid("newEmail", "New email is the same as the current email"));
        }
        if find_user(conn, Lookup::Email(&pending))?.is_some() {
            return Err(AppError::Conflict("An account with this email already exists".into()));
        }
        conn.execute(
            "UPDATE users SET pending_email = ?2, email_change_token = ?3 WHERE id = ?1",
            params![user.id, pending, change_token],
        )?;
        Ok(user)
    })
    .await?;

    let link = mailer::email_change_link(&state.config.public_url, &token, &user.email, &new_email);
    state.jobs.enqueue(Job::SendEmail(mailer::email_change_confirmation(
        &new_email,
        &user.user_name,
        &link,
    )));

    tracing::info!(user_id = user.id, "email change requested");
    Ok(respond(StatusCode::OK, (), "Check your new email to confirm the change"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailChangeParams {
    token: String,
    old_email: String,
    new_email: String,
}

/// GET /api/auth/confirm-email-change?token=&oldEmail=&newEmail=
pub async fn confirm_email_change(
    State(state): State<AppState>,
    Query(params): Query<EmailChangeParams>,
) -> Result<impl IntoResponse, AppError> {
    let user = db::run(&state.db, move |conn| {
        let user = require_user(conn, Lookup::Email(&params.old_email))?;
        let (pending, token): (Option<String>, Option<String>) = conn.query_row(
            "SELECT pending_email, email_change_token FROM users WHERE id = ?1",
            [user.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let valid = matches!(
            (pending, token),
            (Some(pending), Some(token))
                if token == params.token && pending.eq_ignore_ascii_case(&params.new_email)
        );
        if !valid {
            return Err(AppError::invalid("token", "Invalid email change token"));
        }

        conn.execute(
            "UPDATE users SET email = ?2, email_confirmed = 1, pending_email = NULL,
                 email_change_token = NULL, date_modified = datetime('now')
             WHERE id = ?1",
            params![user.id, params.new_email],
        )
        .map_err(|e| AppError::on_unique(e, "An account with this email already exists"))?;
        require_user(conn, Lookup::Id(user.id))
    })
    .await?;

    tracing::info!(user_id = user.id, "email changed");
    Ok(respond(StatusCode::OK, user, "Email changed successfully"))
}
