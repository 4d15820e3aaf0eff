//! JSON-over-HTTP account / profile / leaderboard / daily / match-history
//! surface. The realtime core does not depend on these routes; they are the
//! external face of the persistence gateway.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::auth::{AuthError, AuthService, AuthedUser};
use crate::collections::UserRecord;
use crate::daily::{DailyChallenge, DailySubmission};
use crate::storage::{StorageError, StoreHandle};

#[derive(Clone)]
pub struct ApiState {
    pub store: StoreHandle,
    pub auth: Arc<AuthService>,
    pub daily: Arc<DailyChallenge>,
    pub email_hash_key: String,
}

#[derive(Debug)]
pub enum ApiError {
    Invalid(&'static str),
    Unauthorized,
    NotFound,
    Duplicate,
    Unavailable,
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Duplicate => ApiError::Duplicate,
            StorageError::NotFound => ApiError::NotFound,
            StorageError::Unavailable => ApiError::Unavailable,
            StorageError::Backend(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(_: AuthError) -> Self {
        ApiError::Unauthorized
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Duplicate => (StatusCode::CONFLICT, "duplicate".to_string()),
            ApiError::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "database unavailable".to_string())
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "api internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route(
            "/profile",
            get(get_profile).patch(patch_profile).delete(delete_profile),
        )
        .route("/profile/stats", get(profile_stats))
        .route("/profile/export", get(profile_export))
        .route("/leaderboard", get(leaderboard))
        .route("/daily", get(daily_challenge))
        .route("/daily/submit", post(daily_submit))
        .route("/daily/leaderboard", get(daily_leaderboard))
        .route("/matches", get(match_history))
        .route("/matches/:id", get(match_detail))
        .with_state(state)
}

/// Pull and verify the bearer token; returns the identity and the raw token
/// (the latter so `DELETE /profile` can revoke it).
async fn bearer(state: &ApiState, headers: &HeaderMap) -> Result<(AuthedUser, String), ApiError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)?;
    let user = state.auth.verify(raw).await?;
    Ok((user, raw.to_string()))
}

fn hash_email(key: &str, email: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(email.trim().to_lowercase().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn valid_username(username: &str) -> bool {
    let len = username.chars().count();
    (3..=20).contains(&len)
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    username: String,
    #[serde(default)]
    email: Option<String>,
    password: String,
    #[serde(default)]
    remember: bool,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    token: String,
    user_id: String,
    username: String,
}

async fn register(
    State(state): State<ApiState>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    if !valid_username(&body.username) {
        return Err(ApiError::Invalid("invalid payload"));
    }
    if body.password.len() < 8 {
        return Err(ApiError::Invalid("invalid payload"));
    }
    let store = state.store.get()?;

    let password_hash = bcrypt::hash(&body.password, bcrypt::DEFAULT_COST)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let user = UserRecord {
        id: Uuid::new_v4().to_string(),
        username: body.username.to_lowercase(),
        email_hash: body.email.as_deref().map(|e| hash_email(&state.email_hash_key, e)),
        password_hash: Some(password_hash),
        settings: serde_json::json!({}),
        created: Utc::now(),
    };
    store.create_user(user.clone()).await?;

    let token = state.auth.issue(&user.id, &user.username, body.remember)?;
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse { token, user_id: user.id, username: user.username }),
    ))
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
    #[serde(default)]
    remember: bool,
}

async fn login(
    State(state): State<ApiState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<SessionResponse>, ApiError> {
    let store = state.store.get()?;
    let user = store
        .user_by_username(&body.username)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    let hash = user.password_hash.as_deref().ok_or(ApiError::Unauthorized)?;
    let ok = bcrypt::verify(&body.password, hash).map_err(|e| ApiError::Internal(e.to_string()))?;
    if !ok {
        return Err(ApiError::Unauthorized);
    }
    let token = state.auth.issue(&user.id, &user.username, body.remember)?;
    Ok(Json(SessionResponse { token, user_id: user.id, username: user.username }))
}

#[derive(Debug, Serialize)]
struct ProfileResponse {
    user_id: String,
    username: String,
    settings: serde_json::Value,
    rating: Option<i32>,
    competitive_rating: Option<i32>,
    placement_games_played: u32,
}

async fn get_profile(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ProfileResponse>, ApiError> {
    let (authed, _) = bearer(&state, &headers).await?;
    let store = state.store.get()?;
    let user = store.user_by_id(&authed.id).await?.ok_or(ApiError::NotFound)?;
    let rating = store.rating_row(&authed.id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(ProfileResponse {
        user_id: user.id,
        username: user.username,
        settings: user.settings,
        rating: rating.rating,
        competitive_rating: rating.competitive_rating,
        placement_games_played: rating.placement_games_played,
    }))
}

#[derive(Debug, Deserialize)]
struct PatchProfileBody {
    settings: serde_json::Value,
}

async fn patch_profile(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<PatchProfileBody>,
) -> Result<StatusCode, ApiError> {
    let (authed, _) = bearer(&state, &headers).await?;
    if !body.settings.is_object() {
        return Err(ApiError::Invalid("invalid payload"));
    }
    let store = state.store.get()?;
    store.update_settings(&authed.id, body.settings).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Serialize)]
struct ProfileStats {
    games_played: usize,
    wins: usize,
    losses: usize,
    draws: usize,
    avg_wpm: Option<f64>,
    avg_accuracy: Option<f64>,
    best_wpm: Option<f64>,
}

async fn profile_stats(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ProfileStats>, ApiError> {
    let (authed, _) = bearer(&state, &headers).await?;
    let store = state.store.get()?;
    let history = store.matches_for_user(&authed.id, 200).await?;

    let mut stats = ProfileStats::default();
    let mut wpm_sum = 0.0;
    let mut acc_sum = 0.0;
    let mut scored = 0usize;
    for (_, players) in &history {
        let Some(own) = players.iter().find(|p| p.user_id == authed.id) else { continue };
        let Some(result) = own.result else { continue };
        stats.games_played += 1;
        match result {
            common_match::scoring::MatchOutcome::Win => stats.wins += 1,
            common_match::scoring::MatchOutcome::Loss => stats.losses += 1,
            common_match::scoring::MatchOutcome::Draw => stats.draws += 1,
        }
        if let Some(wpm) = own.wpm {
            wpm_sum += wpm;
            scored += 1;
            stats.best_wpm = Some(stats.best_wpm.map_or(wpm, |best: f64| best.max(wpm)));
        }
        if let Some(acc) = own.accuracy {
            acc_sum += acc;
        }
    }
    if scored > 0 {
        stats.avg_wpm = Some(wpm_sum / scored as f64);
        stats.avg_accuracy = Some(acc_sum / scored as f64);
    }
    Ok(Json(stats))
}

async fn profile_export(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (authed, _) = bearer(&state, &headers).await?;
    let store = state.store.get()?;
    let user = store.user_by_id(&authed.id).await?.ok_or(ApiError::NotFound)?;
    let rating = store.rating_row(&authed.id).await?;
    let matches = store.matches_for_user(&authed.id, 1000).await?;
    let daily = store.daily_scores_for_user(&authed.id, 1000).await?;

    Ok(Json(serde_json::json!({
        "user": {
            "id": user.id,
            "username": user.username,
            "created": user.created,
            "settings": user.settings,
        },
        "rating": rating,
        "matches": matches
            .into_iter()
            .map(|(m, players)| serde_json::json!({ "match": m, "players": players }))
            .collect::<Vec<_>>(),
        "daily_scores": daily,
    })))
}

async fn delete_profile(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (authed, token) = bearer(&state, &headers).await?;
    let store = state.store.get()?;
    store.delete_user(&authed.id).await?;
    state.auth.revoke(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn leaderboard(
    State(state): State<ApiState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.get()?;
    let limit = page.limit.unwrap_or(50).min(100);
    let offset = page.offset.unwrap_or(0);
    let rows = store.leaderboard_page(limit, offset).await?;
    Ok(Json(serde_json::json!({ "entries": rows, "limit": limit, "offset": offset })))
}

async fn daily_challenge(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let info = state.daily.challenge(Utc::now());
    Json(serde_json::json!(info))
}

async fn daily_submit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(submission): Json<DailySubmission>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (authed, _) = bearer(&state, &headers).await?;
    if submission.elapsed_ms == 0 {
        return Err(ApiError::Invalid("invalid payload"));
    }
    let store = state.store.get()?;
    let row = state.daily.score(&authed.id, Utc::now(), &submission);
    store.insert_daily_score(row.clone()).await?;
    Ok((StatusCode::OK, Json(serde_json::json!(row))))
}

async fn daily_leaderboard(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.get()?;
    let day = state.daily.day_key(Utc::now());
    let limit = page.limit.unwrap_or(25).min(100);
    let top = store.daily_top(&day, limit).await?;
    // Rank is only reported for an authenticated caller.
    let own_rank = match bearer(&state, &headers).await {
        Ok((authed, _)) => store.daily_rank(&day, &authed.id).await?,
        Err(_) => None,
    };
    let entries: Vec<serde_json::Value> = top
        .into_iter()
        .map(|(row, username)| {
            serde_json::json!({
                "username": username,
                "wpm": row.wpm,
                "accuracy": row.accuracy,
                "score": row.score,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "day": day, "entries": entries, "rank": own_rank })))
}

async fn match_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (authed, _) = bearer(&state, &headers).await?;
    let store = state.store.get()?;
    let limit = page.limit.unwrap_or(20).min(100);
    let history = store.matches_for_user(&authed.id, limit).await?;
    let entries: Vec<serde_json::Value> = history
        .into_iter()
        .map(|(m, players)| serde_json::json!({ "match": m, "players": players }))
        .collect();
    Ok(Json(serde_json::json!({ "entries": entries })))
}

async fn match_detail(
    State(state): State<ApiState>,
    Path(match_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.get()?;
    let (record, players) = store.match_by_id(&match_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::json!({ "match": record, "players": players })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_validation() {
        assert!(valid_username("speedy_1"));
        assert!(valid_username("abc"));
        assert!(!valid_username("ab"));
        assert!(!valid_username("has space"));
        assert!(!valid_username(&"x".repeat(21)));
    }

    #[test]
    fn email_hash_is_keyed_and_folded() {
        let a = hash_email("key", "User@Example.com");
        let b = hash_email("key", "user@example.com ");
        let c = hash_email("other", "user@example.com");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
