//! Persistence gateway. Every durable write in the system goes through the
//! [`MatchStore`] trait; `MemoryStore` is the complete in-process
//! implementation used by tests and as the fallback store, `PgStore` (see
//! `postgres`) is the production one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::collections::{
    DailyScoreRecord, LeaderboardRow, MatchPlayerRecord, MatchRecord, MatchStatus, RatingRecord,
    RatingUpdate, RecentResult, UserRecord,
};
use common_match::scoring::MatchOutcome;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Unique-constraint violation; callers translate to HTTP 409.
    #[error("duplicate")]
    Duplicate,
    #[error("not found")]
    NotFound,
    /// No store is configured (`DATABASE_URL` absent).
    #[error("database unavailable")]
    Unavailable,
    #[error("database error: {0}")]
    Backend(String),
}

/// Shared handle the rest of the system holds. `unavailable()` models a
/// process started without `DATABASE_URL`: reads and writes fail with
/// [`StorageError::Unavailable`] and the HTTP layer maps that to 503.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Option<Arc<dyn MatchStore>>,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self { inner: Some(store) }
    }

    pub fn unavailable() -> Self {
        Self { inner: None }
    }

    pub fn get(&self) -> Result<&Arc<dyn MatchStore>, StorageError> {
        self.inner.as_ref().ok_or(StorageError::Unavailable)
    }

    pub fn is_available(&self) -> bool {
        self.inner.is_some()
    }
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    // Users.
    async fn create_user(&self, user: UserRecord) -> Result<(), StorageError>;
    async fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StorageError>;
    async fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StorageError>;
    async fn update_settings(
        &self,
        user_id: &str,
        settings: serde_json::Value,
    ) -> Result<(), StorageError>;
    /// Cascade-erases the user's rating, match rows and daily scores.
    async fn delete_user(&self, user_id: &str) -> Result<(), StorageError>;

    // Ratings.
    async fn rating_row(&self, user_id: &str) -> Result<Option<RatingRecord>, StorageError>;
    async fn apply_ratings(&self, updates: Vec<RatingUpdate>) -> Result<(), StorageError>;
    async fn increment_placement(&self, updates: Vec<(String, u32)>) -> Result<(), StorageError>;
    async fn update_placement_mmr(
        &self,
        user_id: &str,
        initial_rating: i32,
    ) -> Result<(), StorageError>;
    /// `count(rating > given) + 1`.
    async fn leaderboard_position(&self, rating: i32) -> Result<i64, StorageError>;
    async fn leaderboard_page(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LeaderboardRow>, StorageError>;

    // Matches.
    async fn create_pending_match(
        &self,
        record: MatchRecord,
        players: Vec<MatchPlayerRecord>,
    ) -> Result<(), StorageError>;
    async fn set_match_status(
        &self,
        match_id: &str,
        status: MatchStatus,
    ) -> Result<(), StorageError>;
    /// Both player rows and the match status in one transaction.
    async fn record_match(
        &self,
        match_id: &str,
        players: Vec<MatchPlayerRecord>,
        status: MatchStatus,
    ) -> Result<(), StorageError>;
    async fn match_by_id(
        &self,
        match_id: &str,
    ) -> Result<Option<(MatchRecord, Vec<MatchPlayerRecord>)>, StorageError>;
    async fn matches_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<(MatchRecord, Vec<MatchPlayerRecord>)>, StorageError>;
    /// Completed ranked results for the rating policy, newest first.
    async fn recent_results(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentResult>, StorageError>;

    // Daily challenge.
    async fn insert_daily_score(&self, row: DailyScoreRecord) -> Result<(), StorageError>;
    async fn daily_top(
        &self,
        day: &str,
        limit: usize,
    ) -> Result<Vec<(DailyScoreRecord, String)>, StorageError>;
    async fn daily_rank(&self, day: &str, user_id: &str) -> Result<Option<i64>, StorageError>;
    async fn daily_scores_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<DailyScoreRecord>, StorageError>;
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<String, UserRecord>,
    username_index: HashMap<String, String>,
    ratings: HashMap<String, RatingRecord>,
    matches: HashMap<String, MatchRecord>,
    /// Creation order, oldest first; match history reads walk it backwards.
    match_order: Vec<String>,
    players: HashMap<String, Vec<MatchPlayerRecord>>,
    daily: HashMap<(String, String), DailyScoreRecord>,
}

/// In-memory store. A single lock over all tables makes every multi-row
/// operation atomic the same way the Postgres transactions are.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn create_user(&self, user: UserRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let folded = user.username.to_lowercase();
        if inner.username_index.contains_key(&folded) {
            return Err(StorageError::Duplicate);
        }
        inner.username_index.insert(folded, user.id.clone());
        inner
            .ratings
            .insert(user.id.clone(), RatingRecord::fresh(user.id.clone()));
        inner.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .username_index
            .get(&username.to_lowercase())
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn update_settings(
        &self,
        user_id: &str,
        settings: serde_json::Value,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(user_id).ok_or(StorageError::NotFound)?;
        user.settings = settings;
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.remove(user_id).ok_or(StorageError::NotFound)?;
        inner.username_index.remove(&user.username.to_lowercase());
        inner.ratings.remove(user_id);
        inner.daily.retain(|(uid, _), _| uid != user_id);
        for rows in inner.players.values_mut() {
            rows.retain(|p| p.user_id != user_id);
        }
        debug!(user_id, "user erased");
        Ok(())
    }

    async fn rating_row(&self, user_id: &str) -> Result<Option<RatingRecord>, StorageError> {
        Ok(self.inner.read().await.ratings.get(user_id).cloned())
    }

    async fn apply_ratings(&self, updates: Vec<RatingUpdate>) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for update in &updates {
            if !inner.ratings.contains_key(&update.user_id) {
                return Err(StorageError::NotFound);
            }
        }
        for update in updates {
            let row = inner
                .ratings
                .get_mut(&update.user_id)
                .expect("presence checked above");
            row.rating = update.rating;
            row.competitive_rating = update.competitive_rating;
        }
        Ok(())
    }

    async fn increment_placement(&self, updates: Vec<(String, u32)>) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for (user_id, _) in &updates {
            if !inner.ratings.contains_key(user_id) {
                return Err(StorageError::NotFound);
            }
        }
        for (user_id, new_count) in updates {
            let row = inner
                .ratings
                .get_mut(&user_id)
                .expect("presence checked above");
            row.placement_games_played = new_count;
        }
        Ok(())
    }

    async fn update_placement_mmr(
        &self,
        user_id: &str,
        initial_rating: i32,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let row = inner.ratings.get_mut(user_id).ok_or(StorageError::NotFound)?;
        row.rating = Some(initial_rating);
        Ok(())
    }

    async fn leaderboard_position(&self, rating: i32) -> Result<i64, StorageError> {
        let inner = self.inner.read().await;
        let above = inner
            .ratings
            .values()
            .filter(|r| r.rating.map(|v| v > rating).unwrap_or(false))
            .count() as i64;
        Ok(above + 1)
    }

    async fn leaderboard_page(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LeaderboardRow>, StorageError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<LeaderboardRow> = inner
            .ratings
            .values()
            .filter_map(|r| {
                let rating = r.rating?;
                let user = inner.users.get(&r.user_id)?;
                Some(LeaderboardRow {
                    user_id: r.user_id.clone(),
                    username: user.username.clone(),
                    rating,
                    competitive_rating: r.competitive_rating,
                })
            })
            .collect();
        rows.sort_by(|a, b| b.rating.cmp(&a.rating).then(a.username.cmp(&b.username)));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn create_pending_match(
        &self,
        record: MatchRecord,
        players: Vec<MatchPlayerRecord>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if inner.matches.contains_key(&record.id) {
            return Err(StorageError::Duplicate);
        }
        inner.match_order.push(record.id.clone());
        inner.players.insert(record.id.clone(), players);
        inner.matches.insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_match_status(
        &self,
        match_id: &str,
        status: MatchStatus,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let record = inner.matches.get_mut(match_id).ok_or(StorageError::NotFound)?;
        record.status = status;
        Ok(())
    }

    async fn record_match(
        &self,
        match_id: &str,
        players: Vec<MatchPlayerRecord>,
        status: MatchStatus,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.matches.contains_key(match_id) {
            return Err(StorageError::NotFound);
        }
        inner.players.insert(match_id.to_string(), players);
        let record = inner
            .matches
            .get_mut(match_id)
            .expect("presence checked above");
        record.status = status;
        Ok(())
    }

    async fn match_by_id(
        &self,
        match_id: &str,
    ) -> Result<Option<(MatchRecord, Vec<MatchPlayerRecord>)>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.matches.get(match_id).map(|record| {
            (
                record.clone(),
                inner.players.get(match_id).cloned().unwrap_or_default(),
            )
        }))
    }

    async fn matches_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<(MatchRecord, Vec<MatchPlayerRecord>)>, StorageError> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for match_id in inner.match_order.iter().rev() {
            if out.len() == limit {
                break;
            }
            let Some(rows) = inner.players.get(match_id) else { continue };
            if rows.iter().any(|p| p.user_id == user_id) {
                if let Some(record) = inner.matches.get(match_id) {
                    out.push((record.clone(), rows.clone()));
                }
            }
        }
        Ok(out)
    }

    async fn recent_results(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentResult>, StorageError> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for match_id in inner.match_order.iter().rev() {
            if out.len() == limit {
                break;
            }
            let Some(record) = inner.matches.get(match_id) else { continue };
            if record.status != MatchStatus::Completed {
                continue;
            }
            let Some(rows) = inner.players.get(match_id) else { continue };
            let Some(own) = rows.iter().find(|p| p.user_id == user_id) else { continue };
            if own.result.is_none() {
                continue;
            }
            let opponent = rows.iter().find(|p| p.user_id != user_id);
            out.push(RecentResult {
                won: own.result.and_then(|r| match r {
                    MatchOutcome::Win => Some(true),
                    MatchOutcome::Loss => Some(false),
                    MatchOutcome::Draw => None,
                }),
                wpm: own.wpm,
                accuracy: own.accuracy,
                consistency: own.consistency,
                opponent_rating: opponent.and_then(|o| o.rating_before),
                created: record.created,
            });
        }
        Ok(out)
    }

    async fn insert_daily_score(&self, row: DailyScoreRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let key = (row.user_id.clone(), row.day.clone());
        if inner.daily.contains_key(&key) {
            return Err(StorageError::Duplicate);
        }
        inner.daily.insert(key, row);
        Ok(())
    }

    async fn daily_top(
        &self,
        day: &str,
        limit: usize,
    ) -> Result<Vec<(DailyScoreRecord, String)>, StorageError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<&DailyScoreRecord> =
            inner.daily.values().filter(|r| r.day == day).collect();
        rows.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|r| {
                let username = inner
                    .users
                    .get(&r.user_id)
                    .map(|u| u.username.clone())
                    .unwrap_or_default();
                (r.clone(), username)
            })
            .collect())
    }

    async fn daily_rank(&self, day: &str, user_id: &str) -> Result<Option<i64>, StorageError> {
        let inner = self.inner.read().await;
        let Some(own) = inner.daily.get(&(user_id.to_string(), day.to_string())) else {
            return Ok(None);
        };
        let above = inner
            .daily
            .values()
            .filter(|r| r.day == day && r.score > own.score)
            .count() as i64;
        Ok(Some(above + 1))
    }

    async fn daily_scores_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<DailyScoreRecord>, StorageError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<DailyScoreRecord> = inner
            .daily
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.day.cmp(&a.day));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str, username: &str) -> UserRecord {
        UserRecord {
            id: id.into(),
            username: username.into(),
            email_hash: None,
            password_hash: None,
            settings: serde_json::json!({}),
            created: Utc::now(),
        }
    }

    fn daily(user_id: &str, day: &str, score: f64) -> DailyScoreRecord {
        DailyScoreRecord {
            user_id: user_id.into(),
            day: day.into(),
            wpm: 80.0,
            raw_wpm: 85.0,
            accuracy: 0.96,
            consistency: 0.8,
            score,
            correct_chars: 400,
            total_typed: 410,
            errors: 10,
            seed: "veloxtype-daily-test".into(),
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn usernames_are_unique_case_folded() {
        let store = MemoryStore::new();
        store.create_user(user("u1", "Speedy")).await.expect("create");
        let err = store.create_user(user("u2", "speedy")).await.unwrap_err();
        assert!(matches!(err, StorageError::Duplicate));
        let found = store.user_by_username("SPEEDY").await.expect("query");
        assert_eq!(found.expect("present").id, "u1");
    }

    #[tokio::test]
    async fn new_users_start_in_placement() {
        let store = MemoryStore::new();
        store.create_user(user("u1", "a")).await.expect("create");
        let row = store.rating_row("u1").await.expect("query").expect("row");
        assert_eq!(row.rating, None);
        assert_eq!(row.placement_games_played, 0);
    }

    #[tokio::test]
    async fn duplicate_daily_is_distinguished() {
        let store = MemoryStore::new();
        store.create_user(user("u1", "a")).await.expect("create");
        store
            .insert_daily_score(daily("u1", "2025-06-01", 70.0))
            .await
            .expect("first insert");
        let err = store
            .insert_daily_score(daily("u1", "2025-06-01", 80.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Duplicate));
        // A different day is fine.
        store
            .insert_daily_score(daily("u1", "2025-06-02", 80.0))
            .await
            .expect("next day");
    }

    #[tokio::test]
    async fn daily_rank_counts_better_scores() {
        let store = MemoryStore::new();
        for (id, score) in [("u1", 50.0), ("u2", 70.0), ("u3", 90.0)] {
            store.create_user(user(id, id)).await.expect("create");
            store
                .insert_daily_score(daily(id, "2025-06-01", score))
                .await
                .expect("insert");
        }
        assert_eq!(store.daily_rank("2025-06-01", "u3").await.unwrap(), Some(1));
        assert_eq!(store.daily_rank("2025-06-01", "u1").await.unwrap(), Some(3));
        assert_eq!(store.daily_rank("2025-06-01", "nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn leaderboard_position_is_count_above_plus_one() {
        let store = MemoryStore::new();
        for (id, rating) in [("u1", 1200), ("u2", 1500), ("u3", 2100)] {
            store.create_user(user(id, id)).await.expect("create");
            store.update_placement_mmr(id, rating).await.expect("mmr");
        }
        assert_eq!(store.leaderboard_position(2100).await.unwrap(), 1);
        assert_eq!(store.leaderboard_position(1200).await.unwrap(), 3);
        assert_eq!(store.leaderboard_position(900).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn delete_user_cascades() {
        let store = MemoryStore::new();
        store.create_user(user("u1", "a")).await.expect("create");
        store
            .insert_daily_score(daily("u1", "2025-06-01", 70.0))
            .await
            .expect("insert");
        store.delete_user("u1").await.expect("delete");
        assert!(store.user_by_id("u1").await.unwrap().is_none());
        assert!(store.rating_row("u1").await.unwrap().is_none());
        assert!(store.daily_rank("2025-06-01", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_handle_surfaces_503_error() {
        let handle = StoreHandle::unavailable();
        assert!(matches!(handle.get(), Err(StorageError::Unavailable)));
    }
}
