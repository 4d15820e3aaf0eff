//! `MatchStore` on tokio-postgres. Every multi-row operation of the gateway
//! runs inside an explicit transaction; unique violations surface as
//! `StorageError::Duplicate` so the HTTP layer can answer 409.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row, Transaction};
use tracing::{error, info};

use crate::collections::{
    DailyScoreRecord, LeaderboardRow, MatchPlayerRecord, MatchRecord, MatchStatus, RatingRecord,
    RatingUpdate, RecentResult, UserRecord,
};
use crate::storage::{MatchStore, StorageError};
use common_match::scoring::MatchOutcome;

pub struct PgStore {
    // Transactions need exclusive access to the client.
    client: Mutex<Client>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id              TEXT PRIMARY KEY,
    username        TEXT NOT NULL,
    username_folded TEXT NOT NULL UNIQUE,
    email_hash      TEXT,
    password_hash   TEXT,
    settings        TEXT NOT NULL DEFAULT '{}',
    created         TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS ratings (
    user_id                 TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    rating                  INTEGER,
    competitive_rating      INTEGER,
    placement_games_played  INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS matches (
    id                  TEXT PRIMARY KEY,
    seed                TEXT NOT NULL,
    mode                TEXT NOT NULL,
    round_time_seconds  INTEGER NOT NULL,
    status              TEXT NOT NULL,
    created             TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS match_players (
    match_id         TEXT NOT NULL REFERENCES matches(id) ON DELETE CASCADE,
    user_id          TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    wpm              DOUBLE PRECISION,
    raw_wpm          DOUBLE PRECISION,
    accuracy         DOUBLE PRECISION,
    consistency      DOUBLE PRECISION,
    score            DOUBLE PRECISION,
    result           TEXT,
    damage_dealt     INTEGER NOT NULL DEFAULT 0,
    damage_taken     INTEGER NOT NULL DEFAULT 0,
    errors           INTEGER NOT NULL DEFAULT 0,
    correct_chars    INTEGER NOT NULL DEFAULT 0,
    total_typed      INTEGER NOT NULL DEFAULT 0,
    rating_before    INTEGER,
    rating_after     INTEGER,
    rating_delta     INTEGER,
    progress_samples TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (match_id, user_id)
);
CREATE INDEX IF NOT EXISTS match_players_user_idx ON match_players(user_id);
CREATE TABLE IF NOT EXISTS daily_scores (
    user_id       TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    day           TEXT NOT NULL,
    wpm           DOUBLE PRECISION NOT NULL,
    raw_wpm       DOUBLE PRECISION NOT NULL,
    accuracy      DOUBLE PRECISION NOT NULL,
    consistency   DOUBLE PRECISION NOT NULL,
    score         DOUBLE PRECISION NOT NULL,
    correct_chars INTEGER NOT NULL,
    total_typed   INTEGER NOT NULL,
    errors        INTEGER NOT NULL,
    seed          TEXT NOT NULL,
    created       TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, day)
);
";

impl PgStore {
    /// Connect and make sure the schema exists. The connection driver runs on
    /// its own task for the life of the store.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(backend)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });

        client.batch_execute(SCHEMA).await.map_err(backend)?;
        info!("postgres store ready");
        Ok(Self { client: Mutex::new(client) })
    }
}

fn backend(e: tokio_postgres::Error) -> StorageError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        StorageError::Duplicate
    } else {
        StorageError::Backend(e.to_string())
    }
}

fn user_from_row(row: &Row) -> UserRecord {
    let settings_raw: String = row.get("settings");
    UserRecord {
        id: row.get("id"),
        username: row.get("username"),
        email_hash: row.get("email_hash"),
        password_hash: row.get("password_hash"),
        settings: serde_json::from_str(&settings_raw).unwrap_or_else(|_| serde_json::json!({})),
        created: row.get("created"),
    }
}

fn rating_from_row(row: &Row) -> RatingRecord {
    let games: i32 = row.get("placement_games_played");
    RatingRecord {
        user_id: row.get("user_id"),
        rating: row.get("rating"),
        competitive_rating: row.get("competitive_rating"),
        placement_games_played: games.max(0) as u32,
    }
}

fn outcome_from_str(raw: Option<String>) -> Option<MatchOutcome> {
    match raw.as_deref() {
        Some("win") => Some(MatchOutcome::Win),
        Some("loss") => Some(MatchOutcome::Loss),
        Some("draw") => Some(MatchOutcome::Draw),
        _ => None,
    }
}

fn match_from_row(row: &Row) -> Result<MatchRecord, StorageError> {
    let status_raw: String = row.get("status");
    let status = MatchStatus::parse(&status_raw)
        .ok_or_else(|| StorageError::Backend(format!("unknown match status {status_raw}")))?;
    let round_time: i32 = row.get("round_time_seconds");
    Ok(MatchRecord {
        id: row.get("id"),
        seed: row.get("seed"),
        mode: row.get("mode"),
        round_time_seconds: round_time.max(0) as u32,
        status,
        created: row.get("created"),
    })
}

fn player_from_row(row: &Row) -> MatchPlayerRecord {
    let samples_raw: String = row.get("progress_samples");
    let get_u32 = |name: &str| -> u32 {
        let v: i32 = row.get(name);
        v.max(0) as u32
    };
    MatchPlayerRecord {
        match_id: row.get("match_id"),
        user_id: row.get("user_id"),
        wpm: row.get("wpm"),
        raw_wpm: row.get("raw_wpm"),
        accuracy: row.get("accuracy"),
        consistency: row.get("consistency"),
        score: row.get("score"),
        result: outcome_from_str(row.get("result")),
        damage_dealt: row.get("damage_dealt"),
        damage_taken: row.get("damage_taken"),
        errors: get_u32("errors"),
        correct_chars: get_u32("correct_chars"),
        total_typed: get_u32("total_typed"),
        rating_before: row.get("rating_before"),
        rating_after: row.get("rating_after"),
        rating_delta: row.get("rating_delta"),
        progress_samples: serde_json::from_str(&samples_raw).unwrap_or_default(),
    }
}

async fn upsert_player_row(
    tx: &Transaction<'_>,
    player: &MatchPlayerRecord,
) -> Result<(), StorageError> {
    let samples =
        serde_json::to_string(&player.progress_samples).unwrap_or_else(|_| "[]".to_string());
    tx.execute(
        "INSERT INTO match_players (
            match_id, user_id, wpm, raw_wpm, accuracy, consistency, score, result,
            damage_dealt, damage_taken, errors, correct_chars, total_typed,
            rating_before, rating_after, rating_delta, progress_samples)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
         ON CONFLICT (match_id, user_id) DO UPDATE SET
            wpm = EXCLUDED.wpm, raw_wpm = EXCLUDED.raw_wpm,
            accuracy = EXCLUDED.accuracy, consistency = EXCLUDED.consistency,
            score = EXCLUDED.score, result = EXCLUDED.result,
            damage_dealt = EXCLUDED.damage_dealt, damage_taken = EXCLUDED.damage_taken,
            errors = EXCLUDED.errors, correct_chars = EXCLUDED.correct_chars,
            total_typed = EXCLUDED.total_typed, rating_before = EXCLUDED.rating_before,
            rating_after = EXCLUDED.rating_after, rating_delta = EXCLUDED.rating_delta,
            progress_samples = EXCLUDED.progress_samples",
        &[
            &player.match_id,
            &player.user_id,
            &player.wpm,
            &player.raw_wpm,
            &player.accuracy,
            &player.consistency,
            &player.score,
            &player.result.map(|r| r.as_str()),
            &player.damage_dealt,
            &player.damage_taken,
            &(player.errors as i32),
            &(player.correct_chars as i32),
            &(player.total_typed as i32),
            &player.rating_before,
            &player.rating_after,
            &player.rating_delta,
            &samples,
        ],
    )
    .await
    .map_err(backend)?;
    Ok(())
}

#[async_trait]
impl MatchStore for PgStore {
    async fn create_user(&self, user: UserRecord) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(backend)?;
        let settings =
            serde_json::to_string(&user.settings).unwrap_or_else(|_| "{}".to_string());
        tx.execute(
            "INSERT INTO users (id, username, username_folded, email_hash, password_hash, settings, created)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
            &[
                &user.id,
                &user.username,
                &user.username.to_lowercase(),
                &user.email_hash,
                &user.password_hash,
                &settings,
                &user.created,
            ],
        )
        .await
        .map_err(backend)?;
        tx.execute("INSERT INTO ratings (user_id) VALUES ($1)", &[&user.id])
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)
    }

    async fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT * FROM users WHERE id = $1", &[&user_id])
            .await
            .map_err(backend)?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM users WHERE username_folded = $1",
                &[&username.to_lowercase()],
            )
            .await
            .map_err(backend)?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn update_settings(
        &self,
        user_id: &str,
        settings: serde_json::Value,
    ) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        let raw = serde_json::to_string(&settings).unwrap_or_else(|_| "{}".to_string());
        let updated = client
            .execute("UPDATE users SET settings = $2 WHERE id = $1", &[&user_id, &raw])
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        let deleted = client
            .execute("DELETE FROM users WHERE id = $1", &[&user_id])
            .await
            .map_err(backend)?;
        if deleted == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn rating_row(&self, user_id: &str) -> Result<Option<RatingRecord>, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT * FROM ratings WHERE user_id = $1", &[&user_id])
            .await
            .map_err(backend)?;
        Ok(row.as_ref().map(rating_from_row))
    }

    async fn apply_ratings(&self, updates: Vec<RatingUpdate>) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(backend)?;
        for update in &updates {
            let updated = tx
                .execute(
                    "UPDATE ratings SET rating = $2, competitive_rating = $3 WHERE user_id = $1",
                    &[&update.user_id, &update.rating, &update.competitive_rating],
                )
                .await
                .map_err(backend)?;
            if updated == 0 {
                return Err(StorageError::NotFound);
            }
        }
        tx.commit().await.map_err(backend)
    }

    async fn increment_placement(&self, updates: Vec<(String, u32)>) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(backend)?;
        for (user_id, new_count) in &updates {
            let updated = tx
                .execute(
                    "UPDATE ratings SET placement_games_played = $2 WHERE user_id = $1",
                    &[user_id, &(*new_count as i32)],
                )
                .await
                .map_err(backend)?;
            if updated == 0 {
                return Err(StorageError::NotFound);
            }
        }
        tx.commit().await.map_err(backend)
    }

    async fn update_placement_mmr(
        &self,
        user_id: &str,
        initial_rating: i32,
    ) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(backend)?;
        let updated = tx
            .execute(
                "UPDATE ratings SET rating = $2 WHERE user_id = $1",
                &[&user_id, &initial_rating],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        tx.commit().await.map_err(backend)
    }

    async fn leaderboard_position(&self, rating: i32) -> Result<i64, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM ratings WHERE rating > $1",
                &[&rating],
            )
            .await
            .map_err(backend)?;
        let above: i64 = row.get(0);
        Ok(above + 1)
    }

    async fn leaderboard_page(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LeaderboardRow>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT r.user_id, u.username, r.rating, r.competitive_rating
                 FROM ratings r JOIN users u ON u.id = r.user_id
                 WHERE r.rating IS NOT NULL
                 ORDER BY r.rating DESC, u.username ASC
                 LIMIT $1 OFFSET $2",
                &[&(limit as i64), &(offset as i64)],
            )
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|row| LeaderboardRow {
                user_id: row.get("user_id"),
                username: row.get("username"),
                rating: row.get("rating"),
                competitive_rating: row.get("competitive_rating"),
            })
            .collect())
    }

    async fn create_pending_match(
        &self,
        record: MatchRecord,
        players: Vec<MatchPlayerRecord>,
    ) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(backend)?;
        tx.execute(
            "INSERT INTO matches (id, seed, mode, round_time_seconds, status, created)
             VALUES ($1,$2,$3,$4,$5,$6)",
            &[
                &record.id,
                &record.seed,
                &record.mode,
                &(record.round_time_seconds as i32),
                &record.status.as_str(),
                &record.created,
            ],
        )
        .await
        .map_err(backend)?;
        for player in &players {
            upsert_player_row(&tx, player).await?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn set_match_status(
        &self,
        match_id: &str,
        status: MatchStatus,
    ) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE matches SET status = $2 WHERE id = $1",
                &[&match_id, &status.as_str()],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn record_match(
        &self,
        match_id: &str,
        players: Vec<MatchPlayerRecord>,
        status: MatchStatus,
    ) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(backend)?;
        let updated = tx
            .execute(
                "UPDATE matches SET status = $2 WHERE id = $1",
                &[&match_id, &status.as_str()],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StorageError::NotFound);
        }
        for player in &players {
            upsert_player_row(&tx, player).await?;
        }
        tx.commit().await.map_err(backend)
    }

    async fn match_by_id(
        &self,
        match_id: &str,
    ) -> Result<Option<(MatchRecord, Vec<MatchPlayerRecord>)>, StorageError> {
        let client = self.client.lock().await;
        let Some(row) = client
            .query_opt("SELECT * FROM matches WHERE id = $1", &[&match_id])
            .await
            .map_err(backend)?
        else {
            return Ok(None);
        };
        let record = match_from_row(&row)?;
        let players = client
            .query("SELECT * FROM match_players WHERE match_id = $1", &[&match_id])
            .await
            .map_err(backend)?
            .iter()
            .map(player_from_row)
            .collect();
        Ok(Some((record, players)))
    }

    async fn matches_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<(MatchRecord, Vec<MatchPlayerRecord>)>, StorageError> {
        let client = self.client.lock().await;
        let match_rows = client
            .query(
                "SELECT m.* FROM matches m
                 JOIN match_players mp ON mp.match_id = m.id
                 WHERE mp.user_id = $1
                 ORDER BY m.created DESC
                 LIMIT $2",
                &[&user_id, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        let mut out = Vec::with_capacity(match_rows.len());
        for row in &match_rows {
            let record = match_from_row(row)?;
            let players = client
                .query("SELECT * FROM match_players WHERE match_id = $1", &[&record.id])
                .await
                .map_err(backend)?
                .iter()
                .map(player_from_row)
                .collect();
            out.push((record, players));
        }
        Ok(out)
    }

    async fn recent_results(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentResult>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT own.wpm, own.accuracy, own.consistency, own.result,
                        opp.rating_before AS opponent_rating, m.created
                 FROM match_players own
                 JOIN matches m ON m.id = own.match_id
                 LEFT JOIN match_players opp
                   ON opp.match_id = own.match_id AND opp.user_id <> own.user_id
                 WHERE own.user_id = $1 AND m.status = 'completed'
                   AND own.result IS NOT NULL
                 ORDER BY m.created DESC
                 LIMIT $2",
                &[&user_id, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|row| {
                let outcome = outcome_from_str(row.get("result"));
                RecentResult {
                    won: outcome.and_then(|r| match r {
                        MatchOutcome::Win => Some(true),
                        MatchOutcome::Loss => Some(false),
                        MatchOutcome::Draw => None,
                    }),
                    wpm: row.get("wpm"),
                    accuracy: row.get("accuracy"),
                    consistency: row.get("consistency"),
                    opponent_rating: row.get("opponent_rating"),
                    created: row.get("created"),
                }
            })
            .collect())
    }

    async fn insert_daily_score(&self, row: DailyScoreRecord) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO daily_scores (
                    user_id, day, wpm, raw_wpm, accuracy, consistency, score,
                    correct_chars, total_typed, errors, seed, created)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
                &[
                    &row.user_id,
                    &row.day,
                    &row.wpm,
                    &row.raw_wpm,
                    &row.accuracy,
                    &row.consistency,
                    &row.score,
                    &(row.correct_chars as i32),
                    &(row.total_typed as i32),
                    &(row.errors as i32),
                    &row.seed,
                    &row.created,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn daily_top(
        &self,
        day: &str,
        limit: usize,
    ) -> Result<Vec<(DailyScoreRecord, String)>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT d.*, u.username FROM daily_scores d
                 JOIN users u ON u.id = d.user_id
                 WHERE d.day = $1
                 ORDER BY d.score DESC
                 LIMIT $2",
                &[&day, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|row| {
                let get_u32 = |name: &str| -> u32 {
                    let v: i32 = row.get(name);
                    v.max(0) as u32
                };
                (
                    DailyScoreRecord {
                        user_id: row.get("user_id"),
                        day: row.get("day"),
                        wpm: row.get("wpm"),
                        raw_wpm: row.get("raw_wpm"),
                        accuracy: row.get("accuracy"),
                        consistency: row.get("consistency"),
                        score: row.get("score"),
                        correct_chars: get_u32("correct_chars"),
                        total_typed: get_u32("total_typed"),
                        errors: get_u32("errors"),
                        seed: row.get("seed"),
                        created: row.get("created"),
                    },
                    row.get("username"),
                )
            })
            .collect())
    }

    async fn daily_rank(&self, day: &str, user_id: &str) -> Result<Option<i64>, StorageError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT 1 + COUNT(*) FROM daily_scores better
                 WHERE better.day = $1
                   AND better.score > (SELECT score FROM daily_scores
                                       WHERE day = $1 AND user_id = $2)",
                &[&day, &user_id],
            )
            .await
            .map_err(backend)?;
        let Some(row) = row else { return Ok(None) };
        let own_exists = client
            .query_opt(
                "SELECT 1 FROM daily_scores WHERE day = $1 AND user_id = $2",
                &[&day, &user_id],
            )
            .await
            .map_err(backend)?;
        if own_exists.is_none() {
            return Ok(None);
        }
        Ok(Some(row.get(0)))
    }

    async fn daily_scores_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<DailyScoreRecord>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM daily_scores WHERE user_id = $1 ORDER BY day DESC LIMIT $2",
                &[&user_id, &(limit as i64)],
            )
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|row| {
                let get_u32 = |name: &str| -> u32 {
                    let v: i32 = row.get(name);
                    v.max(0) as u32
                };
                DailyScoreRecord {
                    user_id: row.get("user_id"),
                    day: row.get("day"),
                    wpm: row.get("wpm"),
                    raw_wpm: row.get("raw_wpm"),
                    accuracy: row.get("accuracy"),
                    consistency: row.get("consistency"),
                    score: row.get("score"),
                    correct_chars: get_u32("correct_chars"),
                    total_typed: get_u32("total_typed"),
                    errors: get_u32("errors"),
                    seed: row.get("seed"),
                    created: row.get("created"),
                }
            })
            .collect())
    }
}
