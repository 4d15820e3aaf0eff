//! Matchmaking service. Holds the ranked queue and the waiters' sockets,
//! runs the one-second pairing tick, and hands paired matches to the
//! orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use common_match::consts::BASE_PLACEMENT_RATING;
use common_match::matchmaking::{MatchQueue, Waiter};
use common_match::message::ServerFrame;
use common_match::rating::{provisional_estimate, PlacementGame};
use common_match::shutdown::ShutdownReceiver;
use common_match::timestamp_ms;

use services::collections::{MatchPlayerRecord, MatchRecord, MatchStatus};
use services::storage::StoreHandle;

use crate::orchestrator::Orchestrator;
use crate::room::{MatchConfig, PlayerSeat};
use crate::{FrameSink, SessionMessage};

const PAIRING_TICK: Duration = Duration::from_secs(1);

pub struct Lobby {
    queue: Mutex<MatchQueue>,
    sinks: Mutex<HashMap<String, FrameSink>>,
    store: StoreHandle,
    orchestrator: Arc<Orchestrator>,
}

impl Lobby {
    pub fn new(store: StoreHandle, orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(MatchQueue::new()),
            sinks: Mutex::new(HashMap::new()),
            store,
            orchestrator,
        })
    }

    /// Enter the queue. The caller has already authenticated the user; a
    /// second join from the same user replaces the first.
    pub async fn join(&self, user_id: &str, username: &str, sink: FrameSink) {
        let (rating, ranked) = self.matchmaking_rating(user_id).await;
        {
            let mut queue = self.queue.lock().await;
            queue.join(Waiter {
                user_id: user_id.to_string(),
                username: username.to_string(),
                rating,
                ranked,
                joined_at: Utc::now(),
            });
        }
        let _ = sink.send(SessionMessage::Frame(ServerFrame::Queued));
        self.sinks.lock().await.insert(user_id.to_string(), sink);
        debug!(user_id, rating, ranked, "queued for matchmaking");
    }

    /// Drop a waiter (leave frame or disconnect). Silent per protocol.
    pub async fn leave(&self, user_id: &str) {
        self.queue.lock().await.leave(user_id);
        self.sinks.lock().await.remove(user_id);
    }

    pub async fn waiting(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Ranked players queue at their rating; unranked at the confidence-
    /// blended placement estimate.
    async fn matchmaking_rating(&self, user_id: &str) -> (i32, bool) {
        let Ok(store) = self.store.get() else {
            return (BASE_PLACEMENT_RATING, false);
        };
        match store.rating_row(user_id).await {
            Ok(Some(row)) => match row.rating {
                Some(rating) => (rating, true),
                None => {
                    let games: Vec<PlacementGame> = store
                        .recent_results(user_id, 5)
                        .await
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|r| {
                            Some(PlacementGame {
                                won: r.won?,
                                wpm: r.wpm?,
                                accuracy: r.accuracy.unwrap_or(0.0),
                                consistency: r.consistency.unwrap_or(0.5),
                                opponent_rating: r.opponent_rating,
                            })
                        })
                        .collect();
                    (provisional_estimate(&games), false)
                }
            },
            _ => (BASE_PLACEMENT_RATING, false),
        }
    }

    /// Pairing loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownReceiver) {
        let mut ticker = tokio::time::interval(PAIRING_TICK);
        let mut shutdown = shutdown;
        info!("matchmaking lobby started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("matchmaking lobby stopped");
    }

    pub async fn tick(&self) {
        let pairs = self.queue.lock().await.pair_ready(Utc::now());
        for (first, second) in pairs {
            self.launch_match(first, second).await;
        }
    }

    async fn launch_match(&self, first: Waiter, second: Waiter) {
        let match_id = Uuid::new_v4().to_string();
        let seed = Uuid::new_v4().to_string();
        let seats = [seat_for(&first), seat_for(&second)];
        let cfg = MatchConfig::ranked(match_id.clone(), seed, seats, timestamp_ms());

        info!(
            match_id = %match_id,
            first = %first.user_id,
            second = %second.user_id,
            gap = (first.rating - second.rating).abs(),
            "paired"
        );

        // Pending match + player shells go down before anyone plays; the
        // room only updates them afterwards.
        if let Ok(store) = self.store.get() {
            let record = MatchRecord {
                id: cfg.match_id.clone(),
                seed: cfg.seed.clone(),
                mode: cfg.mode.clone(),
                round_time_seconds: cfg.round_time_seconds,
                status: MatchStatus::Pending,
                created: Utc::now(),
            };
            let shells = cfg
                .players
                .iter()
                .map(|p| MatchPlayerRecord::shell(cfg.match_id.clone(), p.user_id.clone()))
                .collect();
            if let Err(e) = store.create_pending_match(record, shells).await {
                error!(match_id = %cfg.match_id, error = %e, "pending match write failed");
            }
        }

        self.orchestrator.spawn_room(cfg.clone()).await;

        let mut sinks = self.sinks.lock().await;
        for (waiter, opponent) in [(&first, &second), (&second, &first)] {
            if let Some(sink) = sinks.remove(&waiter.user_id) {
                let _ = sink.send(SessionMessage::Frame(ServerFrame::MatchFound {
                    match_id: cfg.match_id.clone(),
                    seed: cfg.seed.clone(),
                    mode: cfg.mode.clone(),
                    round_time_seconds: cfg.round_time_seconds,
                    text_length: cfg.text_length,
                    difficulty: cfg.difficulty,
                    punctuation: cfg.punctuation,
                    start_at: cfg.start_at,
                    max_rounds: cfg.max_rounds,
                    opponent_id: opponent.user_id.clone(),
                    opponent_rating: cfg
                        .seat(&opponent.user_id)
                        .and_then(|s| s.rating),
                }));
            }
        }
    }
}

fn seat_for(waiter: &Waiter) -> PlayerSeat {
    PlayerSeat {
        user_id: waiter.user_id.clone(),
        username: waiter.username.clone(),
        rating: waiter.ranked.then_some(waiter.rating),
        provisional: waiter.rating,
    }
}
