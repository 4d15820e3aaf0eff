//! One room per match. The room task owns all runtime state for its match
//! and serialises every transition: commands arrive over an mpsc channel and
//! phase deadlines are timers composed into the same select loop, so nothing
//! here is ever concurrently mutated.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use common_match::consts::{
    DEFAULT_BREAK_SECONDS, DEFAULT_COUNTDOWN_SECONDS, DEFAULT_MAX_ROUNDS, DEFAULT_PREP_SECONDS,
    DEFAULT_ROUND_TIME_SECONDS, DEFAULT_TEXT_LENGTH, DRAW_WINDOW_SECONDS, INITIAL_HP,
    MAX_CHARS_PER_SEC_RANKED, OVERPERFORMANCE_WINDOW, PLACEMENT_REQUIRED, RECONNECT_GRACE_MS,
    REGULATION_ROUNDS, SUBMIT_GRACE_MS,
};
use common_match::message::{
    DrawChoice, PlayerSummary, ProgressSnapshot, RoundSubmission, ServerFrame,
};
use common_match::rating::{
    calculate_placement_rating, competitive_after_match, overperformance_promotion, HistorySample,
    PlacementGame,
};
use common_match::scoring::{self, MatchOutcome, RoundMetrics};
use common_match::textgen::{self, Difficulty};
use common_match::timestamp_ms;

use services::collections::{MatchPlayerRecord, MatchStatus, RatingUpdate};
use services::storage::{StorageError, StoreHandle};

use crate::{FrameSink, SessionMessage};

/// One seat of a match as matchmaking handed it over. `rating` is the real
/// rating for ranked players and the provisional estimate for players still
/// in placement.
#[derive(Debug, Clone)]
pub struct PlayerSeat {
    pub user_id: String,
    pub username: String,
    pub rating: Option<i32>,
    pub provisional: i32,
}

impl PlayerSeat {
    /// The rating band this player is scored and matched against.
    pub fn effective_rating(&self) -> i32 {
        self.rating.unwrap_or(self.provisional)
    }
}

/// Everything the orchestrator needs to run one match. Built by matchmaking,
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub match_id: String,
    pub seed: String,
    pub mode: String,
    pub players: [PlayerSeat; 2],
    pub round_time_seconds: u32,
    pub text_length: usize,
    pub difficulty: Difficulty,
    pub punctuation: bool,
    /// Epoch ms the prep phase ends and the first countdown begins.
    pub start_at: u64,
    pub max_rounds: u32,
    pub prep_seconds: u32,
    pub countdown_seconds: u32,
    pub break_seconds: u32,
    pub reconnect_grace_ms: u64,
    pub submit_grace_ms: u64,
}

impl MatchConfig {
    pub fn ranked(match_id: String, seed: String, players: [PlayerSeat; 2], now_ms: u64) -> Self {
        Self {
            match_id,
            seed,
            mode: "ranked".to_string(),
            players,
            round_time_seconds: DEFAULT_ROUND_TIME_SECONDS,
            text_length: DEFAULT_TEXT_LENGTH,
            difficulty: Difficulty::Medium,
            punctuation: false,
            start_at: now_ms + u64::from(DEFAULT_PREP_SECONDS) * 1_000,
            max_rounds: DEFAULT_MAX_ROUNDS,
            prep_seconds: DEFAULT_PREP_SECONDS,
            countdown_seconds: DEFAULT_COUNTDOWN_SECONDS,
            break_seconds: DEFAULT_BREAK_SECONDS,
            reconnect_grace_ms: RECONNECT_GRACE_MS,
            submit_grace_ms: SUBMIT_GRACE_MS,
        }
    }

    pub fn seat(&self, user_id: &str) -> Option<&PlayerSeat> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn opponent_of(&self, user_id: &str) -> Option<&PlayerSeat> {
        self.players.iter().find(|p| p.user_id != user_id)
    }

    pub fn round_text(&self, round: u32) -> String {
        textgen::round_text(&self.seed, round, self.text_length, self.difficulty, self.punctuation)
    }
}

/// Commands a room accepts from the connection layer and matchmaking.
#[derive(Debug)]
pub enum RoomCommand {
    Join { user_id: String, sink: FrameSink },
    Disconnect { user_id: String },
    Progress { user_id: String, snapshot: ProgressSnapshot },
    Submit { user_id: String, submission: RoundSubmission },
    Forfeit { user_id: String },
    DrawVote { user_id: String, vote: DrawChoice },
}

/// Authoritative in-memory state for an in-progress match. Never persisted;
/// the durable rows are written once at finalisation.
#[derive(Debug, Clone)]
pub struct RuntimeMatchState {
    pub match_id: String,
    pub current_round: u32,
    pub max_rounds: u32,
    pub round_start_at: u64,
    pub break_seconds: u32,
    pub countdown_seconds: u32,
    pub player_hp: HashMap<String, i32>,
    pub round_wins: HashMap<String, u32>,
    pub overtime_active: bool,
    pub draw_window_open: bool,
    pub draw_votes: HashMap<String, DrawChoice>,
    pub draw_accepted: bool,
    pub winner_user_id: Option<String>,
    pub forfeited_user_id: Option<String>,
}

impl RuntimeMatchState {
    fn new(cfg: &MatchConfig) -> Self {
        let mut player_hp = HashMap::new();
        let mut round_wins = HashMap::new();
        for seat in &cfg.players {
            player_hp.insert(seat.user_id.clone(), INITIAL_HP);
            round_wins.insert(seat.user_id.clone(), 0);
        }
        Self {
            match_id: cfg.match_id.clone(),
            current_round: 0,
            max_rounds: cfg.max_rounds,
            round_start_at: 0,
            break_seconds: cfg.break_seconds,
            countdown_seconds: cfg.countdown_seconds,
            player_hp,
            round_wins,
            overtime_active: false,
            draw_window_open: false,
            draw_votes: HashMap::new(),
            draw_accepted: false,
            winner_user_id: None,
            forfeited_user_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Lobby { deadline: u64 },
    Prep,
    Countdown { until: u64 },
    Typing { deadline: u64 },
    Break { until: u64, window_next: bool },
    DrawWindow { until: u64 },
    Complete,
}

#[derive(Debug)]
struct RoundEntry {
    submission: RoundSubmission,
    elapsed_ms: u64,
}

/// Per-player running totals across rounds.
#[derive(Debug, Default)]
struct PlayerAggregate {
    rounds: Vec<RoundMetrics>,
    damage_dealt: i32,
    damage_taken: i32,
    samples: Vec<u32>,
}

pub struct Room {
    cfg: MatchConfig,
    state: RuntimeMatchState,
    phase: Phase,
    sinks: HashMap<String, FrameSink>,
    submissions: HashMap<String, RoundEntry>,
    progress: HashMap<String, ProgressSnapshot>,
    aggregates: HashMap<String, PlayerAggregate>,
    disconnect_since: HashMap<String, u64>,
    abandoned: bool,
    store: StoreHandle,
    rx: mpsc::UnboundedReceiver<RoomCommand>,
}

impl Room {
    pub fn new(cfg: MatchConfig, store: StoreHandle, rx: mpsc::UnboundedReceiver<RoomCommand>) -> Self {
        let state = RuntimeMatchState::new(&cfg);
        let lobby_deadline = cfg.start_at + cfg.reconnect_grace_ms;
        let mut aggregates = HashMap::new();
        for seat in &cfg.players {
            aggregates.insert(seat.user_id.clone(), PlayerAggregate::default());
        }
        Self {
            cfg,
            state,
            phase: Phase::Lobby { deadline: lobby_deadline },
            sinks: HashMap::new(),
            submissions: HashMap::new(),
            progress: HashMap::new(),
            aggregates,
            disconnect_since: HashMap::new(),
            abandoned: false,
            store,
            rx,
        }
    }

    /// Owner loop: runs until the match reaches a terminal state, then
    /// finalises exactly once and returns.
    pub async fn run(mut self) {
        if let Ok(store) = self.store.get() {
            if let Err(e) = store
                .set_match_status(&self.cfg.match_id, MatchStatus::InProgress)
                .await
            {
                warn!(match_id = %self.cfg.match_id, error = %e, "could not mark match in-progress");
            }
        }
        info!(match_id = %self.cfg.match_id, "room started");

        while self.phase != Phase::Complete {
            let wake_at = self.next_deadline_ms();
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // Every handle dropped: the process is shutting down.
                        self.abandoned = true;
                        break;
                    }
                },
                _ = sleep_until_ms(wake_at) => self.handle_tick(timestamp_ms()),
            }
        }

        self.finalize().await;
    }

    fn participants(&self) -> [&str; 2] {
        [&self.cfg.players[0].user_id, &self.cfg.players[1].user_id]
    }

    fn is_participant(&self, user_id: &str) -> bool {
        self.cfg.seat(user_id).is_some()
    }

    fn send_to(&self, user_id: &str, frame: ServerFrame) {
        if let Some(sink) = self.sinks.get(user_id) {
            let _ = sink.send(SessionMessage::Frame(frame));
        }
    }

    fn send_opponent(&self, user_id: &str, frame: ServerFrame) {
        if let Some(opponent) = self.cfg.opponent_of(user_id) {
            self.send_to(&opponent.user_id, frame);
        }
    }

    fn broadcast(&self, frame: ServerFrame) {
        for seat in &self.cfg.players {
            self.send_to(&seat.user_id, frame.clone());
        }
    }

    // ---- deadlines ----

    fn phase_deadline_ms(&self) -> Option<u64> {
        match self.phase {
            Phase::Lobby { deadline } => Some(deadline),
            Phase::Prep => Some(self.cfg.start_at),
            Phase::Countdown { until } => Some(until),
            Phase::Typing { deadline } => Some(deadline),
            Phase::Break { until, .. } => Some(until),
            Phase::DrawWindow { until } => Some(until),
            Phase::Complete => None,
        }
    }

    fn next_deadline_ms(&self) -> Option<u64> {
        let disconnect = self
            .disconnect_since
            .values()
            .map(|since| since + self.cfg.reconnect_grace_ms)
            .min();
        match (self.phase_deadline_ms(), disconnect) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ---- timer-driven transitions ----

    fn handle_tick(&mut self, now: u64) {
        // Reconnect grace first: a forfeit beats any phase transition.
        let expired: Vec<String> = self
            .disconnect_since
            .iter()
            .filter(|(_, since)| now >= **since + self.cfg.reconnect_grace_ms)
            .map(|(user, _)| user.clone())
            .collect();
        for user_id in expired {
            // Re-check occupancy: a reconnect clears the timer.
            if self.sinks.contains_key(&user_id) {
                self.disconnect_since.remove(&user_id);
                continue;
            }
            info!(match_id = %self.cfg.match_id, user_id = %user_id, "reconnect grace expired");
            self.forfeit(&user_id);
            return;
        }

        match self.phase {
            Phase::Lobby { deadline } if now >= deadline => self.resolve_no_shows(),
            Phase::Prep if now >= self.cfg.start_at => self.enter_countdown(self.cfg.start_at),
            Phase::Countdown { until } if now >= until => self.enter_typing(),
            Phase::Typing { deadline } if now >= deadline => self.resolve_round(now),
            Phase::Break { until, window_next } if now >= until => {
                if window_next {
                    self.phase = Phase::DrawWindow {
                        until: now + u64::from(DRAW_WINDOW_SECONDS) * 1_000,
                    };
                } else {
                    self.enter_countdown(until);
                }
            }
            Phase::DrawWindow { until } if now >= until => {
                self.close_draw_window();
                self.enter_countdown(now);
            }
            _ => {}
        }
    }

    fn resolve_no_shows(&mut self) {
        let missing: Vec<String> = self
            .cfg
            .players
            .iter()
            .filter(|p| !self.sinks.contains_key(&p.user_id))
            .map(|p| p.user_id.clone())
            .collect();
        match missing.len() {
            0 => {}
            1 => {
                info!(match_id = %self.cfg.match_id, user_id = %missing[0], "no-show forfeit");
                self.forfeit(&missing[0]);
            }
            _ => {
                info!(match_id = %self.cfg.match_id, "neither player connected, abandoning");
                self.abandoned = true;
                self.phase = Phase::Complete;
            }
        }
    }

    fn enter_countdown(&mut self, countdown_start: u64) {
        self.state.current_round += 1;
        self.state.round_start_at =
            countdown_start + u64::from(self.cfg.countdown_seconds) * 1_000;
        self.submissions.clear();
        self.progress.clear();
        self.phase = Phase::Countdown { until: self.state.round_start_at };
        debug!(
            match_id = %self.cfg.match_id,
            round = self.state.current_round,
            start_at = self.state.round_start_at,
            "countdown"
        );
    }

    fn enter_typing(&mut self) {
        let deadline = self.state.round_start_at
            + u64::from(self.cfg.round_time_seconds) * 1_000
            + self.cfg.submit_grace_ms;
        self.phase = Phase::Typing { deadline };
    }

    // ---- command handling ----

    fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { user_id, sink } => self.handle_join(user_id, sink),
            RoomCommand::Disconnect { user_id } => self.handle_disconnect(&user_id),
            RoomCommand::Progress { user_id, snapshot } => self.handle_progress(&user_id, snapshot),
            RoomCommand::Submit { user_id, submission } => self.handle_submit(&user_id, submission),
            RoomCommand::Forfeit { user_id } => {
                if self.is_participant(&user_id) && self.phase != Phase::Complete {
                    info!(match_id = %self.cfg.match_id, user_id = %user_id, "forfeit frame");
                    self.forfeit(&user_id);
                }
            }
            RoomCommand::DrawVote { user_id, vote } => self.handle_draw_vote(&user_id, vote),
        }
    }

    fn handle_join(&mut self, user_id: String, sink: FrameSink) {
        if !self.is_participant(&user_id) || self.phase == Phase::Complete {
            let _ = sink.send(SessionMessage::Frame(ServerFrame::error("not in match")));
            return;
        }

        // Duplicate join: the previous socket is told to close and the room
        // binding moves to the new one.
        if let Some(previous) = self.sinks.insert(user_id.clone(), sink) {
            let _ = previous.send(SessionMessage::Replaced);
            debug!(match_id = %self.cfg.match_id, user_id = %user_id, "socket replaced");
        }
        self.disconnect_since.remove(&user_id);

        self.send_to(
            &user_id,
            ServerFrame::Joined {
                match_id: self.cfg.match_id.clone(),
                round: self.state.current_round,
            },
        );
        self.send_opponent(&user_id, ServerFrame::OpponentJoined { user_id: user_id.clone() });

        match self.phase {
            Phase::Lobby { .. } => {
                let all_in = self
                    .cfg
                    .players
                    .iter()
                    .all(|p| self.sinks.contains_key(&p.user_id));
                if all_in {
                    let now = timestamp_ms();
                    if now >= self.cfg.start_at {
                        self.enter_countdown(now);
                    } else {
                        self.phase = Phase::Prep;
                    }
                }
            }
            Phase::Prep | Phase::Complete => {}
            // Mid-match: replay enough state for the client to rebuild the
            // round locally (text comes from the seed).
            _ => self.send_recovery(&user_id),
        }
    }

    fn send_recovery(&self, user_id: &str) {
        let opponent = self.cfg.opponent_of(user_id).map(|o| o.user_id.clone());
        let opponent_progress = opponent.as_deref().and_then(|o| self.progress.get(o)).cloned();
        let opponent_submitted = opponent
            .as_deref()
            .map(|o| self.submissions.contains_key(o))
            .unwrap_or(false);
        self.send_to(
            user_id,
            ServerFrame::MatchStateRecovery {
                server_time: timestamp_ms(),
                round_number: self.state.current_round,
                round_start_at: self.state.round_start_at,
                max_rounds: self.state.max_rounds,
                round_wins: self.state.round_wins.clone(),
                overtime_active: self.state.overtime_active,
                draw_window_open: self.state.draw_window_open,
                hp: self.state.player_hp.clone(),
                opponent_progress,
                opponent_submitted,
            },
        );
    }

    fn handle_disconnect(&mut self, user_id: &str) {
        if self.phase == Phase::Complete || !self.is_participant(user_id) {
            return;
        }
        if self.sinks.remove(user_id).is_some() {
            self.disconnect_since.insert(user_id.to_string(), timestamp_ms());
            self.send_opponent(user_id, ServerFrame::OpponentLeft { user_id: user_id.to_string() });
            debug!(match_id = %self.cfg.match_id, user_id = %user_id, "disconnected, grace running");
        }
    }

    fn handle_progress(&mut self, user_id: &str, snapshot: ProgressSnapshot) {
        if !self.is_participant(user_id) || !matches!(self.phase, Phase::Typing { .. }) {
            return;
        }
        self.send_opponent(
            user_id,
            ServerFrame::OpponentProgress {
                progress_index: snapshot.progress_index,
                typed_length: snapshot.typed_length,
                mistakes_count: snapshot.mistakes_count,
                elapsed_ms: snapshot.elapsed_ms,
            },
        );
        self.progress.insert(user_id.to_string(), snapshot);
    }

    fn handle_submit(&mut self, user_id: &str, submission: RoundSubmission) {
        if !self.is_participant(user_id) {
            return;
        }
        let now = timestamp_ms();
        match self.phase {
            Phase::Typing { deadline } if now < deadline => {
                if self.submissions.contains_key(user_id) {
                    self.send_to(user_id, ServerFrame::error("already submitted"));
                    return;
                }
                let elapsed_ms = now
                    .saturating_sub(self.state.round_start_at)
                    .clamp(1, u64::from(self.cfg.round_time_seconds) * 1_000);
                self.submissions
                    .insert(user_id.to_string(), RoundEntry { submission, elapsed_ms });
                self.send_to(user_id, ServerFrame::ResultReceived { round: self.state.current_round });
                self.send_opponent(user_id, ServerFrame::OpponentFinished);

                let all_in = self
                    .cfg
                    .players
                    .iter()
                    .all(|p| self.submissions.contains_key(&p.user_id));
                if all_in {
                    self.resolve_round(now);
                }
            }
            _ => {
                self.send_to(user_id, ServerFrame::error("submission past deadline"));
            }
        }
    }

    fn handle_draw_vote(&mut self, user_id: &str, vote: DrawChoice) {
        if !self.is_participant(user_id) {
            return;
        }
        if !self.state.draw_window_open {
            self.send_to(user_id, ServerFrame::error("invalid payload"));
            return;
        }
        self.state.draw_votes.insert(user_id.to_string(), vote);

        if vote == DrawChoice::Continue {
            // Any continue vote slams the window shut.
            let was_window_phase = matches!(self.phase, Phase::DrawWindow { .. });
            self.close_draw_window();
            if was_window_phase {
                self.enter_countdown(timestamp_ms());
            } else if let Phase::Break { until, .. } = self.phase {
                self.phase = Phase::Break { until, window_next: false };
            }
            return;
        }

        let both_draw = self
            .cfg
            .players
            .iter()
            .all(|p| self.state.draw_votes.get(&p.user_id) == Some(&DrawChoice::Draw));
        if both_draw {
            info!(match_id = %self.cfg.match_id, "draw accepted");
            self.state.draw_accepted = true;
            self.close_draw_window();
            self.complete(None, None);
        }
    }

    fn close_draw_window(&mut self) {
        self.state.draw_window_open = false;
        self.state.draw_votes.clear();
    }

    fn forfeit(&mut self, user_id: &str) {
        let winner = self.cfg.opponent_of(user_id).map(|o| o.user_id.clone());
        self.state.player_hp.insert(user_id.to_string(), 0);
        self.state.forfeited_user_id = Some(user_id.to_string());
        self.complete(winner, Some(user_id.to_string()));
    }

    fn complete(&mut self, winner: Option<String>, forfeited: Option<String>) {
        self.state.winner_user_id = winner;
        self.state.forfeited_user_id = forfeited;
        self.phase = Phase::Complete;
    }

    // ---- round resolution ----

    fn resolve_round(&mut self, now: u64) {
        let round = self.state.current_round;
        let target = self.cfg.round_text(round);
        let round_time_ms = u64::from(self.cfg.round_time_seconds) * 1_000;

        let mut scores: HashMap<String, f64> = HashMap::new();
        for seat in self.cfg.players.clone() {
            let entry = self.submissions.remove(&seat.user_id);
            let (typed, samples, total_errors, total_keystrokes, elapsed_ms) = match &entry {
                Some(e) => (
                    e.submission.typed.as_str(),
                    e.submission.samples.clone(),
                    e.submission.total_errors,
                    e.submission.total_keystrokes,
                    e.elapsed_ms,
                ),
                // No submission inside the window: score an empty round.
                None => ("", Vec::new(), None, None, round_time_ms),
            };

            let clamped =
                scoring::clamp_typed(typed, &target, elapsed_ms, MAX_CHARS_PER_SEC_RANKED);
            let metrics = scoring::compute_round(
                &target,
                &clamped,
                elapsed_ms,
                &samples,
                total_errors,
                total_keystrokes,
                Some(seat.effective_rating()),
            );
            scores.insert(seat.user_id.clone(), metrics.combat);

            let aggregate = self.aggregates.entry(seat.user_id.clone()).or_default();
            aggregate.samples.extend(samples);
            aggregate.rounds.push(metrics);
        }

        let [a, b] = self.participants().map(str::to_string);
        let score_a = scores.get(&a).copied().unwrap_or(0.0);
        let score_b = scores.get(&b).copied().unwrap_or(0.0);

        let (round_winner, dealt) = if score_a > score_b {
            (Some(a.clone()), scoring::damage(score_a, score_b))
        } else if score_b > score_a {
            (Some(b.clone()), scoring::damage(score_b, score_a))
        } else {
            (None, 0)
        };

        if let Some(winner) = &round_winner {
            let loser = if winner == &a { &b } else { &a };
            let hp = self.state.player_hp.entry(loser.clone()).or_insert(INITIAL_HP);
            *hp = (*hp - dealt).max(0);
            *self.state.round_wins.entry(winner.clone()).or_insert(0) += 1;
            if let Some(agg) = self.aggregates.get_mut(winner) {
                agg.damage_dealt += dealt;
            }
            if let Some(agg) = self.aggregates.get_mut(loser) {
                agg.damage_taken += dealt;
            }
        }

        if !self.state.overtime_active {
            let wins_a = self.state.round_wins.get(&a).copied().unwrap_or(0);
            let wins_b = self.state.round_wins.get(&b).copied().unwrap_or(0);
            let regulation_split =
                wins_a >= REGULATION_ROUNDS / 2 && wins_b >= REGULATION_ROUNDS / 2;
            if regulation_split || round >= REGULATION_ROUNDS {
                self.state.overtime_active = true;
            }
        }

        // End conditions, in priority order: KO, then round cap. Draw votes
        // terminate from the vote handler, never here.
        let hp_a = self.state.player_hp.get(&a).copied().unwrap_or(0);
        let hp_b = self.state.player_hp.get(&b).copied().unwrap_or(0);

        let terminal = if hp_a <= 0 || hp_b <= 0 {
            Some(if hp_a <= 0 { Some(b.clone()) } else { Some(a.clone()) })
        } else if round >= self.state.max_rounds {
            // Final HP tie-break.
            Some(match hp_a.cmp(&hp_b) {
                std::cmp::Ordering::Greater => Some(a.clone()),
                std::cmp::Ordering::Less => Some(b.clone()),
                std::cmp::Ordering::Equal => None,
            })
        } else {
            None
        };

        let window_next = terminal.is_none()
            && self.state.overtime_active
            && round > REGULATION_ROUNDS
            && (round - REGULATION_ROUNDS) % 2 == 0;
        if window_next {
            self.state.draw_window_open = true;
        }

        let break_until = now + u64::from(self.cfg.break_seconds) * 1_000;
        let next_round_start_at = if terminal.is_some() {
            None
        } else {
            let window_ms = if window_next {
                u64::from(DRAW_WINDOW_SECONDS) * 1_000
            } else {
                0
            };
            Some(break_until + window_ms + u64::from(self.cfg.countdown_seconds) * 1_000)
        };

        self.broadcast(ServerFrame::RoundEnd {
            round,
            round_winner: round_winner.clone(),
            damage: dealt,
            hp: self.state.player_hp.clone(),
            scores: scores.clone(),
            round_wins: self.state.round_wins.clone(),
            overtime_active: self.state.overtime_active,
            draw_window_open: self.state.draw_window_open,
            next_round_start_at,
        });
        debug!(
            match_id = %self.cfg.match_id,
            round,
            winner = round_winner.as_deref().unwrap_or("-"),
            damage = dealt,
            "round resolved"
        );

        match terminal {
            Some(winner) => self.complete(winner, None),
            None => self.phase = Phase::Break { until: break_until, window_next },
        }
    }

    // ---- finalisation ----

    fn outcome_for(&self, user_id: &str) -> Option<MatchOutcome> {
        if self.abandoned {
            return None;
        }
        match &self.state.winner_user_id {
            Some(winner) if winner == user_id => Some(MatchOutcome::Win),
            Some(_) => Some(MatchOutcome::Loss),
            None => Some(MatchOutcome::Draw),
        }
    }

    fn build_player_row(&self, user_id: &str) -> MatchPlayerRecord {
        let aggregate = &self.aggregates[user_id];
        let rounds = &aggregate.rounds;
        let n = rounds.len() as f64;
        let avg = |f: fn(&RoundMetrics) -> f64| -> Option<f64> {
            if rounds.is_empty() {
                None
            } else {
                Some(rounds.iter().map(f).sum::<f64>() / n)
            }
        };

        let mut row = MatchPlayerRecord::shell(self.cfg.match_id.clone(), user_id.to_string());
        row.wpm = avg(|m| m.wpm);
        row.raw_wpm = avg(|m| m.raw_wpm);
        row.accuracy = avg(|m| m.accuracy);
        row.consistency = avg(|m| m.consistency);
        row.score = avg(|m| m.score);
        row.result = self.outcome_for(user_id);
        row.damage_dealt = aggregate.damage_dealt;
        row.damage_taken = aggregate.damage_taken;
        row.errors = rounds.iter().map(|m| m.errors).sum();
        row.correct_chars = rounds.iter().map(|m| m.correct_chars).sum();
        row.total_typed = rounds.iter().map(|m| m.total_typed).sum();
        row.progress_samples = aggregate.samples.clone();
        row
    }

    async fn finalize(&mut self) {
        info!(
            match_id = %self.cfg.match_id,
            winner = self.state.winner_user_id.as_deref().unwrap_or("-"),
            forfeited = self.state.forfeited_user_id.as_deref().unwrap_or("-"),
            abandoned = self.abandoned,
            "finalizing"
        );

        if self.abandoned {
            if let Ok(store) = self.store.get() {
                if let Err(e) = store
                    .set_match_status(&self.cfg.match_id, MatchStatus::Abandoned)
                    .await
                {
                    error!(match_id = %self.cfg.match_id, error = %e, "abandon status write failed");
                }
            }
            self.release();
            return;
        }

        let mut rows: HashMap<String, MatchPlayerRecord> = self
            .participants()
            .map(|u| (u.to_string(), self.build_player_row(u)))
            .into_iter()
            .collect();

        match self.commit(&mut rows).await {
            Ok(()) => {
                let summaries: Vec<PlayerSummary> = self
                    .cfg
                    .players
                    .iter()
                    .filter_map(|seat| rows.get(&seat.user_id))
                    .map(|row| PlayerSummary {
                        user_id: row.user_id.clone(),
                        result: row
                            .result
                            .map(|r| r.as_str().to_string())
                            .unwrap_or_default(),
                        wpm: row.wpm.unwrap_or(0.0),
                        accuracy: row.accuracy.unwrap_or(0.0),
                        damage_dealt: row.damage_dealt,
                        damage_taken: row.damage_taken,
                        rating_before: row.rating_before,
                        rating_after: row.rating_after,
                        rating_delta: row.rating_delta,
                    })
                    .collect();
                self.broadcast(ServerFrame::MatchComplete {
                    match_id: self.cfg.match_id.clone(),
                    winner: self.state.winner_user_id.clone(),
                    draw: self.state.winner_user_id.is_none(),
                    forfeited: self.state.forfeited_user_id.clone(),
                    hp: self.state.player_hp.clone(),
                    players: summaries,
                });
            }
            Err(e) => {
                // Operational incident: the match stays abandoned in memory
                // and nobody's rating moves. No user-visible replay.
                error!(
                    match_id = %self.cfg.match_id,
                    error = %e,
                    "persistence failed during finalisation"
                );
                self.abandoned = true;
                self.broadcast(ServerFrame::error("internal error"));
            }
        }

        self.release();
    }

    /// Durable commit: metric rows, then rating resolution for both players.
    async fn commit(&self, rows: &mut HashMap<String, MatchPlayerRecord>) -> Result<(), StorageError> {
        let store = self.store.get()?;

        // Rating snapshots drive both the Elo math and the persisted
        // before/after columns.
        let mut rating_rows = HashMap::new();
        for seat in &self.cfg.players {
            let row = store.rating_row(&seat.user_id).await?;
            rating_rows.insert(seat.user_id.clone(), row);
        }
        for seat in &self.cfg.players {
            if let Some(row) = rows.get_mut(&seat.user_id) {
                row.rating_before = rating_rows
                    .get(&seat.user_id)
                    .and_then(|r| r.as_ref())
                    .and_then(|r| r.rating);
            }
        }

        let mut rating_updates: Vec<RatingUpdate> = Vec::new();
        let mut placement_increments: Vec<(String, u32)> = Vec::new();
        let mut placement_seeds: Vec<(String, i32)> = Vec::new();

        for seat in &self.cfg.players {
            let user_id = &seat.user_id;
            let Some(outcome) = self.outcome_for(user_id) else { continue };
            let rating_row = rating_rows.get(user_id).and_then(|r| r.clone());
            let opponent = self.cfg.opponent_of(user_id).expect("two players");
            let own = rows.get(user_id).cloned().expect("row built");
            let opp_row = rows.get(&opponent.user_id).cloned().expect("row built");

            match rating_row.as_ref().and_then(|r| r.rating) {
                Some(current) => {
                    let margin =
                        own.score.unwrap_or(0.0) - opp_row.score.unwrap_or(0.0);
                    let hp = self.state.player_hp.get(user_id).copied().unwrap_or(0);
                    let forfeited =
                        self.state.forfeited_user_id.as_deref() == Some(user_id.as_str());
                    let mut delta = scoring::elo_delta(
                        current,
                        opponent.effective_rating(),
                        outcome,
                        margin,
                        hp,
                        forfeited,
                    );
                    let mut new_rating = (current + delta).max(0);

                    // Overperformance accelerator over the last ten games,
                    // this one included.
                    let mut history: Vec<HistorySample> = vec![HistorySample {
                        wpm: own.wpm,
                        accuracy: own.accuracy,
                    }];
                    for recent in store
                        .recent_results(user_id, OVERPERFORMANCE_WINDOW - 1)
                        .await?
                    {
                        history.push(HistorySample { wpm: recent.wpm, accuracy: recent.accuracy });
                    }
                    if let Some(promoted) = overperformance_promotion(new_rating, &history) {
                        info!(
                            match_id = %self.cfg.match_id,
                            user_id = %user_id,
                            from = new_rating,
                            to = promoted,
                            "overperformance promotion"
                        );
                        delta += promoted - new_rating;
                        new_rating = promoted;
                    }

                    let position = store.leaderboard_position(new_rating).await?;
                    let competitive = competitive_after_match(
                        new_rating,
                        rating_row.as_ref().and_then(|r| r.competitive_rating),
                        delta,
                        position,
                    );

                    if let Some(row) = rows.get_mut(user_id) {
                        row.rating_after = Some(new_rating);
                        row.rating_delta = Some(delta);
                    }
                    rating_updates.push(RatingUpdate {
                        user_id: user_id.clone(),
                        rating: Some(new_rating),
                        competitive_rating: competitive,
                    });
                }
                None => {
                    let played = rating_row
                        .as_ref()
                        .map(|r| r.placement_games_played)
                        .unwrap_or(0);
                    let new_count = (played + 1).min(PLACEMENT_REQUIRED);
                    placement_increments.push((user_id.clone(), new_count));

                    if new_count >= PLACEMENT_REQUIRED {
                        let games =
                            self.placement_games(user_id, &own, opponent, outcome, store).await?;
                        let initial = calculate_placement_rating(&games);
                        if let Some(row) = rows.get_mut(user_id) {
                            row.rating_after = Some(initial);
                        }
                        placement_seeds.push((user_id.clone(), initial));
                        info!(
                            match_id = %self.cfg.match_id,
                            user_id = %user_id,
                            rating = initial,
                            games = games.len(),
                            "placement complete"
                        );
                    }
                }
            }
        }

        store
            .record_match(
                &self.cfg.match_id,
                rows.values().cloned().collect(),
                MatchStatus::Completed,
            )
            .await?;
        if !rating_updates.is_empty() {
            store.apply_ratings(rating_updates).await?;
        }
        if !placement_increments.is_empty() {
            store.increment_placement(placement_increments).await?;
        }
        for (user_id, initial) in placement_seeds {
            store.update_placement_mmr(&user_id, initial).await?;
        }
        Ok(())
    }

    /// Last five qualifying games, oldest first, with this match appended.
    async fn placement_games(
        &self,
        user_id: &str,
        own: &MatchPlayerRecord,
        opponent: &PlayerSeat,
        outcome: MatchOutcome,
        store: &std::sync::Arc<dyn services::storage::MatchStore>,
    ) -> Result<Vec<PlacementGame>, StorageError> {
        let mut games: Vec<PlacementGame> = store
            .recent_results(user_id, 2 * PLACEMENT_REQUIRED as usize)
            .await?
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
            .take(PLACEMENT_REQUIRED as usize - 1)
            .collect();
        games.reverse();

        let current_won = match outcome {
            MatchOutcome::Win => Some(true),
            MatchOutcome::Loss => Some(false),
            MatchOutcome::Draw => None,
        };
        if let (Some(won), Some(wpm)) = (current_won, own.wpm) {
            games.push(PlacementGame {
                won,
                wpm,
                accuracy: own.accuracy.unwrap_or(0.0),
                consistency: own.consistency.unwrap_or(0.5),
                opponent_rating: Some(opponent.effective_rating()),
            });
        }
        Ok(games)
    }

    fn release(&mut self) {
        self.submissions.clear();
        self.progress.clear();
        self.disconnect_since.clear();
        self.sinks.clear();
        info!(match_id = %self.cfg.match_id, "room released");
    }
}

async fn sleep_until_ms(deadline: Option<u64>) {
    match deadline {
        Some(at) => {
            let now = timestamp_ms();
            let delta = at.saturating_sub(now);
            tokio::time::sleep(std::time::Duration::from_millis(delta)).await;
        }
        // No deadline pending: park until a command arrives.
        None => std::future::pending::<()>().await,
    }
}
