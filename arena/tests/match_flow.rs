//! End-to-end room behaviour against the in-memory store: a full duel with
//! round damage, reconnect recovery inside the grace window, and the forfeit
//! path when the window lapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use arena::orchestrator::Orchestrator;
use arena::room::{MatchConfig, PlayerSeat, RoomCommand};
use arena::SessionMessage;
use common_match::consts::MAX_DAMAGE_PER_ROUND;
use common_match::message::{ProgressSnapshot, RoundSubmission, ServerFrame};
use common_match::scoring::MatchOutcome;
use common_match::textgen::Difficulty;
use common_match::timestamp_ms;
use services::collections::{MatchStatus, UserRecord};
use services::storage::{MatchStore, MemoryStore, StoreHandle};

type FrameRx = mpsc::UnboundedReceiver<SessionMessage>;

async fn seeded_store(users: &[(&str, Option<i32>)]) -> (Arc<MemoryStore>, StoreHandle) {
    let store = MemoryStore::shared();
    for (id, rating) in users {
        store
            .create_user(UserRecord {
                id: id.to_string(),
                username: id.to_string(),
                email_hash: None,
                password_hash: None,
                settings: serde_json::json!({}),
                created: Utc::now(),
            })
            .await
            .expect("create user");
        if let Some(rating) = rating {
            store.update_placement_mmr(id, *rating).await.expect("seed rating");
        }
    }
    let handle = StoreHandle::new(store.clone() as Arc<dyn MatchStore>);
    (store, handle)
}

fn fast_config(match_id: &str, reconnect_grace_ms: u64) -> MatchConfig {
    MatchConfig {
        match_id: match_id.to_string(),
        seed: format!("seed-{match_id}"),
        mode: "ranked".to_string(),
        players: [
            PlayerSeat {
                user_id: "alice".into(),
                username: "alice".into(),
                rating: Some(1200),
                provisional: 1200,
            },
            PlayerSeat {
                user_id: "bob".into(),
                username: "bob".into(),
                rating: Some(1200),
                provisional: 1200,
            },
        ],
        round_time_seconds: 30,
        text_length: 250,
        difficulty: Difficulty::Medium,
        punctuation: false,
        start_at: timestamp_ms(),
        max_rounds: 6,
        prep_seconds: 0,
        countdown_seconds: 0,
        break_seconds: 0,
        reconnect_grace_ms,
        submit_grace_ms: 1_000,
    }
}

async fn join(orch: &Arc<Orchestrator>, match_id: &str, user: &str) -> FrameRx {
    let (tx, rx) = mpsc::unbounded_channel();
    orch.command(match_id, user, RoomCommand::Join { user_id: user.into(), sink: tx })
        .await
        .expect("join routed");
    rx
}

async fn next_frame(rx: &mut FrameRx) -> ServerFrame {
    match timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open")
    {
        SessionMessage::Frame(frame) => frame,
        SessionMessage::Replaced => panic!("socket unexpectedly replaced"),
    }
}

async fn wait_for<F>(rx: &mut FrameRx, mut pred: F) -> ServerFrame
where
    F: FnMut(&ServerFrame) -> bool,
{
    loop {
        let frame = next_frame(rx).await;
        if pred(&frame) {
            return frame;
        }
    }
}

/// Submit and retry while the room is still counting down.
async fn submit(orch: &Arc<Orchestrator>, match_id: &str, user: &str, rx: &mut FrameRx, typed: &str) {
    for _ in 0..50 {
        orch.command(
            match_id,
            user,
            RoomCommand::Submit {
                user_id: user.into(),
                submission: RoundSubmission {
                    typed: typed.to_string(),
                    samples: vec![10, 20, 30],
                    total_errors: None,
                    total_keystrokes: None,
                },
            },
        )
        .await
        .expect("submit routed");
        let frame = wait_for(rx, |f| {
            matches!(f, ServerFrame::ResultReceived { .. })
                || matches!(f, ServerFrame::Error { .. })
        })
        .await;
        match frame {
            ServerFrame::ResultReceived { .. } => return,
            ServerFrame::Error { message } if message == "submission past deadline" => {
                sleep(Duration::from_millis(20)).await;
            }
            ServerFrame::Error { message } => panic!("unexpected error: {message}"),
            _ => unreachable!(),
        }
    }
    panic!("submission never accepted");
}

#[tokio::test]
async fn duel_deals_capped_damage_and_completes() {
    let (store, handle) = seeded_store(&[("alice", Some(1200)), ("bob", Some(1200))]).await;
    let orch = Orchestrator::new(handle);
    let cfg = fast_config("m-duel", 30_000);
    orch.spawn_room(cfg.clone()).await;

    let mut rx_a = join(&orch, "m-duel", "alice").await;
    let mut rx_b = join(&orch, "m-duel", "bob").await;
    wait_for(&mut rx_a, |f| matches!(f, ServerFrame::Joined { .. })).await;
    wait_for(&mut rx_b, |f| matches!(f, ServerFrame::Joined { .. })).await;

    let mut round = 1u32;
    let complete = loop {
        // A realistic second on the clock keeps the plausibility clamp from
        // zeroing the submissions.
        sleep(Duration::from_millis(1_050)).await;
        let correct: String = cfg.round_text(round).chars().take(40).collect();
        submit(&orch, "m-duel", "alice", &mut rx_a, &correct).await;
        submit(&orch, "m-duel", "bob", &mut rx_b, &"x".repeat(20)).await;

        let frame = wait_for(&mut rx_a, |f| {
            matches!(f, ServerFrame::RoundEnd { .. })
                || matches!(f, ServerFrame::MatchComplete { .. })
        })
        .await;
        match frame {
            ServerFrame::RoundEnd { damage, hp, round_winner, .. } => {
                assert!(damage <= MAX_DAMAGE_PER_ROUND);
                assert!(hp.values().all(|v| *v >= 0));
                assert_eq!(round_winner.as_deref(), Some("alice"));
                round += 1;
                assert!(round <= 7, "match should have ended by KO");
            }
            complete @ ServerFrame::MatchComplete { .. } => break complete,
            _ => unreachable!(),
        }
    };

    let ServerFrame::MatchComplete { winner, draw, forfeited, hp, .. } = complete else {
        unreachable!();
    };
    assert_eq!(winner.as_deref(), Some("alice"));
    assert!(!draw);
    assert!(forfeited.is_none());
    assert_eq!(hp["bob"], 0);

    // Persisted invariants: mirrored damage, complementary results, rating
    // movement consistent with the before/after columns.
    let (record, players) = store
        .match_by_id("m-duel")
        .await
        .expect("query")
        .expect("match stored");
    assert_eq!(record.status, MatchStatus::Completed);
    let alice = players.iter().find(|p| p.user_id == "alice").expect("row");
    let bob = players.iter().find(|p| p.user_id == "bob").expect("row");
    assert_eq!(alice.damage_dealt, bob.damage_taken);
    assert_eq!(alice.damage_taken, bob.damage_dealt);
    assert_eq!(alice.result, Some(MatchOutcome::Win));
    assert_eq!(bob.result, Some(MatchOutcome::Loss));
    for row in [alice, bob] {
        let (before, after, delta) = (
            row.rating_before.expect("ranked"),
            row.rating_after.expect("ranked"),
            row.rating_delta.expect("ranked"),
        );
        assert_eq!(after, before + delta);
    }
    assert!(alice.rating_delta.unwrap() > 0);
    assert!(bob.rating_delta.unwrap() < 0);
}

#[tokio::test]
async fn second_submission_in_a_round_is_rejected() {
    let (_store, handle) = seeded_store(&[("alice", Some(1200)), ("bob", Some(1200))]).await;
    let orch = Orchestrator::new(handle);
    let cfg = fast_config("m-dup", 30_000);
    orch.spawn_room(cfg).await;

    let mut rx_a = join(&orch, "m-dup", "alice").await;
    let mut rx_b = join(&orch, "m-dup", "bob").await;
    wait_for(&mut rx_b, |f| matches!(f, ServerFrame::Joined { .. })).await;

    sleep(Duration::from_millis(200)).await;
    submit(&orch, "m-dup", "alice", &mut rx_a, "hello").await;

    orch.command(
        "m-dup",
        "alice",
        RoomCommand::Submit {
            user_id: "alice".into(),
            submission: RoundSubmission {
                typed: "hello again".into(),
                samples: vec![],
                total_errors: None,
                total_keystrokes: None,
            },
        },
    )
    .await
    .expect("submit routed");

    let frame = wait_for(&mut rx_a, |f| matches!(f, ServerFrame::Error { .. })).await;
    let ServerFrame::Error { message } = frame else { unreachable!() };
    assert_eq!(message, "already submitted");
}

#[tokio::test]
async fn reconnect_inside_grace_gets_recovery_frame() {
    let (_store, handle) = seeded_store(&[("alice", Some(1200)), ("bob", Some(1200))]).await;
    let orch = Orchestrator::new(handle);
    let cfg = fast_config("m-recover", 30_000);
    orch.spawn_room(cfg).await;

    let mut rx_a = join(&orch, "m-recover", "alice").await;
    let mut rx_b = join(&orch, "m-recover", "bob").await;
    wait_for(&mut rx_b, |f| matches!(f, ServerFrame::Joined { .. })).await;

    // Give the room time to reach the typing phase, then stream progress
    // from alice so the recovery snapshot has something to carry.
    sleep(Duration::from_millis(100)).await;
    orch.command(
        "m-recover",
        "alice",
        RoomCommand::Progress {
            user_id: "alice".into(),
            snapshot: ProgressSnapshot {
                progress_index: 12,
                typed_length: 12,
                mistakes_count: 1,
                elapsed_ms: 90,
            },
        },
    )
    .await
    .expect("progress routed");
    sleep(Duration::from_millis(50)).await;

    orch.command(
        "m-recover",
        "bob",
        RoomCommand::Disconnect { user_id: "bob".into() },
    )
    .await
    .expect("disconnect routed");
    wait_for(&mut rx_a, |f| matches!(f, ServerFrame::OpponentLeft { .. })).await;

    // Reconnect well inside the 30s window.
    let mut rx_b2 = join(&orch, "m-recover", "bob").await;
    wait_for(&mut rx_b2, |f| matches!(f, ServerFrame::Joined { .. })).await;
    let recovery = wait_for(&mut rx_b2, |f| {
        matches!(f, ServerFrame::MatchStateRecovery { .. })
    })
    .await;

    let ServerFrame::MatchStateRecovery {
        round_number,
        round_start_at,
        hp,
        opponent_progress,
        opponent_submitted,
        ..
    } = recovery
    else {
        unreachable!();
    };
    assert_eq!(round_number, 1);
    assert!(round_start_at > 0);
    assert_eq!(hp["alice"], 100);
    assert_eq!(hp["bob"], 100);
    assert!(!opponent_submitted);
    assert_eq!(opponent_progress.expect("progress relayed").typed_length, 12);
}

#[tokio::test]
async fn lapsed_grace_forfeits_the_disconnected_player() {
    let (store, handle) = seeded_store(&[("alice", Some(1200)), ("bob", Some(1200))]).await;
    let orch = Orchestrator::new(handle);
    let cfg = fast_config("m-forfeit", 150);
    orch.spawn_room(cfg).await;

    let mut rx_a = join(&orch, "m-forfeit", "alice").await;
    let mut rx_b = join(&orch, "m-forfeit", "bob").await;
    wait_for(&mut rx_b, |f| matches!(f, ServerFrame::Joined { .. })).await;
    sleep(Duration::from_millis(50)).await;

    orch.command(
        "m-forfeit",
        "bob",
        RoomCommand::Disconnect { user_id: "bob".into() },
    )
    .await
    .expect("disconnect routed");
    drop(rx_b);

    let complete = wait_for(&mut rx_a, |f| matches!(f, ServerFrame::MatchComplete { .. })).await;
    let ServerFrame::MatchComplete { winner, forfeited, .. } = complete else {
        unreachable!();
    };
    assert_eq!(winner.as_deref(), Some("alice"));
    assert_eq!(forfeited.as_deref(), Some("bob"));

    let (record, players) = store
        .match_by_id("m-forfeit")
        .await
        .expect("query")
        .expect("stored");
    assert_eq!(record.status, MatchStatus::Completed);
    let bob = players.iter().find(|p| p.user_id == "bob").expect("row");
    assert_eq!(bob.result, Some(MatchOutcome::Loss));
    assert!(bob.rating_delta.unwrap() < 0);
}

#[tokio::test]
async fn completed_match_advances_placement_counter() {
    // Unranked players: no initial rating seeded.
    let (store, handle) = seeded_store(&[("carol", None), ("dave", None)]).await;
    let orch = Orchestrator::new(handle);
    let cfg = MatchConfig {
        players: [
            PlayerSeat {
                user_id: "carol".into(),
                username: "carol".into(),
                rating: None,
                provisional: 1050,
            },
            PlayerSeat {
                user_id: "dave".into(),
                username: "dave".into(),
                rating: None,
                provisional: 1050,
            },
        ],
        ..fast_config("m-place", 30_000)
    };
    orch.spawn_room(cfg).await;

    let mut rx_c = join(&orch, "m-place", "carol").await;
    let mut rx_d = join(&orch, "m-place", "dave").await;
    wait_for(&mut rx_d, |f| matches!(f, ServerFrame::Joined { .. })).await;
    sleep(Duration::from_millis(50)).await;

    orch.command("m-place", "dave", RoomCommand::Forfeit { user_id: "dave".into() })
        .await
        .expect("forfeit routed");
    wait_for(&mut rx_c, |f| matches!(f, ServerFrame::MatchComplete { .. })).await;
    let _ = rx_d;

    for user in ["carol", "dave"] {
        let row = store.rating_row(user).await.expect("query").expect("row");
        assert_eq!(row.placement_games_played, 1);
        assert_eq!(row.rating, None, "one game cannot finish placement");
    }
}
