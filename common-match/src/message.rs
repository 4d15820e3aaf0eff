use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Draw-vote choices during an overtime window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawChoice {
    Draw,
    Continue,
}

/// Per-second progress snapshot relayed to the opponent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub progress_index: u32,
    pub typed_length: u32,
    pub mistakes_count: u32,
    pub elapsed_ms: u64,
}

/// Raw round submission as it arrives off the wire. The server recomputes
/// every metric from this; nothing client-derived is trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSubmission {
    pub typed: String,
    pub samples: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_errors: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_keystrokes: Option<u32>,
}

/// Frames accepted from clients. Anything that fails to parse into one of
/// these is answered with `error{"invalid payload"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Bind to a match room, or enter the matchmaking queue when `match_id`
    /// is absent.
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_id: Option<String>,
        token: String,
    },
    Progress {
        progress_index: u32,
        typed_length: u32,
        mistakes_count: u32,
        elapsed_ms: u64,
    },
    Result {
        typed: String,
        samples: Vec<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_errors: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_keystrokes: Option<u32>,
    },
    Forfeit,
    DrawVote {
        vote: DrawChoice,
    },
    Ping {
        client_ts: u64,
    },
    /// Matchmaking only: abandon the queue.
    Leave,
}

/// Summary of one participant in a completed match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSummary {
    pub user_id: String,
    pub result: String,
    pub wpm: f64,
    pub accuracy: f64,
    pub damage_dealt: i32,
    pub damage_taken: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_before: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_after: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_delta: Option<i32>,
}

/// Frames emitted by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        server_time: u64,
    },
    Queued,
    #[serde(rename = "MATCH_FOUND")]
    MatchFound {
        match_id: String,
        seed: String,
        mode: String,
        round_time_seconds: u32,
        text_length: usize,
        difficulty: crate::textgen::Difficulty,
        punctuation: bool,
        start_at: u64,
        max_rounds: u32,
        opponent_id: String,
        opponent_rating: Option<i32>,
    },
    Joined {
        match_id: String,
        round: u32,
    },
    OpponentJoined {
        user_id: String,
    },
    OpponentLeft {
        user_id: String,
    },
    OpponentProgress {
        progress_index: u32,
        typed_length: u32,
        mistakes_count: u32,
        elapsed_ms: u64,
    },
    OpponentFinished,
    ResultReceived {
        round: u32,
    },
    RoundEnd {
        round: u32,
        round_winner: Option<String>,
        damage: i32,
        hp: HashMap<String, i32>,
        scores: HashMap<String, f64>,
        round_wins: HashMap<String, u32>,
        overtime_active: bool,
        draw_window_open: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_round_start_at: Option<u64>,
    },
    MatchComplete {
        match_id: String,
        winner: Option<String>,
        draw: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forfeited: Option<String>,
        hp: HashMap<String, i32>,
        players: Vec<PlayerSummary>,
    },
    MatchStateRecovery {
        server_time: u64,
        round_number: u32,
        round_start_at: u64,
        max_rounds: u32,
        round_wins: HashMap<String, u32>,
        overtime_active: bool,
        draw_window_open: bool,
        hp: HashMap<String, i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opponent_progress: Option<ProgressSnapshot>,
        opponent_submitted: bool,
    },
    Pong {
        client_ts: u64,
        server_ts: u64,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }
}

/// Encode a server frame as a JSON text payload.
pub fn encode(frame: &ServerFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode a client frame from a JSON text payload.
pub fn decode(text: &str) -> Result<ClientFrame, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_without_match_id_means_queue() {
        let frame = decode(r#"{"type":"join","token":"abc"}"#).expect("decode");
        match frame {
            ClientFrame::Join { match_id, token } => {
                assert!(match_id.is_none());
                assert_eq!(token, "abc");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_is_rejected() {
        assert!(decode(r#"{"type":"spectate","match_id":"m1"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn match_found_keeps_legacy_tag() {
        let frame = ServerFrame::MatchFound {
            match_id: "m1".into(),
            seed: "s".into(),
            mode: "ranked".into(),
            round_time_seconds: 60,
            text_length: 250,
            difficulty: crate::textgen::Difficulty::Medium,
            punctuation: false,
            start_at: 1_000,
            max_rounds: 6,
            opponent_id: "u2".into(),
            opponent_rating: Some(1200),
        };
        let text = encode(&frame).expect("encode");
        assert!(text.contains(r#""type":"MATCH_FOUND""#));
    }

    #[test]
    fn result_roundtrip_preserves_optional_counters() {
        let text = r#"{"type":"result","typed":"abc","samples":[1,2,3],"total_errors":4}"#;
        match decode(text).expect("decode") {
            ClientFrame::Result { total_errors, total_keystrokes, samples, .. } => {
                assert_eq!(total_errors, Some(4));
                assert_eq!(total_keystrokes, None);
                assert_eq!(samples, vec![1, 2, 3]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
