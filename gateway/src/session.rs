//! One task per websocket. The session authenticates the first `join`,
//! then shuttles frames between the socket and whichever service owns the
//! player at the moment (matchmaking lobby or a match room).

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use arena::lobby::Lobby;
use arena::orchestrator::Orchestrator;
use arena::room::RoomCommand;
use arena::SessionMessage;
use common_match::message::{self, ClientFrame, ProgressSnapshot, RoundSubmission, ServerFrame};
use common_match::timesync::ClockSync;
use common_match::timestamp_ms;
use services::auth::{AuthService, AuthedUser};

use crate::ratelimit::TokenBucket;

use std::sync::Arc;

/// Close codes the protocol commits to.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;

static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("gateway_sessions_active", "Open websocket sessions")
        .expect("register gateway_sessions_active")
});

static FRAMES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("gateway_frames_total", "Inbound frames accepted")
        .expect("register gateway_frames_total")
});

static RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("gateway_rate_limited_total", "Inbound frames dropped by rate limit")
        .expect("register gateway_rate_limited_total")
});

#[derive(Clone)]
pub struct SessionContext {
    pub auth: Arc<AuthService>,
    pub lobby: Arc<Lobby>,
    pub orchestrator: Arc<Orchestrator>,
}

/// What the session is currently bound to.
enum Binding {
    Unbound,
    Queue,
    Match { match_id: String },
}

struct Session {
    ctx: SessionContext,
    user: Option<AuthedUser>,
    binding: Binding,
    out_tx: mpsc::UnboundedSender<SessionMessage>,
    bucket: TokenBucket,
    clock: ClockSync,
    close_code: Option<u16>,
}

pub async fn run(mut socket: WebSocket, ctx: SessionContext) {
    SESSIONS_ACTIVE.inc();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SessionMessage>();
    let mut session = Session {
        ctx,
        user: None,
        binding: Binding::Unbound,
        out_tx,
        bucket: TokenBucket::for_frames(),
        clock: ClockSync::new(),
        close_code: None,
    };

    session.send(ServerFrame::Welcome { server_time: timestamp_ms() });

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(SessionMessage::Frame(frame)) => {
                    if let Ok(text) = message::encode(&frame) {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                // A second socket took over this player's seat.
                Some(SessionMessage::Replaced) => {
                    session.binding = Binding::Unbound;
                    session.close_code = Some(CLOSE_NORMAL);
                    break;
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if !session.handle_text(&text).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    // Flush anything still queued (e.g. the error frame that caused the
    // close) before the close frame itself.
    while let Ok(SessionMessage::Frame(frame)) = out_rx.try_recv() {
        if let Ok(text) = message::encode(&frame) {
            if socket.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    }
    let code = session.close_code.unwrap_or(CLOSE_NORMAL);
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: "".into() })))
        .await;

    session.teardown().await;
    SESSIONS_ACTIVE.dec();
}

impl Session {
    fn send(&self, frame: ServerFrame) {
        let _ = self.out_tx.send(SessionMessage::Frame(frame));
    }

    /// Returns false when the session must close.
    async fn handle_text(&mut self, text: &str) -> bool {
        if !self.bucket.try_acquire() {
            RATE_LIMITED_TOTAL.inc();
            self.send(ServerFrame::error("rate limited"));
            return true;
        }
        FRAMES_TOTAL.inc();

        let frame = match message::decode(text) {
            Ok(frame) => frame,
            Err(_) => {
                self.send(ServerFrame::error("invalid payload"));
                return true;
            }
        };

        match frame {
            ClientFrame::Ping { client_ts } => {
                let server_ts = timestamp_ms();
                self.clock.observe_offset(server_ts as i64 - client_ts as i64);
                self.send(ServerFrame::Pong { client_ts, server_ts });
                true
            }
            ClientFrame::Join { match_id, token } => self.handle_join(match_id, token).await,
            ClientFrame::Leave => {
                if matches!(self.binding, Binding::Queue) {
                    if let Some(user) = &self.user {
                        self.ctx.lobby.leave(&user.id).await;
                    }
                    self.binding = Binding::Unbound;
                }
                true
            }
            ClientFrame::Progress { progress_index, typed_length, mistakes_count, elapsed_ms } => {
                self.route(|user_id| RoomCommand::Progress {
                    user_id,
                    snapshot: ProgressSnapshot {
                        progress_index,
                        typed_length,
                        mistakes_count,
                        elapsed_ms,
                    },
                })
                .await
            }
            ClientFrame::Result { typed, samples, total_errors, total_keystrokes } => {
                self.route(|user_id| RoomCommand::Submit {
                    user_id,
                    submission: RoundSubmission { typed, samples, total_errors, total_keystrokes },
                })
                .await
            }
            ClientFrame::Forfeit => self.route(|user_id| RoomCommand::Forfeit { user_id }).await,
            ClientFrame::DrawVote { vote } => {
                self.route(|user_id| RoomCommand::DrawVote { user_id, vote }).await
            }
        }
    }

    async fn handle_join(&mut self, match_id: Option<String>, token: String) -> bool {
        let user = match self.ctx.auth.verify(&token).await {
            Ok(user) => user,
            Err(e) => {
                debug!(error = %e, "join rejected");
                self.send(ServerFrame::error("unauthorized"));
                self.close_code = Some(CLOSE_POLICY);
                return false;
            }
        };

        // Re-joining from the queue into a match drops the queue slot.
        if matches!(self.binding, Binding::Queue) {
            self.ctx.lobby.leave(&user.id).await;
            self.binding = Binding::Unbound;
        }

        match match_id {
            Some(match_id) => {
                let cmd = RoomCommand::Join {
                    user_id: user.id.clone(),
                    sink: self.out_tx.clone(),
                };
                match self.ctx.orchestrator.command(&match_id, &user.id, cmd).await {
                    Ok(()) => {
                        self.binding = Binding::Match { match_id };
                        self.user = Some(user);
                    }
                    Err(_) => self.send(ServerFrame::error("not in match")),
                }
            }
            None => {
                self.ctx
                    .lobby
                    .join(&user.id, &user.username, self.out_tx.clone())
                    .await;
                self.binding = Binding::Queue;
                self.user = Some(user);
            }
        }
        true
    }

    /// Route a match frame into the bound room. Frames before a successful
    /// join are rejected, never buffered.
    async fn route<F>(&mut self, build: F) -> bool
    where
        F: FnOnce(String) -> RoomCommand,
    {
        let (Some(user), Binding::Match { match_id }) = (&self.user, &self.binding) else {
            self.send(ServerFrame::error("not in match"));
            return true;
        };
        let cmd = build(user.id.clone());
        if self.ctx.orchestrator.command(match_id, &user.id, cmd).await.is_err() {
            self.send(ServerFrame::error("not in match"));
        }
        true
    }

    async fn teardown(&mut self) {
        if let Some(offset) = self.clock.offset_ms() {
            debug!(offset_ms = offset, jitter_ms = self.clock.jitter_ms(), "session clock profile");
        }
        match (&self.binding, &self.user) {
            (Binding::Queue, Some(user)) => self.ctx.lobby.leave(&user.id).await,
            (Binding::Match { match_id }, Some(user)) => {
                let cmd = RoomCommand::Disconnect { user_id: user.id.clone() };
                if self.ctx.orchestrator.command(match_id, &user.id, cmd).await.is_err() {
                    warn!(match_id = %match_id, "disconnect for finished room");
                }
            }
            _ => {}
        }
    }
}
