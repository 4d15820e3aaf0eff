pub mod lobby;
pub mod orchestrator;
pub mod room;

use common_match::message::ServerFrame;

/// What a room or the lobby pushes at a player's session task.
#[derive(Debug)]
pub enum SessionMessage {
    Frame(ServerFrame),
    /// A newer socket took over this player's seat; the old session closes.
    Replaced,
}

/// Outbound half of a player's connection as the arena sees it.
pub type FrameSink = tokio::sync::mpsc::UnboundedSender<SessionMessage>;

pub type BoxError = common_match::BoxError;
