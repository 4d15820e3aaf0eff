//! Process-scoped room registry. Each match gets one owner task; the
//! registry maps match ids to command channels and forgets rooms when their
//! tasks return.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use services::storage::StoreHandle;

use crate::room::{MatchConfig, Room, RoomCommand};

#[derive(Debug, thiserror::Error)]
pub enum RoomLookupError {
    #[error("not in match")]
    NotInMatch,
}

struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomCommand>,
    participants: [String; 2],
}

pub struct Orchestrator {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    store: StoreHandle,
}

impl Orchestrator {
    pub fn new(store: StoreHandle) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            store,
        })
    }

    /// Spawn the owner task for a freshly paired match.
    pub async fn spawn_room(self: &Arc<Self>, cfg: MatchConfig) {
        let match_id = cfg.match_id.clone();
        let participants = [cfg.players[0].user_id.clone(), cfg.players[1].user_id.clone()];
        let (tx, rx) = mpsc::unbounded_channel();
        let room = Room::new(cfg, self.store.clone(), rx);

        self.rooms
            .write()
            .await
            .insert(match_id.clone(), RoomHandle { tx, participants });

        let registry = Arc::clone(self);
        let id = match_id.clone();
        tokio::spawn(async move {
            room.run().await;
            registry.rooms.write().await.remove(&id);
        });
        info!(match_id = %match_id, "room spawned");
    }

    /// Route a command from a participant's connection into its room.
    pub async fn command(
        &self,
        match_id: &str,
        user_id: &str,
        cmd: RoomCommand,
    ) -> Result<(), RoomLookupError> {
        let rooms = self.rooms.read().await;
        let handle = rooms.get(match_id).ok_or(RoomLookupError::NotInMatch)?;
        if !handle.participants.iter().any(|p| p == user_id) {
            return Err(RoomLookupError::NotInMatch);
        }
        handle.tx.send(cmd).map_err(|_| {
            warn!(match_id, "command for a room that already terminated");
            RoomLookupError::NotInMatch
        })
    }

    pub async fn is_participant(&self, match_id: &str, user_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(match_id)
            .map(|h| h.participants.iter().any(|p| p == user_id))
            .unwrap_or(false)
    }

    pub async fn active_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }
}
