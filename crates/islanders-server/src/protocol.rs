//! WebSocket protocol messages for Islanders multiplayer.

use islanders_core::{
    CornerId, EdgeId, Event, GameConfig, GameSnapshot, PieceKind, PlayerId, Resource,
    ResourceHand, TileId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Create a new game session
    CreateSession {
        player_name: String,
        #[serde(default)]
        config: Option<GameConfig>,
    },

    /// Join an existing session's waiting room
    JoinSession {
        session_id: Uuid,
        player_name: String,
    },

    /// Leave the current session
    LeaveSession,

    /// Claim a color slot in the waiting room
    PickColor { color: u8 },

    /// Start the game (host only, every seat taken)
    StartGame,

    /// Re-request the current snapshot and prompt
    Sync,

    /// Initial settlement + road placement
    PlaceInitial {
        corner: Option<CornerId>,
        edge: Option<EdgeId>,
    },

    /// Roll the dice
    Roll,

    /// Discard toward a forced robber drop
    DropCards { resources: ResourceHand },

    /// Move the robber and pick a victim
    MoveRobber {
        tile: Option<TileId>,
        victim: Option<PlayerId>,
    },

    /// Build a piece at a location
    Build { piece: PieceKind, location: usize },

    /// Buy a development card
    BuyDevCard,

    PlayKnight,
    PlayRoadBuilding { first: EdgeId, second: EdgeId },
    PlayYearOfPlenty { first: Resource, second: Resource },
    PlayMonopoly { resource: Resource },

    /// Offer a trade to the table
    RequestTrade {
        give: ResourceHand,
        take: ResourceHand,
    },
    AcceptTrade { trade_id: usize },
    RejectTrade { trade_id: usize },
    DeleteTrade { trade_id: usize },

    /// Fixed-ratio trade against the board
    BoardTrade {
        give: Resource,
        give_count: u8,
        take: Resource,
    },

    /// End the current turn
    EndTurn,

    /// Flip the session's debug flag
    ActivateGodMode,

    /// Send chat message
    Chat { message: String },

    /// Request the list of joinable sessions
    ListSessions,

    /// Ping for keepalive
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    /// Welcome message with the connection's identity
    Welcome { connection_id: Uuid },

    /// Session created successfully
    SessionCreated { session_id: Uuid },

    /// Joined a session; the assigned seat follows
    Joined {
        session: SessionInfo,
        player: PlayerId,
    },

    /// Left the session
    Left,

    /// Waiting-room roster changed
    SessionUpdated { session: SessionInfo },

    /// An engine event, broadcast or private
    Game { event: Event },

    /// Full session snapshot for (re)synchronization
    Snapshot { snapshot: GameSnapshot },

    /// Chat message received
    ChatMessage {
        player: PlayerId,
        player_name: String,
        message: String,
    },

    /// Joinable sessions
    SessionList { sessions: Vec<SessionInfo> },

    /// Error occurred
    Error { message: String },

    /// Pong response
    Pong,
}

/// Session information for clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub players: Vec<PlayerInfo>,
    pub player_count: u8,
    pub started: bool,
}

/// Player information in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub player: PlayerId,
    pub name: String,
    pub color: Option<u8>,
    pub connected: bool,
}
