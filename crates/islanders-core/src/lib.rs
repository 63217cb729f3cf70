//! Islanders - a hex-island trading game engine
//!
//! This crate provides the core session logic for Islanders, including:
//! - Board representation parsed from a textual map descriptor
//! - Dice engine with uniform and balanced-deck strategies
//! - Board shuffler with a number-clash repair pass
//! - Player state and resource management
//! - Game state machine with full rule enforcement
//!
//! # Architecture
//!
//! The engine is transport-agnostic: every intent is a plain method
//! call, every effect surfaces through the [`actions::Dispatch`] sink,
//! and timers are requested from (and fed back by) the host.
//!
//! # Modules
//!
//! - [`board`]: Tiles, corners, edges, ports and the map descriptor
//! - [`dice`]: Roll strategies
//! - [`shuffle`]: Procedural layout generation
//! - [`player`]: Player state and resources
//! - [`game`]: Game session state machine
//! - [`actions`]: Outbound events and trade records

pub mod actions;
pub mod board;
pub mod dice;
pub mod game;
pub mod player;
pub mod shuffle;

/// Seat-based player identifier, 1-based. 0 is never a valid player.
pub type PlayerId = u8;

// Re-export commonly used types
pub use actions::{AchievementKind, Dispatch, Event, Trade, TradeStatus};
pub use board::{
    Board, Building, BuildingKind, Corner, CornerId, Edge, EdgeDir, EdgeId, MapParseError,
    PieceKind, Port, PortKind, Resource, ResourceYield, Terrain, Tile, TileId, BASE_MAP_KEY,
    EXTENDED_MAP_KEY, LARGE_MAP_KEY,
};
pub use dice::{DiceEngine, DiceMode, DiceRoll};
pub use game::{ConfigError, Game, GameConfig, GamePhase, GameSnapshot, TimerRequest};
pub use player::{DevCardKind, DevCards, Player, Purchasable, ResourceHand};
pub use shuffle::{BoardShuffler, ShuffleMode};
