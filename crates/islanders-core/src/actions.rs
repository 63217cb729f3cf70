//! Outbound events and trade records.
//!
//! The engine never returns values to callers; every effect is
//! observed through [`Event`]s pushed into an injected [`Dispatch`].
//! `broadcast` reaches the whole session, `to_player` carries the
//! private variants (hand contents, stolen cards, drawn card kinds).

use crate::board::{CornerId, PieceKind, Resource, ResourceYield, TileId};
use crate::dice::DiceRoll;
use crate::game::GamePhase;
use crate::player::{DevCardKind, ResourceHand};
use crate::PlayerId;
use serde::{Deserialize, Serialize};

/// One-way notification sink the session engine writes into.
pub trait Dispatch {
    fn broadcast(&mut self, event: Event);
    fn to_player(&mut self, player: PlayerId, event: Event);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AchievementKind {
    LongestRoad,
    LargestArmy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
    Success,
    Failed,
    Deleted,
}

/// A peer-to-peer trade offer and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: usize,
    pub player: PlayerId,
    /// What the offering player gives away.
    pub give: ResourceHand,
    /// What they want in return.
    pub take: ResourceHand,
    pub status: TradeStatus,
    pub rejected_by: Vec<PlayerId>,
}

impl Trade {
    pub fn new(id: usize, player: PlayerId, give: ResourceHand, take: ResourceHand) -> Self {
        Self {
            id,
            player,
            give,
            take,
            status: TradeStatus::Open,
            rejected_by: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, TradeStatus::Open | TradeStatus::Closed)
    }
}

/// Everything the engine reports. Serialized as tagged JSON on the
/// wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A seat was taken in the waiting room.
    PlayerJoined { player: PlayerId, name: String },
    /// A player picked (or was assigned) a color slot.
    ColorChosen { player: PlayerId, color: u8 },
    /// Phase, active player or turn changed.
    StateChanged {
        phase: GamePhase,
        active_player: PlayerId,
        turn: u32,
    },
    /// The session countdown was (re)armed.
    TimerSet { seconds: u32 },
    /// Prompt for an initial settlement + road placement.
    SetupPrompt {
        player: PlayerId,
        corners: Vec<CornerId>,
    },
    DiceRolled { player: PlayerId, roll: DiceRoll },
    /// Public per-roll distribution summary.
    ResourcesDistributed { grants: Vec<ResourceYield> },
    /// Private: exact cards added to the receiving player's hand.
    ResourcesGained { resources: ResourceHand },
    Built {
        player: PlayerId,
        piece: PieceKind,
        location: usize,
    },
    /// Broadcast with `kind: None`; the buyer gets the real kind.
    DevCardTaken {
        player: PlayerId,
        kind: Option<DevCardKind>,
        remaining: usize,
    },
    DevCardPlayed { player: PlayerId, kind: DevCardKind },
    MonopolyResolved {
        player: PlayerId,
        resource: Resource,
        total: u8,
    },
    RobberMoved {
        player: PlayerId,
        tile: TileId,
        victim: Option<PlayerId>,
        knight: bool,
    },
    /// Private to thief and victim only.
    ResourceStolen {
        thief: PlayerId,
        victim: PlayerId,
        resource: Resource,
    },
    /// Broadcast: how many cards a player dropped, not which.
    CardsDropped { player: PlayerId, count: u8 },
    TradeRequested { trade: Trade },
    TradeUpdated { trade: Trade },
    /// A completed fixed-ratio trade against the board.
    BoardTraded {
        player: PlayerId,
        gave: ResourceHand,
        got: ResourceHand,
    },
    AchievementChanged {
        kind: AchievementKind,
        holder: Option<PlayerId>,
    },
    /// The debug flag went on; snapshots carry it from now on.
    GodModeActivated { player: PlayerId },
    PlayerQuit { player: PlayerId },
    GameEnded {
        winner: Option<PlayerId>,
        standings: Vec<(PlayerId, u8)>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn events_serialize_with_a_snake_case_tag() {
        let event = Event::DiceRolled {
            player: 2,
            roll: DiceRoll { d1: 3, d2: 4 },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "dice_rolled",
                "player": 2,
                "roll": { "d1": 3, "d2": 4 },
            })
        );
    }

    #[test]
    fn private_card_kind_is_omittable() {
        let event = Event::DevCardTaken {
            player: 1,
            kind: None,
            remaining: 24,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], serde_json::Value::Null);

        let event = Event::DevCardTaken {
            player: 1,
            kind: Some(DevCardKind::Knight),
            remaining: 24,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], json!("knight"));
    }

    #[test]
    fn trades_stay_pending_until_settled() {
        let mut trade = Trade::new(0, 1, ResourceHand::new(1, 0, 0, 0, 0), ResourceHand::new(0, 0, 0, 1, 0));
        assert!(trade.is_pending());
        trade.status = TradeStatus::Closed;
        assert!(trade.is_pending());
        trade.status = TradeStatus::Failed;
        assert!(!trade.is_pending());
    }
}
