//! Player state and resource management.
//!
//! This module contains:
//! - Player struct with resources, development cards, and achievements
//! - ResourceHand for managing resource counts
//! - Development card kinds and per-player card piles
//! - Building costs and the shared piece supply caps

use crate::board::{CornerId, EdgeId, PieceKind, Resource};
use crate::PlayerId;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-player piece supply.
pub const MAX_SETTLEMENTS: usize = 5;
pub const MAX_CITIES: usize = 4;
pub const MAX_ROADS: usize = 15;

/// Counts of each resource kind a player holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHand {
    pub sheep: u8,
    pub lumber: u8,
    pub brick: u8,
    pub ore: u8,
    pub wheat: u8,
}

impl ResourceHand {
    pub fn new(sheep: u8, lumber: u8, brick: u8, ore: u8, wheat: u8) -> Self {
        Self {
            sheep,
            lumber,
            brick,
            ore,
            wheat,
        }
    }

    pub fn count(&self, resource: Resource) -> u8 {
        match resource {
            Resource::Sheep => self.sheep,
            Resource::Lumber => self.lumber,
            Resource::Brick => self.brick,
            Resource::Ore => self.ore,
            Resource::Wheat => self.wheat,
        }
    }

    fn count_mut(&mut self, resource: Resource) -> &mut u8 {
        match resource {
            Resource::Sheep => &mut self.sheep,
            Resource::Lumber => &mut self.lumber,
            Resource::Brick => &mut self.brick,
            Resource::Ore => &mut self.ore,
            Resource::Wheat => &mut self.wheat,
        }
    }

    pub fn total(&self) -> u32 {
        Resource::ALL.iter().map(|&r| self.count(r) as u32).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn add(&mut self, resource: Resource, count: u8) {
        *self.count_mut(resource) += count;
    }

    /// Remove up to `count` cards of a kind, returning how many were
    /// actually removed. Counts never go negative.
    pub fn remove(&mut self, resource: Resource, count: u8) -> u8 {
        let held = self.count_mut(resource);
        let taken = count.min(*held);
        *held -= taken;
        taken
    }

    pub fn contains(&self, other: &ResourceHand) -> bool {
        Resource::ALL
            .iter()
            .all(|&r| self.count(r) >= other.count(r))
    }

    /// Pay `cost` out of this hand. Fails without mutation if any
    /// resource falls short.
    pub fn pay(&mut self, cost: &ResourceHand) -> bool {
        if !self.contains(cost) {
            return false;
        }
        for r in Resource::ALL {
            self.remove(r, cost.count(r));
        }
        true
    }

    pub fn gain(&mut self, other: &ResourceHand) {
        for r in Resource::ALL {
            self.add(r, other.count(r));
        }
    }

    /// Pick one held card uniformly at random.
    pub fn random_card<R: Rng>(&self, rng: &mut R) -> Option<Resource> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let mut pick = rng.gen_range(0..total);
        for r in Resource::ALL {
            let held = self.count(r) as u32;
            if pick < held {
                return Some(r);
            }
            pick -= held;
        }
        None
    }

    pub fn as_pairs(&self) -> Vec<(Resource, u8)> {
        Resource::ALL
            .iter()
            .filter(|&&r| self.count(r) > 0)
            .map(|&r| (r, self.count(r)))
            .collect()
    }
}

/// Exact resource cost per purchasable item.
pub fn cost_of(item: Purchasable) -> ResourceHand {
    match item {
        Purchasable::Piece(PieceKind::Road) => ResourceHand::new(0, 1, 1, 0, 0),
        Purchasable::Piece(PieceKind::Settlement) => ResourceHand::new(1, 1, 1, 0, 1),
        Purchasable::Piece(PieceKind::City) => ResourceHand::new(0, 0, 0, 3, 2),
        Purchasable::DevCard => ResourceHand::new(1, 0, 0, 1, 1),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purchasable {
    Piece(PieceKind),
    DevCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevCardKind {
    Knight,
    RoadBuilding,
    YearOfPlenty,
    Monopoly,
    VictoryPoint,
}

impl DevCardKind {
    pub const ALL: [DevCardKind; 5] = [
        DevCardKind::Knight,
        DevCardKind::RoadBuilding,
        DevCardKind::YearOfPlenty,
        DevCardKind::Monopoly,
        DevCardKind::VictoryPoint,
    ];
}

/// A player's development cards, split so a card bought this turn
/// cannot be played until their next action phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevCards {
    bought: [u8; 5],
    usable: [u8; 5],
}

impl DevCards {
    fn slot(kind: DevCardKind) -> usize {
        DevCardKind::ALL.iter().position(|&k| k == kind).unwrap_or(0)
    }

    pub fn add_bought(&mut self, kind: DevCardKind) {
        self.bought[Self::slot(kind)] += 1;
    }

    /// Move everything bought on an earlier turn into the usable pile.
    pub fn promote(&mut self) {
        for i in 0..5 {
            self.usable[i] += self.bought[i];
            self.bought[i] = 0;
        }
    }

    pub fn usable(&self, kind: DevCardKind) -> u8 {
        self.usable[Self::slot(kind)]
    }

    pub fn play(&mut self, kind: DevCardKind) -> bool {
        let slot = Self::slot(kind);
        if self.usable[slot] == 0 {
            return false;
        }
        self.usable[slot] -= 1;
        true
    }

    pub fn count(&self, kind: DevCardKind) -> u8 {
        let slot = Self::slot(kind);
        self.bought[slot] + self.usable[slot]
    }

    pub fn total(&self) -> u8 {
        (0..5).map(|i| self.bought[i] + self.usable[i]).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    /// Color slot 1..=8, unique within a session once chosen.
    pub color: Option<u8>,
    pub hand: ResourceHand,
    pub dev_cards: DevCards,
    pub knights_played: u8,
    pub settlements: Vec<CornerId>,
    pub cities: Vec<CornerId>,
    pub roads: Vec<EdgeId>,
    /// Ordered edge ids of this player's current longest road.
    pub longest_road: Vec<EdgeId>,
    pub has_longest_road: bool,
    pub has_largest_army: bool,
    pub removed: bool,
    pub online: bool,
}

impl Player {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: None,
            hand: ResourceHand::default(),
            dev_cards: DevCards::default(),
            knights_played: 0,
            settlements: Vec::new(),
            cities: Vec::new(),
            roads: Vec::new(),
            longest_road: Vec::new(),
            has_longest_road: false,
            has_largest_army: false,
            removed: false,
            online: true,
        }
    }

    /// Does the shared piece supply still allow this build?
    pub fn has_piece(&self, piece: PieceKind) -> bool {
        match piece {
            PieceKind::Road => self.roads.len() < MAX_ROADS,
            PieceKind::Settlement => self.settlements.len() < MAX_SETTLEMENTS,
            // Upgrading returns a settlement to the supply.
            PieceKind::City => self.cities.len() < MAX_CITIES && !self.settlements.is_empty(),
        }
    }

    pub fn can_afford(&self, item: Purchasable) -> bool {
        self.hand.contains(&cost_of(item))
    }

    /// Pay for an item; false (no mutation) if unaffordable.
    pub fn purchase(&mut self, item: Purchasable) -> bool {
        self.hand.pay(&cost_of(item))
    }

    /// Record a built piece. A city replaces the settlement at the
    /// same corner.
    pub fn record_build(&mut self, piece: PieceKind, location: usize) {
        match piece {
            PieceKind::Road => self.roads.push(location),
            PieceKind::Settlement => self.settlements.push(location),
            PieceKind::City => {
                self.settlements.retain(|&c| c != location);
                self.cities.push(location);
            }
        }
    }

    /// Points visible to everyone.
    pub fn public_points(&self) -> u8 {
        let mut points = self.settlements.len() as u8 + 2 * self.cities.len() as u8;
        if self.has_longest_road {
            points += 2;
        }
        if self.has_largest_army {
            points += 2;
        }
        points
    }

    /// Victory-point cards, hidden until the game ends.
    pub fn private_points(&self) -> u8 {
        self.dev_cards.count(DevCardKind::VictoryPoint)
    }

    pub fn total_points(&self) -> u8 {
        self.public_points() + self.private_points()
    }
}
