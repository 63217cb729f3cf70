//! Core game session state machine.
//!
//! A [`Game`] owns the board, the dice engine and the player roster,
//! and advances through the turn protocol in response to two trigger
//! kinds only: validated player intents and timer expirations fed back
//! by the transport. Illegal or stale intents are silent no-ops, which
//! makes duplicate and late client messages harmless.
//!
//! Pending input is tracked as a FIFO of [`Expectation`]s, each scoped
//! to a phase and a player. A player resolves only the expectation
//! addressed to them; timers force-resolve whatever is left.

use crate::actions::{AchievementKind, Dispatch, Event, Trade, TradeStatus};
use crate::board::{
    Board, CornerId, EdgeId, MapParseError, PieceKind, PortKind, Resource, TileId,
    BASE_MAP_KEY, EXTENDED_MAP_KEY, LARGE_MAP_KEY,
};
use crate::dice::{DiceEngine, DiceMode};
use crate::player::{DevCardKind, Player, Purchasable, ResourceHand};
use crate::shuffle::{BoardShuffler, ShuffleMode};
use crate::PlayerId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    InitialSetup,
    PlayerRoll,
    PlayerActions,
    RobberDrop,
    RobberMove,
    End,
}

/// Session configuration, fixed at construction. Player-count
/// brackets adjust defaults that were not explicitly overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub player_count: u8,
    pub win_points: u8,
    pub timer: bool,
    pub strategize_time: u32,
    pub initial_build_time: u32,
    pub auto_roll: bool,
    pub roll_time: u32,
    pub player_turn_time: u32,
    pub trade_time_bonus_seconds: u32,
    pub robber_drop_time: u32,
    pub robber_move_time: u32,
    pub max_trade_requests: usize,
    pub largest_army_count: u8,
    pub longest_road_count: usize,
    pub robber_hand_limit: u32,
    pub map_shuffle: String,
    pub dice_mode: DiceMode,
    /// Explicit map descriptor; bracket default when absent.
    pub map_key: Option<String>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            player_count: 3,
            win_points: 10,
            timer: true,
            strategize_time: 10,
            initial_build_time: 60,
            auto_roll: false,
            roll_time: 15,
            player_turn_time: 60,
            trade_time_bonus_seconds: 20,
            robber_drop_time: 30,
            robber_move_time: 30,
            max_trade_requests: 4,
            largest_army_count: 3,
            longest_road_count: 5,
            robber_hand_limit: 7,
            map_shuffle: "all".to_string(),
            dice_mode: DiceMode::Random,
            map_key: None,
        }
    }
}

impl GameConfig {
    /// Larger sessions get bigger targets, hand limits and maps,
    /// unless those values were configured away from their defaults.
    pub fn apply_player_count_brackets(&mut self) {
        let defaults = GameConfig::default();
        if self.player_count >= 7 {
            if self.win_points == defaults.win_points {
                self.win_points = 12;
            }
            if self.robber_hand_limit == defaults.robber_hand_limit {
                self.robber_hand_limit = 11;
            }
        } else if self.player_count >= 5 {
            if self.win_points == defaults.win_points {
                self.win_points = 11;
            }
            if self.robber_hand_limit == defaults.robber_hand_limit {
                self.robber_hand_limit = 9;
            }
        }
    }

    /// The map this session plays on.
    pub fn resolved_map_key(&self) -> &str {
        if let Some(key) = &self.map_key {
            return key;
        }
        if self.player_count >= 7 {
            LARGE_MAP_KEY
        } else if self.player_count >= 5 {
            EXTENDED_MAP_KEY
        } else {
            BASE_MAP_KEY
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=8).contains(&self.player_count) {
            return Err(ConfigError::PlayerCount(self.player_count));
        }
        if self.win_points < 3 {
            return Err(ConfigError::WinPoints(self.win_points));
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("player count {0} outside 2..=8")]
    PlayerCount(u8),
    #[error("win points {0} below 3")]
    WinPoints(u8),
    #[error(transparent)]
    Map(#[from] MapParseError),
}

/// Draw pile composition per player-count bracket.
fn dev_card_deck(player_count: u8) -> Vec<DevCardKind> {
    let (knights, each, vps) = if player_count >= 7 {
        (24, 4, 8)
    } else if player_count >= 5 {
        (20, 3, 6)
    } else {
        (14, 2, 5)
    };
    let mut deck = Vec::with_capacity(knights + 3 * each + vps);
    deck.extend(std::iter::repeat(DevCardKind::Knight).take(knights));
    for kind in [
        DevCardKind::RoadBuilding,
        DevCardKind::YearOfPlenty,
        DevCardKind::Monopoly,
    ] {
        deck.extend(std::iter::repeat(kind).take(each));
    }
    deck.extend(std::iter::repeat(DevCardKind::VictoryPoint).take(vps));
    deck
}

/// A pending, phase- and player-scoped input the engine waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Expectation {
    phase: GamePhase,
    player: PlayerId,
    kind: ExpectationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectationKind {
    InitialBuild,
    Roll,
    TurnEnd,
    RobberDrop { count: u8 },
    RobberMove { knight: bool },
}

/// A timer the transport should arm on the engine's behalf. Stale
/// generations fed back after the phase resolved are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub generation: u64,
    pub seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub id: String,
    pub config: GameConfig,
    pub phase: GamePhase,
    pub active_player: PlayerId,
    pub turn: u32,
    pub draw_pile: usize,
    pub robber: TileId,
    pub map_key: String,
    pub build_history: Vec<(PlayerId, PieceKind, usize)>,
    pub trades: Vec<Trade>,
    pub timer_remaining: Option<u32>,
    pub godmode: bool,
}

pub struct Game {
    id: String,
    config: GameConfig,
    board: Board,
    dice: DiceEngine,
    /// Seat index = player id - 1. `None` until the seat is taken.
    players: Vec<Option<Player>>,
    host: Option<PlayerId>,
    started: bool,
    phase: GamePhase,
    /// 0-based seat index of the active player.
    active: usize,
    turn: u32,
    dev_deck: Vec<DevCardKind>,
    expectations: VecDeque<Expectation>,
    build_history: Vec<(PlayerId, PieceKind, usize)>,
    trades: Vec<Trade>,
    trades_this_turn: usize,
    trade_bonus_used: bool,
    longest_road_holder: Option<PlayerId>,
    largest_army_holder: Option<PlayerId>,
    /// Players still protected from a 7 on their first roll.
    avoid_seven: Vec<PlayerId>,
    godmode: bool,
    rng: StdRng,
    dispatch: Box<dyn Dispatch + Send>,
    timer_gen: u64,
    timer: Option<(u32, Instant)>,
    pending_timer: Option<TimerRequest>,
}

impl Game {
    pub fn new(
        id: impl Into<String>,
        mut config: GameConfig,
        dispatch: Box<dyn Dispatch + Send>,
    ) -> Result<Game, ConfigError> {
        Self::with_rng(id, config_prepare(&mut config)?, dispatch, StdRng::from_entropy())
    }

    /// Deterministic session for tests: one seed drives the map
    /// shuffle, the dice and every random fallback.
    pub fn from_seed(
        id: impl Into<String>,
        mut config: GameConfig,
        dispatch: Box<dyn Dispatch + Send>,
        seed: u64,
    ) -> Result<Game, ConfigError> {
        Self::with_rng(
            id,
            config_prepare(&mut config)?,
            dispatch,
            StdRng::seed_from_u64(seed),
        )
    }

    fn with_rng(
        id: impl Into<String>,
        config: GameConfig,
        dispatch: Box<dyn Dispatch + Send>,
        mut rng: StdRng,
    ) -> Result<Game, ConfigError> {
        let board = Board::from_map_key(config.resolved_map_key())?;
        let dice_seed: u64 = rng.gen();
        Ok(Game {
            id: id.into(),
            players: vec![None; config.player_count as usize],
            host: None,
            started: false,
            phase: GamePhase::InitialSetup,
            active: 0,
            turn: 1,
            dev_deck: Vec::new(),
            expectations: VecDeque::new(),
            build_history: Vec::new(),
            trades: Vec::new(),
            trades_this_turn: 0,
            trade_bonus_used: false,
            longest_road_holder: None,
            largest_army_holder: None,
            avoid_seven: Vec::new(),
            godmode: false,
            dice: DiceEngine::from_seed(config.dice_mode, dice_seed),
            board,
            config,
            rng,
            dispatch,
            timer_gen: 0,
            timer: None,
            pending_timer: None,
        })
    }

    // ---- accessors ----

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn active_player(&self) -> PlayerId {
        self.active as PlayerId + 1
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn player(&self, pid: PlayerId) -> Option<&Player> {
        if pid == 0 {
            return None;
        }
        self.players.get(pid as usize - 1)?.as_ref()
    }

    fn player_mut(&mut self, pid: PlayerId) -> Option<&mut Player> {
        if pid == 0 {
            return None;
        }
        self.players.get_mut(pid as usize - 1)?.as_mut()
    }

    fn live_players(&self) -> impl Iterator<Item = &Player> {
        self.players
            .iter()
            .flatten()
            .filter(|p| !p.removed)
    }

    pub fn longest_road_holder(&self) -> Option<PlayerId> {
        self.longest_road_holder
    }

    pub fn largest_army_holder(&self) -> Option<PlayerId> {
        self.largest_army_holder
    }

    pub fn open_trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter().filter(|t| t.is_pending())
    }

    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            id: self.id.clone(),
            config: self.config.clone(),
            phase: self.phase,
            active_player: self.active_player(),
            turn: self.turn,
            draw_pile: self.dev_deck.len(),
            robber: self.board.robber,
            map_key: self.board.map_key(),
            build_history: self.build_history.clone(),
            trades: self.trades.iter().filter(|t| t.is_pending()).cloned().collect(),
            timer_remaining: self.remaining_seconds(),
            godmode: self.godmode,
        }
    }

    /// Debug switch kept from development tooling. One-way: once a
    /// player flips it the session stays flagged in every snapshot,
    /// and the activating player is renamed for all to see.
    pub fn activate_god_mode(&mut self, pid: PlayerId) {
        let live = self.player(pid).map_or(false, |p| !p.removed);
        if !live || self.godmode {
            return;
        }
        self.godmode = true;
        if let Some(player) = self.player_mut(pid) {
            player.name = "H4x0r".to_string();
        }
        self.dispatch.broadcast(Event::GodModeActivated { player: pid });
    }

    // ---- timers ----

    /// The timer the transport should arm next, if one was requested
    /// since the last call.
    pub fn take_timer_request(&mut self) -> Option<TimerRequest> {
        self.pending_timer.take()
    }

    pub fn remaining_seconds(&self) -> Option<u32> {
        self.timer
            .map(|(seconds, since)| seconds.saturating_sub(since.elapsed().as_secs() as u32))
    }

    fn set_timer(&mut self, seconds: u32) {
        if !self.config.timer {
            return;
        }
        self.timer_gen += 1;
        self.timer = Some((seconds, Instant::now()));
        self.pending_timer = Some(TimerRequest {
            generation: self.timer_gen,
            seconds,
        });
        self.dispatch.broadcast(Event::TimerSet { seconds });
    }

    fn clear_timer(&mut self) {
        self.timer_gen += 1;
        self.timer = None;
        self.pending_timer = None;
    }

    // ---- waiting room ----

    /// Take a random free seat. The first player to join hosts.
    pub fn join(&mut self, name: impl Into<String>) -> Option<PlayerId> {
        if self.started {
            return None;
        }
        let free: Vec<usize> = self
            .players
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i)
            .collect();
        let &seat = free.choose(&mut self.rng)?;
        let pid = seat as PlayerId + 1;
        let name = name.into();
        self.players[seat] = Some(Player::new(pid, name.clone()));
        if self.host.is_none() {
            self.host = Some(pid);
        }
        self.dispatch.broadcast(Event::PlayerJoined { player: pid, name });
        Some(pid)
    }

    /// Claim a color slot 1..=8, unique within the session.
    pub fn pick_color(&mut self, pid: PlayerId, color: u8) {
        if !(1..=8).contains(&color) {
            return;
        }
        let taken = self
            .players
            .iter()
            .flatten()
            .any(|p| p.id != pid && p.color == Some(color));
        if taken {
            return;
        }
        let Some(player) = self.player_mut(pid) else { return };
        player.color = Some(color);
        self.dispatch.broadcast(Event::ColorChosen { player: pid, color });
    }

    /// Host starts the game once every seat is taken.
    pub fn start(&mut self, pid: PlayerId) {
        if self.started || self.host != Some(pid) {
            return;
        }
        if self.players.iter().any(|p| p.is_none()) {
            return;
        }
        self.started = true;

        let mode = ShuffleMode::parse(&self.config.map_shuffle);
        if !mode.is_none() {
            if let Ok(mut shuffler) = BoardShuffler::new(self.config.resolved_map_key()) {
                let key = shuffler.shuffle(mode, &mut self.rng);
                if let Ok(board) = Board::from_map_key(&key) {
                    self.board = board;
                }
            }
        }

        self.dev_deck = dev_card_deck(self.config.player_count);
        self.dev_deck.shuffle(&mut self.rng);

        self.phase = GamePhase::InitialSetup;
        self.turn = 1;
        self.active = 0;
        self.announce_state();
        self.expect_initial_build();
    }

    /// Re-send the current prompt to a reconnecting player.
    pub fn resend_prompt(&mut self, pid: PlayerId) {
        if self.phase == GamePhase::InitialSetup
            && self
                .expectations
                .iter()
                .any(|e| e.player == pid && e.kind == ExpectationKind::InitialBuild)
        {
            let corners = self.board.settlement_locations();
            self.dispatch
                .to_player(pid, Event::SetupPrompt { player: pid, corners });
        }
        self.dispatch.to_player(pid, Event::StateChanged {
            phase: self.phase,
            active_player: self.active_player(),
            turn: self.turn,
        });
    }

    pub fn set_online(&mut self, pid: PlayerId, online: bool) {
        if let Some(player) = self.player_mut(pid) {
            player.online = online;
        }
    }

    // ---- state machine plumbing ----

    fn announce_state(&mut self) {
        self.dispatch.broadcast(Event::StateChanged {
            phase: self.phase,
            active_player: self.active_player(),
            turn: self.turn,
        });
    }

    fn take_expectation(
        &mut self,
        pid: PlayerId,
        want: impl Fn(&ExpectationKind) -> bool,
    ) -> Option<Expectation> {
        let pos = self.expectations.iter().position(|e| {
            // A knight's robber move stays claimable for the rest of
            // the turn, even after the roll changes the phase.
            let phase_ok = e.phase == self.phase
                || e.kind == ExpectationKind::RobberMove { knight: true };
            e.player == pid && phase_ok && want(&e.kind)
        })?;
        self.expectations.remove(pos)
    }

    fn expect_initial_build(&mut self) {
        let pid = self.active_player();
        self.expectations.push_back(Expectation {
            phase: GamePhase::InitialSetup,
            player: pid,
            kind: ExpectationKind::InitialBuild,
        });
        let corners = self.board.settlement_locations();
        self.dispatch
            .to_player(pid, Event::SetupPrompt { player: pid, corners });
        self.set_timer(self.config.initial_build_time);
    }

    fn goto_player_roll(&mut self) {
        self.clear_timer();
        self.phase = GamePhase::PlayerRoll;
        let pid = self.active_player();
        if let Some(player) = self.player_mut(pid) {
            player.dev_cards.promote();
        }
        self.announce_state();
        if self.config.auto_roll {
            self.resolve_roll(pid);
            return;
        }
        self.expectations.push_back(Expectation {
            phase: GamePhase::PlayerRoll,
            player: pid,
            kind: ExpectationKind::Roll,
        });
        self.set_timer(self.config.strategize_time + self.config.roll_time);
    }

    fn goto_player_actions(&mut self) {
        self.clear_timer();
        self.phase = GamePhase::PlayerActions;
        let pid = self.active_player();
        self.trades_this_turn = 0;
        self.trade_bonus_used = false;
        self.announce_state();
        self.expectations.push_back(Expectation {
            phase: GamePhase::PlayerActions,
            player: pid,
            kind: ExpectationKind::TurnEnd,
        });
        self.set_timer(self.config.player_turn_time);
    }

    fn goto_robber_drop(&mut self, over_limit: Vec<(PlayerId, u8)>) {
        self.clear_timer();
        self.phase = GamePhase::RobberDrop;
        self.announce_state();
        for (pid, count) in over_limit {
            self.expectations.push_back(Expectation {
                phase: GamePhase::RobberDrop,
                player: pid,
                kind: ExpectationKind::RobberDrop { count },
            });
        }
        self.set_timer(self.config.robber_drop_time);
    }

    fn goto_robber_move(&mut self) {
        self.clear_timer();
        self.phase = GamePhase::RobberMove;
        self.announce_state();
        self.expectations.push_back(Expectation {
            phase: GamePhase::RobberMove,
            player: self.active_player(),
            kind: ExpectationKind::RobberMove { knight: false },
        });
        self.set_timer(self.config.robber_move_time);
    }

    fn end_game(&mut self, winner: Option<PlayerId>) {
        if self.phase == GamePhase::End {
            return;
        }
        self.clear_timer();
        self.expectations.clear();
        self.phase = GamePhase::End;
        let mut standings: Vec<(PlayerId, u8)> = self
            .players
            .iter()
            .flatten()
            .map(|p| (p.id, p.total_points()))
            .collect();
        standings.sort_by(|a, b| b.1.cmp(&a.1));
        self.announce_state();
        self.dispatch.broadcast(Event::GameEnded { winner, standings });
    }

    fn check_win(&mut self, pid: PlayerId) {
        let won = self
            .player(pid)
            .map_or(false, |p| p.total_points() >= self.config.win_points);
        if won {
            self.end_game(Some(pid));
        }
    }

    // ---- initial placement ----

    /// Place an initial settlement + road. Illegal proposals snap to a
    /// random legal location so setup always makes progress.
    pub fn place_initial(&mut self, pid: PlayerId, corner: Option<CornerId>, edge: Option<EdgeId>) {
        if self
            .take_expectation(pid, |k| *k == ExpectationKind::InitialBuild)
            .is_none()
        {
            return;
        }
        self.clear_timer();

        let legal = self.board.settlement_locations();
        let corner = corner
            .filter(|c| legal.contains(c))
            .or_else(|| legal.choose(&mut self.rng).copied());
        let Some(corner) = corner else {
            // No legal corner left on the board; setup cannot continue.
            self.end_game(None);
            return;
        };

        self.board.build(pid, PieceKind::Settlement, corner);
        if let Some(player) = self.player_mut(pid) {
            player.record_build(PieceKind::Settlement, corner);
        }
        self.build_history.push((pid, PieceKind::Settlement, corner));
        self.dispatch.broadcast(Event::Built {
            player: pid,
            piece: PieceKind::Settlement,
            location: corner,
        });

        let road_options: Vec<EdgeId> = self.board.corners[corner]
            .edges
            .iter()
            .copied()
            .filter(|&e| {
                self.board.edges[e].road.is_none() && self.board.edge_touches_land_id(e)
            })
            .collect();
        let edge = edge
            .filter(|e| road_options.contains(e))
            .or_else(|| road_options.choose(&mut self.rng).copied());
        if let Some(edge) = edge {
            self.board.build(pid, PieceKind::Road, edge);
            if let Some(player) = self.player_mut(pid) {
                player.record_build(PieceKind::Road, edge);
            }
            self.build_history.push((pid, PieceKind::Road, edge));
            self.dispatch.broadcast(Event::Built {
                player: pid,
                piece: PieceKind::Road,
                location: edge,
            });
        }

        // Second-round settlements come with their tiles' resources.
        if self.turn == 2 {
            let mut gained = ResourceHand::default();
            for &t in &self.board.corners[corner].tiles {
                if let Some(resource) = self.board.tiles[t].terrain.resource() {
                    gained.add(resource, 1);
                }
            }
            if !gained.is_empty() {
                if let Some(player) = self.player_mut(pid) {
                    player.hand.gain(&gained);
                }
                self.dispatch
                    .to_player(pid, Event::ResourcesGained { resources: gained });
            }
        }

        self.advance_setup();
    }

    fn advance_setup(&mut self) {
        let last = self.players.len() - 1;
        if self.turn == 1 {
            if self.active < last {
                self.active += 1;
            } else {
                // Snake order: the last seat places again immediately.
                self.turn = 2;
            }
            self.announce_state();
            self.expect_initial_build();
        } else if self.active > 0 {
            self.active -= 1;
            self.announce_state();
            self.expect_initial_build();
        } else {
            self.turn = 3;
            self.avoid_seven = self.live_players().map(|p| p.id).collect();
            self.goto_player_roll();
        }
    }

    // ---- rolling ----

    pub fn roll(&mut self, pid: PlayerId) {
        if self
            .take_expectation(pid, |k| *k == ExpectationKind::Roll)
            .is_none()
        {
            return;
        }
        self.resolve_roll(pid);
    }

    fn resolve_roll(&mut self, pid: PlayerId) {
        let avoid: Vec<u8> = if self.avoid_seven.contains(&pid) {
            vec![7]
        } else {
            Vec::new()
        };
        self.avoid_seven.retain(|&p| p != pid);
        let roll = self.dice.roll(&avoid);
        self.dispatch.broadcast(Event::DiceRolled { player: pid, roll });

        if roll.total() == 7 {
            let over_limit: Vec<(PlayerId, u8)> = self
                .live_players()
                .filter(|p| p.hand.total() > self.config.robber_hand_limit)
                .map(|p| (p.id, (p.hand.total() / 2) as u8))
                .collect();
            if over_limit.is_empty() {
                self.goto_robber_move();
            } else {
                self.goto_robber_drop(over_limit);
            }
            return;
        }

        let yields = self.board.distribute(roll.total());
        let mut per_player: Vec<(PlayerId, ResourceHand)> = Vec::new();
        for grant in &yields {
            if let Some(player) = self.player_mut(grant.player) {
                player.hand.add(grant.resource, grant.count);
            }
            match per_player.iter_mut().find(|(p, _)| *p == grant.player) {
                Some((_, hand)) => hand.add(grant.resource, grant.count),
                None => {
                    let mut hand = ResourceHand::default();
                    hand.add(grant.resource, grant.count);
                    per_player.push((grant.player, hand));
                }
            }
        }
        self.dispatch
            .broadcast(Event::ResourcesDistributed { grants: yields });
        for (player, resources) in per_player {
            self.dispatch
                .to_player(player, Event::ResourcesGained { resources });
            self.refresh_trades_for(player);
        }
        self.goto_player_actions();
    }

    // ---- robber ----

    /// Discard toward a forced robber drop. Partial or bogus discards
    /// are clamped to the player's holdings and completed at random.
    pub fn drop_cards(&mut self, pid: PlayerId, discard: ResourceHand) {
        let Some(expectation) = self.take_expectation(pid, |k| {
            matches!(k, ExpectationKind::RobberDrop { .. })
        }) else {
            return;
        };
        let ExpectationKind::RobberDrop { count } = expectation.kind else {
            return;
        };
        self.force_drop(pid, count, Some(discard));
        if !self
            .expectations
            .iter()
            .any(|e| matches!(e.kind, ExpectationKind::RobberDrop { .. }))
        {
            self.goto_robber_move();
        }
    }

    fn force_drop(&mut self, pid: PlayerId, count: u8, requested: Option<ResourceHand>) {
        let mut dropped = 0u8;
        if let Some(requested) = requested {
            for r in Resource::ALL {
                if dropped >= count {
                    break;
                }
                let want = requested.count(r).min(count - dropped);
                if let Some(player) = self.player_mut(pid) {
                    dropped += player.hand.remove(r, want);
                }
            }
        }
        while dropped < count {
            let hand = match self.player(pid) {
                Some(p) => p.hand,
                None => break,
            };
            let Some(card) = hand.random_card(&mut self.rng) else { break };
            if let Some(player) = self.player_mut(pid) {
                dropped += player.hand.remove(card, 1);
            }
        }
        self.dispatch
            .broadcast(Event::CardsDropped { player: pid, count: dropped });
        self.refresh_trades_for(pid);
    }

    pub fn move_robber(
        &mut self,
        pid: PlayerId,
        tile: Option<TileId>,
        victim: Option<PlayerId>,
    ) {
        let Some(expectation) = self.take_expectation(pid, |k| {
            matches!(k, ExpectationKind::RobberMove { .. })
        }) else {
            return;
        };
        let knight = matches!(expectation.kind, ExpectationKind::RobberMove { knight: true });
        self.resolve_robber_move(pid, tile, victim, knight);
    }

    fn resolve_robber_move(
        &mut self,
        pid: PlayerId,
        tile: Option<TileId>,
        victim: Option<PlayerId>,
        knight: bool,
    ) {
        let options = self.board.robbable_tiles();
        let tile = tile
            .filter(|t| options.contains(t))
            .or_else(|| options.choose(&mut self.rng).copied());
        let Some(tile) = tile else { return };
        self.board.move_robber(tile);

        // Victims: owners of buildings on the tile, excluding the
        // mover. An invalid or omitted pick falls back at random.
        let mut candidates: Vec<PlayerId> = Vec::new();
        for &c in &self.board.tiles[tile].corner_ids() {
            if let Some(building) = self.board.corners[c].building {
                if building.owner != pid && !candidates.contains(&building.owner) {
                    let robbable = self
                        .player(building.owner)
                        .map_or(false, |p| !p.removed && !p.hand.is_empty());
                    if robbable {
                        candidates.push(building.owner);
                    }
                }
            }
        }
        let victim = victim
            .filter(|v| candidates.contains(v))
            .or_else(|| candidates.choose(&mut self.rng).copied());

        if let Some(victim) = victim {
            let victim_hand = self.player(victim).map(|p| p.hand);
            let card = victim_hand.and_then(|h| h.random_card(&mut self.rng));
            if let Some(card) = card {
                if let Some(victim_player) = self.player_mut(victim) {
                    victim_player.hand.remove(card, 1);
                }
                if let Some(thief) = self.player_mut(pid) {
                    thief.hand.add(card, 1);
                }
                let stolen = Event::ResourceStolen {
                    thief: pid,
                    victim,
                    resource: card,
                };
                self.dispatch.to_player(pid, stolen.clone());
                self.dispatch.to_player(victim, stolen);
                self.refresh_trades_for(pid);
                self.refresh_trades_for(victim);
            }
        }

        self.dispatch.broadcast(Event::RobberMoved {
            player: pid,
            tile,
            victim,
            knight,
        });

        // A knight's robber move stays inside the current phase.
        if !knight {
            self.goto_player_actions();
        }
    }

    // ---- building & purchases ----

    fn is_active_action(&self, pid: PlayerId) -> bool {
        self.phase == GamePhase::PlayerActions && pid == self.active_player()
    }

    pub fn build(&mut self, pid: PlayerId, piece: PieceKind, location: usize) {
        if !self.is_active_action(pid) {
            return;
        }
        let Some(player) = self.player(pid) else { return };
        if !player.has_piece(piece) || !player.can_afford(Purchasable::Piece(piece)) {
            return;
        }
        let legal = match piece {
            PieceKind::Road => self
                .board
                .road_locations_from_roads(pid, &player.roads)
                .contains(&location),
            PieceKind::Settlement => self
                .board
                .settlement_locations_from_roads(&player.roads)
                .contains(&location),
            PieceKind::City => player.settlements.contains(&location),
        };
        if !legal || !self.board.build(pid, piece, location) {
            return;
        }
        if let Some(player) = self.player_mut(pid) {
            player.purchase(Purchasable::Piece(piece));
            player.record_build(piece, location);
        }
        self.build_history.push((pid, piece, location));
        self.dispatch.broadcast(Event::Built {
            player: pid,
            piece,
            location,
        });
        self.refresh_trades_for(pid);

        match piece {
            PieceKind::Road => self.recompute_longest_road(pid),
            PieceKind::Settlement => self.check_severed_road(location, pid),
            PieceKind::City => {}
        }
        self.check_win(pid);
    }

    pub fn buy_dev_card(&mut self, pid: PlayerId) {
        if !self.is_active_action(pid) || self.dev_deck.is_empty() {
            return;
        }
        let paid = self
            .player_mut(pid)
            .map_or(false, |p| p.purchase(Purchasable::DevCard));
        if !paid {
            return;
        }
        let Some(kind) = self.dev_deck.pop() else { return };
        if let Some(player) = self.player_mut(pid) {
            player.dev_cards.add_bought(kind);
        }
        let remaining = self.dev_deck.len();
        self.dispatch.broadcast(Event::DevCardTaken {
            player: pid,
            kind: None,
            remaining,
        });
        self.dispatch.to_player(
            pid,
            Event::DevCardTaken {
                player: pid,
                kind: Some(kind),
                remaining,
            },
        );
        self.refresh_trades_for(pid);
        self.check_win(pid);
    }

    // ---- development cards ----

    /// Knights may be played before or after the roll.
    pub fn play_knight(&mut self, pid: PlayerId) {
        let phase_ok = matches!(self.phase, GamePhase::PlayerRoll | GamePhase::PlayerActions);
        if !phase_ok || pid != self.active_player() {
            return;
        }
        let played = self
            .player_mut(pid)
            .map_or(false, |p| p.dev_cards.play(DevCardKind::Knight));
        if !played {
            return;
        }
        if let Some(player) = self.player_mut(pid) {
            player.knights_played += 1;
        }
        self.dispatch.broadcast(Event::DevCardPlayed {
            player: pid,
            kind: DevCardKind::Knight,
        });
        self.recompute_largest_army(pid);
        self.expectations.push_back(Expectation {
            phase: self.phase,
            player: pid,
            kind: ExpectationKind::RobberMove { knight: true },
        });
    }

    pub fn play_road_building(&mut self, pid: PlayerId, first: EdgeId, second: EdgeId) {
        if !self.is_active_action(pid) {
            return;
        }
        let played = self
            .player_mut(pid)
            .map_or(false, |p| p.dev_cards.play(DevCardKind::RoadBuilding));
        if !played {
            return;
        }
        self.dispatch.broadcast(Event::DevCardPlayed {
            player: pid,
            kind: DevCardKind::RoadBuilding,
        });
        for edge in [first, second] {
            let Some(player) = self.player(pid) else { break };
            if !player.has_piece(PieceKind::Road) {
                break;
            }
            let legal = self
                .board
                .road_locations_from_roads(pid, &player.roads)
                .contains(&edge);
            if !legal || !self.board.build(pid, PieceKind::Road, edge) {
                continue;
            }
            if let Some(player) = self.player_mut(pid) {
                player.record_build(PieceKind::Road, edge);
            }
            self.build_history.push((pid, PieceKind::Road, edge));
            self.dispatch.broadcast(Event::Built {
                player: pid,
                piece: PieceKind::Road,
                location: edge,
            });
        }
        self.recompute_longest_road(pid);
        self.check_win(pid);
    }

    pub fn play_year_of_plenty(&mut self, pid: PlayerId, first: Resource, second: Resource) {
        if !self.is_active_action(pid) {
            return;
        }
        let played = self
            .player_mut(pid)
            .map_or(false, |p| p.dev_cards.play(DevCardKind::YearOfPlenty));
        if !played {
            return;
        }
        let mut gained = ResourceHand::default();
        gained.add(first, 1);
        gained.add(second, 1);
        if let Some(player) = self.player_mut(pid) {
            player.hand.gain(&gained);
        }
        self.dispatch.broadcast(Event::DevCardPlayed {
            player: pid,
            kind: DevCardKind::YearOfPlenty,
        });
        self.dispatch
            .to_player(pid, Event::ResourcesGained { resources: gained });
        self.refresh_trades_for(pid);
    }

    pub fn play_monopoly(&mut self, pid: PlayerId, resource: Resource) {
        if !self.is_active_action(pid) {
            return;
        }
        let played = self
            .player_mut(pid)
            .map_or(false, |p| p.dev_cards.play(DevCardKind::Monopoly));
        if !played {
            return;
        }
        let victims: Vec<PlayerId> = self
            .live_players()
            .filter(|p| p.id != pid)
            .map(|p| p.id)
            .collect();
        let mut total = 0u8;
        for victim in victims {
            if let Some(player) = self.player_mut(victim) {
                let held = player.hand.count(resource);
                player.hand.remove(resource, held);
                total += held;
            }
            self.refresh_trades_for(victim);
        }
        if let Some(player) = self.player_mut(pid) {
            player.hand.add(resource, total);
        }
        self.dispatch.broadcast(Event::DevCardPlayed {
            player: pid,
            kind: DevCardKind::Monopoly,
        });
        self.dispatch.broadcast(Event::MonopolyResolved {
            player: pid,
            resource,
            total,
        });
        self.refresh_trades_for(pid);
    }

    // ---- achievements ----

    fn recompute_largest_army(&mut self, pid: PlayerId) {
        let Some(candidate) = self.player(pid) else { return };
        let knights = candidate.knights_played;
        if knights < self.config.largest_army_count {
            return;
        }
        let holder_knights = self
            .largest_army_holder
            .and_then(|h| self.player(h))
            .map(|p| p.knights_played);
        // Ties never transfer the title.
        let takes = match holder_knights {
            None => true,
            Some(held) => self.largest_army_holder != Some(pid) && knights > held,
        };
        if !takes {
            return;
        }
        if let Some(prev) = self.largest_army_holder {
            if let Some(player) = self.player_mut(prev) {
                player.has_largest_army = false;
            }
        }
        if let Some(player) = self.player_mut(pid) {
            player.has_largest_army = true;
        }
        self.largest_army_holder = Some(pid);
        self.dispatch.broadcast(Event::AchievementChanged {
            kind: AchievementKind::LargestArmy,
            holder: Some(pid),
        });
        self.check_win(pid);
    }

    fn recompute_longest_road(&mut self, pid: PlayerId) {
        let roads = match self.player(pid) {
            Some(p) => p.roads.clone(),
            None => return,
        };
        let path = self.board.longest_path_from_roads(pid, &roads);
        if let Some(player) = self.player_mut(pid) {
            player.longest_road = path.clone();
        }
        if path.len() < self.config.longest_road_count {
            return;
        }
        let holder_len = self
            .longest_road_holder
            .and_then(|h| self.player(h))
            .map(|p| p.longest_road.len());
        let takes = match holder_len {
            None => true,
            Some(held) => self.longest_road_holder != Some(pid) && path.len() > held,
        };
        if !takes {
            return;
        }
        self.transfer_longest_road(Some(pid));
        self.check_win(pid);
    }

    fn transfer_longest_road(&mut self, to: Option<PlayerId>) {
        if self.longest_road_holder == to {
            return;
        }
        if let Some(prev) = self.longest_road_holder {
            if let Some(player) = self.player_mut(prev) {
                player.has_longest_road = false;
            }
        }
        if let Some(pid) = to {
            if let Some(player) = self.player_mut(pid) {
                player.has_longest_road = true;
            }
        }
        self.longest_road_holder = to;
        self.dispatch.broadcast(Event::AchievementChanged {
            kind: AchievementKind::LongestRoad,
            holder: to,
        });
    }

    /// A settlement can cut the current holder's longest road in two.
    /// Only corners sitting on two of the holder's counted edges can
    /// do that; when they do, everyone's path is re-measured.
    fn check_severed_road(&mut self, corner: CornerId, builder: PlayerId) {
        let Some(holder) = self.longest_road_holder else { return };
        if holder == builder {
            return;
        }
        let Some(holder_player) = self.player(holder) else { return };
        let counted: Vec<EdgeId> = self.board.corners[corner]
            .edges
            .iter()
            .copied()
            .filter(|e| holder_player.longest_road.contains(e))
            .filter(|&e| self.board.edges[e].road == Some(holder))
            .collect();
        if counted.len() < 2 {
            return;
        }

        // Re-measure every live player, then settle the title.
        let pids: Vec<PlayerId> = self.live_players().map(|p| p.id).collect();
        for pid in pids {
            let roads = match self.player(pid) {
                Some(p) => p.roads.clone(),
                None => continue,
            };
            let path = self.board.longest_path_from_roads(pid, &roads);
            if let Some(player) = self.player_mut(pid) {
                player.longest_road = path;
            }
        }
        let min = self.config.longest_road_count;
        let holder_len = self.player(holder).map_or(0, |p| p.longest_road.len());
        let best = self
            .live_players()
            .map(|p| (p.id, p.longest_road.len()))
            .max_by_key(|&(_, len)| len);
        match best {
            Some((pid, len)) if len >= min => {
                // The holder keeps the title unless strictly beaten.
                if holder_len >= min && len <= holder_len {
                    return;
                }
                if pid != holder {
                    self.transfer_longest_road(Some(pid));
                    self.check_win(pid);
                } else if holder_len < min {
                    self.transfer_longest_road(None);
                }
            }
            _ => {
                if holder_len < min {
                    self.transfer_longest_road(None);
                }
            }
        }
    }

    /// Best trade ratio the player has for giving away `resource`.
    fn trade_ratio(&self, pid: PlayerId, resource: Resource) -> u8 {
        let Some(player) = self.player(pid) else { return 4 };
        let mut ratio = 4;
        for &corner in player.settlements.iter().chain(player.cities.iter()) {
            if let Some((kind, port_ratio)) = self.board.corners[corner].port {
                let applies = match kind {
                    PortKind::Any => true,
                    PortKind::Resource(r) => r == resource,
                };
                if applies && port_ratio < ratio {
                    ratio = port_ratio;
                }
            }
        }
        ratio
    }

    // ---- trading ----

    pub fn request_trade(&mut self, pid: PlayerId, give: ResourceHand, take: ResourceHand) {
        if !self.is_active_action(pid) || give.is_empty() || take.is_empty() {
            return;
        }
        if self.trades_this_turn >= self.config.max_trade_requests {
            return;
        }
        let holds = self.player(pid).map_or(false, |p| p.hand.contains(&give));
        let mut trade = Trade::new(self.trades.len(), pid, give, take);
        if !holds {
            trade.status = TradeStatus::Closed;
        }
        self.trades_this_turn += 1;
        self.dispatch
            .broadcast(Event::TradeRequested { trade: trade.clone() });
        self.trades.push(trade);

        // The first request of a turn buys the table extra time, once.
        if !self.trade_bonus_used {
            self.trade_bonus_used = true;
            if let Some(remaining) = self.remaining_seconds() {
                self.set_timer(remaining + self.config.trade_time_bonus_seconds);
            }
        }
    }

    pub fn accept_trade(&mut self, pid: PlayerId, trade_id: usize) {
        if self.phase != GamePhase::PlayerActions {
            return;
        }
        let Some(trade) = self.trades.get(trade_id).cloned() else { return };
        if trade.player == pid || trade.status != TradeStatus::Open {
            return;
        }
        // Both hands are re-validated at acceptance time.
        let offerer_holds = self
            .player(trade.player)
            .map_or(false, |p| p.hand.contains(&trade.give));
        let acceptor_holds = self.player(pid).map_or(false, |p| p.hand.contains(&trade.take));
        if !offerer_holds || !acceptor_holds {
            return;
        }
        if let Some(offerer) = self.player_mut(trade.player) {
            offerer.hand.pay(&trade.give);
            offerer.hand.gain(&trade.take);
        }
        if let Some(acceptor) = self.player_mut(pid) {
            acceptor.hand.pay(&trade.take);
            acceptor.hand.gain(&trade.give);
        }
        if let Some(stored) = self.trades.get_mut(trade_id) {
            stored.status = TradeStatus::Success;
            let trade = stored.clone();
            self.dispatch.broadcast(Event::TradeUpdated { trade });
        }
        self.refresh_trades_for(trade.player);
        self.refresh_trades_for(pid);
    }

    pub fn reject_trade(&mut self, pid: PlayerId, trade_id: usize) {
        let others = self.live_players().count().saturating_sub(1);
        let Some(trade) = self.trades.get_mut(trade_id) else { return };
        if trade.player == pid || !trade.is_pending() || trade.rejected_by.contains(&pid) {
            return;
        }
        trade.rejected_by.push(pid);
        if trade.rejected_by.len() >= others {
            trade.status = TradeStatus::Failed;
        }
        let trade = trade.clone();
        self.dispatch.broadcast(Event::TradeUpdated { trade });
    }

    pub fn delete_trade(&mut self, pid: PlayerId, trade_id: usize) {
        let Some(trade) = self.trades.get_mut(trade_id) else { return };
        if trade.player != pid || !trade.is_pending() {
            return;
        }
        trade.status = TradeStatus::Deleted;
        let trade = trade.clone();
        self.dispatch.broadcast(Event::TradeUpdated { trade });
    }

    /// Fixed-ratio trade against the board, gated by port access.
    pub fn board_trade(&mut self, pid: PlayerId, give: Resource, give_count: u8, take: Resource) {
        if !self.is_active_action(pid) || give == take || give_count == 0 {
            return;
        }
        let ratio = self.trade_ratio(pid, give);
        if give_count % ratio != 0 {
            return;
        }
        let receive = give_count / ratio;
        let holds = self
            .player(pid)
            .map_or(false, |p| p.hand.count(give) >= give_count);
        if !holds {
            return;
        }
        let mut gave = ResourceHand::default();
        gave.add(give, give_count);
        let mut got = ResourceHand::default();
        got.add(take, receive);
        if let Some(player) = self.player_mut(pid) {
            player.hand.pay(&gave);
            player.hand.gain(&got);
        }
        self.dispatch.broadcast(Event::BoardTraded {
            player: pid,
            gave,
            got,
        });
        self.refresh_trades_for(pid);
    }

    /// Open offers close while their owner cannot cover them and
    /// reopen when they can again.
    fn refresh_trades_for(&mut self, pid: PlayerId) {
        let hand = match self.player(pid) {
            Some(p) => p.hand,
            None => return,
        };
        let mut changed = Vec::new();
        for trade in self.trades.iter_mut() {
            if trade.player != pid || !trade.is_pending() {
                continue;
            }
            let next = if hand.contains(&trade.give) {
                TradeStatus::Open
            } else {
                TradeStatus::Closed
            };
            if trade.status != next {
                trade.status = next;
                changed.push(trade.clone());
            }
        }
        for trade in changed {
            self.dispatch.broadcast(Event::TradeUpdated { trade });
        }
    }

    // ---- turn end & removal ----

    pub fn end_turn(&mut self, pid: PlayerId) {
        if self
            .take_expectation(pid, |k| *k == ExpectationKind::TurnEnd)
            .is_none()
        {
            return;
        }
        self.finish_turn();
    }

    fn finish_turn(&mut self) {
        // Pending knight moves and open offers die with the turn.
        self.expectations.clear();
        let stale: Vec<usize> = self
            .trades
            .iter()
            .filter(|t| t.is_pending())
            .map(|t| t.id)
            .collect();
        for id in stale {
            if let Some(trade) = self.trades.get_mut(id) {
                trade.status = TradeStatus::Deleted;
                let trade = trade.clone();
                self.dispatch.broadcast(Event::TradeUpdated { trade });
            }
        }
        if let Some(next) = self.next_live_seat(self.active) {
            self.active = next;
        }
        self.turn += 1;
        self.goto_player_roll();
    }

    fn next_live_seat(&self, from: usize) -> Option<usize> {
        let count = self.players.len();
        (1..=count)
            .map(|step| (from + step) % count)
            .find(|&seat| {
                self.players[seat]
                    .as_ref()
                    .map_or(false, |p| !p.removed)
            })
    }

    /// Remove a player. Before start the seat returns to the pool;
    /// mid-game the seat stays (turn order is stable) but is skipped.
    pub fn remove_player(&mut self, pid: PlayerId) {
        if pid == 0 || pid as usize > self.players.len() {
            return;
        }
        if !self.started {
            self.players[pid as usize - 1] = None;
            if self.host == Some(pid) {
                self.host = self.players.iter().flatten().map(|p| p.id).next();
            }
            self.dispatch.broadcast(Event::PlayerQuit { player: pid });
            return;
        }
        let already_removed = match self.player(pid) {
            Some(p) => p.removed,
            None => true,
        };
        if already_removed || self.phase == GamePhase::End {
            return;
        }
        if let Some(player) = self.player_mut(pid) {
            player.removed = true;
            player.online = false;
        }
        self.expectations.retain(|e| e.player != pid);
        self.dispatch.broadcast(Event::PlayerQuit { player: pid });

        if self.phase == GamePhase::InitialSetup {
            self.end_game(None);
            return;
        }
        let live: Vec<PlayerId> = self.live_players().map(|p| p.id).collect();
        match live.len() {
            0 => self.end_game(None),
            1 => self.end_game(Some(live[0])),
            _ => {
                if self.active_player() == pid {
                    self.finish_turn();
                } else if self.phase == GamePhase::RobberDrop
                    && !self
                        .expectations
                        .iter()
                        .any(|e| matches!(e.kind, ExpectationKind::RobberDrop { .. }))
                {
                    self.goto_robber_move();
                }
            }
        }
    }

    // ---- timer expiry ----

    /// Called by the transport when an armed timer fires. Stale
    /// generations are no-ops, so a timer racing a player action can
    /// never double-resolve a phase.
    pub fn handle_timer(&mut self, generation: u64) {
        if generation != self.timer_gen || self.timer.is_none() {
            return;
        }
        self.timer = None;
        match self.phase {
            GamePhase::InitialSetup => {
                if let Some(e) = self
                    .expectations
                    .iter()
                    .find(|e| e.kind == ExpectationKind::InitialBuild)
                    .cloned()
                {
                    self.expectations.retain(|x| x != &e);
                    // Re-enter through the public path with no proposal.
                    self.expectations.push_front(e.clone());
                    self.place_initial(e.player, None, None);
                }
            }
            GamePhase::PlayerRoll => {
                let pid = self.active_player();
                self.force_pending_knight_move(pid);
                if self
                    .take_expectation(pid, |k| *k == ExpectationKind::Roll)
                    .is_some()
                {
                    self.resolve_roll(pid);
                }
            }
            GamePhase::PlayerActions => {
                let pid = self.active_player();
                self.force_pending_knight_move(pid);
                self.finish_turn();
            }
            GamePhase::RobberDrop => {
                // Collapse every outstanding drop, then move on. The
                // FIFO is drained first so nothing double-resolves.
                let pending: Vec<(PlayerId, u8)> = self
                    .expectations
                    .iter()
                    .filter_map(|e| match e.kind {
                        ExpectationKind::RobberDrop { count } => Some((e.player, count)),
                        _ => None,
                    })
                    .collect();
                self.expectations
                    .retain(|e| !matches!(e.kind, ExpectationKind::RobberDrop { .. }));
                for (pid, count) in pending {
                    self.force_drop(pid, count, None);
                }
                self.goto_robber_move();
            }
            GamePhase::RobberMove => {
                // A pending knight move can queue ahead of the rolled
                // seven's move; collapse every outstanding one.
                let pid = self.active_player();
                while let Some(e) =
                    self.take_expectation(pid, |k| matches!(k, ExpectationKind::RobberMove { .. }))
                {
                    let knight =
                        matches!(e.kind, ExpectationKind::RobberMove { knight: true });
                    self.resolve_robber_move(pid, None, None, knight);
                    if self.phase != GamePhase::RobberMove {
                        break;
                    }
                }
            }
            GamePhase::End => {}
        }
    }

    fn force_pending_knight_move(&mut self, pid: PlayerId) {
        if self
            .take_expectation(pid, |k| *k == ExpectationKind::RobberMove { knight: true })
            .is_some()
        {
            self.resolve_robber_move(pid, None, None, true);
        }
    }
}

fn config_prepare(config: &mut GameConfig) -> Result<GameConfig, ConfigError> {
    config.validate()?;
    config.apply_player_count_brackets();
    Ok(config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn config_defaults_match_the_rulebook() {
        let config = GameConfig::default();
        assert_eq!(config.player_count, 3);
        assert_eq!(config.win_points, 10);
        assert_eq!(config.robber_hand_limit, 7);
        assert_eq!(config.longest_road_count, 5);
        assert_eq!(config.largest_army_count, 3);
        assert_eq!(config.map_shuffle, "all");
    }

    #[test]
    fn player_count_brackets_adjust_unset_values() {
        let mut config = GameConfig {
            player_count: 5,
            ..GameConfig::default()
        };
        config.apply_player_count_brackets();
        assert_eq!(config.win_points, 11);
        assert_eq!(config.robber_hand_limit, 9);
        assert_eq!(config.resolved_map_key(), EXTENDED_MAP_KEY);

        let mut config = GameConfig {
            player_count: 7,
            ..GameConfig::default()
        };
        config.apply_player_count_brackets();
        assert_eq!(config.win_points, 12);
        assert_eq!(config.robber_hand_limit, 11);
        assert_eq!(config.resolved_map_key(), LARGE_MAP_KEY);
    }

    #[test]
    fn explicit_values_survive_brackets() {
        let mut config = GameConfig {
            player_count: 6,
            win_points: 8,
            robber_hand_limit: 5,
            ..GameConfig::default()
        };
        config.apply_player_count_brackets();
        assert_eq!(config.win_points, 8);
        assert_eq!(config.robber_hand_limit, 5);
    }

    #[test]
    fn config_validation() {
        let config = GameConfig {
            player_count: 1,
            ..GameConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PlayerCount(1)));
        let config = GameConfig {
            win_points: 2,
            ..GameConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::WinPoints(2)));
        assert!(GameConfig::default().validate().is_ok());
    }

    #[test]
    fn deck_composition_per_bracket() {
        let count = |deck: &[DevCardKind], kind| deck.iter().filter(|&&k| k == kind).count();
        let deck = dev_card_deck(4);
        assert_eq!(deck.len(), 25);
        assert_eq!(count(&deck, DevCardKind::Knight), 14);
        assert_eq!(count(&deck, DevCardKind::VictoryPoint), 5);

        let deck = dev_card_deck(6);
        assert_eq!(deck.len(), 35);
        assert_eq!(count(&deck, DevCardKind::Knight), 20);
        assert_eq!(count(&deck, DevCardKind::Monopoly), 3);

        let deck = dev_card_deck(8);
        assert_eq!(deck.len(), 44);
        assert_eq!(count(&deck, DevCardKind::Knight), 24);
        assert_eq!(count(&deck, DevCardKind::VictoryPoint), 8);
    }

    use crate::board::{Building, BuildingKind};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<(Option<PlayerId>, Event)>>>,
    }

    impl Recorder {
        fn sink(&self) -> Box<dyn Dispatch + Send> {
            Box::new(Sink {
                log: Arc::clone(&self.log),
            })
        }

        fn broadcasts(&self) -> Vec<Event> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| to.is_none())
                .map(|(_, e)| e.clone())
                .collect()
        }

        fn private_to(&self, pid: PlayerId) -> Vec<Event> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| *to == Some(pid))
                .map(|(_, e)| e.clone())
                .collect()
        }
    }

    struct Sink {
        log: Arc<Mutex<Vec<(Option<PlayerId>, Event)>>>,
    }

    impl Dispatch for Sink {
        fn broadcast(&mut self, event: Event) {
            self.log.lock().unwrap().push((None, event));
        }

        fn to_player(&mut self, player: PlayerId, event: Event) {
            self.log.lock().unwrap().push((Some(player), event));
        }
    }

    /// A 3-player session dropped straight into the action phase with
    /// player 1 active, skipping setup.
    fn bare_game(seed: u64) -> (Game, Recorder) {
        let config = GameConfig {
            map_shuffle: "none".to_string(),
            ..GameConfig::default()
        };
        let rec = Recorder::default();
        let mut game = Game::from_seed("t", config, rec.sink(), seed).unwrap();
        for name in ["amy", "bo", "cj"] {
            game.join(name).unwrap();
        }
        game.started = true;
        game.phase = GamePhase::PlayerActions;
        game.active = 0;
        (game, rec)
    }

    fn hand_of(game: &Game, pid: PlayerId) -> ResourceHand {
        game.player(pid).unwrap().hand
    }

    #[test]
    fn forced_drop_honors_the_request_then_completes_randomly() {
        let (mut game, rec) = bare_game(11);
        game.players[1].as_mut().unwrap().hand = ResourceHand::new(3, 3, 1, 1, 1);
        game.phase = GamePhase::RobberDrop;
        game.expectations.push_back(Expectation {
            phase: GamePhase::RobberDrop,
            player: 2,
            kind: ExpectationKind::RobberDrop { count: 4 },
        });

        game.drop_cards(2, ResourceHand::new(2, 0, 0, 0, 0));

        let hand = hand_of(&game, 2);
        assert_eq!(hand.total(), 5, "9 cards must drop to 5");
        assert!(hand.sheep <= 1, "both requested sheep were discarded");
        assert!(rec
            .broadcasts()
            .contains(&Event::CardsDropped { player: 2, count: 4 }));
        // Last outstanding drop resolved, so the robber move is next.
        assert_eq!(game.phase(), GamePhase::RobberMove);
    }

    #[test]
    fn drop_request_exceeding_holdings_is_clamped() {
        let (mut game, _rec) = bare_game(12);
        game.players[2].as_mut().unwrap().hand = ResourceHand::new(0, 8, 0, 0, 0);
        game.phase = GamePhase::RobberDrop;
        game.expectations.push_back(Expectation {
            phase: GamePhase::RobberDrop,
            player: 3,
            kind: ExpectationKind::RobberDrop { count: 4 },
        });

        // Claims to discard sheep it does not hold; lumber covers it.
        game.drop_cards(3, ResourceHand::new(9, 0, 0, 0, 0));
        assert_eq!(hand_of(&game, 3).total(), 4);
    }

    #[test]
    fn intents_from_the_wrong_player_or_phase_are_ignored() {
        let (mut game, rec) = bare_game(13);
        game.expectations.push_back(Expectation {
            phase: GamePhase::PlayerActions,
            player: 1,
            kind: ExpectationKind::TurnEnd,
        });

        game.roll(1);
        assert_eq!(game.phase(), GamePhase::PlayerActions);

        game.end_turn(2);
        assert_eq!(game.turn(), 1, "inactive player cannot end the turn");

        game.end_turn(1);
        assert_eq!(game.turn(), 2);
        assert_eq!(game.phase(), GamePhase::PlayerRoll);
        assert_eq!(game.active_player(), 2);

        // The expectation was consumed; repeating the intent is inert.
        let rolls_before = rec
            .broadcasts()
            .iter()
            .filter(|e| matches!(e, Event::DiceRolled { .. }))
            .count();
        game.end_turn(1);
        assert_eq!(game.turn(), 2);
        assert_eq!(
            rec.broadcasts()
                .iter()
                .filter(|e| matches!(e, Event::DiceRolled { .. }))
                .count(),
            rolls_before
        );
    }

    #[test]
    fn duplicate_roll_resolves_once() {
        let (mut game, rec) = bare_game(14);
        game.phase = GamePhase::PlayerRoll;
        game.expectations.push_back(Expectation {
            phase: GamePhase::PlayerRoll,
            player: 1,
            kind: ExpectationKind::Roll,
        });

        game.roll(1);
        game.roll(1);
        let rolls = rec
            .broadcasts()
            .iter()
            .filter(|e| matches!(e, Event::DiceRolled { .. }))
            .count();
        assert_eq!(rolls, 1);
    }

    #[test]
    fn trade_closes_and_reopens_with_the_offerers_hand() {
        let (mut game, rec) = bare_game(15);
        game.players[0].as_mut().unwrap().hand = ResourceHand::new(2, 0, 0, 0, 0);
        game.players[1].as_mut().unwrap().hand = ResourceHand::new(0, 0, 0, 1, 0);

        let give = ResourceHand::new(2, 0, 0, 0, 0);
        let take = ResourceHand::new(0, 0, 0, 1, 0);
        game.request_trade(1, give, take);
        assert_eq!(game.open_trades().count(), 1);

        game.players[0].as_mut().unwrap().hand = ResourceHand::default();
        game.refresh_trades_for(1);
        let closed = rec.broadcasts().iter().any(|e| {
            matches!(e, Event::TradeUpdated { trade } if trade.status == TradeStatus::Closed)
        });
        assert!(closed, "offer must close when the offerer cannot cover it");

        game.players[0].as_mut().unwrap().hand = give;
        game.refresh_trades_for(1);
        let reopened = rec
            .broadcasts()
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::TradeUpdated { trade } => Some(trade.status),
                _ => None,
            });
        assert_eq!(reopened, Some(TradeStatus::Open));

        game.accept_trade(2, 0);
        assert_eq!(hand_of(&game, 1), take);
        assert_eq!(hand_of(&game, 2), give);
    }

    #[test]
    fn trade_fails_after_everyone_else_rejects() {
        let (mut game, rec) = bare_game(16);
        game.players[0].as_mut().unwrap().hand = ResourceHand::new(1, 0, 0, 0, 0);
        game.request_trade(
            1,
            ResourceHand::new(1, 0, 0, 0, 0),
            ResourceHand::new(0, 0, 0, 0, 1),
        );

        game.reject_trade(2, 0);
        game.reject_trade(2, 0);
        assert_eq!(game.open_trades().count(), 1, "one player rejects once");
        game.reject_trade(3, 0);
        assert_eq!(game.open_trades().count(), 0);
        let failed = rec.broadcasts().iter().any(|e| {
            matches!(e, Event::TradeUpdated { trade } if trade.status == TradeStatus::Failed)
        });
        assert!(failed);
    }

    #[test]
    fn board_trade_requires_exact_ratio_multiples() {
        let (mut game, _rec) = bare_game(17);
        game.players[0].as_mut().unwrap().hand = ResourceHand::new(8, 0, 0, 0, 0);

        // No port access, so the default 4:1 rate applies.
        game.board_trade(1, Resource::Sheep, 8, Resource::Ore);
        assert_eq!(hand_of(&game, 1), ResourceHand::new(0, 0, 0, 2, 0));

        game.players[0].as_mut().unwrap().hand = ResourceHand::new(3, 0, 0, 0, 0);
        game.board_trade(1, Resource::Sheep, 3, Resource::Ore);
        assert_eq!(
            hand_of(&game, 1),
            ResourceHand::new(3, 0, 0, 0, 0),
            "3 is not a multiple of the 4:1 rate"
        );
    }

    /// Backtracking search for a simple road chain on land, avoiding
    /// the given corners.
    fn find_chain(
        board: &Board,
        cur: CornerId,
        len: usize,
        visited: &mut Vec<CornerId>,
        edges: &mut Vec<EdgeId>,
        banned: &[CornerId],
    ) -> bool {
        if edges.len() == len {
            return true;
        }
        let candidates = board.corners[cur].edges.clone();
        for e in candidates {
            if !board.edge_touches_land_id(e) || board.edges[e].road.is_some() {
                continue;
            }
            let [a, b] = board.edges[e].corners;
            let next = if a == cur { b } else { a };
            if visited.contains(&next) || banned.contains(&next) {
                continue;
            }
            visited.push(next);
            edges.push(e);
            if find_chain(board, next, len, visited, edges, banned) {
                return true;
            }
            visited.pop();
            edges.pop();
        }
        false
    }

    fn lay_chain(game: &mut Game, pid: PlayerId, len: usize, banned: &[CornerId]) -> Vec<CornerId> {
        for start in 0..game.board.corners.len() {
            if banned.contains(&start) {
                continue;
            }
            let mut visited = vec![start];
            let mut edges = Vec::new();
            if find_chain(&game.board, start, len, &mut visited, &mut edges, banned) {
                for &e in &edges {
                    game.board.edges[e].road = Some(pid);
                }
                game.players[pid as usize - 1].as_mut().unwrap().roads = edges;
                return visited;
            }
        }
        panic!("no {len}-edge chain available");
    }

    #[test]
    fn longest_road_transfers_with_exactly_one_event_each() {
        let (mut game, rec) = bare_game(18);
        let achievement_events = |rec: &Recorder| {
            rec.broadcasts()
                .into_iter()
                .filter(|e| matches!(e, Event::AchievementChanged { .. }))
                .collect::<Vec<_>>()
        };

        let mut banned = lay_chain(&mut game, 1, 5, &[]);
        game.recompute_longest_road(1);
        let events = achievement_events(&rec);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            Event::AchievementChanged {
                kind: AchievementKind::LongestRoad,
                holder: Some(1),
            }
        );
        assert!(game.player(1).unwrap().has_longest_road);

        let more = lay_chain(&mut game, 2, 6, &banned);
        banned.extend(more);
        game.recompute_longest_road(2);
        let events = achievement_events(&rec);
        assert_eq!(events.len(), 2, "a transfer is a single event");
        assert_eq!(
            events[1],
            Event::AchievementChanged {
                kind: AchievementKind::LongestRoad,
                holder: Some(2),
            }
        );
        assert!(!game.player(1).unwrap().has_longest_road);
        assert!(game.player(2).unwrap().has_longest_road);

        // A tie never moves the title.
        lay_chain(&mut game, 3, 6, &banned);
        game.recompute_longest_road(3);
        assert_eq!(achievement_events(&rec).len(), 2);
        assert_eq!(game.longest_road_holder(), Some(2));
    }

    #[test]
    fn robber_move_steals_one_card_privately() {
        let (mut game, rec) = bare_game(19);
        let target = game
            .board
            .robbable_tiles()
            .into_iter()
            .next()
            .unwrap();
        let corner = game.board.tiles[target].corner_ids()[0];
        game.board.corners[corner].building = Some(Building {
            owner: 2,
            kind: BuildingKind::Settlement,
        });
        game.players[1].as_mut().unwrap().hand = ResourceHand::new(0, 0, 0, 1, 0);

        game.phase = GamePhase::RobberMove;
        game.expectations.push_back(Expectation {
            phase: GamePhase::RobberMove,
            player: 1,
            kind: ExpectationKind::RobberMove { knight: false },
        });
        game.move_robber(1, Some(target), Some(2));

        assert_eq!(game.board.robber, target);
        assert_eq!(hand_of(&game, 1).ore, 1);
        assert!(hand_of(&game, 2).is_empty());
        assert!(rec.broadcasts().contains(&Event::RobberMoved {
            player: 1,
            tile: target,
            victim: Some(2),
            knight: false,
        }));
        let stolen = Event::ResourceStolen {
            thief: 1,
            victim: 2,
            resource: Resource::Ore,
        };
        assert!(rec.private_to(1).contains(&stolen));
        assert!(rec.private_to(2).contains(&stolen));
        assert_eq!(game.phase(), GamePhase::PlayerActions);
    }

    #[test]
    fn knight_requires_a_promoted_card_and_counts_toward_largest_army() {
        let (mut game, rec) = bare_game(20);
        for _ in 0..3 {
            game.players[0]
                .as_mut()
                .unwrap()
                .dev_cards
                .add_bought(DevCardKind::Knight);
        }
        game.play_knight(1);
        assert_eq!(
            game.player(1).unwrap().knights_played,
            0,
            "cards bought this turn are not yet playable"
        );

        game.players[0].as_mut().unwrap().dev_cards.promote();
        for _ in 0..3 {
            game.play_knight(1);
            // Resolve the robber move the knight armed.
            game.move_robber(1, None, None);
        }
        assert_eq!(game.player(1).unwrap().knights_played, 3);
        assert_eq!(game.largest_army_holder(), Some(1));
        let army_events = rec
            .broadcasts()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::AchievementChanged {
                        kind: AchievementKind::LargestArmy,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(army_events, 1);
    }

    #[test]
    fn knight_robber_move_survives_the_roll() {
        let (mut game, _rec) = bare_game(22);
        let cards = &mut game.players[0].as_mut().unwrap().dev_cards;
        cards.add_bought(DevCardKind::Knight);
        cards.promote();
        game.phase = GamePhase::PlayerRoll;
        game.avoid_seven = vec![1];
        game.expectations.push_back(Expectation {
            phase: GamePhase::PlayerRoll,
            player: 1,
            kind: ExpectationKind::Roll,
        });

        // Knight before the roll arms a robber move; rolling must not
        // strand it in the previous phase.
        game.play_knight(1);
        game.roll(1);
        assert_eq!(game.phase(), GamePhase::PlayerActions);

        let target = game.board.robbable_tiles()[0];
        game.move_robber(1, Some(target), None);
        assert_eq!(game.board.robber, target);
        assert_eq!(game.phase(), GamePhase::PlayerActions);
    }

    #[test]
    fn god_mode_is_one_way_and_lands_in_the_snapshot() {
        let (mut game, rec) = bare_game(23);
        assert!(!game.snapshot().godmode);

        game.activate_god_mode(2);
        assert!(game.snapshot().godmode);
        assert_eq!(game.player(2).unwrap().name, "H4x0r");

        game.activate_god_mode(3);
        let flips = rec
            .broadcasts()
            .iter()
            .filter(|e| matches!(e, Event::GodModeActivated { .. }))
            .count();
        assert_eq!(flips, 1, "the flag only flips once");
    }

    #[test]
    fn settlement_severing_the_road_vacates_the_title() {
        let (mut game, rec) = bare_game(24);
        let corners = lay_chain(&mut game, 1, 5, &[]);
        game.recompute_longest_road(1);
        assert_eq!(game.longest_road_holder(), Some(1));

        // An opposing settlement on an interior corner splits the
        // counted path into a 2-run and a 3-run, both under the
        // minimum.
        let cut = corners[2];
        game.board.corners[cut].building = Some(Building {
            owner: 2,
            kind: BuildingKind::Settlement,
        });
        game.check_severed_road(cut, 2);

        assert_eq!(game.longest_road_holder(), None);
        assert!(!game.player(1).unwrap().has_longest_road);
        let last = rec
            .broadcasts()
            .into_iter()
            .rev()
            .find_map(|e| match e {
                Event::AchievementChanged { kind: AchievementKind::LongestRoad, holder } => {
                    Some(holder)
                }
                _ => None,
            });
        assert_eq!(last, Some(None));
    }

    #[test]
    fn severed_title_passes_to_the_next_longest_road() {
        let (mut game, _rec) = bare_game(25);
        let mut banned = lay_chain(&mut game, 1, 5, &[]);
        game.recompute_longest_road(1);
        banned.extend(lay_chain(&mut game, 2, 5, &banned));
        game.recompute_longest_road(2);
        assert_eq!(game.longest_road_holder(), Some(1), "ties do not transfer");

        let cut = banned[2];
        game.board.corners[cut].building = Some(Building {
            owner: 3,
            kind: BuildingKind::Settlement,
        });
        game.check_severed_road(cut, 3);
        assert_eq!(game.longest_road_holder(), Some(2));
        assert!(game.player(2).unwrap().has_longest_road);
    }

    #[test]
    fn reaching_the_target_score_ends_the_session() {
        let (mut game, rec) = bare_game(26);
        game.config.win_points = 4;
        {
            let player = game.players[0].as_mut().unwrap();
            player.record_build(PieceKind::Settlement, 0);
            player.record_build(PieceKind::Settlement, 5);
        }
        // Two settlements plus the longest-road title reach the target.
        lay_chain(&mut game, 1, 5, &[]);
        game.recompute_longest_road(1);

        assert_eq!(game.phase(), GamePhase::End);
        let ended = rec.broadcasts().into_iter().find_map(|e| match e {
            Event::GameEnded { winner, standings } => Some((winner, standings)),
            _ => None,
        });
        let (winner, standings) = ended.expect("the session ended");
        assert_eq!(winner, Some(1));
        assert_eq!(standings[0], (1, 4));
    }

    #[test]
    fn monopoly_collects_every_copy_of_the_resource() {
        let (mut game, rec) = bare_game(21);
        game.players[0].as_mut().unwrap().hand = ResourceHand::new(0, 1, 0, 0, 0);
        game.players[1].as_mut().unwrap().hand = ResourceHand::new(0, 3, 1, 0, 0);
        game.players[2].as_mut().unwrap().hand = ResourceHand::new(0, 2, 0, 0, 0);
        let cards = &mut game.players[0].as_mut().unwrap().dev_cards;
        cards.add_bought(DevCardKind::Monopoly);
        cards.promote();

        game.play_monopoly(1, Resource::Lumber);
        assert_eq!(hand_of(&game, 1).lumber, 6);
        assert_eq!(hand_of(&game, 2), ResourceHand::new(0, 0, 1, 0, 0));
        assert_eq!(hand_of(&game, 3).total(), 0);
        assert!(rec.broadcasts().contains(&Event::MonopolyResolved {
            player: 1,
            resource: Resource::Lumber,
            total: 5,
        }));
    }
}
