//! Live game sessions.
//!
//! A [`Session`] wraps one engine [`Game`] behind a mutex and routes
//! its events to connected peers. The engine never sleeps: it records
//! the timer it wants, and [`pump`] turns that request into a tokio
//! sleep that feeds the expiry back with its generation. A stale
//! generation is ignored by the engine, so a timer racing a player
//! intent is harmless.

use crate::protocol::{PlayerInfo, ServerMessage, SessionInfo};
use dashmap::DashMap;
use islanders_core::{ConfigError, Dispatch, Event, Game, GameConfig, GamePhase, PlayerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is full")]
    Full,

    #[error("game already started")]
    AlreadyStarted,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Seconds a finished session lingers so clients can fetch the final
/// standings before teardown.
const END_GRACE_SECONDS: u64 = 60;

pub type SessionMap = Arc<DashMap<Uuid, Arc<Session>>>;

type Peers = Arc<DashMap<PlayerId, UnboundedSender<ServerMessage>>>;

/// Routes engine events to connected peers.
struct PeerDispatch {
    peers: Peers,
}

impl Dispatch for PeerDispatch {
    fn broadcast(&mut self, event: Event) {
        for peer in self.peers.iter() {
            let _ = peer.value().send(ServerMessage::Game {
                event: event.clone(),
            });
        }
    }

    fn to_player(&mut self, player: PlayerId, event: Event) {
        if let Some(tx) = self.peers.get(&player) {
            let _ = tx.send(ServerMessage::Game { event });
        }
    }
}

pub struct Session {
    pub id: Uuid,
    game: Mutex<Game>,
    peers: Peers,
    teardown_scheduled: AtomicBool,
}

impl Session {
    pub fn new(id: Uuid, config: GameConfig) -> Result<Arc<Session>, SessionError> {
        let peers: Peers = Arc::new(DashMap::new());
        let dispatch = Box::new(PeerDispatch {
            peers: Arc::clone(&peers),
        });
        let game = Game::new(id.to_string(), config, dispatch)?;
        Ok(Arc::new(Session {
            id,
            game: Mutex::new(game),
            peers,
            teardown_scheduled: AtomicBool::new(false),
        }))
    }

    /// The engine, poison-tolerant. Engine calls never panic across
    /// the lock in normal operation.
    pub fn game(&self) -> MutexGuard<'_, Game> {
        self.game.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a seat and wire the peer's outbound channel.
    pub fn join(
        &self,
        name: String,
        tx: UnboundedSender<ServerMessage>,
    ) -> Result<PlayerId, SessionError> {
        let pid = {
            let mut game = self.game();
            if game.started() {
                return Err(SessionError::AlreadyStarted);
            }
            game.join(name).ok_or(SessionError::Full)?
        };
        self.peers.insert(pid, tx);
        Ok(pid)
    }

    /// Drop a peer. Before start the seat frees up; mid-game the seat
    /// stays and is only marked offline, leaving room to reconnect.
    pub fn detach(&self, pid: PlayerId) {
        self.peers.remove(&pid);
        let mut game = self.game();
        if game.started() {
            game.set_online(pid, false);
        } else {
            game.remove_player(pid);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn joinable(&self) -> bool {
        !self.game().started()
    }

    pub fn info(&self) -> SessionInfo {
        let game = self.game();
        let players = (1..=game.config().player_count)
            .filter_map(|pid| game.player(pid))
            .map(|p| PlayerInfo {
                player: p.id,
                name: p.name.clone(),
                color: p.color,
                connected: p.online,
            })
            .collect();
        SessionInfo {
            id: self.id,
            players,
            player_count: game.config().player_count,
            started: game.started(),
        }
    }
}

/// Service the engine's side effects after an interaction: arm any
/// requested timer and schedule teardown once the game has ended.
pub fn pump(session: &Arc<Session>, sessions: &SessionMap) {
    let (request, ended) = {
        let mut game = session.game();
        (game.take_timer_request(), game.phase() == GamePhase::End)
    };

    if let Some(req) = request {
        let session = Arc::clone(session);
        let sessions = Arc::clone(sessions);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(req.seconds))).await;
            session.game().handle_timer(req.generation);
            pump(&session, &sessions);
        });
    }

    if ended && !session.teardown_scheduled.swap(true, Ordering::SeqCst) {
        let sessions = Arc::clone(sessions);
        let id = session.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(END_GRACE_SECONDS)).await;
            sessions.remove(&id);
            info!(%id, "finished session torn down");
        });
    }
}
