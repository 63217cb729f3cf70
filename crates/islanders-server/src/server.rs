//! WebSocket server and connection handling.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{pump, Session, SessionMap};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use islanders_core::PlayerId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Server state shared across all connections.
pub struct ServerState {
    /// All live sessions
    pub sessions: SessionMap,
    /// Connection -> (session, seat) for connections inside a session
    pub connections: DashMap<Uuid, (Uuid, PlayerId)>,
    /// Connection -> outbound message channel
    pub senders: DashMap<Uuid, mpsc::UnboundedSender<ServerMessage>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            connections: DashMap::new(),
            senders: DashMap::new(),
        }
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, connection: Uuid, msg: ServerMessage) {
        if let Some(sender) = self.senders.get(&connection) {
            let _ = sender.send(msg);
        }
    }

    /// Joinable sessions, for the lobby list.
    pub fn waiting_sessions(&self) -> Vec<crate::protocol::SessionInfo> {
        self.sessions
            .iter()
            .filter(|s| s.joinable())
            .map(|s| s.info())
            .collect()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the WebSocket server.
pub async fn run_server(addr: SocketAddr, state: Arc<ServerState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Islanders server listening on {}", addr);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }

    Ok(())
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    info!("New WebSocket connection from {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = Uuid::new_v4();

    // Channel for outgoing messages
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.senders.insert(connection_id, tx);

    let welcome = ServerMessage::Welcome { connection_id };
    let msg_text = serde_json::to_string(&welcome)?;
    ws_sender.send(Message::Text(msg_text)).await?;

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) {
                    handle_message(connection_id, client_msg, &state);
                } else {
                    warn!("Invalid message from {}: {}", connection_id, text);
                }
            }
            Ok(Message::Close(_)) => {
                info!("Client {} closing connection", connection_id);
                break;
            }
            Ok(Message::Ping(_)) => {
                state.send_to(connection_id, ServerMessage::Pong);
            }
            Err(e) => {
                error!("WebSocket error from {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    handle_disconnect(connection_id, &state);
    state.senders.remove(&connection_id);
    send_task.abort();

    info!("Connection closed for {}", connection_id);
    Ok(())
}

/// Look up the caller's session and seat, run the interaction, then
/// service timers and teardown.
fn with_session<F>(state: &Arc<ServerState>, connection: Uuid, f: F)
where
    F: FnOnce(&Arc<Session>, PlayerId),
{
    let located = state.connections.get(&connection).map(|e| *e.value());
    let Some((session_id, pid)) = located else {
        state.send_to(
            connection,
            ServerMessage::Error {
                message: "Not in a session".to_string(),
            },
        );
        return;
    };
    let session = state.sessions.get(&session_id).map(|s| Arc::clone(&s));
    let Some(session) = session else { return };
    f(&session, pid);
    pump(&session, &state.sessions);
}

/// Handle a client message.
fn handle_message(connection: Uuid, msg: ClientMessage, state: &Arc<ServerState>) {
    match msg {
        ClientMessage::CreateSession {
            player_name,
            config,
        } => {
            let Some(sender) = state.senders.get(&connection).map(|s| s.clone()) else {
                return;
            };
            let session_id = Uuid::new_v4();
            match Session::new(session_id, config.unwrap_or_default()) {
                Ok(session) => {
                    // Creator takes the first seat and hosts.
                    let Ok(pid) = session.join(player_name, sender) else {
                        return;
                    };
                    state.sessions.insert(session_id, Arc::clone(&session));
                    state.connections.insert(connection, (session_id, pid));

                    state.send_to(connection, ServerMessage::SessionCreated { session_id });
                    state.send_to(
                        connection,
                        ServerMessage::Joined {
                            session: session.info(),
                            player: pid,
                        },
                    );
                }
                Err(e) => {
                    state.send_to(
                        connection,
                        ServerMessage::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        ClientMessage::JoinSession {
            session_id,
            player_name,
        } => {
            let Some(sender) = state.senders.get(&connection).map(|s| s.clone()) else {
                return;
            };
            let session = state.sessions.get(&session_id).map(|s| Arc::clone(&s));
            let Some(session) = session else {
                state.send_to(
                    connection,
                    ServerMessage::Error {
                        message: "Session not found".to_string(),
                    },
                );
                return;
            };
            match session.join(player_name, sender) {
                Ok(pid) => {
                    state.connections.insert(connection, (session_id, pid));
                    state.send_to(
                        connection,
                        ServerMessage::Joined {
                            session: session.info(),
                            player: pid,
                        },
                    );
                }
                Err(e) => {
                    state.send_to(
                        connection,
                        ServerMessage::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        ClientMessage::LeaveSession => {
            if let Some((_, (session_id, pid))) = state.connections.remove(&connection) {
                let session = state.sessions.get(&session_id).map(|s| Arc::clone(&s));
                if let Some(session) = session {
                    session.detach(pid);
                    pump(&session, &state.sessions);
                    if session.is_empty() {
                        state.sessions.remove(&session_id);
                    }
                }
                state.send_to(connection, ServerMessage::Left);
            }
        }

        ClientMessage::PickColor { color } => {
            with_session(state, connection, |session, pid| {
                session.game().pick_color(pid, color);
            });
        }

        ClientMessage::StartGame => {
            with_session(state, connection, |session, pid| {
                session.game().start(pid);
                if session.game().started() {
                    let snapshot = session.game().snapshot();
                    for entry in state.senders.iter() {
                        if state
                            .connections
                            .get(entry.key())
                            .map_or(false, |c| c.0 == session.id)
                        {
                            let _ = entry.value().send(ServerMessage::Snapshot {
                                snapshot: snapshot.clone(),
                            });
                        }
                    }
                }
            });
        }

        ClientMessage::Sync => {
            with_session(state, connection, |session, pid| {
                let snapshot = session.game().snapshot();
                state.send_to(connection, ServerMessage::Snapshot { snapshot });
                session.game().resend_prompt(pid);
            });
        }

        ClientMessage::PlaceInitial { corner, edge } => {
            with_session(state, connection, |session, pid| {
                session.game().place_initial(pid, corner, edge);
            });
        }

        ClientMessage::Roll => {
            with_session(state, connection, |session, pid| {
                session.game().roll(pid);
            });
        }

        ClientMessage::DropCards { resources } => {
            with_session(state, connection, |session, pid| {
                session.game().drop_cards(pid, resources);
            });
        }

        ClientMessage::MoveRobber { tile, victim } => {
            with_session(state, connection, |session, pid| {
                session.game().move_robber(pid, tile, victim);
            });
        }

        ClientMessage::Build { piece, location } => {
            with_session(state, connection, |session, pid| {
                session.game().build(pid, piece, location);
            });
        }

        ClientMessage::BuyDevCard => {
            with_session(state, connection, |session, pid| {
                session.game().buy_dev_card(pid);
            });
        }

        ClientMessage::PlayKnight => {
            with_session(state, connection, |session, pid| {
                session.game().play_knight(pid);
            });
        }

        ClientMessage::PlayRoadBuilding { first, second } => {
            with_session(state, connection, |session, pid| {
                session.game().play_road_building(pid, first, second);
            });
        }

        ClientMessage::PlayYearOfPlenty { first, second } => {
            with_session(state, connection, |session, pid| {
                session.game().play_year_of_plenty(pid, first, second);
            });
        }

        ClientMessage::PlayMonopoly { resource } => {
            with_session(state, connection, |session, pid| {
                session.game().play_monopoly(pid, resource);
            });
        }

        ClientMessage::RequestTrade { give, take } => {
            with_session(state, connection, |session, pid| {
                session.game().request_trade(pid, give, take);
            });
        }

        ClientMessage::AcceptTrade { trade_id } => {
            with_session(state, connection, |session, pid| {
                session.game().accept_trade(pid, trade_id);
            });
        }

        ClientMessage::RejectTrade { trade_id } => {
            with_session(state, connection, |session, pid| {
                session.game().reject_trade(pid, trade_id);
            });
        }

        ClientMessage::DeleteTrade { trade_id } => {
            with_session(state, connection, |session, pid| {
                session.game().delete_trade(pid, trade_id);
            });
        }

        ClientMessage::BoardTrade {
            give,
            give_count,
            take,
        } => {
            with_session(state, connection, |session, pid| {
                session.game().board_trade(pid, give, give_count, take);
            });
        }

        ClientMessage::EndTurn => {
            with_session(state, connection, |session, pid| {
                session.game().end_turn(pid);
            });
        }

        ClientMessage::ActivateGodMode => {
            with_session(state, connection, |session, pid| {
                session.game().activate_god_mode(pid);
            });
        }

        ClientMessage::Chat { message } => {
            with_session(state, connection, |session, pid| {
                let player_name = session
                    .game()
                    .player(pid)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                let chat = ServerMessage::ChatMessage {
                    player: pid,
                    player_name,
                    message: message.clone(),
                };
                for entry in state.senders.iter() {
                    if state
                        .connections
                        .get(entry.key())
                        .map_or(false, |c| c.0 == session.id)
                    {
                        let _ = entry.value().send(chat.clone());
                    }
                }
            });
        }

        ClientMessage::ListSessions => {
            let sessions = state.waiting_sessions();
            state.send_to(connection, ServerMessage::SessionList { sessions });
        }

        ClientMessage::Ping => {
            state.send_to(connection, ServerMessage::Pong);
        }
    }
}

/// Handle peer disconnect: free the seat pre-start, otherwise mark
/// the player offline so they can reconnect.
fn handle_disconnect(connection: Uuid, state: &Arc<ServerState>) {
    if let Some((_, (session_id, pid))) = state.connections.remove(&connection) {
        let session = state.sessions.get(&session_id).map(|s| Arc::clone(&s));
        if let Some(session) = session {
            session.detach(pid);
            pump(&session, &state.sessions);
            if session.is_empty() {
                state.sessions.remove(&session_id);
            }
        }
    }
}
