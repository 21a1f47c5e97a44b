//! Inbound frame dispatch.
//!
//! The router is the only component that knows about connections: it
//! decodes inbound text frames, resolves the connection -> player binding,
//! invokes lobby/session/tournament operations, and fans outbound frames
//! back out through the registry.
//!
//! Error taxonomy: malformed JSON is logged and dropped; a structurally
//! valid frame with an unknown or ill-typed `type` gets an `error` reply;
//! domain and authorization failures get an `error` reply and mutate
//! nothing; gateway failures are logged and swallowed, leaving in-memory
//! state authoritative.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use shared::frames::{ClientFrame, ServerFrame};
use shared::{Direction, DEFAULT_MAX_PLAYERS};

use crate::game::MatchSession;
use crate::gateway::{IdentityGateway, PersistenceGateway};
use crate::lobby::{AddPlayer, Lobby, LobbyManager};
use crate::registry::{ConnId, ConnectionRegistry, SharedRegistry};
use crate::session::{spawn_session_ticker, start_tournament, Audience};

pub struct Router {
    pub registry: SharedRegistry,
    pub lobbies: Arc<LobbyManager>,
    identity: Arc<dyn IdentityGateway>,
    persistence: Arc<dyn PersistenceGateway>,
    score_limit: u32,
}

impl Router {
    pub fn new(
        identity: Arc<dyn IdentityGateway>,
        persistence: Arc<dyn PersistenceGateway>,
        score_limit: u32,
    ) -> Self {
        Router {
            registry: ConnectionRegistry::shared(),
            lobbies: Arc::new(LobbyManager::new()),
            identity,
            persistence,
            score_limit,
        }
    }

    /// Registers a freshly accepted connection and greets it; the user id
    /// stays null until the connection binds via create/join.
    pub async fn register_connection(
        &self,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Message>,
    ) -> ConnId {
        let conn = self.registry.write().await.add(addr, sender);
        self.reply(conn, &ServerFrame::Connection { user_id: None })
            .await;
        conn
    }

    /// Entry point for one inbound text frame.
    pub async fn handle_text(&self, conn: ConnId, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("dropping malformed frame from connection {}: {}", conn, e);
                return;
            }
        };
        let frame: ClientFrame = match serde_json::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unrecognized frame from connection {}: {}", conn, e);
                self.reply_error(conn, "unrecognized frame type").await;
                return;
            }
        };

        match frame {
            ClientFrame::CreateLobby {
                user_id,
                max_players,
            } => self.create_lobby(conn, user_id, max_players).await,
            ClientFrame::JoinLobby { user_id, lobby_id } => {
                self.join_lobby(conn, user_id, lobby_id).await
            }
            ClientFrame::LeaveLobby { lobby_id } => self.leave_lobby(conn, lobby_id).await,
            ClientFrame::GetLobbyList => self.lobby_list(conn).await,
            ClientFrame::GetLobbyById { lobby_id } => self.lobby_by_id(conn, lobby_id).await,
            ClientFrame::Ready { ready } => self.set_ready(conn, ready).await,
            ClientFrame::StartGame => self.start_game(conn).await,
            ClientFrame::PauseGame => self.pause_game(conn).await,
            ClientFrame::ResumeGame => self.resume_game(conn).await,
            ClientFrame::MovePaddle { direction } => self.move_paddle(conn, direction).await,
        }
    }

    /// Transport close: unbind, drop the slot, purge the entry, and tear
    /// down the lobby if it emptied.
    pub async fn handle_disconnect(&self, conn: ConnId) {
        let removed = self.registry.write().await.remove(conn);
        let Some(removed) = removed else { return };
        let (Some(user_id), Some(lobby_id)) = (removed.user_id, removed.lobby_id) else {
            return;
        };

        let Some(lobby) = self.lobbies.get(lobby_id).await else {
            return;
        };
        let mut lobby = lobby.lock().await;
        self.drop_player(&mut lobby, user_id).await;
        if lobby.is_empty() {
            self.teardown_lobby(&mut lobby).await;
        }
    }

    async fn reply(&self, conn: ConnId, frame: &ServerFrame) {
        self.registry.read().await.send_to(conn, frame);
    }

    async fn reply_error(&self, conn: ConnId, message: impl Into<String>) {
        self.reply(
            conn,
            &ServerFrame::Error {
                message: message.into(),
            },
        )
        .await;
    }

    async fn broadcast_lobby(&self, lobby_id: u64, frame: &ServerFrame) {
        self.registry.read().await.broadcast_to_lobby(lobby_id, frame);
    }

    /// Lobby-list refreshes are the one globally fanned-out frame.
    async fn refresh_lobby_list(&self) {
        let lobbies = self.lobbies.summaries().await;
        self.registry
            .read()
            .await
            .broadcast_global(&ServerFrame::LobbyList { lobbies });
    }

    /// Resolves the caller through the identity gateway; answers the
    /// connection on any failure and returns None.
    async fn resolve_user(&self, conn: ConnId, user_id: u64) -> Option<u64> {
        match self.identity.find_user_by_id(user_id).await {
            Ok(Some(profile)) => Some(profile.id),
            Ok(None) => {
                self.reply_error(conn, "unknown user").await;
                None
            }
            Err(e) => {
                warn!("identity lookup for user {} failed: {}", user_id, e);
                self.reply_error(conn, "identity gateway unavailable").await;
                None
            }
        }
    }

    /// The (user, lobby) binding of a connection, or an error reply.
    async fn require_binding(&self, conn: ConnId) -> Option<(u64, u64)> {
        let binding = {
            let registry = self.registry.read().await;
            registry
                .get(conn)
                .and_then(|c| c.user_id.zip(c.lobby_id))
        };
        if binding.is_none() {
            self.reply_error(conn, "not in a lobby").await;
        }
        binding
    }

    async fn create_lobby(&self, conn: ConnId, user_id: u64, max_players: Option<usize>) {
        let Some(user_id) = self.resolve_user(conn, user_id).await else {
            return;
        };
        let already_joined = {
            let registry = self.registry.read().await;
            registry.get(conn).and_then(|c| c.lobby_id).is_some()
        };
        if already_joined {
            self.reply_error(conn, "already in a lobby").await;
            return;
        }

        let capacity = max_players.unwrap_or(DEFAULT_MAX_PLAYERS);
        let (lobby_id, lobby) = self.lobbies.create_lobby(capacity).await;
        let player_number = {
            let mut lobby = lobby.lock().await;
            let number = match lobby.add_player(user_id) {
                AddPlayer::Joined(number) | AddPlayer::Rejoined(number) => number,
                AddPlayer::Full => {
                    self.reply_error(conn, "lobby is full").await;
                    return;
                }
            };
            match self
                .persistence
                .create_match(lobby_id, user_id, lobby.max_players, &format!("lobby-{}", lobby_id))
                .await
            {
                Ok(record) => lobby.match_record_id = Some(record.id),
                Err(e) => warn!("failed to persist match for lobby {}: {}", lobby_id, e),
            }
            number
        };

        self.registry.write().await.bind(conn, user_id, lobby_id);
        self.reply(
            conn,
            &ServerFrame::Connection {
                user_id: Some(user_id),
            },
        )
        .await;
        self.reply(
            conn,
            &ServerFrame::LobbyCreated {
                lobby_id,
                player_number,
            },
        )
        .await;
        self.refresh_lobby_list().await;
    }

    async fn join_lobby(&self, conn: ConnId, user_id: u64, lobby_id: u64) {
        let Some(user_id) = self.resolve_user(conn, user_id).await else {
            return;
        };
        let bound_elsewhere = {
            let registry = self.registry.read().await;
            registry
                .get(conn)
                .and_then(|c| c.lobby_id)
                .is_some_and(|bound| bound != lobby_id)
        };
        if bound_elsewhere {
            self.reply_error(conn, "already in a lobby").await;
            return;
        }

        let Some(lobby) = self.lobbies.get(lobby_id).await else {
            self.reply_error(conn, "no such lobby").await;
            return;
        };
        let mut lobby = lobby.lock().await;

        match lobby.add_player(user_id) {
            AddPlayer::Full => {
                self.reply_error(conn, "lobby is full").await;
            }
            AddPlayer::Joined(player_number) => {
                if let Some(match_id) = lobby.match_record_id {
                    if let Err(e) = self.persistence.add_player_to_match(match_id, user_id).await {
                        warn!("failed to persist join for lobby {}: {}", lobby_id, e);
                    }
                }
                self.registry.write().await.bind(conn, user_id, lobby_id);
                self.reply(
                    conn,
                    &ServerFrame::Connection {
                        user_id: Some(user_id),
                    },
                )
                .await;
                self.reply(
                    conn,
                    &ServerFrame::JoinedLobby {
                        lobby_id,
                        player_number,
                    },
                )
                .await;
                self.broadcast_lobby(
                    lobby_id,
                    &ServerFrame::PlayerJoined {
                        player_id: user_id,
                        player_count: lobby.player_count(),
                    },
                )
                .await;
            }
            AddPlayer::Rejoined(player_number) => {
                self.registry.write().await.bind(conn, user_id, lobby_id);
                self.reply(
                    conn,
                    &ServerFrame::Connection {
                        user_id: Some(user_id),
                    },
                )
                .await;
                self.reply(
                    conn,
                    &ServerFrame::JoinedLobby {
                        lobby_id,
                        player_number,
                    },
                )
                .await;
                // Reconnecting into a paused match resumes it in place,
                // scores intact.
                if let Some(session) = lobby.session() {
                    let mut session = session.lock().await;
                    self.reply(
                        conn,
                        &ServerFrame::InitGame {
                            state: session.snapshot(),
                        },
                    )
                    .await;
                    if session.is_running() && session.is_paused() {
                        session.resume();
                        let state = session.snapshot();
                        drop(session);
                        self.broadcast_lobby(lobby_id, &ServerFrame::ResumeGame { state })
                            .await;
                    }
                }
            }
        }
    }

    async fn leave_lobby(&self, conn: ConnId, lobby_id: u64) {
        let Some((user_id, bound_lobby)) = self.require_binding(conn).await else {
            return;
        };
        if bound_lobby != lobby_id {
            self.reply_error(conn, "not in that lobby").await;
            return;
        }
        let Some(lobby) = self.lobbies.get(lobby_id).await else {
            self.reply_error(conn, "no such lobby").await;
            return;
        };

        let mut lobby = lobby.lock().await;
        self.registry.write().await.unbind_lobby(conn);
        self.drop_player(&mut lobby, user_id).await;
        self.reply(conn, &ServerFrame::LeftLobby).await;
        if lobby.is_empty() {
            self.teardown_lobby(&mut lobby).await;
        }
    }

    /// Shared removal path for leave and transport close: removes the
    /// slot, announces it, and surfaces the forced pause if one happened.
    async fn drop_player(&self, lobby: &mut Lobby, user_id: u64) {
        let was_unpaused = match lobby.session() {
            Some(session) => {
                let session = session.lock().await;
                session.is_running() && !session.is_paused()
            }
            None => false,
        };

        if lobby.remove_player(user_id).await.is_none() {
            return;
        }

        if let Some(match_id) = lobby.match_record_id {
            let persistence = Arc::clone(&self.persistence);
            tokio::spawn(async move {
                if let Err(e) = persistence.remove_player_from_match(match_id, user_id).await {
                    warn!("failed to persist player removal: {}", e);
                }
            });
        }

        self.broadcast_lobby(
            lobby.id,
            &ServerFrame::PlayerDisconnected {
                id: user_id,
                player_count: lobby.player_count(),
            },
        )
        .await;

        if was_unpaused {
            if let Some(session) = lobby.session() {
                let state = session.lock().await.snapshot();
                self.broadcast_lobby(lobby.id, &ServerFrame::PauseGame { state })
                    .await;
            }
        }
    }

    /// Cancels tickers, deletes the lobby, and queues the durable-row
    /// deletion: an empty lobby must not leak its match record.
    async fn teardown_lobby(&self, lobby: &mut Lobby) {
        lobby.shutdown();
        self.lobbies.remove(lobby.id).await;

        let lobby_id = lobby.id;
        let persistence = Arc::clone(&self.persistence);
        tokio::spawn(async move {
            if let Err(e) = persistence.delete_match_by_lobby_id(lobby_id).await {
                warn!("failed to delete match record for lobby {}: {}", lobby_id, e);
            }
        });

        self.refresh_lobby_list().await;
    }

    async fn lobby_list(&self, conn: ConnId) {
        let lobbies = self.lobbies.summaries().await;
        self.reply(conn, &ServerFrame::LobbyList { lobbies }).await;
    }

    async fn lobby_by_id(&self, conn: ConnId, lobby_id: u64) {
        match self.lobbies.get(lobby_id).await {
            Some(lobby) => {
                let summary = lobby.lock().await.summary();
                self.reply(conn, &ServerFrame::LobbyInfo { lobby: summary })
                    .await;
            }
            None => self.reply_error(conn, "no such lobby").await,
        }
    }

    async fn set_ready(&self, conn: ConnId, ready: bool) {
        let Some((user_id, lobby_id)) = self.require_binding(conn).await else {
            return;
        };
        let Some(lobby) = self.lobbies.get(lobby_id).await else {
            self.reply_error(conn, "no such lobby").await;
            return;
        };
        let summary = {
            let mut lobby = lobby.lock().await;
            if !lobby.set_ready(user_id, ready) {
                self.reply_error(conn, "not in that lobby").await;
                return;
            }
            lobby.summary()
        };
        self.broadcast_lobby(lobby_id, &ServerFrame::LobbyInfo { lobby: summary })
            .await;
    }

    async fn start_game(&self, conn: ConnId) {
        let Some((user_id, lobby_id)) = self.require_binding(conn).await else {
            return;
        };
        let Some(lobby) = self.lobbies.get(lobby_id).await else {
            self.reply_error(conn, "no such lobby").await;
            return;
        };
        let mut lobby = lobby.lock().await;

        if !lobby.is_creator(user_id) {
            self.reply_error(conn, "only the lobby creator can start the game")
                .await;
            return;
        }
        if lobby.game_started {
            self.reply_error(conn, "game already started").await;
            return;
        }
        if !lobby.start_game() {
            self.reply_error(conn, "need at least two players, all ready")
                .await;
            return;
        }

        if lobby.is_tournament_lobby() {
            let roster: Vec<u64> = lobby.players().iter().map(|p| p.user_id).collect();
            info!(
                "starting tournament in lobby {} with {} players",
                lobby_id,
                roster.len()
            );
            let handle = start_tournament(
                lobby_id,
                roster,
                self.score_limit,
                Arc::clone(&self.registry),
                Arc::clone(&self.persistence),
            );
            lobby.attach_tournament(handle);
            return;
        }

        let mut slots: Vec<_> = lobby.players().to_vec();
        slots.sort_by_key(|p| p.player_number);
        let mut session = MatchSession::new(slots[0].user_id, slots[1].user_id, self.score_limit);
        session.match_record_id = lobby.match_record_id;
        session.start();
        let state = session.snapshot();
        let session = Arc::new(Mutex::new(session));

        let ticker = spawn_session_ticker(
            Arc::clone(&session),
            Audience::Lobby(lobby_id),
            Arc::clone(&self.registry),
            Arc::clone(&self.persistence),
            None,
        );
        lobby.attach_match(session, ticker);

        self.broadcast_lobby(lobby_id, &ServerFrame::InitGame { state })
            .await;
    }

    async fn pause_game(&self, conn: ConnId) {
        self.toggle_pause(conn, true).await;
    }

    async fn resume_game(&self, conn: ConnId) {
        self.toggle_pause(conn, false).await;
    }

    async fn toggle_pause(&self, conn: ConnId, pause: bool) {
        let Some((user_id, lobby_id)) = self.require_binding(conn).await else {
            return;
        };
        let Some(lobby) = self.lobbies.get(lobby_id).await else {
            self.reply_error(conn, "no such lobby").await;
            return;
        };
        let lobby = lobby.lock().await;

        if !lobby.is_creator(user_id) {
            self.reply_error(conn, "only the lobby creator can pause or resume")
                .await;
            return;
        }
        if lobby.tournament().is_some() {
            self.reply_error(conn, "a tournament match cannot be paused")
                .await;
            return;
        }
        let Some(session) = lobby.session() else {
            self.reply_error(conn, "no game in progress").await;
            return;
        };

        let mut session = session.lock().await;
        if !session.is_running() || session.is_over() {
            self.reply_error(conn, "no game in progress").await;
            return;
        }
        // Repeating the current state is a no-op, not an error.
        if session.is_paused() == pause {
            return;
        }
        if pause {
            session.pause();
        } else {
            session.resume();
        }
        let state = session.snapshot();
        drop(session);

        let frame = if pause {
            ServerFrame::PauseGame { state }
        } else {
            ServerFrame::ResumeGame { state }
        };
        self.broadcast_lobby(lobby_id, &frame).await;
    }

    async fn move_paddle(&self, conn: ConnId, direction: Direction) {
        // Unlike the lifecycle commands, a stray move is dropped silently.
        let binding = {
            let registry = self.registry.read().await;
            registry.get(conn).and_then(|c| c.user_id.zip(c.lobby_id))
        };
        let Some((user_id, lobby_id)) = binding else {
            debug!("ignoring movePaddle from unbound connection {}", conn);
            return;
        };
        let Some(lobby) = self.lobbies.get(lobby_id).await else {
            return;
        };
        let lobby = lobby.lock().await;
        let Some(session) = lobby.session_for_player(user_id).await else {
            return;
        };
        drop(lobby);

        let mut session = session.lock().await;
        if let Some(player_number) = session.player_number_of(user_id) {
            session.move_paddle(player_number, direction);
        }
    }
}
