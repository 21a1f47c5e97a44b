//! Lobby state machine and the manager owning all lobbies.
//!
//! Every lobby sits behind its own async mutex; a handler holds that lock
//! across its whole check-and-update sequence, so two concurrent joins
//! can never race between the capacity check and the slot insert even
//! when one of them awaits a gateway call in between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use tokio::sync::{Mutex, RwLock};

use shared::frames::{LobbyPlayerSummary, LobbySummary};
use shared::DEFAULT_MAX_PLAYERS;

use crate::game::MatchSession;
use crate::session::{SessionTicker, TournamentHandle};

/// One occupied slot.
#[derive(Debug, Clone)]
pub struct LobbyPlayer {
    pub user_id: u64,
    pub player_number: u8,
    pub ready: bool,
}

/// The game a started lobby is running.
pub enum ActiveGame {
    Match {
        session: Arc<Mutex<MatchSession>>,
        ticker: SessionTicker,
    },
    Tournament(TournamentHandle),
}

/// Result of an `add_player` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPlayer {
    /// A fresh slot was assigned.
    Joined(u8),
    /// The user already held a slot; this is the reconnect path.
    Rejoined(u8),
    /// At capacity; nothing changed.
    Full,
}

pub struct Lobby {
    pub id: u64,
    pub creator_id: Option<u64>,
    pub max_players: usize,
    pub game_started: bool,
    /// Durable row backing this lobby, when persistence accepted it.
    pub match_record_id: Option<i64>,
    players: Vec<LobbyPlayer>,
    active_game: Option<ActiveGame>,
}

impl Lobby {
    pub fn new(id: u64, max_players: usize) -> Self {
        Lobby {
            id,
            creator_id: None,
            max_players: max_players.max(2),
            game_started: false,
            match_record_id: None,
            players: Vec::new(),
            active_game: None,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn players(&self) -> &[LobbyPlayer] {
        &self.players
    }

    pub fn player(&self, user_id: u64) -> Option<&LobbyPlayer> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_creator(&self, user_id: u64) -> bool {
        self.creator_id == Some(user_id)
    }

    /// Lobbies above the 1v1 capacity run brackets instead of a single
    /// match.
    pub fn is_tournament_lobby(&self) -> bool {
        self.max_players > DEFAULT_MAX_PLAYERS
    }

    /// Assigns the next free player number, recording the creator on
    /// first join. Returns `Full` (no state change) at capacity;
    /// returns the existing slot when the user is already present.
    pub fn add_player(&mut self, user_id: u64) -> AddPlayer {
        if let Some(existing) = self.player(user_id) {
            return AddPlayer::Rejoined(existing.player_number);
        }
        if self.players.len() >= self.max_players {
            return AddPlayer::Full;
        }

        let player_number = self.next_free_number();
        if self.creator_id.is_none() {
            self.creator_id = Some(user_id);
        }
        self.players.push(LobbyPlayer {
            user_id,
            player_number,
            ready: false,
        });
        info!(
            "player {} joined lobby {} as number {}",
            user_id, self.id, player_number
        );
        AddPlayer::Joined(player_number)
    }

    fn next_free_number(&self) -> u8 {
        let mut number = 1u8;
        while self.players.iter().any(|p| p.player_number == number) {
            number += 1;
        }
        number
    }

    /// Removes the slot. A running session is forced to paused, since a
    /// one-player match cannot proceed. Returns the removed slot.
    pub async fn remove_player(&mut self, user_id: u64) -> Option<LobbyPlayer> {
        let index = self.players.iter().position(|p| p.user_id == user_id)?;
        let removed = self.players.remove(index);
        info!("player {} left lobby {}", user_id, self.id);

        if let Some(ActiveGame::Match { session, .. }) = &self.active_game {
            let mut session = session.lock().await;
            if session.is_running() && !session.is_paused() {
                session.pause();
            }
        }
        Some(removed)
    }

    /// Idempotent readiness flip. Returns false for an unknown player.
    pub fn set_ready(&mut self, user_id: u64, ready: bool) -> bool {
        match self.players.iter_mut().find(|p| p.user_id == user_id) {
            Some(player) => {
                player.ready = ready;
                true
            }
            None => false,
        }
    }

    pub fn all_ready(&self) -> bool {
        self.players.iter().all(|p| p.ready)
    }

    pub fn can_start(&self) -> bool {
        self.players.len() >= 2 && !self.game_started && self.all_ready()
    }

    /// Marks the game started when the gate holds. Who may call this is
    /// the router's concern; here it is only a state transition.
    pub fn start_game(&mut self) -> bool {
        if !self.can_start() {
            return false;
        }
        self.game_started = true;
        true
    }

    pub fn attach_match(&mut self, session: Arc<Mutex<MatchSession>>, ticker: SessionTicker) {
        self.active_game = Some(ActiveGame::Match { session, ticker });
    }

    pub fn attach_tournament(&mut self, handle: TournamentHandle) {
        self.active_game = Some(ActiveGame::Tournament(handle));
    }

    /// The 1v1 session, when one is attached.
    pub fn session(&self) -> Option<Arc<Mutex<MatchSession>>> {
        match &self.active_game {
            Some(ActiveGame::Match { session, .. }) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub fn tournament(&self) -> Option<&TournamentHandle> {
        match &self.active_game {
            Some(ActiveGame::Tournament(handle)) => Some(handle),
            _ => None,
        }
    }

    /// The session a member is currently playing in: the lobby match, or
    /// their live pairing inside the bracket.
    pub async fn session_for_player(&self, user_id: u64) -> Option<Arc<Mutex<MatchSession>>> {
        match &self.active_game {
            Some(ActiveGame::Match { session, .. }) => {
                self.player(user_id).map(|_| Arc::clone(session))
            }
            Some(ActiveGame::Tournament(handle)) => handle.session_for(user_id).await,
            None => None,
        }
    }

    /// Cancels every ticker this lobby owns. Called on teardown; dropping
    /// the lobby does the same through the handles' Drop impls.
    pub fn shutdown(&mut self) {
        match self.active_game.take() {
            Some(ActiveGame::Match { ticker, .. }) => ticker.cancel(),
            Some(ActiveGame::Tournament(handle)) => handle.shutdown(),
            None => {}
        }
    }

    pub fn summary(&self) -> LobbySummary {
        LobbySummary {
            id: self.id,
            creator_id: self.creator_id,
            max_players: self.max_players,
            player_count: self.players.len(),
            game_started: self.game_started,
            players: self
                .players
                .iter()
                .map(|p| LobbyPlayerSummary {
                    user_id: p.user_id,
                    player_number: p.player_number,
                    ready: p.ready,
                })
                .collect(),
        }
    }
}

/// Owns every lobby. The map itself is only locked long enough to look up
/// or insert an `Arc`; all lobby mutation happens under the lobby's own
/// mutex.
pub struct LobbyManager {
    lobbies: RwLock<HashMap<u64, Arc<Mutex<Lobby>>>>,
    next_id: AtomicU64,
}

impl LobbyManager {
    pub fn new() -> Self {
        LobbyManager {
            lobbies: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn create_lobby(&self, max_players: usize) -> (u64, Arc<Mutex<Lobby>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lobby = Arc::new(Mutex::new(Lobby::new(id, max_players)));
        self.lobbies.write().await.insert(id, Arc::clone(&lobby));
        info!("lobby {} created (capacity {})", id, max_players.max(2));
        (id, lobby)
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Mutex<Lobby>>> {
        self.lobbies.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: u64) -> Option<Arc<Mutex<Lobby>>> {
        let removed = self.lobbies.write().await.remove(&id);
        if removed.is_some() {
            info!("lobby {} deleted", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.lobbies.read().await.len()
    }

    /// Snapshot of every lobby, ordered by id.
    pub async fn summaries(&self) -> Vec<LobbySummary> {
        let lobbies: Vec<Arc<Mutex<Lobby>>> =
            self.lobbies.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(lobbies.len());
        for lobby in lobbies {
            summaries.push(lobby.lock().await.summary());
        }
        summaries.sort_by_key(|s| s.id);
        summaries
    }
}

impl Default for LobbyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Direction;

    #[test]
    fn test_add_player_assigns_numbers_in_order() {
        let mut lobby = Lobby::new(1, 2);

        assert_eq!(lobby.add_player(10), AddPlayer::Joined(1));
        assert_eq!(lobby.add_player(20), AddPlayer::Joined(2));
        assert_eq!(lobby.creator_id, Some(10));
        assert_eq!(lobby.player_count(), 2);
    }

    #[test]
    fn test_full_lobby_rejects_without_state_change() {
        let mut lobby = Lobby::new(1, 2);
        lobby.add_player(10);
        lobby.add_player(20);

        assert_eq!(lobby.add_player(30), AddPlayer::Full);
        assert_eq!(lobby.player_count(), 2);
        assert!(lobby.player(30).is_none());
        assert_eq!(lobby.creator_id, Some(10));
    }

    #[test]
    fn test_rejoin_returns_existing_slot() {
        let mut lobby = Lobby::new(1, 2);
        lobby.add_player(10);
        lobby.add_player(20);

        assert_eq!(lobby.add_player(20), AddPlayer::Rejoined(2));
        assert_eq!(lobby.player_count(), 2);
    }

    #[test]
    fn test_freed_number_is_reused() {
        let mut lobby = Lobby::new(1, 4);
        lobby.add_player(10);
        lobby.add_player(20);
        lobby.add_player(30);

        tokio_test::block_on(lobby.remove_player(20));
        assert_eq!(lobby.add_player(40), AddPlayer::Joined(2));
    }

    #[test]
    fn test_start_gate_requires_everyone_ready() {
        let mut lobby = Lobby::new(1, 2);
        lobby.add_player(10);
        assert!(!lobby.start_game(), "one player must not start");

        lobby.add_player(20);
        lobby.set_ready(10, true);
        assert!(!lobby.start_game(), "one unready player must not start");
        assert!(!lobby.game_started);

        lobby.set_ready(20, true);
        assert!(lobby.start_game());
        assert!(lobby.game_started);
        assert!(!lobby.start_game(), "already started");
    }

    #[test]
    fn test_set_ready_is_idempotent() {
        let mut lobby = Lobby::new(1, 2);
        lobby.add_player(10);

        assert!(lobby.set_ready(10, true));
        assert!(lobby.set_ready(10, true));
        assert!(lobby.player(10).unwrap().ready);
        assert!(lobby.set_ready(10, false));
        assert!(!lobby.player(10).unwrap().ready);

        assert!(!lobby.set_ready(99, true));
    }

    #[tokio::test]
    async fn test_remove_player_pauses_running_session() {
        let mut lobby = Lobby::new(1, 2);
        lobby.add_player(10);
        lobby.add_player(20);
        lobby.set_ready(10, true);
        lobby.set_ready(20, true);
        lobby.start_game();

        let mut session = MatchSession::new(10, 20, 10);
        session.start();
        session.score1 = 4;
        let session = Arc::new(Mutex::new(session));

        // A ticker is not needed to observe the pause transition.
        let persistence: Arc<dyn crate::gateway::PersistenceGateway> =
            Arc::new(crate::gateway::InMemoryPersistence::new());
        let ticker = crate::session::spawn_session_ticker(
            Arc::clone(&session),
            crate::session::Audience::Lobby(1),
            crate::registry::ConnectionRegistry::shared(),
            persistence,
            None,
        );
        lobby.attach_match(Arc::clone(&session), ticker);

        lobby.remove_player(20).await;

        let guard = session.lock().await;
        assert!(guard.is_paused(), "session must pause, not finish");
        assert!(!guard.is_over());
        assert_eq!(guard.score1, 4, "scores survive the disconnect");
    }

    #[tokio::test]
    async fn test_rejoin_after_disconnect_keeps_scores() {
        let mut lobby = Lobby::new(1, 2);
        lobby.add_player(10);
        lobby.add_player(20);

        let mut session = MatchSession::new(10, 20, 10);
        session.start();
        session.score2 = 7;
        session.pause();
        let session = Arc::new(Mutex::new(session));

        lobby.remove_player(20).await;
        assert_eq!(lobby.add_player(20), AddPlayer::Joined(2));

        let mut guard = session.lock().await;
        guard.resume();
        assert!(!guard.is_paused());
        assert_eq!(guard.score2, 7);
        guard.move_paddle(2, Direction::Down);
    }

    #[tokio::test]
    async fn test_session_for_player_scopes_to_members() {
        let mut lobby = Lobby::new(1, 2);
        lobby.add_player(10);
        lobby.add_player(20);

        let session = Arc::new(Mutex::new(MatchSession::new(10, 20, 10)));
        let persistence: Arc<dyn crate::gateway::PersistenceGateway> =
            Arc::new(crate::gateway::InMemoryPersistence::new());
        let ticker = crate::session::spawn_session_ticker(
            Arc::clone(&session),
            crate::session::Audience::Lobby(1),
            crate::registry::ConnectionRegistry::shared(),
            persistence,
            None,
        );
        lobby.attach_match(Arc::clone(&session), ticker);

        assert!(lobby.session_for_player(10).await.is_some());
        assert!(lobby.session_for_player(99).await.is_none());
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let manager = LobbyManager::new();
        let (id_a, _) = manager.create_lobby(2).await;
        let (id_b, lobby_b) = manager.create_lobby(4).await;
        assert_ne!(id_a, id_b);
        assert_eq!(manager.len().await, 2);

        lobby_b.lock().await.add_player(1);
        let summaries = manager.summaries().await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, id_a);
        assert_eq!(summaries[1].player_count, 1);

        assert!(manager.remove(id_a).await.is_some());
        assert!(manager.get(id_a).await.is_none());
        assert_eq!(manager.len().await, 1);
    }

    #[test]
    fn test_capacity_floor_and_tournament_flag() {
        let lobby = Lobby::new(1, 0);
        assert_eq!(lobby.max_players, 2);
        assert!(!lobby.is_tournament_lobby());

        let lobby = Lobby::new(2, 8);
        assert!(lobby.is_tournament_lobby());
    }
}
