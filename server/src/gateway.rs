//! Contracts for the surrounding systems. The session core resolves
//! identities and records outcomes exclusively through these traits; every
//! call may fail independently of in-memory state, and callers must treat
//! in-memory state as authoritative when one does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use shared::frames::TournamentStatus;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("no such record: {0}")]
    NotFound(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub id: u64,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRecordStatus {
    Open,
    Finished,
}

/// Durable projection of a match outcome. Written by the core, never read
/// back on the tick path.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub id: i64,
    pub lobby_id: u64,
    pub name: String,
    pub max_players: usize,
    pub player_ids: Vec<u64>,
    pub score1: u32,
    pub score2: u32,
    pub winner_id: Option<u64>,
    pub status: MatchRecordStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TournamentRecord {
    pub id: i64,
    pub lobby_id: u64,
    pub participant_ids: Vec<u64>,
    pub status: TournamentStatus,
    pub completed_matches: u32,
    pub scheduled_rounds: u32,
    pub player_points: HashMap<u64, u32>,
    pub match_ids: Vec<i64>,
}

/// Resolves numeric user ids to display identity.
#[async_trait]
pub trait IdentityGateway: Send + Sync {
    async fn find_user_by_id(&self, id: u64) -> Result<Option<UserProfile>, GatewayError>;
}

/// Durably records match and tournament outcomes.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_match(
        &self,
        lobby_id: u64,
        player1_id: u64,
        max_players: usize,
        name: &str,
    ) -> Result<MatchRecord, GatewayError>;
    async fn add_player_to_match(&self, match_id: i64, user_id: u64) -> Result<(), GatewayError>;
    async fn remove_player_from_match(
        &self,
        match_id: i64,
        user_id: u64,
    ) -> Result<(), GatewayError>;
    async fn update_score(
        &self,
        match_id: i64,
        score1: u32,
        score2: u32,
        winner_id: Option<u64>,
    ) -> Result<(), GatewayError>;
    async fn delete_match_by_lobby_id(&self, lobby_id: u64) -> Result<bool, GatewayError>;
    async fn get_open_lobbies(&self) -> Result<Vec<MatchRecord>, GatewayError>;

    async fn create_tournament(&self, lobby_id: u64) -> Result<i64, GatewayError>;
    async fn add_player_to_tournament(
        &self,
        tournament_id: i64,
        user_id: u64,
    ) -> Result<(), GatewayError>;
    async fn create_tournament_match(
        &self,
        tournament_id: i64,
        player1_id: u64,
        player2_id: u64,
    ) -> Result<i64, GatewayError>;
    async fn update_tournament_status(
        &self,
        tournament_id: i64,
        status: TournamentStatus,
    ) -> Result<(), GatewayError>;
    async fn update_tournament_completion(
        &self,
        tournament_id: i64,
        completed_matches: u32,
    ) -> Result<(), GatewayError>;
    async fn update_tournament_schedule(
        &self,
        tournament_id: i64,
        scheduled_rounds: u32,
    ) -> Result<(), GatewayError>;
    async fn update_player_points(
        &self,
        tournament_id: i64,
        user_id: u64,
        points: u32,
    ) -> Result<(), GatewayError>;
}

/// Identity store backed by a map. Strict mode resolves registered users
/// only; permissive mode fabricates a guest profile for unknown ids so the
/// server runs stand-alone.
pub struct InMemoryIdentity {
    users: RwLock<HashMap<u64, UserProfile>>,
    permissive: bool,
}

impl InMemoryIdentity {
    pub fn new() -> Self {
        InMemoryIdentity {
            users: RwLock::new(HashMap::new()),
            permissive: false,
        }
    }

    pub fn permissive() -> Self {
        InMemoryIdentity {
            users: RwLock::new(HashMap::new()),
            permissive: true,
        }
    }

    pub async fn add_user(&self, id: u64, username: &str, role: &str) {
        self.users.write().await.insert(
            id,
            UserProfile {
                id,
                username: username.to_string(),
                role: role.to_string(),
            },
        );
    }
}

impl Default for InMemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityGateway for InMemoryIdentity {
    async fn find_user_by_id(&self, id: u64) -> Result<Option<UserProfile>, GatewayError> {
        if let Some(profile) = self.users.read().await.get(&id) {
            return Ok(Some(profile.clone()));
        }
        if self.permissive {
            return Ok(Some(UserProfile {
                id,
                username: format!("guest-{}", id),
                role: "user".to_string(),
            }));
        }
        Ok(None)
    }
}

/// Reference persistence implementation backed by maps; also the store the
/// stand-alone binary runs with.
pub struct InMemoryPersistence {
    matches: RwLock<HashMap<i64, MatchRecord>>,
    tournaments: RwLock<HashMap<i64, TournamentRecord>>,
    next_id: AtomicI64,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        InMemoryPersistence {
            matches: RwLock::new(HashMap::new()),
            tournaments: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn match_by_id(&self, id: i64) -> Option<MatchRecord> {
        self.matches.read().await.get(&id).cloned()
    }

    pub async fn tournament_by_id(&self, id: i64) -> Option<TournamentRecord> {
        self.tournaments.read().await.get(&id).cloned()
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryPersistence {
    async fn create_match(
        &self,
        lobby_id: u64,
        player1_id: u64,
        max_players: usize,
        name: &str,
    ) -> Result<MatchRecord, GatewayError> {
        let record = MatchRecord {
            id: self.allocate_id(),
            lobby_id,
            name: name.to_string(),
            max_players,
            player_ids: vec![player1_id],
            score1: 0,
            score2: 0,
            winner_id: None,
            status: MatchRecordStatus::Open,
        };
        self.matches.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn add_player_to_match(&self, match_id: i64, user_id: u64) -> Result<(), GatewayError> {
        let mut matches = self.matches.write().await;
        let record = matches.get_mut(&match_id).ok_or(GatewayError::NotFound(match_id))?;
        if !record.player_ids.contains(&user_id) {
            record.player_ids.push(user_id);
        }
        Ok(())
    }

    async fn remove_player_from_match(
        &self,
        match_id: i64,
        user_id: u64,
    ) -> Result<(), GatewayError> {
        let mut matches = self.matches.write().await;
        let record = matches.get_mut(&match_id).ok_or(GatewayError::NotFound(match_id))?;
        record.player_ids.retain(|&id| id != user_id);
        Ok(())
    }

    async fn update_score(
        &self,
        match_id: i64,
        score1: u32,
        score2: u32,
        winner_id: Option<u64>,
    ) -> Result<(), GatewayError> {
        let mut matches = self.matches.write().await;
        let record = matches.get_mut(&match_id).ok_or(GatewayError::NotFound(match_id))?;
        record.score1 = score1;
        record.score2 = score2;
        record.winner_id = winner_id;
        if winner_id.is_some() {
            record.status = MatchRecordStatus::Finished;
        }
        Ok(())
    }

    async fn delete_match_by_lobby_id(&self, lobby_id: u64) -> Result<bool, GatewayError> {
        let mut matches = self.matches.write().await;
        let before = matches.len();
        matches.retain(|_, record| record.lobby_id != lobby_id);
        Ok(matches.len() != before)
    }

    async fn get_open_lobbies(&self) -> Result<Vec<MatchRecord>, GatewayError> {
        let matches = self.matches.read().await;
        let mut open: Vec<MatchRecord> = matches
            .values()
            .filter(|r| r.status == MatchRecordStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|r| r.id);
        Ok(open)
    }

    async fn create_tournament(&self, lobby_id: u64) -> Result<i64, GatewayError> {
        let record = TournamentRecord {
            id: self.allocate_id(),
            lobby_id,
            participant_ids: Vec::new(),
            status: TournamentStatus::Pending,
            completed_matches: 0,
            scheduled_rounds: 0,
            player_points: HashMap::new(),
            match_ids: Vec::new(),
        };
        let id = record.id;
        self.tournaments.write().await.insert(id, record);
        Ok(id)
    }

    async fn add_player_to_tournament(
        &self,
        tournament_id: i64,
        user_id: u64,
    ) -> Result<(), GatewayError> {
        let mut tournaments = self.tournaments.write().await;
        let record = tournaments
            .get_mut(&tournament_id)
            .ok_or(GatewayError::NotFound(tournament_id))?;
        if !record.participant_ids.contains(&user_id) {
            record.participant_ids.push(user_id);
            record.player_points.insert(user_id, 0);
        }
        Ok(())
    }

    async fn create_tournament_match(
        &self,
        tournament_id: i64,
        player1_id: u64,
        player2_id: u64,
    ) -> Result<i64, GatewayError> {
        let match_id = {
            let record = MatchRecord {
                id: self.allocate_id(),
                lobby_id: 0,
                name: format!("tournament-{}", tournament_id),
                max_players: 2,
                player_ids: vec![player1_id, player2_id],
                score1: 0,
                score2: 0,
                winner_id: None,
                status: MatchRecordStatus::Open,
            };
            let id = record.id;
            self.matches.write().await.insert(id, record);
            id
        };
        let mut tournaments = self.tournaments.write().await;
        let record = tournaments
            .get_mut(&tournament_id)
            .ok_or(GatewayError::NotFound(tournament_id))?;
        record.match_ids.push(match_id);
        Ok(match_id)
    }

    async fn update_tournament_status(
        &self,
        tournament_id: i64,
        status: TournamentStatus,
    ) -> Result<(), GatewayError> {
        let mut tournaments = self.tournaments.write().await;
        let record = tournaments
            .get_mut(&tournament_id)
            .ok_or(GatewayError::NotFound(tournament_id))?;
        record.status = status;
        Ok(())
    }

    async fn update_tournament_completion(
        &self,
        tournament_id: i64,
        completed_matches: u32,
    ) -> Result<(), GatewayError> {
        let mut tournaments = self.tournaments.write().await;
        let record = tournaments
            .get_mut(&tournament_id)
            .ok_or(GatewayError::NotFound(tournament_id))?;
        record.completed_matches = completed_matches;
        Ok(())
    }

    async fn update_tournament_schedule(
        &self,
        tournament_id: i64,
        scheduled_rounds: u32,
    ) -> Result<(), GatewayError> {
        let mut tournaments = self.tournaments.write().await;
        let record = tournaments
            .get_mut(&tournament_id)
            .ok_or(GatewayError::NotFound(tournament_id))?;
        record.scheduled_rounds = scheduled_rounds;
        Ok(())
    }

    async fn update_player_points(
        &self,
        tournament_id: i64,
        user_id: u64,
        points: u32,
    ) -> Result<(), GatewayError> {
        let mut tournaments = self.tournaments.write().await;
        let record = tournaments
            .get_mut(&tournament_id)
            .ok_or(GatewayError::NotFound(tournament_id))?;
        record.player_points.insert(user_id, points);
        Ok(())
    }
}

/// Persistence stub whose every call fails; backs the failure-tolerance
/// tests.
pub struct UnavailablePersistence;

macro_rules! unavailable {
    () => {
        Err(GatewayError::Unavailable("persistence offline".to_string()))
    };
}

#[async_trait]
impl PersistenceGateway for UnavailablePersistence {
    async fn create_match(
        &self,
        _lobby_id: u64,
        _player1_id: u64,
        _max_players: usize,
        _name: &str,
    ) -> Result<MatchRecord, GatewayError> {
        unavailable!()
    }

    async fn add_player_to_match(&self, _match_id: i64, _user_id: u64) -> Result<(), GatewayError> {
        unavailable!()
    }

    async fn remove_player_from_match(
        &self,
        _match_id: i64,
        _user_id: u64,
    ) -> Result<(), GatewayError> {
        unavailable!()
    }

    async fn update_score(
        &self,
        _match_id: i64,
        _score1: u32,
        _score2: u32,
        _winner_id: Option<u64>,
    ) -> Result<(), GatewayError> {
        unavailable!()
    }

    async fn delete_match_by_lobby_id(&self, _lobby_id: u64) -> Result<bool, GatewayError> {
        unavailable!()
    }

    async fn get_open_lobbies(&self) -> Result<Vec<MatchRecord>, GatewayError> {
        unavailable!()
    }

    async fn create_tournament(&self, _lobby_id: u64) -> Result<i64, GatewayError> {
        unavailable!()
    }

    async fn add_player_to_tournament(
        &self,
        _tournament_id: i64,
        _user_id: u64,
    ) -> Result<(), GatewayError> {
        unavailable!()
    }

    async fn create_tournament_match(
        &self,
        _tournament_id: i64,
        _player1_id: u64,
        _player2_id: u64,
    ) -> Result<i64, GatewayError> {
        unavailable!()
    }

    async fn update_tournament_status(
        &self,
        _tournament_id: i64,
        _status: TournamentStatus,
    ) -> Result<(), GatewayError> {
        unavailable!()
    }

    async fn update_tournament_completion(
        &self,
        _tournament_id: i64,
        _completed_matches: u32,
    ) -> Result<(), GatewayError> {
        unavailable!()
    }

    async fn update_tournament_schedule(
        &self,
        _tournament_id: i64,
        _scheduled_rounds: u32,
    ) -> Result<(), GatewayError> {
        unavailable!()
    }

    async fn update_player_points(
        &self,
        _tournament_id: i64,
        _user_id: u64,
        _points: u32,
    ) -> Result<(), GatewayError> {
        unavailable!()
    }
}
