//! Session tickers and the tournament coordinator.
//!
//! Every running match gets one ticker task driving the simulation at a
//! fixed 60 Hz, independent of inbound traffic. Tickers are torn down
//! through a `CancellationToken`, so dropping the owning handle stops the
//! loop deterministically. Persistence writes on finish are spawned
//! fire-and-forget; a gateway failure is logged and never reaches the
//! tick path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use shared::frames::{ServerFrame, TournamentStatus};
use shared::TICK_RATE;

use crate::game::{MatchSession, TickEvent};
use crate::gateway::PersistenceGateway;
use crate::registry::SharedRegistry;
use crate::tournament::{AdvanceOutcome, Tournament};

/// Who receives the frames a ticker emits.
#[derive(Debug, Clone, Copy)]
pub enum Audience {
    /// Every connection bound to the lobby.
    Lobby(u64),
    /// Exactly the two players of a tournament pairing.
    Pair(u64, u64),
}

/// Result of a finished tournament pairing, reported by its ticker.
#[derive(Debug, Clone)]
pub struct PairingOutcome {
    pub round: usize,
    pub pairing: usize,
    pub player1_id: u64,
    pub player2_id: u64,
    pub winner_id: u64,
    pub score1: u32,
    pub score2: u32,
}

/// Where a pairing ticker reports its outcome.
pub struct OutcomeSink {
    pub round: usize,
    pub pairing: usize,
    pub tx: mpsc::UnboundedSender<PairingOutcome>,
}

/// Handle to one running ticker task. Cancelling (or dropping) the handle
/// stops the loop.
pub struct SessionTicker {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl SessionTicker {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels and waits for the loop to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for SessionTicker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn deliver(registry: &SharedRegistry, audience: Audience, frame: &ServerFrame) {
    let registry = registry.read().await;
    match audience {
        Audience::Lobby(lobby_id) => registry.broadcast_to_lobby(lobby_id, frame),
        Audience::Pair(a, b) => {
            registry.send_to_user(a, frame);
            registry.send_to_user(b, frame);
        }
    }
}

/// Queues the final score write without blocking the caller.
fn persist_final_score(
    persistence: Arc<dyn PersistenceGateway>,
    match_id: i64,
    score1: u32,
    score2: u32,
    winner_id: u64,
) {
    tokio::spawn(async move {
        if let Err(e) = persistence
            .update_score(match_id, score1, score2, Some(winner_id))
            .await
        {
            warn!("failed to persist final score for match {}: {}", match_id, e);
        }
    });
}

/// Spawns the 60 Hz loop for one session: tick, broadcast the snapshot,
/// and on finish persist the result and report the outcome.
pub fn spawn_session_ticker(
    session: Arc<Mutex<MatchSession>>,
    audience: Audience,
    registry: SharedRegistry,
    persistence: Arc<dyn PersistenceGateway>,
    outcome: Option<OutcomeSink>,
) -> SessionTicker {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs_f64(1.0 / TICK_RATE as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let (event, snapshot, ids, scores, record_id) = {
                        let mut session = session.lock().await;
                        let event = session.tick();
                        (
                            event,
                            session.snapshot(),
                            (session.player1_id, session.player2_id),
                            (session.score1, session.score2),
                            session.match_record_id,
                        )
                    };

                    match event {
                        TickEvent::Idle => {}
                        TickEvent::Advanced => {
                            deliver(&registry, audience, &ServerFrame::GameUpdate { state: snapshot })
                                .await;
                        }
                        // A point was scored and positions re-centered.
                        TickEvent::Scored => {
                            deliver(&registry, audience, &ServerFrame::ResetGame { state: snapshot })
                                .await;
                        }
                        TickEvent::Finished { winner_id } => {
                            deliver(&registry, audience, &ServerFrame::GameUpdate { state: snapshot })
                                .await;
                            if let Some(match_id) = record_id {
                                persist_final_score(
                                    Arc::clone(&persistence),
                                    match_id,
                                    scores.0,
                                    scores.1,
                                    winner_id,
                                );
                            }
                            if let Some(sink) = &outcome {
                                let _ = sink.tx.send(PairingOutcome {
                                    round: sink.round,
                                    pairing: sink.pairing,
                                    player1_id: ids.0,
                                    player2_id: ids.1,
                                    winner_id,
                                    score1: scores.0,
                                    score2: scores.1,
                                });
                            }
                            break;
                        }
                    }
                }
            }
        }
        debug!("session ticker stopped");
    });

    SessionTicker { cancel, handle }
}

type SharedSessions = Arc<RwLock<HashMap<u64, Arc<Mutex<MatchSession>>>>>;

/// Handle to a running tournament: bracket state, the player -> session
/// map, and the coordinator's cancellation token. Dropping the handle
/// tears the whole tournament down.
pub struct TournamentHandle {
    pub state: Arc<Mutex<Tournament>>,
    sessions: SharedSessions,
    cancel: CancellationToken,
}

impl TournamentHandle {
    /// The live session the user is currently playing in, if any.
    pub async fn session_for(&self, user_id: u64) -> Option<Arc<Mutex<MatchSession>>> {
        self.sessions.read().await.get(&user_id).cloned()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TournamentHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builds the bracket, spawns the coordinator task, and returns the
/// handle the lobby keeps.
pub fn start_tournament(
    lobby_id: u64,
    roster: Vec<u64>,
    score_limit: u32,
    registry: SharedRegistry,
    persistence: Arc<dyn PersistenceGateway>,
) -> TournamentHandle {
    let mut bracket = Tournament::new(roster);
    bracket.start();

    let state = Arc::new(Mutex::new(bracket));
    let sessions: SharedSessions = Arc::new(RwLock::new(HashMap::new()));
    let cancel = CancellationToken::new();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

    let coordinator = TournamentCoordinator {
        lobby_id,
        score_limit,
        registry,
        persistence,
        state: Arc::clone(&state),
        sessions: Arc::clone(&sessions),
        tickers: Mutex::new(Vec::new()),
        outcome_tx,
    };

    let token = cancel.clone();
    tokio::spawn(async move {
        coordinator.run(outcome_rx, token).await;
    });

    TournamentHandle {
        state,
        sessions,
        cancel,
    }
}

struct TournamentCoordinator {
    lobby_id: u64,
    score_limit: u32,
    registry: SharedRegistry,
    persistence: Arc<dyn PersistenceGateway>,
    state: Arc<Mutex<Tournament>>,
    sessions: SharedSessions,
    tickers: Mutex<Vec<SessionTicker>>,
    outcome_tx: mpsc::UnboundedSender<PairingOutcome>,
}

impl TournamentCoordinator {
    async fn run(
        self,
        mut outcome_rx: mpsc::UnboundedReceiver<PairingOutcome>,
        cancel: CancellationToken,
    ) {
        // Best-effort durable registration; the record id feeds every
        // later tournament write, and None simply skips them.
        let roster = self.state.lock().await.roster().to_vec();
        let record_id = match self.persistence.create_tournament(self.lobby_id).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("failed to persist tournament for lobby {}: {}", self.lobby_id, e);
                None
            }
        };
        if let Some(id) = record_id {
            for &user_id in &roster {
                if let Err(e) = self.persistence.add_player_to_tournament(id, user_id).await {
                    warn!("failed to persist tournament participant {}: {}", user_id, e);
                }
            }
            if let Err(e) = self
                .persistence
                .update_tournament_status(id, TournamentStatus::Ongoing)
                .await
            {
                warn!("failed to persist tournament status: {}", e);
            }
            if let Err(e) = self.persistence.update_tournament_schedule(id, 1).await {
                warn!("failed to persist tournament schedule: {}", e);
            }
        }

        info!("tournament started in lobby {}", self.lobby_id);
        self.launch_open_pairings(0, record_id).await;
        self.broadcast_bracket().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    for ticker in self.tickers.lock().await.drain(..) {
                        ticker.cancel();
                    }
                    let mut bracket = self.state.lock().await;
                    bracket.cancel();
                    if let Some(id) = record_id {
                        let persistence = Arc::clone(&self.persistence);
                        tokio::spawn(async move {
                            if let Err(e) = persistence
                                .update_tournament_status(id, TournamentStatus::Cancelled)
                                .await
                            {
                                warn!("failed to persist tournament cancellation: {}", e);
                            }
                        });
                    }
                    debug!("tournament in lobby {} cancelled", self.lobby_id);
                    break;
                }
                outcome = outcome_rx.recv() => {
                    let Some(outcome) = outcome else { break };
                    if self.handle_outcome(outcome, record_id).await {
                        break;
                    }
                }
            }
        }
    }

    /// Applies one pairing result. Returns true when the tournament is
    /// over and the coordinator should exit.
    async fn handle_outcome(&self, outcome: PairingOutcome, record_id: Option<i64>) -> bool {
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&outcome.player1_id);
            sessions.remove(&outcome.player2_id);
        }

        let (advance, winner_points, completed) = {
            let mut bracket = self.state.lock().await;
            if !bracket.record_result(outcome.round, outcome.pairing, outcome.winner_id) {
                warn!(
                    "dropping stale pairing result (round {}, pairing {})",
                    outcome.round, outcome.pairing
                );
                return false;
            }
            let points = bracket
                .player_scores
                .get(&outcome.winner_id)
                .copied()
                .unwrap_or(0);
            (bracket.try_advance(), points, bracket.completed_pairings())
        };

        if let Some(id) = record_id {
            let persistence = Arc::clone(&self.persistence);
            let winner_id = outcome.winner_id;
            tokio::spawn(async move {
                if let Err(e) = persistence.update_tournament_completion(id, completed).await {
                    warn!("failed to persist tournament completion: {}", e);
                }
                if let Err(e) = persistence
                    .update_player_points(id, winner_id, winner_points)
                    .await
                {
                    warn!("failed to persist player points: {}", e);
                }
            });
        }

        match advance {
            AdvanceOutcome::NotReady => {
                self.broadcast_bracket().await;
                false
            }
            AdvanceOutcome::NextRound(round_idx) => {
                if let Some(id) = record_id {
                    let persistence = Arc::clone(&self.persistence);
                    let rounds = round_idx as u32 + 1;
                    tokio::spawn(async move {
                        if let Err(e) = persistence.update_tournament_schedule(id, rounds).await {
                            warn!("failed to persist tournament schedule: {}", e);
                        }
                    });
                }
                self.launch_open_pairings(round_idx, record_id).await;
                self.broadcast_bracket().await;
                false
            }
            AdvanceOutcome::Champion(winner_id) => {
                info!(
                    "tournament in lobby {} won by {}",
                    self.lobby_id, winner_id
                );
                self.broadcast_bracket().await;
                deliver(
                    &self.registry,
                    Audience::Lobby(self.lobby_id),
                    &ServerFrame::TournamentFinished { winner_id },
                )
                .await;
                if let Some(id) = record_id {
                    let persistence = Arc::clone(&self.persistence);
                    tokio::spawn(async move {
                        if let Err(e) = persistence
                            .update_tournament_status(id, TournamentStatus::Completed)
                            .await
                        {
                            warn!("failed to persist tournament status: {}", e);
                        }
                    });
                }
                true
            }
        }
    }

    /// Spins up one session per open pairing of the round. Byes are
    /// already completed and get no session.
    async fn launch_open_pairings(&self, round_idx: usize, record_id: Option<i64>) {
        let open: Vec<(usize, u64, u64)> = {
            let bracket = self.state.lock().await;
            let Some(round) = bracket.rounds.get(round_idx) else {
                return;
            };
            round
                .pairings
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.is_completed)
                .filter_map(|(i, p)| p.player2_id.map(|p2| (i, p.player1_id, p2)))
                .collect()
        };

        for (pairing_idx, player1_id, player2_id) in open {
            let match_record_id = if let Some(tournament_id) = record_id {
                match self
                    .persistence
                    .create_tournament_match(tournament_id, player1_id, player2_id)
                    .await
                {
                    Ok(match_id) => {
                        let mut bracket = self.state.lock().await;
                        if let Some(pairing) = bracket
                            .rounds
                            .get_mut(round_idx)
                            .and_then(|r| r.pairings.get_mut(pairing_idx))
                        {
                            pairing.match_record_id = Some(match_id);
                        }
                        Some(match_id)
                    }
                    Err(e) => {
                        warn!("failed to persist tournament match: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            let mut session = MatchSession::new(player1_id, player2_id, self.score_limit);
            session.match_record_id = match_record_id;
            session.start();
            let snapshot = session.snapshot();
            let session = Arc::new(Mutex::new(session));

            {
                let mut sessions = self.sessions.write().await;
                sessions.insert(player1_id, Arc::clone(&session));
                sessions.insert(player2_id, Arc::clone(&session));
            }

            deliver(
                &self.registry,
                Audience::Pair(player1_id, player2_id),
                &ServerFrame::InitGame { state: snapshot },
            )
            .await;

            let ticker = spawn_session_ticker(
                session,
                Audience::Pair(player1_id, player2_id),
                Arc::clone(&self.registry),
                Arc::clone(&self.persistence),
                Some(OutcomeSink {
                    round: round_idx,
                    pairing: pairing_idx,
                    tx: self.outcome_tx.clone(),
                }),
            );
            self.tickers.lock().await.push(ticker);
        }
    }

    async fn broadcast_bracket(&self) {
        let summary = self.state.lock().await.summary();
        deliver(
            &self.registry,
            Audience::Lobby(self.lobby_id),
            &ServerFrame::TournamentUpdate {
                tournament: summary,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryPersistence;
    use crate::registry::ConnectionRegistry;
    use tokio_tungstenite::tungstenite::Message;

    async fn bound_connection(
        registry: &SharedRegistry,
        user_id: u64,
        lobby_id: u64,
    ) -> mpsc::UnboundedReceiver<Message>
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reg = registry.write().await;
        let conn = reg.add("127.0.0.1:9000".parse().unwrap(), tx);
        reg.bind(conn, user_id, lobby_id);
        rx
    }

    fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                frames.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_broadcasts_updates() {
        let registry = ConnectionRegistry::shared();
        let persistence: Arc<dyn PersistenceGateway> = Arc::new(InMemoryPersistence::new());
        let mut rx = bound_connection(&registry, 1, 7).await;

        let mut session = MatchSession::new(1, 2, 10);
        session.start();
        let session = Arc::new(Mutex::new(session));

        let ticker = spawn_session_ticker(
            Arc::clone(&session),
            Audience::Lobby(7),
            Arc::clone(&registry),
            persistence,
            None,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;

        let frames = drain_frames(&mut rx);
        assert!(
            frames
                .iter()
                .any(|f| matches!(f, ServerFrame::GameUpdate { .. })),
            "expected at least one gameUpdate, got {:?}",
            frames
        );

        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_cancellation_is_deterministic() {
        let registry = ConnectionRegistry::shared();
        let persistence: Arc<dyn PersistenceGateway> = Arc::new(InMemoryPersistence::new());

        let mut session = MatchSession::new(1, 2, 10);
        session.start();
        let session = Arc::new(Mutex::new(session));

        let ticker = spawn_session_ticker(
            Arc::clone(&session),
            Audience::Lobby(7),
            Arc::clone(&registry),
            persistence,
            None,
        );

        ticker.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ticker.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_persists_and_reports_finish() {
        let registry = ConnectionRegistry::shared();
        let store = Arc::new(InMemoryPersistence::new());
        let persistence: Arc<dyn PersistenceGateway> = store.clone();
        let mut rx = bound_connection(&registry, 1, 7).await;

        let record = store.create_match(7, 1, 2, "lobby-7").await.unwrap();

        // One point from finishing, ball about to cross the right edge.
        let mut session = MatchSession::new(1, 2, 1);
        session.match_record_id = Some(record.id);
        session.start();
        session.ball.x = shared::FIELD_WIDTH - 1.0;
        session.ball.y = 50.0;
        session.ball.speed_x = 12.0;
        session.ball.speed_y = 0.0;
        let session = Arc::new(Mutex::new(session));

        let (tx, mut outcome_rx) = mpsc::unbounded_channel();
        let ticker = spawn_session_ticker(
            Arc::clone(&session),
            Audience::Lobby(7),
            Arc::clone(&registry),
            persistence,
            Some(OutcomeSink {
                round: 0,
                pairing: 0,
                tx,
            }),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(ticker.is_finished());
        let outcome = outcome_rx.try_recv().expect("expected a pairing outcome");
        assert_eq!(outcome.winner_id, 1);
        assert_eq!(outcome.score1, 1);

        let frames = drain_frames(&mut rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::GameUpdate { state } if state.game_is_over
        )));

        let persisted = store.match_by_id(record.id).await.unwrap();
        assert_eq!(persisted.winner_id, Some(1));
        assert_eq!(persisted.score1, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tournament_coordinator_runs_round_one() {
        let registry = ConnectionRegistry::shared();
        let store = Arc::new(InMemoryPersistence::new());
        let persistence: Arc<dyn PersistenceGateway> = store.clone();

        let mut rx = bound_connection(&registry, 1, 3).await;
        for user in 2..=4 {
            bound_connection(&registry, user, 3).await;
        }

        let handle = start_tournament(
            3,
            vec![1, 2, 3, 4],
            10,
            Arc::clone(&registry),
            persistence,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Both pairings have live sessions; paired players share one.
        let s1 = handle.session_for(1).await.expect("player 1 has a session");
        let s2 = handle.session_for(2).await.expect("player 2 has a session");
        assert!(Arc::ptr_eq(&s1, &s2));
        assert!(handle.session_for(3).await.is_some());

        let frames = drain_frames(&mut rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::TournamentUpdate { .. })));
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::InitGame { .. })));

        // Durable registration carried the roster and both round-1 rows.
        let record = store.tournament_by_id(1).await.expect("tournament persisted");
        assert_eq!(record.participant_ids, vec![1, 2, 3, 4]);
        assert_eq!(record.scheduled_rounds, 1);
        assert_eq!(record.match_ids.len(), 2);

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            handle.state.lock().await.status,
            TournamentStatus::Cancelled
        );
    }
}
