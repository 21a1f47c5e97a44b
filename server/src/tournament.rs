//! Bracket scheduling: deterministic pairing, round completion tracking,
//! winner advancement.

use std::collections::HashMap;

use shared::frames::{PairingSummary, RoundSummary, TournamentStatus, TournamentSummary};

/// One scheduled 1v1 match within a round. `player2_id == None` models a
/// bye: the pairing is born completed with `player1_id` as winner.
#[derive(Debug, Clone)]
pub struct Pairing {
    pub player1_id: u64,
    pub player2_id: Option<u64>,
    pub winner_id: Option<u64>,
    pub match_record_id: Option<i64>,
    pub is_completed: bool,
}

impl Pairing {
    fn versus(player1_id: u64, player2_id: u64) -> Self {
        Pairing {
            player1_id,
            player2_id: Some(player2_id),
            winner_id: None,
            match_record_id: None,
            is_completed: false,
        }
    }

    fn bye(player_id: u64) -> Self {
        Pairing {
            player1_id: player_id,
            player2_id: None,
            winner_id: Some(player_id),
            match_record_id: None,
            is_completed: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Round {
    pub pairings: Vec<Pairing>,
}

impl Round {
    pub fn is_complete(&self) -> bool {
        self.pairings.iter().all(|p| p.is_completed)
    }
}

/// What `try_advance` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Current round still has open pairings (or the tournament is not
    /// ongoing).
    NotReady,
    /// A new round was generated; its index is returned.
    NextRound(usize),
    /// A single winner remains.
    Champion(u64),
}

#[derive(Debug)]
pub struct Tournament {
    roster: Vec<u64>,
    pub rounds: Vec<Round>,
    pub player_scores: HashMap<u64, u32>,
    pub status: TournamentStatus,
}

impl Tournament {
    /// Registers the roster without building any round.
    pub fn new(roster: Vec<u64>) -> Self {
        let player_scores = roster.iter().map(|&id| (id, 0)).collect();
        Tournament {
            roster,
            rounds: Vec::new(),
            player_scores,
            status: TournamentStatus::Pending,
        }
    }

    pub fn roster(&self) -> &[u64] {
        &self.roster
    }

    /// Builds round 1 from the roster in registration order and moves the
    /// tournament to ongoing. No-op unless pending.
    pub fn start(&mut self) {
        if self.status != TournamentStatus::Pending {
            return;
        }
        let round = Self::build_round(&self.roster);
        self.credit_byes(&round);
        self.rounds.push(round);
        self.status = TournamentStatus::Ongoing;
    }

    /// Pairs players in the given order; an odd tail gets a bye.
    fn build_round(players: &[u64]) -> Round {
        let mut pairings = Vec::with_capacity(players.len().div_ceil(2));
        for pair in players.chunks(2) {
            match pair {
                [a, b] => pairings.push(Pairing::versus(*a, *b)),
                [a] => pairings.push(Pairing::bye(*a)),
                _ => unreachable!(),
            }
        }
        Round { pairings }
    }

    fn credit_byes(&mut self, round: &Round) {
        for pairing in round.pairings.iter().filter(|p| p.player2_id.is_none()) {
            *self.player_scores.entry(pairing.player1_id).or_insert(0) += 1;
        }
    }

    pub fn current_round_index(&self) -> Option<usize> {
        self.rounds.len().checked_sub(1)
    }

    /// Marks a pairing resolved. Returns false (no state change) when the
    /// indices are stale, the pairing is already completed, or the winner
    /// is not one of its players.
    pub fn record_result(&mut self, round: usize, pairing: usize, winner_id: u64) -> bool {
        let Some(slot) = self
            .rounds
            .get_mut(round)
            .and_then(|r| r.pairings.get_mut(pairing))
        else {
            return false;
        };
        if slot.is_completed {
            return false;
        }
        if slot.player1_id != winner_id && slot.player2_id != Some(winner_id) {
            return false;
        }
        slot.winner_id = Some(winner_id);
        slot.is_completed = true;
        *self.player_scores.entry(winner_id).or_insert(0) += 1;
        true
    }

    /// Winners of a round, ordered by their position in the roster.
    pub fn winners_of(&self, round: usize) -> Vec<u64> {
        let Some(round) = self.rounds.get(round) else {
            return Vec::new();
        };
        let mut winners: Vec<u64> = round.pairings.iter().filter_map(|p| p.winner_id).collect();
        winners.sort_by_key(|id| self.roster.iter().position(|r| r == id));
        winners
    }

    /// Generates the next round once the current one is complete, or
    /// resolves the champion when a single winner remains.
    pub fn try_advance(&mut self) -> AdvanceOutcome {
        if self.status != TournamentStatus::Ongoing {
            return AdvanceOutcome::NotReady;
        }
        let Some(current) = self.current_round_index() else {
            return AdvanceOutcome::NotReady;
        };
        if !self.rounds[current].is_complete() {
            return AdvanceOutcome::NotReady;
        }

        let winners = self.winners_of(current);
        match winners.as_slice() {
            [] => AdvanceOutcome::NotReady,
            [champion] => {
                self.status = TournamentStatus::Completed;
                AdvanceOutcome::Champion(*champion)
            }
            _ => {
                let round = Self::build_round(&winners);
                self.credit_byes(&round);
                self.rounds.push(round);
                AdvanceOutcome::NextRound(self.rounds.len() - 1)
            }
        }
    }

    pub fn champion(&self) -> Option<u64> {
        if self.status != TournamentStatus::Completed {
            return None;
        }
        self.rounds
            .last()
            .and_then(|r| r.pairings.last())
            .and_then(|p| p.winner_id)
    }

    pub fn cancel(&mut self) {
        if self.status == TournamentStatus::Ongoing || self.status == TournamentStatus::Pending {
            self.status = TournamentStatus::Cancelled;
        }
    }

    pub fn completed_pairings(&self) -> u32 {
        self.rounds
            .iter()
            .flat_map(|r| &r.pairings)
            .filter(|p| p.is_completed)
            .count() as u32
    }

    pub fn summary(&self) -> TournamentSummary {
        TournamentSummary {
            status: self.status,
            rounds: self
                .rounds
                .iter()
                .map(|round| RoundSummary {
                    pairings: round
                        .pairings
                        .iter()
                        .map(|p| PairingSummary {
                            player1_id: p.player1_id,
                            player2_id: p.player2_id,
                            winner_id: p.winner_id,
                            is_completed: p.is_completed,
                        })
                        .collect(),
                })
                .collect(),
            player_scores: self.player_scores.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_player_roster_gives_two_pairings() {
        let mut t = Tournament::new(vec![10, 20, 30, 40]);
        t.start();

        assert_eq!(t.status, TournamentStatus::Ongoing);
        assert_eq!(t.rounds.len(), 1);
        assert_eq!(t.rounds[0].pairings.len(), 2);
        assert_eq!(t.rounds[0].pairings[0].player1_id, 10);
        assert_eq!(t.rounds[0].pairings[0].player2_id, Some(20));
        assert_eq!(t.rounds[0].pairings[1].player1_id, 30);
        assert_eq!(t.rounds[0].pairings[1].player2_id, Some(40));
    }

    #[test]
    fn test_round_two_waits_for_all_pairings() {
        let mut t = Tournament::new(vec![10, 20, 30, 40]);
        t.start();

        assert!(t.record_result(0, 0, 20));
        assert_eq!(t.try_advance(), AdvanceOutcome::NotReady);
        assert_eq!(t.rounds.len(), 1);

        assert!(t.record_result(0, 1, 30));
        assert_eq!(t.try_advance(), AdvanceOutcome::NextRound(1));

        // Round 2 pairs exactly the recorded winners, in registration order.
        assert_eq!(t.rounds[1].pairings.len(), 1);
        assert_eq!(t.rounds[1].pairings[0].player1_id, 20);
        assert_eq!(t.rounds[1].pairings[0].player2_id, Some(30));
    }

    #[test]
    fn test_champion_resolution() {
        let mut t = Tournament::new(vec![10, 20, 30, 40]);
        t.start();
        t.record_result(0, 0, 10);
        t.record_result(0, 1, 40);
        t.try_advance();
        t.record_result(1, 0, 40);

        assert_eq!(t.try_advance(), AdvanceOutcome::Champion(40));
        assert_eq!(t.status, TournamentStatus::Completed);
        assert_eq!(t.champion(), Some(40));
        assert_eq!(t.player_scores[&40], 2);
        assert_eq!(t.player_scores[&10], 1);
        assert_eq!(t.player_scores[&20], 0);
    }

    #[test]
    fn test_odd_roster_gets_a_bye() {
        let mut t = Tournament::new(vec![1, 2, 3]);
        t.start();

        assert_eq!(t.rounds[0].pairings.len(), 2);
        let bye = &t.rounds[0].pairings[1];
        assert_eq!(bye.player1_id, 3);
        assert_eq!(bye.player2_id, None);
        assert!(bye.is_completed);
        assert_eq!(bye.winner_id, Some(3));
        assert_eq!(t.player_scores[&3], 1);

        // Every registered player appears in exactly one pairing.
        let mut seen: Vec<u64> = t.rounds[0]
            .pairings
            .iter()
            .flat_map(|p| {
                let mut v = vec![p.player1_id];
                v.extend(p.player2_id);
                v
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_bye_winner_advances_against_real_winner() {
        let mut t = Tournament::new(vec![1, 2, 3]);
        t.start();
        t.record_result(0, 0, 2);

        assert_eq!(t.try_advance(), AdvanceOutcome::NextRound(1));
        assert_eq!(t.rounds[1].pairings.len(), 1);
        assert_eq!(t.rounds[1].pairings[0].player1_id, 2);
        assert_eq!(t.rounds[1].pairings[0].player2_id, Some(3));
    }

    #[test]
    fn test_record_result_rejects_bad_input() {
        let mut t = Tournament::new(vec![1, 2]);
        t.start();

        // Not a participant of the pairing.
        assert!(!t.record_result(0, 0, 99));
        // Stale indices.
        assert!(!t.record_result(5, 0, 1));
        assert!(!t.record_result(0, 5, 1));

        assert!(t.record_result(0, 0, 1));
        // Double completion is refused.
        assert!(!t.record_result(0, 0, 2));
        assert_eq!(t.player_scores[&1], 1);
    }

    #[test]
    fn test_start_is_noop_when_ongoing() {
        let mut t = Tournament::new(vec![1, 2]);
        t.start();
        t.start();
        assert_eq!(t.rounds.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let mut t = Tournament::new(vec![1, 2, 3, 4]);
        t.start();
        t.cancel();
        assert_eq!(t.status, TournamentStatus::Cancelled);
        assert_eq!(t.try_advance(), AdvanceOutcome::NotReady);
    }

    #[test]
    fn test_eight_player_bracket_depth() {
        let roster: Vec<u64> = (1..=8).collect();
        let mut t = Tournament::new(roster);
        t.start();

        // Lower id wins every pairing.
        for round in 0..3 {
            let picks: Vec<(usize, u64)> = t.rounds[round]
                .pairings
                .iter()
                .enumerate()
                .map(|(i, p)| (i, p.player1_id.min(p.player2_id.unwrap())))
                .collect();
            for (i, winner) in picks {
                assert!(t.record_result(round, i, winner));
            }
            match t.try_advance() {
                AdvanceOutcome::NextRound(idx) => assert_eq!(idx, round + 1),
                AdvanceOutcome::Champion(id) => {
                    assert_eq!(round, 2);
                    assert_eq!(id, 1);
                }
                AdvanceOutcome::NotReady => panic!("round {} did not advance", round),
            }
        }

        assert_eq!(t.champion(), Some(1));
        assert_eq!(t.completed_pairings(), 7);
    }
}
