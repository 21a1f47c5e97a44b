use log::info;
use rand::Rng;
use shared::frames::{BallState, GameSnapshot, PaddleState};
use shared::{
    ball_hits_paddle, paddle_deflection, Ball, Direction, Paddle, BALL_SPEED, FIELD_WIDTH,
    SUB_STEPS,
};

/// Outcome of one tick; the ticker picks the outbound frame from this.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickEvent {
    /// Session not running (created, paused, or over); nothing advanced.
    Idle,
    Advanced,
    Scored,
    Finished { winner_id: u64 },
}

/// One running game instance bound to two players.
///
/// States: Created -> Running <-> Paused -> Finished. Operations called in
/// an incompatible state are no-ops; `move_paddle` is ignored unless the
/// session is actively running.
#[derive(Debug)]
pub struct MatchSession {
    pub player1_id: u64,
    pub player2_id: u64,
    pub ball: Ball,
    pub paddle1: Paddle,
    pub paddle2: Paddle,
    pub score1: u32,
    pub score2: u32,
    pub score_limit: u32,
    pub match_record_id: Option<i64>,
    paused: bool,
    running: bool,
    game_over: bool,
}

impl MatchSession {
    pub fn new(player1_id: u64, player2_id: u64, score_limit: u32) -> Self {
        MatchSession {
            player1_id,
            player2_id,
            ball: Ball::centered(),
            paddle1: Paddle::for_player(1),
            paddle2: Paddle::for_player(2),
            score1: 0,
            score2: 0,
            score_limit,
            match_record_id: None,
            paused: false,
            running: false,
            game_over: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_over(&self) -> bool {
        self.game_over
    }

    pub fn winner_id(&self) -> Option<u64> {
        if !self.game_over {
            return None;
        }
        if self.score1 >= self.score_limit {
            Some(self.player1_id)
        } else {
            Some(self.player2_id)
        }
    }

    /// The player number (1 or 2) a user controls in this session.
    pub fn player_number_of(&self, user_id: u64) -> Option<u8> {
        if user_id == self.player1_id {
            Some(1)
        } else if user_id == self.player2_id {
            Some(2)
        } else {
            None
        }
    }

    pub fn start(&mut self) {
        if self.running || self.game_over {
            return;
        }
        self.running = true;
        self.paused = false;
        info!(
            "match started: {} vs {} (first to {})",
            self.player1_id, self.player2_id, self.score_limit
        );
    }

    pub fn pause(&mut self) {
        if self.running && !self.game_over {
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.running && !self.game_over {
            self.paused = false;
        }
    }

    /// Applies a move command immediately, independent of the tick.
    /// Ignored while paused, finished, or not yet started.
    pub fn move_paddle(&mut self, player_number: u8, direction: Direction) {
        if !self.running || self.paused || self.game_over {
            return;
        }
        match player_number {
            1 => self.paddle1.step(direction),
            2 => self.paddle2.step(direction),
            _ => {}
        }
    }

    /// Re-centers ball and paddles without touching the scores.
    pub fn reset(&mut self) {
        if self.game_over {
            return;
        }
        self.serve();
    }

    pub fn reset_scores(&mut self) {
        self.score1 = 0;
        self.score2 = 0;
    }

    /// Advances the simulation by one tick in equal sub-steps. A wall or
    /// scoring event ends the tick early; paddle contact flips the
    /// horizontal velocity at most once because contact is only tested
    /// against the paddle the ball is moving toward.
    pub fn tick(&mut self) -> TickEvent {
        if !self.running || self.paused || self.game_over {
            return TickEvent::Idle;
        }

        let step = 1.0 / SUB_STEPS as f32;
        for _ in 0..SUB_STEPS {
            self.ball.integrate(step);

            if self.ball.bounce_walls() {
                break;
            }

            if self.ball.speed_x < 0.0 && ball_hits_paddle(&self.ball, &self.paddle1) {
                self.ball.x = self.paddle1.x + self.paddle1.width + self.ball.radius;
                self.ball.reflect_x();
                self.ball.speed_y += paddle_deflection(self.ball.y, &self.paddle1);
            } else if self.ball.speed_x > 0.0 && ball_hits_paddle(&self.ball, &self.paddle2) {
                self.ball.x = self.paddle2.x - self.ball.radius;
                self.ball.reflect_x();
                self.ball.speed_y += paddle_deflection(self.ball.y, &self.paddle2);
            }

            if self.ball.x < 0.0 {
                return self.score_point(2);
            }
            if self.ball.x > FIELD_WIDTH {
                return self.score_point(1);
            }
        }

        TickEvent::Advanced
    }

    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            ball: BallState::from(&self.ball),
            paddle1: PaddleState::from(&self.paddle1),
            paddle2: PaddleState::from(&self.paddle2),
            score1: self.score1,
            score2: self.score2,
            paused: self.paused,
            running: self.running,
            game_is_over: self.game_over,
        }
    }

    fn score_point(&mut self, scorer: u8) -> TickEvent {
        let (score, winner_id) = if scorer == 1 {
            self.score1 += 1;
            (self.score1, self.player1_id)
        } else {
            self.score2 += 1;
            (self.score2, self.player2_id)
        };

        if score >= self.score_limit {
            self.game_over = true;
            self.running = false;
            info!(
                "match finished {}-{}, winner {}",
                self.score1, self.score2, winner_id
            );
            return TickEvent::Finished { winner_id };
        }

        self.serve();
        TickEvent::Scored
    }

    /// Center the ball with a fresh 50/50 direction per axis and re-home
    /// both paddles.
    fn serve(&mut self) {
        let mut rng = rand::thread_rng();
        self.ball.recenter();
        self.ball.speed_x = if rng.gen_bool(0.5) {
            BALL_SPEED
        } else {
            -BALL_SPEED
        };
        self.ball.speed_y = if rng.gen_bool(0.5) {
            BALL_SPEED
        } else {
            -BALL_SPEED
        };
        self.paddle1.rehome();
        self.paddle2.rehome();
    }
}
