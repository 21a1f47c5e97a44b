use serde::{Deserialize, Serialize};

pub mod frames;

pub const FIELD_WIDTH: f32 = 800.0;
pub const FIELD_HEIGHT: f32 = 600.0;
pub const BALL_RADIUS: f32 = 10.0;
pub const BALL_SPEED: f32 = 6.0;
pub const PADDLE_WIDTH: f32 = 10.0;
pub const PADDLE_HEIGHT: f32 = 100.0;
pub const PADDLE_STEP: f32 = 12.0;
pub const PADDLE_MARGIN: f32 = 20.0;
pub const DEFLECTION_FACTOR: f32 = 0.05;
pub const TICK_RATE: u32 = 60;
pub const SUB_STEPS: u32 = 4;
pub const DEFAULT_SCORE_LIMIT: u32 = 10;
pub const DEFAULT_MAX_PLAYERS: usize = 2;

/// Vertical movement command for a paddle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ball {
    pub x: f32,
    pub y: f32,
    pub speed_x: f32,
    pub speed_y: f32,
    pub radius: f32,
}

impl Ball {
    pub fn centered() -> Self {
        Ball {
            x: FIELD_WIDTH / 2.0,
            y: FIELD_HEIGHT / 2.0,
            speed_x: BALL_SPEED,
            speed_y: BALL_SPEED,
            radius: BALL_RADIUS,
        }
    }

    /// Advances the ball by a fraction of one tick's worth of velocity.
    pub fn integrate(&mut self, step: f32) {
        self.x += self.speed_x * step;
        self.y += self.speed_y * step;
    }

    pub fn reflect_x(&mut self) {
        self.speed_x = -self.speed_x;
    }

    pub fn reflect_y(&mut self) {
        self.speed_y = -self.speed_y;
    }

    /// Reflects off the top/bottom walls, clamping the center back into the
    /// field. Returns true when a wall was hit.
    pub fn bounce_walls(&mut self) -> bool {
        if self.y - self.radius <= 0.0 {
            self.y = self.radius;
            self.reflect_y();
            true
        } else if self.y + self.radius >= FIELD_HEIGHT {
            self.y = FIELD_HEIGHT - self.radius;
            self.reflect_y();
            true
        } else {
            false
        }
    }

    pub fn recenter(&mut self) {
        self.x = FIELD_WIDTH / 2.0;
        self.y = FIELD_HEIGHT / 2.0;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Paddle {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub speed: f32,
}

impl Paddle {
    /// Paddle for player 1 (left wall) or player 2 (right wall), homed to
    /// the vertical center.
    pub fn for_player(player_number: u8) -> Self {
        let x = if player_number == 1 {
            PADDLE_MARGIN
        } else {
            FIELD_WIDTH - PADDLE_MARGIN - PADDLE_WIDTH
        };
        Paddle {
            x,
            y: (FIELD_HEIGHT - PADDLE_HEIGHT) / 2.0,
            width: PADDLE_WIDTH,
            height: PADDLE_HEIGHT,
            speed: PADDLE_STEP,
        }
    }

    pub fn center_y(&self) -> f32 {
        self.y + self.height / 2.0
    }

    /// Moves one step in the given direction, clamped to the field.
    pub fn step(&mut self, direction: Direction) {
        match direction {
            Direction::Up => self.y -= self.speed,
            Direction::Down => self.y += self.speed,
        }
        self.y = self.y.clamp(0.0, FIELD_HEIGHT - self.height);
    }

    /// Re-homes the paddle to the vertical center after a score.
    pub fn rehome(&mut self) {
        self.y = (FIELD_HEIGHT - self.height) / 2.0;
    }
}

/// Contact test: the ball's bounding extent overlaps the paddle rectangle
/// on both axes.
pub fn ball_hits_paddle(ball: &Ball, paddle: &Paddle) -> bool {
    ball.x + ball.radius >= paddle.x
        && ball.x - ball.radius <= paddle.x + paddle.width
        && ball.y + ball.radius >= paddle.y
        && ball.y - ball.radius <= paddle.y + paddle.height
}

/// Deflection added to the vertical speed on paddle contact; off-center
/// hits change the rebound angle.
pub fn paddle_deflection(ball_y: f32, paddle: &Paddle) -> f32 {
    (ball_y - paddle.center_y()) * DEFLECTION_FACTOR
}
