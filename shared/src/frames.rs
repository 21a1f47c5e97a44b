//! Wire protocol: one JSON object per text frame, discriminated by `type`.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `HashMap<u64, _>` whose keys arrive as JSON object keys
/// (always strings). serde_json parses integer keys natively, but an
/// internally-tagged enum buffers content first, which turns the keys into
/// strings and loses that native support — so parse them explicitly here.
fn deserialize_u64_key_map<'de, D>(deserializer: D) -> Result<HashMap<u64, u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let string_keyed = HashMap::<String, u32>::deserialize(deserializer)?;
    string_keyed
        .into_iter()
        .map(|(k, v)| {
            k.parse::<u64>()
                .map(|k| (k, v))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

use crate::{Ball, Direction, Paddle};

/// Frames a client may send. An unmatched `type` tag fails to
/// deserialize, which the router treats as a protocol error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    CreateLobby {
        user_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_players: Option<usize>,
    },
    JoinLobby {
        user_id: u64,
        lobby_id: u64,
    },
    LeaveLobby {
        lobby_id: u64,
    },
    GetLobbyList,
    GetLobbyById {
        lobby_id: u64,
    },
    Ready {
        ready: bool,
    },
    StartGame,
    PauseGame,
    ResumeGame,
    MovePaddle {
        direction: Direction,
    },
}

/// Frames the server sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Connection {
        user_id: Option<u64>,
    },
    Error {
        message: String,
    },
    LobbyCreated {
        lobby_id: u64,
        player_number: u8,
    },
    JoinedLobby {
        lobby_id: u64,
        player_number: u8,
    },
    LeftLobby,
    PlayerJoined {
        player_id: u64,
        player_count: usize,
    },
    PlayerDisconnected {
        id: u64,
        player_count: usize,
    },
    LobbyInfo {
        lobby: LobbySummary,
    },
    LobbyList {
        lobbies: Vec<LobbySummary>,
    },
    GameUpdate {
        state: GameSnapshot,
    },
    InitGame {
        state: GameSnapshot,
    },
    ResetGame {
        state: GameSnapshot,
    },
    PauseGame {
        state: GameSnapshot,
    },
    ResumeGame {
        state: GameSnapshot,
    },
    TournamentUpdate {
        tournament: TournamentSummary,
    },
    TournamentFinished {
        winner_id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallState {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
}

impl From<&Ball> for BallState {
    fn from(ball: &Ball) -> Self {
        BallState {
            x: ball.x,
            y: ball.y,
            radius: ball.radius,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaddleState {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl From<&Paddle> for PaddleState {
    fn from(paddle: &Paddle) -> Self {
        PaddleState {
            x: paddle.x,
            y: paddle.y,
            w: paddle.width,
            h: paddle.height,
        }
    }
}

/// Read-only match state broadcast to clients for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub ball: BallState,
    pub paddle1: PaddleState,
    pub paddle2: PaddleState,
    pub score1: u32,
    pub score2: u32,
    pub paused: bool,
    pub running: bool,
    pub game_is_over: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPlayerSummary {
    pub user_id: u64,
    pub player_number: u8,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbySummary {
    pub id: u64,
    pub creator_id: Option<u64>,
    pub max_players: usize,
    pub player_count: usize,
    pub game_started: bool,
    pub players: Vec<LobbyPlayerSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TournamentStatus {
    Pending,
    Ongoing,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingSummary {
    pub player1_id: u64,
    /// None models a bye.
    pub player2_id: Option<u64>,
    pub winner_id: Option<u64>,
    pub is_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSummary {
    pub pairings: Vec<PairingSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentSummary {
    pub status: TournamentStatus,
    pub rounds: Vec<RoundSummary>,
    #[serde(deserialize_with = "deserialize_u64_key_map")]
    pub player_scores: HashMap<u64, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_wire_spelling() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"createLobby","userId":7}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::CreateLobby {
                user_id: 7,
                max_players: None
            }
        );

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"joinLobby","userId":7,"lobbyId":3}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::JoinLobby {
                user_id: 7,
                lobby_id: 3
            }
        );

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"movePaddle","direction":"up"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::MovePaddle {
                direction: Direction::Up
            }
        );

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"startGame"}"#).unwrap();
        assert_eq!(frame, ClientFrame::StartGame);
    }

    #[test]
    fn test_unknown_frame_type_is_an_error() {
        let result = serde_json::from_str::<ClientFrame>(r#"{"type":"fileUpload","data":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"joinLobby"}"#).is_err());
    }

    #[test]
    fn test_server_frame_wire_spelling() {
        let json = serde_json::to_string(&ServerFrame::LobbyCreated {
            lobby_id: 1,
            player_number: 1,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"lobbyCreated","lobbyId":1,"playerNumber":1}"#);

        let json = serde_json::to_string(&ServerFrame::Error {
            message: "lobby is full".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","message":"lobby is full"}"#);

        let json = serde_json::to_string(&ServerFrame::Connection { user_id: None }).unwrap();
        assert_eq!(json, r#"{"type":"connection","userId":null}"#);

        let json = serde_json::to_string(&ServerFrame::LeftLobby).unwrap();
        assert_eq!(json, r#"{"type":"leftLobby"}"#);
    }

    #[test]
    fn test_snapshot_wire_spelling() {
        let snapshot = GameSnapshot {
            ball: BallState {
                x: 400.0,
                y: 300.0,
                radius: 10.0,
            },
            paddle1: PaddleState {
                x: 20.0,
                y: 250.0,
                w: 10.0,
                h: 100.0,
            },
            paddle2: PaddleState {
                x: 770.0,
                y: 250.0,
                w: 10.0,
                h: 100.0,
            },
            score1: 3,
            score2: 5,
            paused: false,
            running: true,
            game_is_over: false,
        };

        let json = serde_json::to_string(&ServerFrame::GameUpdate { state: snapshot }).unwrap();
        assert!(json.starts_with(r#"{"type":"gameUpdate","state":{"ball":"#));
        assert!(json.contains(r#""gameIsOver":false"#));
        assert!(json.contains(r#""score1":3"#));

        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServerFrame::GameUpdate { state: snapshot });
    }

    #[test]
    fn test_snapshot_from_entities() {
        let ball = Ball::centered();
        let paddle = Paddle::for_player(2);

        let ball_state = BallState::from(&ball);
        assert_eq!(ball_state.x, ball.x);
        assert_eq!(ball_state.radius, ball.radius);

        let paddle_state = PaddleState::from(&paddle);
        assert_eq!(paddle_state.x, paddle.x);
        assert_eq!(paddle_state.w, paddle.width);
        assert_eq!(paddle_state.h, paddle.height);
    }

    #[test]
    fn test_tournament_summary_round_trip() {
        let summary = TournamentSummary {
            status: TournamentStatus::Ongoing,
            rounds: vec![RoundSummary {
                pairings: vec![
                    PairingSummary {
                        player1_id: 1,
                        player2_id: Some(2),
                        winner_id: Some(1),
                        is_completed: true,
                    },
                    PairingSummary {
                        player1_id: 3,
                        player2_id: None,
                        winner_id: Some(3),
                        is_completed: true,
                    },
                ],
            }],
            player_scores: HashMap::from([(1, 1), (3, 1)]),
        };

        let json = serde_json::to_string(&ServerFrame::TournamentUpdate {
            tournament: summary.clone(),
        })
        .unwrap();
        assert!(json.contains(r#""status":"ongoing""#));
        assert!(json.contains(r#""isCompleted":true"#));

        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServerFrame::TournamentUpdate { tournament: summary });
    }
}
