//! # Match & Tournament Session Server
//!
//! The authoritative session layer for networked Pong: it admits players
//! over persistent WebSocket connections, groups them into lobbies, runs
//! one fixed-rate simulation per active match, and coordinates
//! multi-round tournament brackets on top of the same match primitive.
//!
//! ## Architecture
//!
//! Inbound frames flow `network` -> `router` -> lobby/session/tournament
//! operations; outbound frames fan back out through the `registry`. Each
//! running match is driven by its own 60 Hz ticker task (`session`),
//! independent of inbound traffic, and torn down through cancellation
//! tokens when its lobby dies. Everything durable goes through the
//! `gateway` contracts, best-effort: a persistence failure is logged and
//! in-memory state stays authoritative.
//!
//! ## Module Organization
//!
//! - [`game`]: the per-match state machine (ball, paddles, scoring,
//!   sub-stepped tick)
//! - [`lobby`]: player slots, readiness, start gating, and the manager
//!   owning every lobby behind its own lock
//! - [`tournament`]: pure bracket scheduling (deterministic pairing,
//!   round completion, winner advancement)
//! - [`session`]: ticker tasks and the tournament coordinator
//! - [`registry`]: connection bookkeeping and broadcast primitives
//! - [`router`]: frame decoding and dispatch; the only module that knows
//!   about connections
//! - [`network`]: the WebSocket accept loop and per-socket tasks
//! - [`gateway`]: identity and persistence contracts with in-memory
//!   reference implementations

pub mod game;
pub mod gateway;
pub mod lobby;
pub mod network;
pub mod registry;
pub mod router;
pub mod session;
pub mod tournament;
