//! Performance benchmarks for critical session systems

use std::time::Instant;

use server::game::MatchSession;
use shared::frames::ServerFrame;
use shared::{ball_hits_paddle, Ball, Paddle};

/// Benchmarks the contact predicate
#[test]
fn benchmark_contact_detection() {
    let paddle = Paddle::for_player(2);
    let mut ball = Ball::centered();
    ball.x = paddle.x - ball.radius - 1.0;
    ball.y = paddle.center_y();

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = ball_hits_paddle(&ball, &paddle);
    }

    let duration = start.elapsed();
    println!(
        "Contact detection: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 100ms for 100k iterations
    assert!(duration.as_millis() < 100);
}

/// Benchmarks full simulation ticks
#[test]
fn benchmark_session_tick_throughput() {
    let mut session = MatchSession::new(1, 2, u32::MAX);
    session.start();
    session.ball.speed_y = 9.0;

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        session.tick();
    }

    let duration = start.elapsed();
    let per_tick = duration.as_nanos() as f64 / iterations as f64;
    println!(
        "Session tick: {} iterations in {:?} ({:.2} ns/tick)",
        iterations, duration, per_tick
    );

    // 100k ticks is ~28 minutes of play; simulating it should take well
    // under a second of wall time
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks snapshot serialization, the per-tick broadcast cost
#[test]
fn benchmark_snapshot_serialization() {
    let mut session = MatchSession::new(1, 2, 10);
    session.start();

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = ServerFrame::GameUpdate {
            state: session.snapshot(),
        };
        let _ = serde_json::to_string(&frame).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Snapshot serialization: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks a 60 Hz tick budget end to end: tick plus serialize must fit
/// well inside the 16.6ms frame
#[test]
fn benchmark_tick_budget() {
    let mut session = MatchSession::new(1, 2, u32::MAX);
    session.start();
    session.ball.speed_y = 7.0;

    let ticks = 600; // ten seconds of play
    let start = Instant::now();

    for _ in 0..ticks {
        session.tick();
        let frame = ServerFrame::GameUpdate {
            state: session.snapshot(),
        };
        let _ = serde_json::to_string(&frame).unwrap();
    }

    let duration = start.elapsed();
    let per_tick_us = duration.as_micros() as f64 / ticks as f64;
    println!(
        "Tick + broadcast encode: {} ticks in {:?} ({:.2} μs/tick)",
        ticks, duration, per_tick_us
    );

    // A 60 Hz tick has a 16,666 μs budget
    assert!(per_tick_us < 16_666.0);
}
