use clap::Parser;
use log::info;
use std::sync::Arc;

use server::gateway::{InMemoryIdentity, InMemoryPersistence};
use server::network::Server;
use server::router::Router;

/// Parses command-line arguments, wires the gateways, and serves until
/// interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Points needed to win a match
        #[clap(short, long, default_value_t = shared::DEFAULT_SCORE_LIMIT)]
        score_limit: u32,
    }

    env_logger::init();
    let args = Args::parse();

    // Stand-alone defaults: guests resolve permissively and records live
    // in memory. A deployment swaps in gateway implementations backed by
    // the real user store and database.
    let identity = Arc::new(InMemoryIdentity::permissive());
    let persistence = Arc::new(InMemoryPersistence::new());
    let router = Arc::new(Router::new(identity, persistence, args.score_limit));

    let server = Server::new(router);
    let addr = format!("{}:{}", args.host, args.port);

    tokio::select! {
        result = server.run(&addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}
