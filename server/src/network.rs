//! WebSocket transport: accept loop plus one reader and one writer task
//! per connection. Everything protocol-shaped lives in the router; this
//! module only moves text frames.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::router::Router;

pub struct Server {
    router: Arc<Router>,
}

impl Server {
    pub fn new(router: Arc<Router>) -> Self {
        Server { router }
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Binds and serves until the task is dropped. Each accepted socket
    /// gets its own handler task; a failed handshake only costs that
    /// socket.
    pub async fn run(&self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(router, stream, peer).await {
                    debug!("connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    router: Arc<Router>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let websocket = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = websocket.split();

    // The writer task drains the per-connection queue the registry holds
    // the sending half of.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let conn = router.register_connection(peer, tx.clone()).await;
    debug!("connection {} accepted from {}", conn, peer);

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => router.handle_text(conn, text.as_str()).await,
            Ok(Message::Ping(payload)) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                warn!("dropping binary frame from connection {}", conn);
            }
            Ok(_) => {}
            Err(e) => {
                debug!("read error on connection {}: {}", conn, e);
                break;
            }
        }
    }

    router.handle_disconnect(conn).await;
    writer.abort();
    Ok(())
}
