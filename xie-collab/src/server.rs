//! WebSocket listener and per-connection pumps.
//!
//! ```text
//!            ┌── reader task ── text frames ──► ConnectionManager::on_message
//! TcpStream ─┤
//!            └── writer loop ◄── outbound / close channels
//! ```
//!
//! The writer loop owns the sink. It ends on a close request, a dead
//! socket, or the reader finishing, and the peer is then dropped from the
//! manager whatever the cause.

use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;

use crate::peers::{ConnectionManager, PeerChannels};
use crate::protocol::ProtocolError;

/// How long a closing connection waits for the client to finish its side.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub struct CollabServer {
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
}

impl CollabServer {
    pub async fn bind(addr: &str, manager: Arc<ConnectionManager>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.local_addr() {
            Ok(addr) => log::info!("Listening for editors on {addr}"),
            Err(e) => log::warn!("Listening on an unknown address: {e}"),
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        tokio::spawn(handle_connection(stream, addr, self.manager.clone()));
                    }
                    Err(e) => log::error!("Accept failed: {e}"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Listener exiting");
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, manager: Arc<ConnectionManager>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let PeerChannels {
        id,
        mut outbound,
        mut close,
    } = manager.accept(addr).await;

    let reader_manager = manager.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => reader_manager.on_message(id, text.as_str()).await,
                Ok(Message::Binary(_)) => {
                    reader_manager
                        .close_peer(id, &ProtocolError::BinaryFrame.to_string())
                        .await;
                    break;
                }
                Ok(Message::Close(_)) => break,
                // Ping and pong are answered by tungstenite
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Read error from peer {id}: {e}");
                    break;
                }
            }
        }
    });

    let mut reader_done = false;
    loop {
        tokio::select! {
            biased;
            Some(reason) = close.recv() => {
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: reason.into(),
                };
                if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
                    log::debug!("Failed to send close frame to peer {id}: {e}");
                }
                break;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = ws_sender.send(Message::text(text)).await {
                    log::debug!("Write to peer {id} failed: {e}");
                    break;
                }
            }
            _ = &mut reader => {
                reader_done = true;
                break;
            }
        }
    }

    if reader_done {
        // Completes the closing handshake the client started
        let _ = ws_sender.close().await;
    } else if tokio::time::timeout(CLOSE_GRACE, &mut reader).await.is_err() {
        reader.abort();
    }
    manager.on_disconnect(id).await;
}
