//! Connected peers and the dispatcher that feeds them.
//!
//! ```text
//!  socket reader ──on_message──► ConnectionManager ──► EditSessionHandler
//!                                     │   ▲
//!  socket writer ◄── outbound/close ──┘   └── run_dispatcher ◄── DispatchQueue
//! ```
//!
//! Each peer owns two channels drained by its socket writer: `outbound` for
//! text frames and `close` for a single close request. The manager maps
//! peers to session keys, enforces the message order of the protocol, and
//! turns every violation into a close with a readable reason.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;
use xie_core::ChangeSet;

use crate::broadcast::{AtomicFanoutStats, ChangeBroadcast, Dispatch, FanoutStats, TerminationReason};
use crate::orchestrator::ChangeRejected;
use crate::protocol::{close_reason, ClientMessage, ProtocolError, Selection, ServerMessage, SessionStart};

/// How long the dispatcher waits on one peer's full outbound queue
/// before giving up on that peer.
const SLOW_PEER_TIMEOUT: Duration = Duration::from_secs(5);

const UNEXPECTED_SESSION: &str = "We are not expecting a session with this key.";
const SESSION_NOT_OPEN: &str = "Session is no longer open";
const SLOW_PEER: &str = "Falling too far behind; reconnect to resume";

/// The editing side a connection talks to once it has a session key.
#[async_trait]
pub trait EditSessionHandler: Send + Sync {
    /// Claim a requested session; `None` refuses the key.
    async fn start_session(&self, session_key: &str) -> Option<SessionStart>;

    async fn is_session_open(&self, session_key: &str) -> bool;

    /// A `CHANGE` from the session's client. `Err` ends the connection.
    async fn change_received(
        &self,
        session_key: &str,
        base_revision: usize,
        selection: Selection,
        change: Option<ChangeSet>,
    ) -> Result<(), ChangeRejected>;

    /// The session's transport is gone.
    async fn session_closed(&self, session_key: &str);
}

/// Receiving halves for one accepted connection's writer.
pub struct PeerChannels {
    pub id: Uuid,
    pub outbound: mpsc::Receiver<String>,
    pub close: mpsc::Receiver<String>,
}

struct ConnectedPeer {
    client_addr: SocketAddr,
    connected_at: Instant,
    last_active: Instant,
    /// Bound as soon as the peer announces it, before `HELLO` is queued
    session_key: Option<String>,
    /// False until `HELLO` is queued; updates wait in `pending` until then
    greeted: bool,
    pending: Vec<String>,
    outbound: mpsc::Sender<String>,
    close: mpsc::Sender<String>,
}

impl ConnectedPeer {
    /// Request a close. Only the first request per peer is kept.
    fn request_close(&self, reason: &str) -> bool {
        self.close.try_send(close_reason(reason)).is_ok()
    }
}

pub struct ConnectionManager {
    handler: Arc<dyn EditSessionHandler>,
    outbound_capacity: usize,
    peers: RwLock<HashMap<Uuid, ConnectedPeer>>,
    stats: AtomicFanoutStats,
}

impl ConnectionManager {
    pub fn new(handler: Arc<dyn EditSessionHandler>, outbound_capacity: usize) -> Self {
        Self {
            handler,
            outbound_capacity: outbound_capacity.max(1),
            peers: RwLock::new(HashMap::new()),
            stats: AtomicFanoutStats::default(),
        }
    }

    /// Register a freshly upgraded connection.
    pub async fn accept(&self, client_addr: SocketAddr) -> PeerChannels {
        let id = Uuid::new_v4();
        let (outbound_tx, outbound) = mpsc::channel(self.outbound_capacity);
        let (close_tx, close) = mpsc::channel(1);
        self.peers.write().await.insert(
            id,
            ConnectedPeer {
                client_addr,
                connected_at: Instant::now(),
                last_active: Instant::now(),
                session_key: None,
                greeted: false,
                pending: Vec::new(),
                outbound: outbound_tx,
                close: close_tx,
            },
        );
        log::info!("Peer {id} connected from {client_addr}");
        PeerChannels { id, outbound, close }
    }

    /// Ask a peer's writer to send a close frame with `reason`.
    pub async fn close_peer(&self, id: Uuid, reason: &str) {
        if let Some(peer) = self.peers.read().await.get(&id) {
            if peer.request_close(reason) {
                self.stats.record_close();
                log::info!("Closing peer {id} ({}): {reason}", peer.client_addr);
            }
        }
    }

    /// Handle one text frame from a peer.
    pub async fn on_message(&self, id: Uuid, text: &str) {
        let session_key = match self.peers.write().await.get_mut(&id) {
            Some(peer) => {
                peer.last_active = Instant::now();
                peer.session_key.clone()
            }
            None => {
                log::warn!("Message from peer {id}, which is no longer on our list");
                return;
            }
        };

        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => return self.close_peer(id, &e.to_string()).await,
        };

        match (msg, session_key) {
            (ClientMessage::SessionKey(_), Some(_)) => {
                self.close_peer(id, &ProtocolError::DuplicateSessionKey.to_string())
                    .await
            }
            (ClientMessage::SessionKey(key), None) => self.announce(id, key).await,
            (_, None) => {
                self.close_peer(id, &ProtocolError::NotAnnounced.to_string())
                    .await
            }
            (ClientMessage::Ping, Some(key)) => {
                if !self.handler.is_session_open(&key).await {
                    self.close_peer(id, SESSION_NOT_OPEN).await;
                }
            }
            (
                ClientMessage::Change {
                    base_revision,
                    selection,
                    change,
                },
                Some(key),
            ) => {
                if let Err(rejected) = self
                    .handler
                    .change_received(&key, base_revision, selection, change)
                    .await
                {
                    log::warn!("Session {key} sent a rejected change: {rejected}");
                    self.close_peer(id, &rejected.to_string()).await;
                }
            }
        }
    }

    /// Bind a session key to a peer and greet it.
    ///
    /// The key is bound before the handler is asked, so any update routed
    /// to the session from then on is held in `pending` and flushed right
    /// behind `HELLO`. The peer lock is released while the handler runs.
    async fn announce(&self, id: Uuid, key: String) {
        match self.peers.write().await.get_mut(&id) {
            Some(peer) => peer.session_key = Some(key.clone()),
            None => return,
        }

        let start = self.handler.start_session(&key).await;

        let mut peers = self.peers.write().await;
        // Gone already; on_disconnect has released the session
        let Some(peer) = peers.get_mut(&id) else {
            return;
        };
        let Some(start) = start else {
            log::info!("Peer {id} announced unexpected session key {key}");
            peer.session_key = None;
            peer.pending.clear();
            if peer.request_close(UNEXPECTED_SESSION) {
                self.stats.record_close();
            }
            return;
        };
        let hello = match ServerMessage::Hello(start).encode() {
            Ok(hello) => hello,
            Err(e) => {
                log::error!("Failed to encode HELLO for session {key}: {e}");
                if peer.request_close(&e.to_string()) {
                    self.stats.record_close();
                }
                return;
            }
        };

        peer.greeted = true;
        let held = std::mem::take(&mut peer.pending);
        for text in std::iter::once(hello).chain(held) {
            if peer.outbound.try_send(text).is_ok() {
                self.stats.record_sent();
            } else {
                self.stats.record_dropped();
            }
        }
        log::info!("Peer {id} bound to session {key}");
    }

    /// Forget a peer whose socket has closed, and end its session.
    pub async fn on_disconnect(&self, id: Uuid) {
        let removed = self.peers.write().await.remove(&id);
        let Some(peer) = removed else {
            return;
        };
        log::info!(
            "Peer {id} from {} disconnected after {:?} ({:?} idle)",
            peer.client_addr,
            peer.connected_at.elapsed(),
            peer.last_active.elapsed()
        );
        if let Some(key) = peer.session_key {
            self.handler.session_closed(&key).await;
        }
    }

    /// Drain orchestrator instructions until the queue closes or
    /// `shutdown` flips to true.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<Dispatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let dispatch = tokio::select! {
                next = queue.recv() => match next {
                    Some(dispatch) => dispatch,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            match dispatch {
                Dispatch::Broadcast(change) => self.deliver(change).await,
                Dispatch::Terminate {
                    session_keys,
                    reason,
                } => self.terminate(&session_keys, reason).await,
            }
        }
        log::info!("Dispatcher exiting");
    }

    /// `UPDATE` to every receiver except the source; `ACKCHANGE` to the
    /// source when the broadcast carries a change.
    async fn deliver(&self, change: ChangeBroadcast) {
        let update = ServerMessage::Update {
            revision_id: change.new_revision,
            source_session_key: change.source_session_key.clone(),
            selections: change.selections,
            change: change.change.clone(),
        };
        let update = match update.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode UPDATE: {e}");
                return;
            }
        };
        let ack = change.change.is_some().then(|| {
            ServerMessage::AckChange {
                base_revision: change.base_revision,
                new_revision: change.new_revision,
            }
            .encode()
        });
        let ack = match ack.transpose() {
            Ok(ack) => ack,
            Err(e) => {
                log::error!("Failed to encode ACKCHANGE: {e}");
                return;
            }
        };

        // Pick each receiver's frame under the lock; never await a send there
        let mut targets: Vec<(Uuid, String, mpsc::Sender<String>)> = Vec::new();
        {
            let mut peers = self.peers.write().await;
            for (id, peer) in peers.iter_mut() {
                let Some(key) = peer.session_key.as_ref() else {
                    continue;
                };
                if !change.receivers.contains(key) {
                    continue;
                }
                let text = if *key == change.source_session_key {
                    match &ack {
                        Some(ack) => ack.clone(),
                        None => continue,
                    }
                } else {
                    update.clone()
                };
                if peer.greeted {
                    targets.push((*id, text, peer.outbound.clone()));
                } else {
                    peer.pending.push(text);
                }
            }
        }

        for (id, text, tx) in targets {
            match tokio::time::timeout(SLOW_PEER_TIMEOUT, tx.send(text)).await {
                Ok(Ok(())) => self.stats.record_sent(),
                Ok(Err(_)) => self.stats.record_dropped(),
                Err(_) => {
                    self.stats.record_dropped();
                    log::warn!("Peer {id} is not draining its queue");
                    self.close_peer(id, SLOW_PEER).await;
                }
            }
        }
    }

    async fn terminate(&self, session_keys: &HashSet<String>, reason: TerminationReason) {
        let peers = self.peers.read().await;
        let reason = reason.to_string();
        for (id, peer) in peers.iter() {
            let bound = peer
                .session_key
                .as_ref()
                .is_some_and(|key| session_keys.contains(key));
            if bound && peer.request_close(&reason) {
                self.stats.record_close();
                log::info!("Terminating peer {id}: {reason}");
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> FanoutStats {
        let active = self.peers.read().await.len();
        self.stats.snapshot(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use xie_core::DocumentError;

    #[derive(Default)]
    struct FakeHandler {
        expected: Mutex<HashSet<String>>,
        open: Mutex<HashSet<String>>,
        closed: Mutex<Vec<String>>,
        changes: Mutex<Vec<(String, usize, Option<ChangeSet>)>>,
    }

    impl FakeHandler {
        fn expecting(keys: &[&str]) -> Arc<Self> {
            let handler = Self::default();
            handler
                .expected
                .lock()
                .unwrap()
                .extend(keys.iter().map(|k| k.to_string()));
            Arc::new(handler)
        }
    }

    #[async_trait]
    impl EditSessionHandler for FakeHandler {
        async fn start_session(&self, session_key: &str) -> Option<SessionStart> {
            if !self.expected.lock().unwrap().remove(session_key) {
                return None;
            }
            self.open.lock().unwrap().insert(session_key.to_string());
            Some(SessionStart {
                name: "Doc".to_string(),
                revision_id: 0,
                text: vec![],
                peer_selections: vec![],
            })
        }

        async fn is_session_open(&self, session_key: &str) -> bool {
            self.open.lock().unwrap().contains(session_key)
        }

        async fn change_received(
            &self,
            session_key: &str,
            base_revision: usize,
            _selection: Selection,
            change: Option<ChangeSet>,
        ) -> Result<(), ChangeRejected> {
            if base_revision > 0 {
                return Err(ChangeRejected::Rejected(DocumentError::UnknownRevision {
                    base: base_revision,
                    head: 0,
                }));
            }
            self.changes
                .lock()
                .unwrap()
                .push((session_key.to_string(), base_revision, change));
            Ok(())
        }

        async fn session_closed(&self, session_key: &str) {
            self.open.lock().unwrap().remove(session_key);
            self.closed.lock().unwrap().push(session_key.to_string());
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn connected(manager: &ConnectionManager, key: &str) -> PeerChannels {
        let mut channels = manager.accept(addr()).await;
        manager
            .on_message(channels.id, &format!("SESSIONKEY {key}"))
            .await;
        let hello = channels.outbound.try_recv().unwrap();
        assert!(hello.starts_with("HELLO "), "{hello}");
        channels
    }

    #[tokio::test]
    async fn test_hello_on_expected_key() {
        let handler = FakeHandler::expecting(&["S-a"]);
        let manager = ConnectionManager::new(handler.clone(), 8);
        let mut channels = connected(&manager, "S-a").await;
        assert!(channels.close.try_recv().is_err());
        assert_eq!(manager.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_unexpected_key_closes() {
        let manager = ConnectionManager::new(FakeHandler::expecting(&[]), 8);
        let mut channels = manager.accept(addr()).await;
        manager.on_message(channels.id, "SESSIONKEY S-zzz").await;
        assert_eq!(channels.close.try_recv().unwrap(), UNEXPECTED_SESSION);
        assert!(channels.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_protocol_violations_close() {
        let handler = FakeHandler::expecting(&["S-a"]);
        let manager = ConnectionManager::new(handler, 8);

        let mut early = manager.accept(addr()).await;
        manager.on_message(early.id, "PING").await;
        assert_eq!(
            early.close.try_recv().unwrap(),
            ProtocolError::NotAnnounced.to_string()
        );

        let mut garbage = manager.accept(addr()).await;
        manager.on_message(garbage.id, "HELLO there").await;
        assert!(garbage
            .close
            .try_recv()
            .unwrap()
            .starts_with("You shouldn't have said that"));

        let mut twice = connected(&manager, "S-a").await;
        manager.on_message(twice.id, "SESSIONKEY S-a").await;
        assert_eq!(
            twice.close.try_recv().unwrap(),
            ProtocolError::DuplicateSessionKey.to_string()
        );
    }

    #[tokio::test]
    async fn test_ping_after_session_ends() {
        let handler = FakeHandler::expecting(&["S-a"]);
        let manager = ConnectionManager::new(handler.clone(), 8);
        let mut channels = connected(&manager, "S-a").await;

        manager.on_message(channels.id, "PING").await;
        assert!(channels.close.try_recv().is_err());

        handler.open.lock().unwrap().clear();
        manager.on_message(channels.id, "PING").await;
        assert_eq!(channels.close.try_recv().unwrap(), SESSION_NOT_OPEN);
    }

    #[tokio::test]
    async fn test_change_forwarded_and_rejections_close() {
        let handler = FakeHandler::expecting(&["S-a"]);
        let manager = ConnectionManager::new(handler.clone(), 8);
        let mut channels = connected(&manager, "S-a").await;

        manager
            .on_message(
                channels.id,
                r#"CHANGE 0 {"start":0,"end":0} {"lengthBefore":0,"lengthAfter":1,"items":[{"glyph":"x"}]}"#,
            )
            .await;
        let changes = handler.changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "S-a");
        assert!(changes[0].2.is_some());

        manager
            .on_message(channels.id, r#"CHANGE 4 {"start":0,"end":0}"#)
            .await;
        assert!(channels
            .close
            .try_recv()
            .unwrap()
            .starts_with("We don't like this change"));
    }

    #[tokio::test]
    async fn test_dispatch_update_and_ack() {
        let handler = FakeHandler::expecting(&["S-a", "S-b"]);
        let manager = Arc::new(ConnectionManager::new(handler, 8));
        let mut alice = connected(&manager, "S-a").await;
        let mut bob = connected(&manager, "S-b").await;

        let receivers = HashSet::from(["S-a".to_string(), "S-b".to_string()]);
        manager
            .deliver(ChangeBroadcast {
                source_session_key: "S-a".to_string(),
                base_revision: 0,
                new_revision: 1,
                receivers: receivers.clone(),
                selections: vec![],
                change: Some("0>X".parse().unwrap()),
            })
            .await;
        assert_eq!(alice.outbound.try_recv().unwrap(), "ACKCHANGE 0 1");
        assert!(bob
            .outbound
            .try_recv()
            .unwrap()
            .starts_with("UPDATE 1 S-a [] {"));

        // Selection-only: no ack for the source
        manager
            .deliver(ChangeBroadcast {
                source_session_key: "S-a".to_string(),
                base_revision: 1,
                new_revision: 1,
                receivers,
                selections: vec![],
                change: None,
            })
            .await;
        assert!(alice.outbound.try_recv().is_err());
        assert_eq!(bob.outbound.try_recv().unwrap(), "UPDATE 1 S-a []");

        let stats = manager.stats().await;
        assert_eq!(stats.active_peers, 2);
        // Two HELLOs plus three deliveries
        assert_eq!(stats.messages_sent, 5);
    }

    #[tokio::test]
    async fn test_updates_held_until_hello() {
        let handler = FakeHandler::expecting(&["S-b"]);
        let manager = ConnectionManager::new(handler, 8);
        let mut bob = manager.accept(addr()).await;

        // Key bound but not yet greeted, as while the handler is starting it
        manager
            .peers
            .write()
            .await
            .get_mut(&bob.id)
            .unwrap()
            .session_key = Some("S-b".to_string());
        manager
            .deliver(ChangeBroadcast {
                source_session_key: "S-a".to_string(),
                base_revision: 0,
                new_revision: 1,
                receivers: HashSet::from(["S-a".to_string(), "S-b".to_string()]),
                selections: vec![],
                change: Some("0>X".parse().unwrap()),
            })
            .await;
        assert!(bob.outbound.try_recv().is_err());

        manager.announce(bob.id, "S-b".to_string()).await;
        assert!(bob.outbound.try_recv().unwrap().starts_with("HELLO "));
        assert!(bob.outbound.try_recv().unwrap().starts_with("UPDATE 1 S-a "));
    }

    #[tokio::test]
    async fn test_dispatcher_terminates_sessions() {
        let handler = FakeHandler::expecting(&["S-a", "S-b"]);
        let manager = Arc::new(ConnectionManager::new(handler, 8));
        let mut alice = connected(&manager, "S-a").await;
        let mut bob = connected(&manager, "S-b").await;

        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(Dispatch::Terminate {
            session_keys: HashSet::from(["S-b".to_string()]),
            reason: TerminationReason::IdleTimeout,
        })
        .unwrap();
        drop(tx);
        manager.clone().run_dispatcher(rx, shutdown_rx).await;

        assert!(alice.close.try_recv().is_err());
        assert_eq!(
            bob.close.try_recv().unwrap(),
            TerminationReason::IdleTimeout.to_string()
        );
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let handler = FakeHandler::expecting(&["S-a"]);
        let manager = ConnectionManager::new(handler.clone(), 8);
        let channels = connected(&manager, "S-a").await;
        let anonymous = manager.accept(addr()).await;

        manager.on_disconnect(channels.id).await;
        manager.on_disconnect(anonymous.id).await;
        assert_eq!(*handler.closed.lock().unwrap(), vec!["S-a".to_string()]);
        assert_eq!(manager.peer_count().await, 0);

        // Messages from a forgotten peer are ignored
        manager.on_message(channels.id, "PING").await;
    }
}
