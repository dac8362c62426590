use super::events::{Envelope, PresenceValue, EVENT_PRESENCE};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};

pub const OUTBOUND_QUEUE_SIZE: usize = 256;
pub const REQUIRED_PEERS: usize = 2;

/// What the hub holds for each live connection: the identity, the sending
/// half of the bounded outbound queue, and the close notifier that ends the
/// write pump.
#[derive(Clone)]
pub struct PeerHandle {
    pub conn_id: u64,
    pub client_id: String,
    sender: mpsc::Sender<String>,
    closed: Arc<Notify>,
}

impl PeerHandle {
    pub fn new(
        conn_id: u64,
        client_id: String,
        sender: mpsc::Sender<String>,
        closed: Arc<Notify>,
    ) -> Self {
        Self {
            conn_id,
            client_id,
            sender,
            closed,
        }
    }

    fn close(&self) {
        self.closed.notify_one();
    }
}

enum HubCommand {
    Register(PeerHandle),
    Unregister(u64),
    Stop,
}

type PeerMap = Arc<RwLock<HashMap<u64, PeerHandle>>>;

/// Registry of live connections. A single event-loop task applies every
/// membership mutation, so transitions are totally ordered and each presence
/// broadcast reflects the state it follows. Read helpers go through the
/// shared lock. Constructed per process (or per test) and injected, never a
/// global.
pub struct Hub {
    peers: PeerMap,
    commands: mpsc::Sender<HubCommand>,
    next_conn_id: AtomicU64,
}

impl Hub {
    pub fn spawn() -> Arc<Self> {
        // Capacity 1: senders rendezvous with the event loop, keeping
        // membership transitions ordered with their callers.
        let (tx, rx) = mpsc::channel(1);
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));
        let hub = Arc::new(Self {
            peers: Arc::clone(&peers),
            commands: tx.clone(),
            next_conn_id: AtomicU64::new(1),
        });
        tokio::spawn(run_event_loop(peers, rx, tx));
        hub
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, handle: PeerHandle) {
        let _ = self.commands.send(HubCommand::Register(handle)).await;
    }

    pub async fn unregister(&self, conn_id: u64) {
        let _ = self.commands.send(HubCommand::Unregister(conn_id)).await;
    }

    /// Schedule an unregistration from a context that must not block on the
    /// hub, e.g. evicting a slow consumer discovered mid-forward.
    pub fn unregister_later(&self, conn_id: u64) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let _ = commands.send(HubCommand::Unregister(conn_id)).await;
        });
    }

    /// Close every outbound queue and drop all membership. The event loop
    /// exits afterwards.
    pub async fn stop(&self) {
        let _ = self.commands.send(HubCommand::Stop).await;
    }

    pub async fn online_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, sender_conn_id: u64) -> bool {
        self.peers
            .read()
            .await
            .keys()
            .any(|id| *id != sender_conn_id)
    }

    /// Deliver a frame to the one other connected client, if any. Delivery
    /// is a non-blocking enqueue; a full queue fails the send and schedules
    /// the slow client for unregistration.
    pub async fn send_to_peer(&self, sender_conn_id: u64, frame: &str) -> bool {
        let peers = self.peers.read().await;
        for (id, handle) in peers.iter() {
            if *id == sender_conn_id {
                continue;
            }
            match handle.sender.try_send(frame.to_string()) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => {
                    warn!("peer {} outbound queue full, evicting", handle.client_id);
                    self.unregister_later(*id);
                    return false;
                }
                Err(TrySendError::Closed(_)) => continue,
            }
        }
        false
    }
}

async fn run_event_loop(
    peers: PeerMap,
    mut commands: mpsc::Receiver<HubCommand>,
    command_tx: mpsc::Sender<HubCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Register(handle) => {
                let online = {
                    let mut guard = peers.write().await;
                    guard.insert(handle.conn_id, handle);
                    guard.len()
                };
                broadcast_presence(&peers, &command_tx, online).await;
                info!("client connected (online: {})", online);
            }
            HubCommand::Unregister(conn_id) => {
                let removed = {
                    let mut guard = peers.write().await;
                    guard.remove(&conn_id)
                };
                // The hub drops its handle first and then closes the queue,
                // exactly once per connection.
                if let Some(handle) = removed {
                    handle.close();
                    let online = peers.read().await.len();
                    broadcast_presence(&peers, &command_tx, online).await;
                    info!("client disconnected (online: {})", online);
                }
            }
            HubCommand::Stop => {
                let mut guard = peers.write().await;
                for (_, handle) in guard.drain() {
                    handle.close();
                }
                return;
            }
        }
    }
}

async fn broadcast_presence(peers: &PeerMap, command_tx: &mpsc::Sender<HubCommand>, online: usize) {
    let event = Envelope::new(
        EVENT_PRESENCE,
        PresenceValue {
            online,
            required: REQUIRED_PEERS,
        },
    );
    let Ok(frame) = event.marshal() else {
        return;
    };

    let guard = peers.read().await;
    for (id, handle) in guard.iter() {
        match handle.sender.try_send(frame.clone()) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                let command_tx = command_tx.clone();
                let conn_id = *id;
                tokio::spawn(async move {
                    let _ = command_tx.send(HubCommand::Unregister(conn_id)).await;
                });
            }
        }
    }
}
