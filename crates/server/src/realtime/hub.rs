//! Connection registry and fan-out
//!
//! A user may hold several sockets (tabs, devices). They count as online
//! while at least one is open. Each socket is tied to the session token it
//! authenticated with, so revoking the session closes the socket too.

use super::events::ServerEvent;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events buffered per socket before the client counts as stalled
pub const CONNECTION_QUEUE: usize = 256;

pub type EventSender = mpsc::Sender<ServerEvent>;
pub type EventReceiver = mpsc::Receiver<ServerEvent>;

struct Connection {
    tx: EventSender,
    token: String,
    closed: Arc<Notify>,
}

/// Handle returned to a freshly registered socket
pub struct Registration {
    pub conn_id: Uuid,
    pub rx: EventReceiver,
    /// This is the user's only open socket
    pub first: bool,
    /// Fires when the hub drops the socket (session revoked, queue full)
    pub closed: Arc<Notify>,
}

#[derive(Default)]
pub struct Hub {
    connections: RwLock<HashMap<String, HashMap<Uuid, Connection>>>,
    /// Accounts reported online without a socket (the assistant)
    pinned: RwLock<HashSet<String>>,
    /// Serialises presence writes against connect/disconnect races
    presence: Mutex<()>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, user_id: &str, token: &str) -> Registration {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        let conn_id = Uuid::new_v4();
        let closed = Arc::new(Notify::new());

        let mut connections = self.connections.write();
        let user_conns = connections.entry(user_id.to_string()).or_default();
        user_conns.insert(
            conn_id,
            Connection {
                tx,
                token: token.to_string(),
                closed: closed.clone(),
            },
        );
        let first = user_conns.len() == 1;

        info!("[Hub] {} connected ({} open)", user_id, user_conns.len());
        Registration {
            conn_id,
            rx,
            first,
            closed,
        }
    }

    /// Forget a socket. Returns true when the user has no socket left.
    pub fn disconnect(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut connections = self.connections.write();
        let Some(user_conns) = connections.get_mut(user_id) else {
            return true;
        };
        if user_conns.remove(&conn_id).is_some() {
            info!("[Hub] {} disconnected ({} open)", user_id, user_conns.len());
        }
        if user_conns.is_empty() {
            connections.remove(user_id);
            true
        } else {
            false
        }
    }

    /// Drop the listed sockets and wake their tasks so they shut down
    fn close(&self, targets: &[(String, Uuid)]) -> usize {
        let mut connections = self.connections.write();
        let mut closed = 0;
        for (user_id, conn_id) in targets {
            let Some(user_conns) = connections.get_mut(user_id) else {
                continue;
            };
            if let Some(conn) = user_conns.remove(conn_id) {
                conn.closed.notify_one();
                closed += 1;
            }
            if user_conns.is_empty() {
                connections.remove(user_id);
            }
        }
        closed
    }

    /// Close every socket opened with this session token
    pub fn close_session(&self, token: &str) -> usize {
        let targets: Vec<(String, Uuid)> = self
            .connections
            .read()
            .iter()
            .flat_map(|(user_id, conns)| {
                conns
                    .iter()
                    .filter(|(_, conn)| conn.token == token)
                    .map(move |(conn_id, _)| (user_id.clone(), *conn_id))
            })
            .collect();
        let closed = self.close(&targets);
        if closed > 0 {
            info!("[Hub] Closed {} socket(s) of a revoked session", closed);
        }
        closed
    }

    /// Close every socket of a user
    pub fn close_user(&self, user_id: &str) -> usize {
        let targets: Vec<(String, Uuid)> = self
            .connections
            .read()
            .get(user_id)
            .map(|conns| {
                conns
                    .keys()
                    .map(|conn_id| (user_id.to_string(), *conn_id))
                    .collect()
            })
            .unwrap_or_default();
        let closed = self.close(&targets);
        if closed > 0 {
            info!("[Hub] Closed {} socket(s) of {}", closed, user_id);
        }
        closed
    }

    /// Held while a presence change is written and announced
    pub async fn presence_lock(&self) -> MutexGuard<'_, ()> {
        self.presence.lock().await
    }

    pub fn pin_online(&self, user_id: &str) {
        self.pinned.write().insert(user_id.to_string());
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.pinned.read().contains(user_id) || self.connections.read().contains_key(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        for pinned in self.pinned.read().iter() {
            if !ids.contains(pinned) {
                ids.push(pinned.clone());
            }
        }
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().values().map(HashMap::len).sum()
    }

    /// Queue an event on every matching socket, then close the ones that
    /// stopped draining their queue
    fn deliver<F>(&self, event: &ServerEvent, mut wants: F) -> usize
    where
        F: FnMut(&str, &Uuid) -> bool,
    {
        let mut delivered = 0;
        let mut stalled = Vec::new();
        {
            let connections = self.connections.read();
            for (user_id, conns) in connections.iter() {
                for (conn_id, conn) in conns.iter() {
                    if !wants(user_id.as_str(), conn_id) {
                        continue;
                    }
                    match conn.tx.try_send(event.clone()) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            stalled.push((user_id.clone(), *conn_id));
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
        }

        if !stalled.is_empty() {
            warn!("[Hub] Dropping {} stalled socket(s)", stalled.len());
            self.close(&stalled);
        }
        delivered
    }

    /// Deliver to one socket
    pub fn send_to_connection(&self, user_id: &str, conn_id: Uuid, event: ServerEvent) {
        self.deliver(&event, |user, conn| user == user_id && *conn == conn_id);
    }

    /// Deliver to every socket of one user
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        self.deliver(event, |user, _| user == user_id);
    }

    /// Deliver to every socket of each listed user
    pub fn send_to_users<I, S>(&self, user_ids: I, event: &ServerEvent)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: HashSet<String> = user_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        let delivered = self.deliver(event, |user, _| targets.contains(user));
        debug!("[Hub] fan-out reached {} sockets", delivered);
    }

    /// Deliver to everyone connected
    pub fn broadcast(&self, event: &ServerEvent) {
        self.deliver(event, |_, _| true);
    }
}
