use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use courier_types::events::ServerEvent;

/// Broadcast group key: every user has a personal group, every chat has one
/// group. Groups are independent; no cross-group ordering exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupId {
    User(Uuid),
    Chat(Uuid),
}

struct ConnectionEntry {
    user_id: Option<Uuid>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Tracks which user each live connection speaks for and which broadcast
/// groups it has joined. All membership state lives here; nothing else in
/// the system holds connection state.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// conn_id -> identity + delivery channel
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,

    /// group -> member connection ids
    groups: RwLock<HashMap<GroupId, HashSet<Uuid>>>,
}

/// What `leave_all` found when tearing a connection down.
pub struct Departure {
    pub user_id: Uuid,
    /// True when no other live connection speaks for this user.
    pub last_for_user: bool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: RwLock::new(HashMap::new()),
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Admit a connection with its delivery channel. Called once per socket
    /// before any command is processed.
    pub async fn register(&self, conn_id: Uuid, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, ConnectionEntry { user_id: None, tx });
    }

    /// Bind a connection to a user identity. Returns true when this is the
    /// user's first live connection (the caller flips them online). Unknown
    /// connection ids are a no-op returning false.
    pub async fn bind_user(&self, conn_id: Uuid, user_id: Uuid) -> bool {
        let mut connections = self.inner.connections.write().await;

        let already_connected = connections
            .iter()
            .any(|(id, entry)| *id != conn_id && entry.user_id == Some(user_id));

        match connections.get_mut(&conn_id) {
            Some(entry) => {
                entry.user_id = Some(user_id);
                !already_connected
            }
            None => false,
        }
    }

    /// Add a connection to a group. Idempotent; unknown connections are a
    /// no-op (the socket is already gone).
    pub async fn join(&self, conn_id: Uuid, group: GroupId) {
        if !self.inner.connections.read().await.contains_key(&conn_id) {
            debug!("join for unknown connection {}, ignoring", conn_id);
            return;
        }

        self.inner
            .groups
            .write()
            .await
            .entry(group)
            .or_default()
            .insert(conn_id);
    }

    pub async fn is_member(&self, group: GroupId, conn_id: Uuid) -> bool {
        self.inner
            .groups
            .read()
            .await
            .get(&group)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// Snapshot the delivery channels of a group's current members. Each map
    /// is locked on its own and released before the caller sends anything.
    pub async fn members(&self, group: GroupId) -> Vec<(Uuid, mpsc::UnboundedSender<ServerEvent>)> {
        let member_ids: Vec<Uuid> = {
            let groups = self.inner.groups.read().await;
            match groups.get(&group) {
                Some(members) => members.iter().copied().collect(),
                None => return vec![],
            }
        };

        let connections = self.inner.connections.read().await;
        member_ids
            .iter()
            .filter_map(|id| {
                connections
                    .get(id)
                    .map(|entry| (*id, entry.tx.clone()))
            })
            .collect()
    }

    pub async fn sender_of(&self, conn_id: Uuid) -> Option<mpsc::UnboundedSender<ServerEvent>> {
        self.inner
            .connections
            .read()
            .await
            .get(&conn_id)
            .map(|entry| entry.tx.clone())
    }

    /// Remove a connection from every group and drop it. Returns the bound
    /// user (if any) and whether this was their last live connection; the
    /// caller persists the offline flip. Unknown connections are a no-op.
    pub async fn leave_all(&self, conn_id: Uuid) -> Option<Departure> {
        let mut connections = self.inner.connections.write().await;
        let entry = connections.remove(&conn_id)?;

        let mut groups = self.inner.groups.write().await;
        groups.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
        drop(groups);

        let user_id = entry.user_id?;
        let last_for_user = !connections
            .values()
            .any(|other| other.user_id == Some(user_id));

        Some(Departure {
            user_id,
            last_for_user,
        })
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
