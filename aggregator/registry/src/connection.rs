use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use meshview_aggregator_api::AggregatorMessage;
use meshview_aggregator_core::{ClusterState, ClusterSummary, RegistryError};
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle to one collector connection's outbound half.
///
/// The token identifies the connection that owns a registry slot, so a
/// closing stream can never evict a successor that already replaced it.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    token: Uuid,
    tx: mpsc::UnboundedSender<AggregatorMessage>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<AggregatorMessage>) -> Self {
        Self {
            token: Uuid::new_v4(),
            tx,
        }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Queues a message for the connection's writer task. Returns false when
    /// the connection is tearing down.
    pub fn send(&self, message: AggregatorMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// One connected cluster: its exclusively-owned stream handle and the latest
/// snapshot, replaced wholesale on every sync.
#[derive(Debug)]
struct ClusterConnection {
    handle: ConnectionHandle,
    connected_at: DateTime<Utc>,
    last_update: Option<DateTime<Utc>>,
    state: Option<ClusterState>,
}

#[derive(Debug, Default)]
struct Connections {
    live: HashMap<String, ClusterConnection>,
    /// Recently released identities and when they were released. Consulted
    /// only when a reconnect grace window is configured.
    released: HashMap<String, Instant>,
}

/// Admission control and latest-state storage for every connected cluster.
///
/// At most one live connection owns a cluster identity at any instant;
/// `register` is the sole primitive enforcing that. State reads vastly
/// outnumber connect/disconnect events, so the map sits behind a
/// read/write-split lock and reads return cheaply-cloned immutable values.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<Connections>,
    reconnect_grace: Duration,
}

impl ConnectionRegistry {
    /// `reconnect_grace` keeps a disconnected identity unregistrable for the
    /// given interval to absorb reconnect races; zero disables the window.
    pub fn new(reconnect_grace: Duration) -> Self {
        Self {
            connections: RwLock::new(Connections::default()),
            reconnect_grace,
        }
    }

    /// Installs a connection as the exclusive owner of `cluster`. The
    /// existing owner, if any, is never displaced; the caller must reject
    /// and close the new stream instead.
    pub fn register(&self, cluster: &str, handle: ConnectionHandle) -> Result<(), RegistryError> {
        let mut connections = self.connections.write();
        if connections.live.contains_key(cluster) {
            return Err(RegistryError::AlreadyConnected(cluster.to_string()));
        }
        if !self.reconnect_grace.is_zero() {
            let grace = self.reconnect_grace;
            connections.released.retain(|_, at| at.elapsed() < grace);
            if connections.released.contains_key(cluster) {
                debug!(%cluster, "identity still inside its reconnect grace window");
                return Err(RegistryError::AlreadyConnected(cluster.to_string()));
            }
        }
        connections.live.insert(
            cluster.to_string(),
            ClusterConnection {
                handle,
                connected_at: Utc::now(),
                last_update: None,
                state: None,
            },
        );
        info!(%cluster, "cluster connected");
        Ok(())
    }

    /// Removes `cluster` regardless of which connection owns it. Idempotent.
    pub fn unregister(&self, cluster: &str) {
        let mut connections = self.connections.write();
        if connections.live.remove(cluster).is_some() {
            self.record_release(&mut connections, cluster);
            info!(%cluster, "cluster disconnected");
        }
    }

    /// Removes `cluster` only while the connection bearing `token` still
    /// owns the slot. Connection tasks use this on teardown so that a stream
    /// closing late cannot evict a replacement that raced past it.
    pub fn unregister_stream(&self, cluster: &str, token: Uuid) -> bool {
        let mut connections = self.connections.write();
        match connections.live.get(cluster) {
            Some(conn) if conn.handle.token() == token => {
                connections.live.remove(cluster);
                self.record_release(&mut connections, cluster);
                info!(%cluster, "cluster disconnected");
                true
            }
            Some(_) => {
                debug!(%cluster, "slot already owned by a newer connection");
                false
            }
            None => false,
        }
    }

    /// Tracks a released identity for grace-window checks. With the window
    /// disabled nothing consults the map, so nothing is recorded. Expired
    /// entries are pruned on every insert as well as in `register`; the map
    /// never holds more than one entry per identity released within the
    /// current window.
    fn record_release(&self, connections: &mut Connections, cluster: &str) {
        if self.reconnect_grace.is_zero() {
            return;
        }
        let grace = self.reconnect_grace;
        connections.released.retain(|_, at| at.elapsed() < grace);
        connections.released.insert(cluster.to_string(), Instant::now());
    }

    #[cfg(test)]
    pub(crate) fn released_len(&self) -> usize {
        self.connections.read().released.len()
    }

    /// Replaces the stored snapshot wholesale. A collector must identify
    /// before syncing.
    pub fn update_state(&self, cluster: &str, state: ClusterState) -> Result<(), RegistryError> {
        let mut connections = self.connections.write();
        let conn = connections
            .live
            .get_mut(cluster)
            .ok_or_else(|| RegistryError::NotConnected(cluster.to_string()))?;
        conn.last_update = Some(state.received_at);
        conn.state = Some(state);
        Ok(())
    }

    pub fn state(&self, cluster: &str) -> Result<ClusterState, RegistryError> {
        let connections = self.connections.read();
        let conn = connections
            .live
            .get(cluster)
            .ok_or_else(|| RegistryError::NotConnected(cluster.to_string()))?;
        conn.state
            .clone()
            .ok_or_else(|| RegistryError::NoState(cluster.to_string()))
    }

    /// A consistent point-in-time copy of every synced cluster's state.
    pub fn all_states(&self) -> std::collections::HashMap<String, ClusterState> {
        self.connections
            .read()
            .live
            .iter()
            .filter_map(|(cluster, conn)| {
                conn.state.clone().map(|state| (cluster.clone(), state))
            })
            .collect()
    }

    pub fn summaries(&self) -> Vec<ClusterSummary> {
        let connections = self.connections.read();
        let mut summaries = connections
            .live
            .iter()
            .map(|(cluster, conn)| ClusterSummary {
                cluster_id: cluster.clone(),
                connected_at: conn.connected_at,
                last_update: conn.last_update,
                resource_count: conn.state.as_ref().map(|s| s.resource_count),
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        summaries
    }

    pub fn is_connected(&self, cluster: &str) -> bool {
        self.connections.read().live.contains_key(cluster)
    }

    /// Writes a message onto `cluster`'s stream.
    pub fn send(&self, cluster: &str, message: AggregatorMessage) -> Result<(), RegistryError> {
        let connections = self.connections.read();
        let conn = connections
            .live
            .get(cluster)
            .ok_or_else(|| RegistryError::NotConnected(cluster.to_string()))?;
        if conn.handle.send(message) {
            Ok(())
        } else {
            warn!(%cluster, "connection outbound channel is closed");
            Err(RegistryError::NotConnected(cluster.to_string()))
        }
    }

    /// Drops every connection. Process shutdown only.
    pub fn clear(&self) {
        let mut connections = self.connections.write();
        let dropped = connections.live.len();
        connections.live.clear();
        connections.released.clear();
        if dropped > 0 {
            info!(clusters = dropped, "dropped all cluster connections");
        }
    }
}
