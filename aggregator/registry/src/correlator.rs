use crate::ConnectionRegistry;
use ahash::AHashMap as HashMap;
use bytes::Bytes;
use meshview_aggregator_api::{AggregatorMessage, InspectReply, InspectRequest};
use meshview_aggregator_core::{DispatchError, InspectKind, RequestKind};
use parking_lot::Mutex;
use prost::Message;
use std::{marker::PhantomData, sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Live proxy-configuration fetch.
#[derive(Clone, Copy, Debug)]
pub struct ProxyConfig;

impl InspectKind for ProxyConfig {
    const KIND: RequestKind = RequestKind::ProxyConfig;
    type Request = meshview_aggregator_api::ProxyConfigRequest;
    type Response = meshview_aggregator_api::ProxyConfigResponse;
}

/// Live service-connection-metrics fetch.
#[derive(Clone, Copy, Debug)]
pub struct ServiceMetrics;

impl InspectKind for ServiceMetrics {
    const KIND: RequestKind = RequestKind::ServiceMetrics;
    type Request = meshview_aggregator_api::ServiceMetricsRequest;
    type Response = meshview_aggregator_api::ServiceMetricsResponse;
}

type Delivery = Result<Bytes, DispatchError>;

/// One in-flight request: who it targets, when it expires, and the one-slot
/// channel its dispatcher is blocked on. Removed on exactly one terminal
/// path: delivery, timeout, cancellation, disconnect, or shutdown.
#[derive(Debug)]
struct PendingRequest {
    cluster: String,
    timeout: Duration,
    deadline: Instant,
    tx: oneshot::Sender<Delivery>,
}

/// Issues uniquely-identified requests of one kind against a specific
/// cluster's stream and resolves them when a matching reply arrives.
///
/// Correlation ids carry no ordering meaning: replies may arrive in any
/// order relative to dispatch order, interleaved across kinds on the same
/// stream. First delivery wins; duplicates look like unknown ids because the
/// pending entry is already gone.
#[derive(Debug)]
pub struct Correlator<K> {
    registry: Arc<ConnectionRegistry>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    _kind: PhantomData<K>,
}

impl<K: InspectKind> Correlator<K> {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::default()),
            _kind: PhantomData,
        }
    }

    /// Pushes `request` down `cluster`'s stream and blocks the calling task
    /// on a three-way race: reply delivery, deadline expiry, or `cancel`.
    /// The pending entry is removed on every exit path, including the caller
    /// dropping this future mid-flight.
    pub async fn dispatch(
        &self,
        cluster: &str,
        request: K::Request,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<K::Response, DispatchError> {
        // Fail fast before allocating an id or starting a timer.
        if !self.registry.is_connected(cluster) {
            return Err(DispatchError::ClusterUnavailable(cluster.to_string()));
        }

        let id = Uuid::new_v4();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                cluster: cluster.to_string(),
                timeout,
                deadline,
                tx,
            },
        );
        let _guard = PendingGuard { pending: &self.pending, id };

        let message = AggregatorMessage::inspect_request(InspectRequest {
            correlation_id: id.to_string(),
            kind: K::KIND as i32,
            payload: request.encode_to_vec().into(),
        });
        if let Err(error) = self.registry.send(cluster, message) {
            debug!(kind = %K::KIND, %cluster, %id, %error, "inspect request not sent");
            return Err(DispatchError::ClusterUnavailable(cluster.to_string()));
        }

        let payload = tokio::select! {
            delivered = rx => match delivered {
                Ok(delivery) => delivery?,
                // Senders are only dropped when the correlator itself goes away.
                Err(_) => return Err(DispatchError::Shutdown),
            },
            _ = tokio::time::sleep_until(deadline) => {
                debug!(kind = %K::KIND, %cluster, %id, ?timeout, "inspect request timed out");
                return Err(DispatchError::Timeout(timeout));
            }
            _ = cancel.cancelled() => return Err(DispatchError::Canceled),
        };

        K::Response::decode(payload).map_err(|error| {
            warn!(kind = %K::KIND, %cluster, %id, %error, "undecodable inspect payload");
            DispatchError::Rejected(format!("invalid {} payload: {error}", K::KIND))
        })
    }

    /// Routes one reply to its blocked dispatcher. Non-blocking: a receive
    /// loop calls this and resumes reading. Replies for unknown or
    /// already-resolved ids are logged and dropped; they never affect any
    /// other pending request.
    pub fn handle_response(&self, reply: InspectReply) {
        let id = match Uuid::parse_str(&reply.correlation_id) {
            Ok(id) => id,
            Err(_) => {
                warn!(kind = %K::KIND, correlation_id = %reply.correlation_id, "malformed correlation id");
                return;
            }
        };
        let entry = self.pending.lock().remove(&id);
        let entry = match entry {
            Some(entry) => entry,
            None => {
                debug!(kind = %K::KIND, %id, "reply for unknown or already-resolved request");
                return;
            }
        };
        let delivery = if reply.ok {
            Ok(reply.payload)
        } else {
            Err(DispatchError::Rejected(reply.error))
        };
        if entry.tx.send(delivery).is_err() {
            // The dispatcher gave up (timeout or cancellation raced the reply).
            debug!(kind = %K::KIND, %id, cluster = %entry.cluster, "caller abandoned before delivery");
        }
    }

    /// Defensive sweep: force-resolves entries whose deadline has passed, in
    /// case a dispatcher's own timer and the map ever fall out of sync. Safe
    /// to run concurrently with dispatch and delivery.
    pub fn expire_stale(&self) {
        let now = Instant::now();
        let expired: Vec<(Uuid, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        for (id, entry) in expired {
            warn!(kind = %K::KIND, %id, cluster = %entry.cluster, "expiring stale request");
            let _ = entry.tx.send(Err(DispatchError::Timeout(entry.timeout)));
        }
    }

    /// Fails every pending request scoped to `cluster` with
    /// `ClusterUnavailable`. Called on disconnect: fail-fast, not lazy expiry.
    pub fn fail_cluster(&self, cluster: &str) {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, entry)| entry.cluster == cluster)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        if !failed.is_empty() {
            debug!(kind = %K::KIND, %cluster, requests = failed.len(), "failing requests for disconnected cluster");
        }
        for entry in failed {
            let _ = entry
                .tx
                .send(Err(DispatchError::ClusterUnavailable(cluster.to_string())));
        }
    }

    /// Releases every blocked dispatcher with `Shutdown`.
    pub fn shutdown(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.tx.send(Err(DispatchError::Shutdown));
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Removes the pending entry when a dispatch future exits by any path,
/// including being dropped before resolution.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<Uuid, PendingRequest>>,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// The per-kind correlator instances, one per request kind, sharing one
/// registry. Inbound replies are routed by their wire kind; lifecycle events
/// fan out to every instance.
#[derive(Debug)]
pub struct Correlators {
    pub proxy_config: Correlator<ProxyConfig>,
    pub service_metrics: Correlator<ServiceMetrics>,
}

impl Correlators {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            proxy_config: Correlator::new(registry.clone()),
            service_metrics: Correlator::new(registry),
        }
    }

    pub fn handle_response(&self, reply: InspectReply) {
        match RequestKind::try_from(reply.kind) {
            Ok(RequestKind::ProxyConfig) => self.proxy_config.handle_response(reply),
            Ok(RequestKind::ServiceMetrics) => self.service_metrics.handle_response(reply),
            Ok(RequestKind::Unknown) | Err(_) => {
                warn!(kind = reply.kind, correlation_id = %reply.correlation_id, "reply for unrecognized request kind");
            }
        }
    }

    pub fn fail_cluster(&self, cluster: &str) {
        self.proxy_config.fail_cluster(cluster);
        self.service_metrics.fail_cluster(cluster);
    }

    pub fn expire_stale(&self) {
        self.proxy_config.expire_stale();
        self.service_metrics.expire_stale();
    }

    pub fn shutdown(&self) {
        self.proxy_config.shutdown();
        self.service_metrics.shutdown();
    }

    pub fn pending_len(&self) -> usize {
        self.proxy_config.pending_len() + self.service_metrics.pending_len()
    }
}
