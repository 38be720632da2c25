use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Wholesale, point-in-time snapshot of one cluster's aggregated mesh
/// resources, replaced in full on every sync and never merged.
///
/// The payload is an opaque JSON document assembled by the collector; the
/// aggregator stores and serves it without looking past its size.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterState {
    pub payload: Bytes,
    pub resource_count: u64,
    pub received_at: DateTime<Utc>,
}

/// Connection metadata served by the query API.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub resource_count: Option<u64>,
}
