#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Wire messages exchanged between collectors and the aggregator, plus the
//! length-delimited framing codec that carries them.
//!
//! Every collector holds exactly one duplex stream. The collector speaks
//! first with [`Hello`], then pushes [`StateSync`] messages at its own
//! cadence and answers [`InspectRequest`]s with [`InspectReply`]s carrying
//! the correlation id they answer.

mod codec;

pub use self::codec::{ClientCodec, CodecError, ServerCodec, WireCodec, MAX_FRAME_LEN};

use bytes::Bytes;
use meshview_aggregator_core::RequestKind;

/// First message on every collector stream: claims exclusive ownership of a
/// cluster identity for the life of the connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub collector_version: String,
}

/// Accepts or rejects a [`Hello`]. A rejected stream is closed by the
/// aggregator immediately after this message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloAck {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Wholesale replacement of the sending cluster's state snapshot.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateSync {
    /// Opaque JSON document assembled by the collector.
    #[prost(bytes = "bytes", tag = "1")]
    pub payload: Bytes,
    #[prost(uint64, tag = "2")]
    pub resource_count: u64,
}

/// Aggregator-initiated, deadline-bound inspection request pushed down an
/// established stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InspectRequest {
    #[prost(string, tag = "1")]
    pub correlation_id: String,
    #[prost(enumeration = "RequestKind", tag = "2")]
    pub kind: i32,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
}

/// Collector's answer to an [`InspectRequest`]. Replies may arrive in any
/// order relative to dispatch order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InspectReply {
    #[prost(string, tag = "1")]
    pub correlation_id: String,
    #[prost(enumeration = "RequestKind", tag = "2")]
    pub kind: i32,
    #[prost(bool, tag = "3")]
    pub ok: bool,
    #[prost(string, tag = "4")]
    pub error: String,
    #[prost(bytes = "bytes", tag = "5")]
    pub payload: Bytes,
}

/// Fetch the live proxy configuration of one workload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxyConfigRequest {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(string, tag = "2")]
    pub pod: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxyConfigResponse {
    /// JSON summary produced by the collector's proxy-admin parser.
    #[prost(bytes = "bytes", tag = "1")]
    pub config: Bytes,
}

/// Fetch live connection metrics for one service over a time range.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceMetricsRequest {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    /// Unix milliseconds; zero leaves the bound to the collector's default.
    #[prost(int64, tag = "3")]
    pub since_ms: i64,
    #[prost(int64, tag = "4")]
    pub until_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceMetricsResponse {
    /// JSON summary produced by the collector's metrics parser.
    #[prost(bytes = "bytes", tag = "1")]
    pub metrics: Bytes,
}

/// Envelope for everything a collector sends.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CollectorMessage {
    #[prost(oneof = "collector_message::Kind", tags = "1, 2, 3")]
    pub kind: Option<collector_message::Kind>,
}

pub mod collector_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        StateSync(super::StateSync),
        #[prost(message, tag = "3")]
        InspectReply(super::InspectReply),
    }
}

/// Envelope for everything the aggregator sends.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AggregatorMessage {
    #[prost(oneof = "aggregator_message::Kind", tags = "1, 2")]
    pub kind: Option<aggregator_message::Kind>,
}

pub mod aggregator_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        HelloAck(super::HelloAck),
        #[prost(message, tag = "2")]
        InspectRequest(super::InspectRequest),
    }
}

// === impl CollectorMessage ===

impl CollectorMessage {
    pub fn hello(cluster_id: impl Into<String>, collector_version: impl Into<String>) -> Self {
        Self {
            kind: Some(collector_message::Kind::Hello(Hello {
                cluster_id: cluster_id.into(),
                collector_version: collector_version.into(),
            })),
        }
    }

    pub fn state_sync(payload: impl Into<Bytes>, resource_count: u64) -> Self {
        Self {
            kind: Some(collector_message::Kind::StateSync(StateSync {
                payload: payload.into(),
                resource_count,
            })),
        }
    }

    pub fn inspect_reply(reply: InspectReply) -> Self {
        Self {
            kind: Some(collector_message::Kind::InspectReply(reply)),
        }
    }
}

// === impl AggregatorMessage ===

impl AggregatorMessage {
    pub fn hello_ack(accepted: bool, reason: impl Into<String>) -> Self {
        Self {
            kind: Some(aggregator_message::Kind::HelloAck(HelloAck {
                accepted,
                reason: reason.into(),
            })),
        }
    }

    pub fn inspect_request(request: InspectRequest) -> Self {
        Self {
            kind: Some(aggregator_message::Kind::InspectRequest(request)),
        }
    }
}
