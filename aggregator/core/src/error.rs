use std::time::Duration;
use thiserror::Error;

/// Errors raised by connection admission and state lookups.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another live connection already owns this cluster identity, or the
    /// identity is still inside its reconnect grace window.
    #[error("cluster {0} is already connected")]
    AlreadyConnected(String),

    #[error("cluster {0} is not connected")]
    NotConnected(String),

    /// The cluster is connected but has not synced a snapshot yet.
    #[error("no state received from cluster {0} yet")]
    NoState(String),
}

/// Terminal outcomes of an on-demand dispatch, other than a delivered result.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The cluster was never connected, or disconnected mid-flight.
    #[error("cluster {0} is not available")]
    ClusterUnavailable(String),

    /// No response arrived within the deadline. Distinct from
    /// `ClusterUnavailable`: the cluster was connected the whole time.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("request canceled by the caller")]
    Canceled,

    #[error("aggregator is shutting down")]
    Shutdown,

    /// The collector answered, but with an error or an undecodable payload.
    #[error("collector rejected the request: {0}")]
    Rejected(String),
}
