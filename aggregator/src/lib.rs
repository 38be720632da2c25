#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use meshview_aggregator_api as api;
pub use meshview_aggregator_core::{
    ClusterState, ClusterSummary, DispatchError, InspectKind, RegistryError, RequestKind,
};
pub use meshview_aggregator_protocol as protocol;
pub use meshview_aggregator_registry::{ConnectionRegistry, Correlators};
pub use meshview_aggregator_runtime::Args;
