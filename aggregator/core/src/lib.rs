#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
mod inspect;
mod state;

pub use self::error::{DispatchError, RegistryError};
pub use self::inspect::{InspectKind, RequestKind};
pub use self::state::{ClusterState, ClusterSummary};
