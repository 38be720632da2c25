#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Shared aggregator state: the cluster connection registry and the
//! on-demand request correlators.
//!
//! Both structures are constructed once at startup and shared (`Arc`) by
//! every connection's receive loop, the query handlers, and the background
//! sweep. All mutation goes through their methods; nothing else touches the
//! underlying maps.

mod connection;
mod correlator;


pub use self::connection::{ConnectionHandle, ConnectionRegistry};
pub use self::correlator::{Correlator, Correlators, ProxyConfig, ServiceMetrics};
