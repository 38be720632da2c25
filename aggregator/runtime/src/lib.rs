#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Process wiring for the meshview aggregator: configuration, the collector
//! listener, the query API, and shutdown ordering.

mod admin;
mod api;
mod args;

pub use self::args::Args;
