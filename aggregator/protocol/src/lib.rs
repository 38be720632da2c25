#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The collector-facing stream protocol: a per-connection sequence gate that
//! moves each stream through identification, acceptance or rejection, and
//! steady-state streaming, wiring inbound messages to the connection
//! registry and the request correlators.

mod connection;
mod listener;

pub use self::connection::serve_connection;
pub use self::listener::serve;
