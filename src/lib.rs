//! RelayNet - Relay message protocol and socket transport
//!
//! Wire formats for relay messages, a framed TCP server and client, and the
//! handler glue that applies relay operations to a data component.

pub mod config;
pub mod network;
pub mod protocol;
pub mod relay;
