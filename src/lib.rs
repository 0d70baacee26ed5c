//! Connection-pool and request-dispatch engine for a fleet of storage-service nodes reached by
//! service discovery. This crate owns: discovering backend instances ([`resolver`]), maintaining
//! an adaptive pool of multiplexed TCP connections to them ([`connection_set`], [`pool`]),
//! choosing a connection per request ([`pool`]), tracking per-request lifecycle ([`request`]),
//! and a façade tying it together ([`client`]).
//!
//! This crate does not define the bytes on the wire of any particular RPC protocol — callers
//! supply a [`transport::Transport`] factory when constructing a [`client::Client`].

pub mod client;
mod connection;
mod connection_set;
pub mod error;
pub mod options;
mod pool;
mod request;
pub mod resolver;
#[cfg(test)]
mod test_support;
pub mod transport;

pub use client::Client;
pub use error::{Error, ErrorKind, Result};
