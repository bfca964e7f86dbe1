//! # tempolink-net
//!
//! The wire transport for the session coordinator: length-prefixed JSON
//! framing, the accept-loop/writer-thread server that drives a
//! `tempolink_core::Coordinator`, and a thin reference client.

pub mod client;
pub mod framing;
pub mod protocol;
pub mod server;

pub use client::SessionClient;
pub use protocol::ConnectionWelcome;
pub use server::{CoordinatorServer, ServerConfig};
