//! # tempolink-core
//!
//! The session coordinator: session/membership registry, leader election,
//! the authoritative transport state machine, clock-sync and latency
//! tracking, and the event-validation/rate-limit/authorization pipeline
//! that sits in front of all of it. Independent of any wire transport —
//! `tempolink-net` drives it one [`tempolink_types::Command`] at a time
//! through [`coordinator::Coordinator`].
//!
//! ## Module overview
//!
//! - [`config`] — embedded-TOML-defaults-plus-environment-override config loader
//! - [`registry`] — `SessionRegistry`: session/member CRUD, capacity, idle sweep
//! - [`role`] — `RoleManager`: leader election, handoff requests, disconnect takeover
//! - [`transport`] — `TransportEngine`: play/pause/seek/setTempo state machine and tick loop
//! - [`sync`] — `SyncEngine`: clock-sync handshake, latency tracking, drift correction
//! - [`ratelimit`] — per-connection token-bucket rate limiting
//! - [`dispatch`] — `EventDispatcher`: validation, authorization, rate-limit pipeline
//! - [`telemetry`] — `TelemetryBus`: periodic aggregate reports and the health endpoint
//! - [`locks`] — per-session serialization discipline
//! - [`error`] — the error taxonomy and its mapping to wire `Event::Error`
//! - [`coordinator`] — wires all of the above into the single facade `tempolink-net` drives

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod ratelimit;
pub mod registry;
pub mod role;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use coordinator::{Coordinator, EventSink};
pub use error::CoordinatorError;
