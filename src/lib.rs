#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! qbee-connect library: remote access tunnels to fleet devices.
//!
//! - `target` — target descriptor grammar and device connection requests
//! - `api` — management API client (device status, inventory, login)
//! - `resolver` — device id to edge gateway route
//! - `transport` — multiplexed WebSocket session to an edge gateway
//! - `bridge` — local TCP/UDP/stdio ends of a tunnel
//! - `terminal` — interactive PTY sessions with resize forwarding
//! - `supervisor` — multi-device connect with retry, backoff and jitter
//! - `connect` — one resolve/open/serve cycle
//! - `broker` — on-demand HTTP reverse proxy with a tunnel cache
//! - `config` — TOML + env configuration
//! - `error` — error types

pub mod api;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod connect;
pub mod error;
pub mod resolver;
pub mod supervisor;
pub mod target;
pub mod terminal;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use connect::Tunneler;
pub use error::{BrokerError, TunnelError};
pub use target::{parse_target, DeviceConnection, Target};
