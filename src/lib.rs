//! smartcielo: async client for the Cielo Home cloud HVAC API
//!
//! This crate provides:
//! - Captcha-assisted login and token refresh against the cloud backend
//! - Device directory enumeration with last-known state
//! - Per-device command state machines and command payload builders
//! - A persistent WebSocket connection with health probing and
//!   exponential-backoff reconnection
//!
//! The entry point is [`Connection`]: construct it from a [`Config`],
//! call [`Connection::connect`], then read device snapshots, send
//! commands, and consume [`Event`]s from [`Connection::subscribe`].

pub mod auth;
pub mod config;
pub mod connection;
pub mod device;
pub mod directory;
pub mod protocol;
pub mod solver;

pub use auth::{AuthError, Authenticator, RefreshError, Session};
pub use config::{Config, ConnectionConfig, IdentityConfig, SolverConfig};
pub use connection::{CommandError, ConnectError, Connection, ConnectionState, Event};
pub use device::{
    normalize_mac, CommandAction, CommandState, Device, FanSpeed, Mode, Power, Telemetry,
};
pub use directory::{Directory, DirectoryError};
pub use solver::{SolverClient, SolverError};
