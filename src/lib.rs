//! Node agent for a fleet of game servers on one host: installs server
//! distributions, supervises their processes, records console output and
//! resource samples, and streams events to authenticated WebSocket clients.

pub mod api;
pub mod bus;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod installer;
pub mod journal;
pub mod models;
pub mod process;
pub mod server_config;
pub mod session;
pub mod state;
pub mod store;

pub use error::{Error, ErrorKind, Result};
