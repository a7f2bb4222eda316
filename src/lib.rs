pub mod allocate;
pub mod client;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod media;
pub mod net;
pub mod permissions;
pub mod socket;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;

pub use client::{Client, SessionContext};
pub use config::ClientConfig;
pub use error::ClientError;
pub use state::{CallState, ConnectionState, EndReason};
