//! Sonar Core - Shared configuration and error types

pub mod config;
pub mod error;

pub use config::{Config, MAX_PACKET_SIZE};
pub use error::{Error, Result};
