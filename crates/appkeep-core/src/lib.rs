//! AppKeep core library
//!
//! Shared error taxonomy, configuration and identity types used by the
//! backup engine and the command-line front end.

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::{ConfigLoader, EngineConfig};
pub use error::{Error, Result};
pub use types::{ApplicationRef, UserId};
