//! btlink CLI library
//!
//! Argument parsing, configuration loading and the command implementations
//! behind the `btlink` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use config::CliConfig;
pub use error::{CliError, Result};
