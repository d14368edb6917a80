//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Session name override
    #[arg(short, long)]
    pub session: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run a publisher and searchers in-process and broadcast a message
    Loopback {
        /// Message the publisher broadcasts
        #[arg(default_value = "hello from btlink")]
        message: String,
        /// Number of searchers to connect
        #[arg(short, long, default_value_t = 2)]
        peers: usize,
        /// Bytes per simulated radio chunk
        #[arg(long, default_value_t = 4)]
        chunk_size: usize,
    },
    /// Search for a publisher over BLE and exchange data with it
    Search {
        /// Message to send once connected
        #[arg(short, long)]
        message: Option<String>,
        /// Number of bytes to read from the publisher
        #[arg(short, long)]
        read: Option<usize>,
        /// Seconds to wait for the connection and each read
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}
