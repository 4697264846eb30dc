//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Mode,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Mode {
    /// Serve rooms over the line protocol on a single node
    Local,
    /// Serve cluster RPC backed by a presence store and bus
    Cluster,
    /// Serve the shared presence store and bus to cluster nodes
    Hub,
    /// Interactive client for a cluster node
    Client {
        /// RPC endpoint, e.g. ws://127.0.0.1:3000/rpc
        #[arg(short, long)]
        server: Option<String>,
        /// Username; prompted for when absent
        #[arg(short, long)]
        user: Option<String>,
    },
}
