//! CLI utilities for ferry.
//!
//! Options shared by the `ferry_server` and `ferry_worker` binaries. Both sides of a
//! transport must agree on the server address, the port and the serialization mode.
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::{
    consumer::{
        ConsumerConfig, DEFAULT_MPI_BUFFER_SIZE, DEFAULT_PING_INTERVAL_SECS, DEFAULT_PORT,
        DEFAULT_SERVER,
    },
    protocol::SerializationMode,
};

/// Transport connecting the consumer with its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// One short-lived TCP connection per work item
    Socket,
    /// One persistent websocket connection per worker
    Ws,
    /// In-process message passing between ranks
    Mpi,
    /// Local threads working on the queues directly
    Threads,
    /// A single local thread working on the queues directly
    Serial,
}

#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Host name or address of the consumer
    #[arg(long, default_value = DEFAULT_SERVER)]
    pub server: String,
    /// Port of the consumer
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Wire format of every exchanged message
    #[arg(long, value_enum, default_value_t = SerializationMode::Binary)]
    pub mode: SerializationMode,
    /// Seconds between websocket pings
    #[arg(long, default_value_t = DEFAULT_PING_INTERVAL_SECS)]
    pub ping_interval: u64,
    /// Disable Nagle's algorithm on TCP streams
    #[arg(long)]
    pub no_delay: bool,
    /// Log pings and pongs at info level
    #[arg(long)]
    pub verbose_control_frames: bool,
    /// Largest message, in bytes, exchanged between ranks
    #[arg(long, default_value_t = DEFAULT_MPI_BUFFER_SIZE)]
    pub mpi_buffer_size: usize,
}

impl ConnectionArgs {
    pub fn config(&self) -> ConsumerConfig {
        ConsumerConfig {
            server: self.server.clone(),
            port: self.port,
            serialization_mode: self.mode,
            ping_interval: Duration::from_secs(self.ping_interval),
            no_delay: self.no_delay,
            verbose_control_frames: self.verbose_control_frames,
            mpi_buffer_size: self.mpi_buffer_size,
            ..Default::default()
        }
    }
}
