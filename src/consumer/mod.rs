//! Consumers and the clients (workers) that talk to them.
//!
//! A [`Consumer`] is the server side of a transport: it accepts connections or
//! requests from workers and bridges them to a [`Broker`](crate::broker::Broker)
//! through a [`BrokerPort`](crate::broker::BrokerPort). A [`Client`] is the worker
//! side: it repeatedly asks for work, processes it and returns the result.
//!
//! Every transport is a closed pair; a websocket client cannot talk to a socket
//! consumer.
//!
//! - [`socket`]: one short-lived TCP connection per request/response pair.
//! - [`websocket`]: one persistent connection per worker, kept alive with pings.
//! - [`mpi`]: message passing between ranks, with rank 0 as the master.
//! - [`thread`]: local threads working on the broker directly, with no client.
use std::{io, ops::RangeInclusive, time::Duration};

use log::info;
use rand::Rng;
use thiserror::Error;

use crate::{
    broker::BrokerPort,
    context::ContextError,
    payload::Processable,
    protocol::{
        CodecError, CommandEnvelope, DispatchError, ProtocolError, SerializationMode, dispatch,
    },
};

pub mod mpi;
pub mod socket;
pub mod thread;
pub mod websocket;

pub const DEFAULT_SERVER: &str = "localhost";
pub const DEFAULT_PORT: u16 = 10000;
pub const DEFAULT_MAX_RECONNECTS: usize = 10;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BROKER_TIMEOUT_MS: u64 = 200;
pub const DEFAULT_MPI_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("failed to listen at {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("rank {0} cannot act as the master; only rank 0 can")]
    NotMaster(usize),
    #[error("rank 0 is the master and cannot act as a worker")]
    NotWorker,
    #[error("failed to start consumer: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("giving up after {attempts} failed connection attempts: {last}")]
    ReconnectsExhausted { attempts: usize, last: String },
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Mpi(#[from] mpi::MpiError),
    #[error("connection closed by the consumer")]
    Closed,
    #[error(transparent)]
    Config(#[from] ConsumerError),
}

/// Reasons a single server-side session ends early.
#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs [`dispatch::serve`] off the reactor, since broker calls block.
///
/// The envelope is moved to the blocking thread and back.
pub(crate) async fn serve_blocking<P: Processable>(
    port: &BrokerPort<P>,
    mode: SerializationMode,
    envelope: &mut CommandEnvelope<P>,
    request: Vec<u8>,
) -> Result<Vec<u8>, SessionError> {
    let port = port.clone();
    let mut owned = std::mem::take(envelope);

    let (owned, reply) = tokio::task::spawn_blocking(move || {
        let reply = dispatch::serve(&request, &mut owned, &port, mode);
        (owned, reply)
    })
    .await?;

    *envelope = owned;
    Ok(reply?)
}

/// Settings shared by consumers and clients of every transport.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub server: String,
    pub port: u16,
    pub serialization_mode: SerializationMode,
    /// Threads used to serve connections; `0` selects the hardware concurrency.
    pub threads: usize,
    pub max_reconnects: usize,
    pub ping_interval: Duration,
    pub pin_threads: bool,
    pub multiple_contexts: bool,
    pub reuse_address: bool,
    pub no_delay: bool,
    pub broker_timeout: Duration,
    pub verbose_control_frames: bool,
    pub mpi_buffer_size: usize,
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            port: DEFAULT_PORT,
            serialization_mode: SerializationMode::default(),
            threads: 0,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            pin_threads: false,
            multiple_contexts: true,
            reuse_address: true,
            no_delay: false,
            broker_timeout: Duration::from_millis(DEFAULT_BROKER_TIMEOUT_MS),
            verbose_control_frames: false,
            mpi_buffer_size: DEFAULT_MPI_BUFFER_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.server.trim().is_empty() {
            return Err(ConsumerError::Config("server name is empty".to_string()));
        }
        if self.ping_interval.is_zero() {
            return Err(ConsumerError::Config(
                "ping interval must be positive".to_string(),
            ));
        }
        if self.mpi_buffer_size == 0 {
            return Err(ConsumerError::Config(
                "message buffer size must be positive".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConsumerError::Config(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Server side of a transport.
pub trait Consumer {
    /// Starts accepting work requests. Fails if the consumer cannot start.
    fn start(&mut self) -> Result<(), ConsumerError>;

    /// Stops accepting requests, aborts outstanding exchanges and joins all threads.
    fn shutdown(&mut self);

    fn stopped(&self) -> bool;

    fn name(&self) -> &'static str;

    /// Short identifier used on the command line.
    fn mnemonic(&self) -> &'static str;

    /// Estimated number of workers, and whether the estimate is exact.
    fn processing_units_estimate(&self) -> (usize, bool);
}

/// Worker side of a transport.
pub trait Client {
    /// Runs the request/process/respond cycle until the worker terminates.
    fn run(&mut self) -> Result<ClientStats, ClientError>;
}

/// Counters kept by a client over its lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub processed: u64,
    pub nodata: u64,
    pub reconnects: u64,
}

impl ClientStats {
    pub(crate) fn log_summary(&self, client: &str) {
        info!(
            "{client} is shutting down; processed {} items in total, \"no data\" was received {} times, {} reconnects",
            self.processed, self.nodata, self.reconnects
        );
    }
}

/// Uniformly random sleep interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    range: RangeInclusive<Duration>,
}

impl Backoff {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { range: min..=max }
    }

    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self::new(Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn sample(&self) -> Duration {
        let (min, max) = (*self.range.start(), *self.range.end());
        if min >= max {
            return min;
        }
        rand::rng().random_range(min..=max)
    }
}

/// Reconnect bookkeeping for a client.
#[derive(Debug)]
pub(crate) struct Reconnects {
    failures: usize,
    max: usize,
}

impl Reconnects {
    pub(crate) fn new(max: usize) -> Self {
        Self { failures: 0, max }
    }

    /// Records a failed attempt; returns `false` once the limit is reached.
    pub(crate) fn failed(&mut self) -> bool {
        self.failures += 1;
        self.failures < self.max
    }

    pub(crate) fn connected(&mut self) {
        self.failures = 0;
    }

    pub(crate) fn failures(&self) -> usize {
        self.failures
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }
}
