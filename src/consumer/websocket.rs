//! Persistent-websocket transport.
//!
//! Each worker holds one websocket connection for its whole lifetime and sends
//! every request over it. The consumer pings each connection at a fixed interval;
//! a connection that fails to answer one ping before the next tick is marked stale.
//!
//! Envelopes travel in binary frames in [`SerializationMode::Binary`] and in text
//! frames otherwise.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use log::{Level, debug, error, info, log, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Builder, Handle},
    sync::watch,
    time::MissedTickBehavior,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::{
    broker::{Broker, BrokerPort},
    context::IoContextPool,
    payload::Processable,
    protocol::{
        CodecError, Command, CommandEnvelope, Next, SerializationMode, codec, dispatch,
    },
};

use super::{
    Backoff, Client, ClientError, ClientStats, Consumer, ConsumerConfig, ConsumerError,
    Reconnects, SessionError, serve_blocking,
};

pub const NODATA_BACKOFF: Backoff = Backoff::from_millis(10, 50);
pub const RECONNECT_BACKOFF: Backoff = Backoff::from_millis(500, 1000);

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const CLOSE_DRAIN: Duration = Duration::from_millis(500);
const MAX_CLOSE_REASON: usize = 120;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Liveness of one connection as seen by the side sending pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Alive,
    SendingPing,
    Stale,
}

/// What to do when the ping timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    SendPing,
    BecameStale,
    Idle,
}

/// Ping/pong state machine of a single connection.
///
/// ```text
/// Alive --tick--> SendingPing --pong/ping--> Alive
///                      |
///                      +--tick--> Stale
/// ```
///
/// `Stale` is terminal.
#[derive(Debug)]
pub struct Heartbeat {
    state: PingState,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            state: PingState::Alive,
        }
    }

    pub fn state(&self) -> PingState {
        self.state
    }

    pub fn tick(&mut self) -> Tick {
        match self.state {
            PingState::Alive => {
                self.state = PingState::SendingPing;
                Tick::SendPing
            }
            PingState::SendingPing => {
                self.state = PingState::Stale;
                Tick::BecameStale
            }
            PingState::Stale => Tick::Idle,
        }
    }

    /// Records a pong or ping from the peer. Data frames do not count.
    pub fn alive(&mut self) {
        if self.state != PingState::Stale {
            self.state = PingState::Alive;
        }
    }
}

fn control_level(verbose: bool) -> Level {
    if verbose { Level::Info } else { Level::Trace }
}

fn to_frame(bytes: Vec<u8>, mode: SerializationMode) -> Result<Message, CodecError> {
    match mode {
        SerializationMode::Binary => Ok(Message::Binary(bytes)),
        SerializationMode::Text | SerializationMode::Xml => String::from_utf8(bytes)
            .map(Message::Text)
            .map_err(|e| CodecError::Utf8(e.utf8_error())),
    }
}

/// Sends a close frame and waits briefly for the peer to acknowledge it.
async fn close_connection(
    ws: &mut WebSocketStream<TcpStream>,
    frame: Option<CloseFrame<'static>>,
) {
    if ws.close(frame).await.is_err() {
        return;
    }
    let _ = tokio::time::timeout(CLOSE_DRAIN, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

fn protocol_close(reason: &impl std::fmt::Display) -> CloseFrame<'static> {
    let mut reason = reason.to_string();
    while reason.len() > MAX_CLOSE_REASON {
        reason.pop();
    }
    CloseFrame {
        code: CloseCode::Protocol,
        reason: reason.into(),
    }
}

struct Shared<P> {
    port: BrokerPort<P>,
    mode: SerializationMode,
    no_delay: bool,
    ping_interval: Duration,
    verbose_control_frames: bool,
    stopped: AtomicBool,
    stop: watch::Sender<bool>,
    active: AtomicUsize,
    stale: AtomicUsize,
}

/// Consumer serving workers over long-lived websocket connections.
pub struct WebsocketConsumer<P: Processable> {
    config: ConsumerConfig,
    shared: Arc<Shared<P>>,
    pool: Option<IoContextPool>,
    local_addr: Option<SocketAddr>,
}

impl<P: Processable> WebsocketConsumer<P> {
    pub fn new(config: ConsumerConfig, broker: Arc<dyn Broker<P>>) -> Self {
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            port: BrokerPort::new(broker, config.broker_timeout),
            mode: config.serialization_mode,
            no_delay: config.no_delay,
            ping_interval: config.ping_interval,
            verbose_control_frames: config.verbose_control_frames,
            stopped: AtomicBool::new(false),
            stop,
            active: AtomicUsize::new(0),
            stale: AtomicUsize::new(0),
        });

        Self {
            config,
            shared,
            pool: None,
            local_addr: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of connections that stopped answering pings.
    pub fn stale_connections(&self) -> usize {
        self.shared.stale.load(Ordering::Relaxed)
    }
}

impl<P: Processable> Consumer for WebsocketConsumer<P> {
    fn start(&mut self) -> Result<(), ConsumerError> {
        self.config.validate()?;
        let address = self.config.address();

        let mut pool = IoContextPool::new(
            self.config.threads,
            self.config.pin_threads,
            self.config.multiple_contexts,
        )?;
        let acceptor = pool.get()?;
        pool.init()?;
        pool.run()?;
        let contexts = (0..pool.size())
            .map(|_| pool.get())
            .collect::<Result<Vec<_>, _>>()?;

        let listener = {
            let _guard = acceptor.enter();
            super::socket::bind(&address, self.config.reuse_address)
                .map_err(|source| ConsumerError::Bind { address, source })?
        };
        self.local_addr = Some(listener.local_addr()?);
        info!(
            "{} listening at {:?} with {} threads",
            self.name(),
            self.local_addr,
            pool.size()
        );

        self.shared.stopped.store(false, Ordering::SeqCst);
        self.shared.stop.send_replace(false);
        acceptor.spawn(accept_loop(listener, contexts, Arc::clone(&self.shared)));
        self.pool = Some(pool);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let Some(mut pool) = self.pool.take() else {
            return;
        };

        self.shared.stop.send_replace(true);
        let deadline = Instant::now() + CLOSE_GRACE;
        while self.shared.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        pool.stop();
        info!(
            "{} has shut down; {} connections went stale",
            self.name(),
            self.stale_connections()
        );
    }

    fn stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "WebsocketConsumer"
    }

    fn mnemonic(&self) -> &'static str {
        "ws"
    }

    fn processing_units_estimate(&self) -> (usize, bool) {
        (self.shared.active.load(Ordering::Relaxed), false)
    }
}

impl<P: Processable> Drop for WebsocketConsumer<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop<P: Processable>(
    listener: TcpListener,
    contexts: Vec<Handle>,
    shared: Arc<Shared<P>>,
) {
    let mut stop = shared.stop.subscribe();
    let mut next = 0usize;

    while !shared.stopped.load(Ordering::SeqCst) {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {e}; will keep accepting");
                    continue;
                }
            },
            _ = stop.changed() => break,
        };

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to detach connection from {peer}: {e}");
                continue;
            }
        };

        let context = &contexts[next % contexts.len()];
        next = next.wrapping_add(1);

        let session = WebsocketSession::new(Arc::clone(&shared), peer);
        context.spawn(async move {
            match TcpStream::from_std(stream) {
                Ok(stream) => session.run(stream).await,
                Err(e) => warn!("failed to register connection from {peer}: {e}"),
            }
        });
    }
    debug!("accept loop has terminated");
}

async fn handshake(
    stream: TcpStream,
    no_delay: bool,
) -> Result<WebSocketStream<TcpStream>, SessionError> {
    if no_delay {
        stream.set_nodelay(true)?;
    }
    Ok(tokio_tungstenite::accept_async(stream).await?)
}

/// Serves all requests of one worker connection.
struct WebsocketSession<P> {
    shared: Arc<Shared<P>>,
    peer: SocketAddr,
    heartbeat: Heartbeat,
    envelope: CommandEnvelope<P>,
}

impl<P: Processable> WebsocketSession<P> {
    fn new(shared: Arc<Shared<P>>, peer: SocketAddr) -> Self {
        Self {
            shared,
            peer,
            heartbeat: Heartbeat::new(),
            envelope: CommandEnvelope::default(),
        }
    }

    async fn run(mut self, stream: TcpStream) {
        self.shared.active.fetch_add(1, Ordering::SeqCst);

        match handshake(stream, self.shared.no_delay).await {
            Ok(ws) => match self.serve_connection(ws).await {
                Ok(()) => debug!("connection with {} closed", self.peer),
                Err(SessionError::Dispatch(e)) => {
                    error!("closing connection with {} after protocol error: {e}", self.peer)
                }
                Err(e) => warn!("connection with {} terminated: {e}", self.peer),
            },
            Err(e) => warn!("websocket handshake with {} failed: {e}", self.peer),
        }

        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn serve_connection(
        &mut self,
        mut ws: WebSocketStream<TcpStream>,
    ) -> Result<(), SessionError> {
        let interval = self.shared.ping_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop = self.shared.stop.subscribe();
        let level = control_level(self.shared.verbose_control_frames);

        loop {
            if self.shared.stopped.load(Ordering::SeqCst) {
                close_connection(&mut ws, None).await;
                return Ok(());
            }

            tokio::select! {
                message = ws.next() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    let request = match message? {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data,
                        Message::Ping(_) => {
                            log!(level, "ping from {}", self.peer);
                            self.heartbeat.alive();
                            continue;
                        }
                        Message::Pong(_) => {
                            log!(level, "pong from {}", self.peer);
                            self.heartbeat.alive();
                            continue;
                        }
                        Message::Close(_) => return Ok(()),
                        Message::Frame(_) => continue,
                    };

                    let reply = serve_blocking(
                        &self.shared.port,
                        self.shared.mode,
                        &mut self.envelope,
                        request,
                    )
                    .await;
                    match reply {
                        Ok(reply) => {
                            let frame = to_frame(reply, self.shared.mode)
                                .map_err(dispatch::DispatchError::from)?;
                            ws.send(frame).await?;
                        }
                        Err(SessionError::Dispatch(e)) => {
                            close_connection(&mut ws, Some(protocol_close(&e))).await;
                            return Err(SessionError::Dispatch(e));
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ = ticker.tick() => match self.heartbeat.tick() {
                    Tick::SendPing => {
                        log!(level, "sending ping to {}", self.peer);
                        ws.send(Message::Ping(Vec::new())).await?;
                    }
                    Tick::BecameStale => {
                        warn!("connection with {} did not answer a ping and is now stale", self.peer);
                        self.shared.stale.fetch_add(1, Ordering::Relaxed);
                    }
                    Tick::Idle => {}
                },
                _ = stop.changed() => {}
            }
        }
    }
}

/// Worker talking to a [`WebsocketConsumer`].
pub struct WebsocketClient<P> {
    config: ConsumerConfig,
    envelope: CommandEnvelope<P>,
    reconnects: Reconnects,
    stats: ClientStats,
    nodata_backoff: Backoff,
    reconnect_backoff: Backoff,
    halt: Arc<AtomicBool>,
}

impl<P: Processable> WebsocketClient<P> {
    pub fn new(config: ConsumerConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let reconnects = Reconnects::new(config.max_reconnects);

        Ok(Self {
            config,
            envelope: CommandEnvelope::default(),
            reconnects,
            stats: ClientStats::default(),
            nodata_backoff: NODATA_BACKOFF,
            reconnect_backoff: RECONNECT_BACKOFF,
            halt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_backoff(mut self, nodata: Backoff, reconnect: Backoff) -> Self {
        self.nodata_backoff = nodata;
        self.reconnect_backoff = reconnect;
        self
    }

    /// Flag that makes the client close its connection after the current exchange.
    pub fn with_halt(mut self, halt: Arc<AtomicBool>) -> Self {
        self.halt = halt;
        self
    }

    fn url(&self) -> String {
        format!("ws://{}:{}/", self.config.server, self.config.port)
    }

    async fn connect(&mut self) -> Result<ClientStream, ClientError> {
        let url = self.url();
        loop {
            match tokio_tungstenite::connect_async_with_config(
                url.as_str(),
                None,
                self.config.no_delay,
            )
            .await
            {
                Ok((ws, _)) => {
                    self.reconnects.connected();
                    info!("websocket client connected to {url}");
                    return Ok(ws);
                }
                Err(e) => {
                    if !self.reconnects.failed() {
                        error!(
                            "{} / {} failed connection attempts to {url}: {e}; the client will terminate now",
                            self.reconnects.failures(),
                            self.reconnects.max()
                        );
                        return Err(ClientError::ReconnectsExhausted {
                            attempts: self.reconnects.failures(),
                            last: e.to_string(),
                        });
                    }
                    self.stats.reconnects += 1;
                    warn!(
                        "{} / {} failed connection attempts to {url}: {e}; will try to reconnect",
                        self.reconnects.failures(),
                        self.reconnects.max()
                    );
                    tokio::time::sleep(self.reconnect_backoff.sample()).await;
                }
            }
        }
    }

    async fn run_cycle(&mut self) -> Result<(), ClientError> {
        let mode = self.config.serialization_mode;
        let mut ws = self.connect().await?;
        self.envelope.reset(Command::GetData, None);

        loop {
            // A pending result is delivered before a halt takes effect.
            let halting = self.halt.load(Ordering::SeqCst);
            if halting && self.envelope.command() != Command::Result {
                break;
            }
            let outgoing = dispatch::encode_request(&mut self.envelope, mode)?;
            ws.send(to_frame(outgoing, mode)?).await?;

            let Some(incoming) = self.receive(&mut ws).await? else {
                info!("consumer closed the connection");
                return Ok(());
            };
            self.envelope = codec::from_bytes(&incoming, mode).inspect_err(|e| {
                error!("websocket client received an unreadable reply: {e}; the client will terminate")
            })?;

            if halting {
                if self.envelope.command() == Command::Compute {
                    warn!("websocket client is halting; the work item it was just handed is dropped");
                }
                break;
            }

            let next = match self.respond(&mut ws).await {
                Ok((_, true)) => {
                    info!("consumer closed the connection while an item was being processed");
                    return Ok(());
                }
                Ok((next, false)) => next,
                Err(e) => {
                    error!("websocket client: {e}; the client will terminate");
                    return Err(e);
                }
            };

            match next {
                Next::Send => {
                    if self.envelope.command() == Command::Result {
                        self.stats.processed += 1;
                    }
                }
                Next::Backoff => {
                    self.stats.nodata += 1;
                    tokio::time::sleep(self.nodata_backoff.sample()).await;
                }
            }
        }

        let _ = ws.close(None).await;
        Ok(())
    }

    /// Waits for the next data frame, answering pings on the way.
    ///
    /// Returns `None` if the consumer closed the connection.
    async fn receive(&self, ws: &mut ClientStream) -> Result<Option<Vec<u8>>, ClientError> {
        let level = control_level(self.config.verbose_control_frames);
        while let Some(message) = ws.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(text.into_bytes())),
                Message::Binary(data) => return Ok(Some(data)),
                Message::Ping(_) => {
                    log!(level, "websocket client got a ping");
                    ws.flush().await?;
                }
                Message::Pong(_) => log!(level, "websocket client got a pong"),
                Message::Close(_) => return Ok(None),
                Message::Frame(_) => {}
            }
        }
        Err(ClientError::Closed)
    }

    /// Processes the reply on a blocking thread while keeping the connection alive.
    ///
    /// The flag is set if the consumer closed the connection in the meantime.
    async fn respond(&mut self, ws: &mut ClientStream) -> Result<(Next, bool), ClientError> {
        let level = control_level(self.config.verbose_control_frames);
        let mut envelope = std::mem::take(&mut self.envelope);
        let mut job = tokio::task::spawn_blocking(move || {
            let next = dispatch::respond(&mut envelope, true);
            (envelope, next)
        });

        let mut closed = false;

        let (envelope, next) = loop {
            tokio::select! {
                joined = &mut job => break joined.map_err(std::io::Error::other)?,
                message = ws.next(), if !closed => match message {
                    Some(Ok(Message::Ping(_))) => {
                        log!(level, "websocket client got a ping while processing");
                        ws.flush().await?;
                    }
                    Some(Ok(Message::Close(_))) => closed = true,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ClientError::Closed),
                },
            }
        };

        self.envelope = envelope;
        Ok((next?, closed))
    }
}

impl<P: Processable> Client for WebsocketClient<P> {
    fn run(&mut self) -> Result<ClientStats, ClientError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let result = runtime.block_on(self.run_cycle());
        self.stats.log_summary("websocket client");
        result.map(|()| self.stats)
    }
}
