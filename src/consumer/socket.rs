//! Ephemeral-socket transport.
//!
//! Every request/response pair travels over a fresh TCP connection. A message ends
//! when the sender shuts down its write half; the receiver reads until end-of-stream.
//! No idle sockets are held, at the cost of one connect per work item.
//!
//! ```text
//! client: connect -> write request -> shutdown(write) -> read until EOF -> close
//! server: accept  -> read until EOF -> serve -> write reply -> shutdown(write)
//! ```
use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use log::{debug, error, info, trace, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    runtime::{Builder, Handle},
};

use crate::{
    broker::{Broker, BrokerPort},
    context::IoContextPool,
    payload::Processable,
    protocol::{Command, CommandEnvelope, Next, SerializationMode, codec, dispatch},
};

use super::{
    Backoff, Client, ClientError, ClientStats, Consumer, ConsumerConfig, ConsumerError,
    Reconnects, SessionError, serve_blocking,
};

const LISTEN_BACKLOG: u32 = 1024;

pub const NODATA_BACKOFF: Backoff = Backoff::from_millis(50, 200);
pub const RECONNECT_BACKOFF: Backoff = Backoff::from_millis(500, 1000);

struct Shared<P> {
    port: BrokerPort<P>,
    mode: SerializationMode,
    no_delay: bool,
    stopped: AtomicBool,
    active: AtomicUsize,
}

/// Consumer handing out work items over short-lived TCP connections.
pub struct SocketConsumer<P: Processable> {
    config: ConsumerConfig,
    shared: Arc<Shared<P>>,
    pool: Option<IoContextPool>,
    local_addr: Option<SocketAddr>,
}

impl<P: Processable> SocketConsumer<P> {
    pub fn new(config: ConsumerConfig, broker: Arc<dyn Broker<P>>) -> Self {
        let shared = Arc::new(Shared {
            port: BrokerPort::new(broker, config.broker_timeout),
            mode: config.serialization_mode,
            no_delay: config.no_delay,
            stopped: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        });

        Self {
            config,
            shared,
            pool: None,
            local_addr: None,
        }
    }

    /// Address the consumer is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl<P: Processable> Consumer for SocketConsumer<P> {
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
            bind(&address, self.config.reuse_address)
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
        acceptor.spawn(accept_loop(listener, contexts, Arc::clone(&self.shared)));
        self.pool = Some(pool);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(mut pool) = self.pool.take() {
            pool.stop();
            info!("{} has shut down", self.name());
        }
    }

    fn stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "SocketConsumer"
    }

    fn mnemonic(&self) -> &'static str {
        "socket"
    }

    fn processing_units_estimate(&self) -> (usize, bool) {
        (self.shared.active.load(Ordering::Relaxed), false)
    }
}

impl<P: Processable> Drop for SocketConsumer<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(super) fn bind(address: &str, reuse_address: bool) -> std::io::Result<TcpListener> {
    let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "address did not resolve",
        )
    })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(reuse_address)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_loop<P: Processable>(
    listener: TcpListener,
    contexts: Vec<Handle>,
    shared: Arc<Shared<P>>,
) {
    let mut next = 0usize;

    while !shared.stopped.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("failed to accept connection: {e}; will keep accepting");
                continue;
            }
        };
        trace!("accepted connection from {peer}");

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to detach connection from {peer}: {e}");
                continue;
            }
        };

        let context = &contexts[next % contexts.len()];
        next = next.wrapping_add(1);

        let session = SocketSession::new(Arc::clone(&shared), peer);
        context.spawn(async move {
            match TcpStream::from_std(stream) {
                Ok(stream) => session.run(stream).await,
                Err(e) => warn!("failed to register connection from {peer}: {e}"),
            }
        });
    }
    debug!("accept loop has terminated");
}

/// Serves one request/response exchange.
struct SocketSession<P> {
    shared: Arc<Shared<P>>,
    peer: SocketAddr,
    incoming: Vec<u8>,
    envelope: CommandEnvelope<P>,
}

impl<P: Processable> SocketSession<P> {
    fn new(shared: Arc<Shared<P>>, peer: SocketAddr) -> Self {
        Self {
            shared,
            peer,
            incoming: Vec::new(),
            envelope: CommandEnvelope::default(),
        }
    }

    async fn run(mut self, mut stream: TcpStream) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }

        self.shared.active.fetch_add(1, Ordering::Relaxed);
        match self.exchange(&mut stream).await {
            Ok(()) => {}
            Err(SessionError::Dispatch(e)) => {
                error!("session with {} failed: {e}; no reply will be sent", self.peer)
            }
            Err(e) => warn!("session with {} terminated: {e}", self.peer),
        }
        self.shared.active.fetch_sub(1, Ordering::Relaxed);
    }

    async fn exchange(&mut self, stream: &mut TcpStream) -> Result<(), SessionError> {
        if self.shared.no_delay {
            stream.set_nodelay(true)?;
        }

        stream.read_to_end(&mut self.incoming).await?;
        let request = std::mem::take(&mut self.incoming);

        let reply = serve_blocking(
            &self.shared.port,
            self.shared.mode,
            &mut self.envelope,
            request,
        )
        .await?;

        stream.write_all(&reply).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Worker talking to a [`SocketConsumer`].
pub struct SocketClient<P> {
    config: ConsumerConfig,
    envelope: CommandEnvelope<P>,
    reconnects: Reconnects,
    stats: ClientStats,
    nodata_backoff: Backoff,
    reconnect_backoff: Backoff,
    halt: Arc<AtomicBool>,
}

impl<P: Processable> SocketClient<P> {
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

    /// Flag that makes the client return once its current exchange is complete.
    pub fn with_halt(mut self, halt: Arc<AtomicBool>) -> Self {
        self.halt = halt;
        self
    }

    async fn run_cycle(&mut self) -> Result<(), ClientError> {
        let mode = self.config.serialization_mode;
        self.envelope.reset(Command::GetData, None);

        loop {
            // A pending result is delivered before a halt takes effect.
            let halting = self.halt.load(Ordering::SeqCst);
            if halting && self.envelope.command() != Command::Result {
                break;
            }
            let outgoing = dispatch::encode_request(&mut self.envelope, mode)?;

            let mut stream = self.connect().await?;
            stream.write_all(&outgoing).await?;
            stream.shutdown().await?;

            let mut incoming = Vec::new();
            stream.read_to_end(&mut incoming).await?;
            drop(stream);

            self.envelope = codec::from_bytes(&incoming, mode).inspect_err(|e| {
                error!("socket client received an unreadable reply: {e}; the client will terminate")
            })?;

            if halting {
                if self.envelope.command() == Command::Compute {
                    warn!("socket client is halting; the work item it was just handed is dropped");
                }
                break;
            }

            match dispatch::respond(&mut self.envelope, false) {
                Ok(Next::Send) => {
                    if self.envelope.command() == Command::Result {
                        self.stats.processed += 1;
                    }
                }
                Ok(Next::Backoff) => {
                    self.stats.nodata += 1;
                    tokio::time::sleep(self.nodata_backoff.sample()).await;
                }
                Err(e) => {
                    error!("socket client: {e}; the client will terminate");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<TcpStream, ClientError> {
        let address = self.config.address();
        loop {
            match TcpStream::connect((self.config.server.as_str(), self.config.port)).await {
                Ok(stream) => {
                    self.reconnects.connected();
                    if self.config.no_delay {
                        stream.set_nodelay(true)?;
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    if !self.reconnects.failed() {
                        error!(
                            "{} / {} failed connection attempts to {address}: {e}; the client will terminate now",
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
                        "{} / {} failed connection attempts to {address}: {e}; will try to reconnect",
                        self.reconnects.failures(),
                        self.reconnects.max()
                    );
                    tokio::time::sleep(self.reconnect_backoff.sample()).await;
                }
            }
        }
    }
}

impl<P: Processable> Client for SocketClient<P> {
    fn run(&mut self) -> Result<ClientStats, ClientError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let result = runtime.block_on(self.run_cycle());
        self.stats.log_summary("socket client");
        result.map(|()| self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{Shutdown, TcpListener as StdListener, TcpStream as StdStream},
        thread,
        time::{Duration, Instant},
    };

    use crate::{
        broker::QueueBroker,
        consumer::testing::{HaltingItem, halt_flag},
        payload::ParaboloidItem,
        protocol::{CodecError, ProtocolError, UnknownCommand},
    };

    use super::*;

    fn test_config(mode: SerializationMode) -> ConsumerConfig {
        ConsumerConfig {
            server: "127.0.0.1".to_string(),
            port: 0,
            serialization_mode: mode,
            threads: 2,
            broker_timeout: Duration::from_millis(20),
            max_reconnects: 3,
            ..Default::default()
        }
    }

    fn start_consumer(
        mode: SerializationMode,
    ) -> (
        SocketConsumer<ParaboloidItem>,
        Arc<QueueBroker<ParaboloidItem>>,
        SocketAddr,
    ) {
        let broker = Arc::new(QueueBroker::new(64));
        let mut consumer = SocketConsumer::new(
            test_config(mode),
            broker.clone() as Arc<dyn Broker<ParaboloidItem>>,
        );
        consumer.start().unwrap();
        let addr = consumer.local_addr().unwrap();
        (consumer, broker, addr)
    }

    fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut stream = StdStream::connect(addr).unwrap();
        stream.write_all(request).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        reply
    }

    fn envelope_exchange(
        addr: SocketAddr,
        envelope: &CommandEnvelope<ParaboloidItem>,
    ) -> CommandEnvelope<ParaboloidItem> {
        let mode = SerializationMode::Binary;
        let reply = exchange(addr, &codec::to_bytes(envelope, mode).unwrap());
        codec::from_bytes(&reply, mode).unwrap()
    }

    fn fast_client(config: ConsumerConfig) -> SocketClient<ParaboloidItem> {
        SocketClient::new(config)
            .unwrap()
            .with_backoff(Backoff::from_millis(1, 5), Backoff::from_millis(1, 5))
    }

    #[test]
    fn empty_broker_yields_nodata() {
        let (mut consumer, _broker, addr) = start_consumer(SerializationMode::Binary);

        let start = Instant::now();
        let reply = envelope_exchange(addr, &CommandEnvelope::new(Command::GetData, None));

        assert_eq!(reply.command(), Command::NoData);
        assert!(start.elapsed() < Duration::from_secs(5));
        consumer.shutdown();
    }

    #[test]
    fn result_is_answered_with_next_item() {
        let (mut consumer, broker, addr) = start_consumer(SerializationMode::Binary);
        broker.submit(ParaboloidItem::new(1, vec![1.0]), Duration::ZERO);
        broker.submit(ParaboloidItem::new(2, vec![2.0]), Duration::ZERO);

        let mut first = envelope_exchange(addr, &CommandEnvelope::new(Command::GetData, None));
        assert_eq!(first.command(), Command::Compute);
        first.process().unwrap();
        first.set_command(Command::Result);

        let second = envelope_exchange(addr, &first);
        assert_eq!(second.command(), Command::Compute);
        assert_eq!(second.payload().unwrap().id, 2);

        let returned = broker.collect(Duration::from_secs(1)).unwrap();
        assert_eq!(returned.id, 1);
        assert_eq!(returned.result, Some(1.0));
        consumer.shutdown();
    }

    #[test]
    fn unknown_request_fails_session_only() {
        let (mut consumer, _broker, addr) = start_consumer(SerializationMode::Text);

        let reply = exchange(addr, br#"{"command":42,"payload":null}"#);
        assert!(reply.is_empty());

        let reply = exchange(addr, br#"{"command":1,"payload":null}"#);
        let reply: CommandEnvelope<ParaboloidItem> =
            codec::from_bytes(&reply, SerializationMode::Text).unwrap();
        assert_eq!(reply.command(), Command::NoData);
        consumer.shutdown();
    }

    #[test]
    fn clients_process_all_items() {
        for mode in [
            SerializationMode::Text,
            SerializationMode::Xml,
            SerializationMode::Binary,
        ] {
            let (mut consumer, broker, addr) = start_consumer(mode);
            for id in 0..20 {
                broker.submit(ParaboloidItem::new(id, vec![id as f64, 1.0]), Duration::ZERO);
            }

            let halt = Arc::new(AtomicBool::new(false));
            let workers = (0..2)
                .map(|_| {
                    let config = ConsumerConfig {
                        port: addr.port(),
                        ..test_config(mode)
                    };
                    let mut client = fast_client(config).with_halt(Arc::clone(&halt));
                    thread::spawn(move || client.run())
                })
                .collect::<Vec<_>>();

            let mut results = (0..20)
                .map(|_| broker.collect(Duration::from_secs(10)).unwrap())
                .collect::<Vec<_>>();
            results.sort_by_key(|item| item.id);

            for (id, item) in results.iter().enumerate() {
                assert_eq!(item.id, id as u64);
                assert_eq!(item.result, Some((id * id) as f64 + 1.0));
            }

            halt.store(true, Ordering::SeqCst);
            let processed: u64 = workers
                .into_iter()
                .map(|w| w.join().unwrap().unwrap().processed)
                .sum();
            assert!(processed >= 20);
            consumer.shutdown();
            assert!(consumer.stopped());
        }
    }

    #[test]
    fn client_gives_up_after_max_reconnects() {
        let port = {
            let listener = StdListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ConsumerConfig {
            port,
            ..test_config(SerializationMode::Binary)
        };

        let mut client = fast_client(config);
        let res = client.run();

        assert!(matches!(
            res,
            Err(ClientError::ReconnectsExhausted { attempts: 3, .. })
        ));
        assert_eq!(client.stats.reconnects, 2);
    }

    fn fake_server(reply: &'static [u8]) -> u16 {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).unwrap();
            stream.write_all(reply).unwrap();
        });
        port
    }

    #[test]
    fn client_terminates_on_unknown_command() {
        let port = fake_server(br#"{"command":42,"payload":null}"#);
        let config = ConsumerConfig {
            port,
            ..test_config(SerializationMode::Text)
        };

        let res = fast_client(config).run();
        assert!(matches!(
            res,
            Err(ClientError::Codec(CodecError::UnknownCommand(UnknownCommand(42))))
        ));
    }

    #[test]
    fn client_terminates_on_unexpected_command() {
        let port = fake_server(br#"{"command":1,"payload":null}"#);
        let config = ConsumerConfig {
            port,
            ..test_config(SerializationMode::Text)
        };

        let res = fast_client(config).run();
        assert!(matches!(
            res,
            Err(ClientError::Protocol(ProtocolError::UnexpectedCommand(
                Command::GetData
            )))
        ));
    }

    #[test]
    fn halted_client_delivers_pending_result() {
        let broker = Arc::new(QueueBroker::<HaltingItem>::new(4));
        let mut consumer = SocketConsumer::new(
            test_config(SerializationMode::Binary),
            broker.clone() as Arc<dyn Broker<HaltingItem>>,
        );
        consumer.start().unwrap();
        let addr = consumer.local_addr().unwrap();
        broker.submit(HaltingItem::new("socket-halt"), Duration::ZERO);

        let config = ConsumerConfig {
            port: addr.port(),
            ..test_config(SerializationMode::Binary)
        };
        let mut client = SocketClient::<HaltingItem>::new(config)
            .unwrap()
            .with_backoff(Backoff::from_millis(1, 5), Backoff::from_millis(1, 5))
            .with_halt(halt_flag("socket-halt"));
        let stats = client.run().unwrap();

        assert_eq!(stats.processed, 1);
        let returned = broker.collect(Duration::from_secs(1)).unwrap();
        assert!(returned.processed);
        consumer.shutdown();
    }

    #[test]
    fn consumer_refuses_invalid_config() {
        let broker = Arc::new(QueueBroker::<ParaboloidItem>::new(1));
        let config = ConsumerConfig {
            mpi_buffer_size: 0,
            ..test_config(SerializationMode::Binary)
        };
        let mut consumer = SocketConsumer::new(config, broker as Arc<dyn Broker<ParaboloidItem>>);

        assert!(matches!(consumer.start(), Err(ConsumerError::Config(_))));
    }
}
