//! Message-passing transport.
//!
//! Rank 0 is the master and runs an [`MpiConsumer`]; every other rank runs an
//! [`MpiWorker`]. Workers send their requests tagged [`TAG_REQUEST_WORK_ITEM`] and
//! the master answers with [`TAG_SEND_WORK_ITEM`].
//!
//! The master never blocks on a receive. A dedicated thread polls a pending receive
//! and hands each completed request to a fixed [`ThreadPool`](pool::ThreadPool),
//! whose handlers send their reply without blocking and poll it until it completes
//! or the consumer stops. Workers use plain blocking calls.
//!
//! Every message must fit the configured buffer. Oversized messages are never
//! truncated: the receive fails with [`MpiError::Truncated`], and senders check
//! the encoded size before sending.
//!
//! The ranks are reached through the [`Communicator`] trait; [`LocalWorld`] provides
//! in-process ranks.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    broker::{Broker, BrokerPort},
    context::hardware_concurrency,
    payload::Processable,
    protocol::{Command, CommandEnvelope, Next, SerializationMode, codec, dispatch},
};

use super::{Backoff, Client, ClientError, ClientStats, Consumer, ConsumerConfig, ConsumerError};

mod local;
mod pool;

pub use local::{LocalCommunicator, LocalRecv, LocalSend, LocalWorld};
pub use pool::ThreadPool;

pub type Tag = i32;

pub const TAG_REQUEST_WORK_ITEM: Tag = 0;
pub const TAG_SEND_WORK_ITEM: Tag = 1;

pub const MASTER_RANK: usize = 0;

pub const NODATA_BACKOFF: Backoff = Backoff::from_millis(50, 200);

#[derive(Debug, Error)]
pub enum MpiError {
    #[error(
        "message of {size} bytes from rank {sender} does not fit the {capacity} byte receive buffer"
    )]
    Truncated {
        sender: usize,
        size: usize,
        capacity: usize,
    },
    #[error("encoded message of {size} bytes exceeds the {capacity} byte buffer")]
    Oversized { size: usize, capacity: usize },
    #[error("communicator has been finalized")]
    Finalized,
    #[error("rank {rank} does not exist in a world of size {size}")]
    InvalidRank { rank: usize, size: usize },
}

/// A message taken out of a rank's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub source: usize,
    pub data: Vec<u8>,
}

/// A non-blocking operation that is polled for completion.
pub trait Request: Send {
    type Output;

    /// Returns the result once the operation has completed, `None` while pending.
    fn test(&mut self) -> Result<Option<Self::Output>, MpiError>;
}

/// Point-to-point messaging between the ranks of a world.
pub trait Communicator: Send + Sync + 'static {
    type RecvRequest: Request<Output = Received>;
    type SendRequest: Request<Output = ()>;

    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sends `data` and blocks until a matching receive has taken it.
    fn send(&self, data: &[u8], dest: usize, tag: Tag) -> Result<(), MpiError>;

    /// Blocks until a message with `tag` arrives from `source` (any rank if `None`).
    fn recv(
        &self,
        source: Option<usize>,
        tag: Tag,
        capacity: usize,
    ) -> Result<Received, MpiError>;

    fn irecv(
        &self,
        source: Option<usize>,
        tag: Tag,
        capacity: usize,
    ) -> Result<Self::RecvRequest, MpiError>;

    fn isend(&self, data: Vec<u8>, dest: usize, tag: Tag) -> Result<Self::SendRequest, MpiError>;
}

/// Polls `request` every `interval` until it completes or `stop` is raised.
///
/// Returns `Ok(None)` if polling was cancelled.
pub fn poll_until<R: Request>(
    request: &mut R,
    stop: &AtomicBool,
    interval: Duration,
) -> Result<Option<R::Output>, MpiError> {
    loop {
        if let Some(output) = request.test()? {
            return Ok(Some(output));
        }
        if stop.load(Ordering::SeqCst) {
            return Ok(None);
        }
        thread::sleep(interval);
    }
}

fn check_size(encoded: &[u8], capacity: usize) -> Result<(), MpiError> {
    if encoded.len() > capacity {
        Err(MpiError::Oversized {
            size: encoded.len(),
            capacity,
        })
    } else {
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct Limits {
    mode: SerializationMode,
    capacity: usize,
    poll_interval: Duration,
}

/// Master side of the message-passing transport. Only valid on rank 0.
pub struct MpiConsumer<P: Processable, C: Communicator> {
    config: ConsumerConfig,
    comm: Arc<C>,
    port: BrokerPort<P>,
    stop: Arc<AtomicBool>,
    receiver: Option<thread::JoinHandle<()>>,
}

impl<P: Processable, C: Communicator> MpiConsumer<P, C> {
    pub fn new(config: ConsumerConfig, comm: C, broker: Arc<dyn Broker<P>>) -> Self {
        let port = BrokerPort::new(broker, config.broker_timeout);
        Self {
            config,
            comm: Arc::new(comm),
            port,
            stop: Arc::new(AtomicBool::new(true)),
            receiver: None,
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            mode: self.config.serialization_mode,
            capacity: self.config.mpi_buffer_size,
            poll_interval: self.config.poll_interval,
        }
    }
}

impl<P: Processable, C: Communicator> Consumer for MpiConsumer<P, C> {
    fn start(&mut self) -> Result<(), ConsumerError> {
        self.config.validate()?;
        if self.comm.rank() != MASTER_RANK {
            return Err(ConsumerError::NotMaster(self.comm.rank()));
        }
        if self.receiver.is_some() {
            warn!("{} is already running; start() ignored", self.name());
            return Ok(());
        }

        let threads = match self.config.threads {
            0 => hardware_concurrency(),
            n => n,
        };
        let handlers = ThreadPool::new(threads)?;

        self.stop.store(false, Ordering::SeqCst);
        let comm = Arc::clone(&self.comm);
        let port = self.port.clone();
        let stop = Arc::clone(&self.stop);
        let limits = self.limits();

        let receiver = thread::Builder::new()
            .name("mpi-receiver".to_string())
            .spawn(move || receive_loop(comm, port, stop, handlers, limits))?;
        self.receiver = Some(receiver);

        info!(
            "{} started on rank {} of {} with {threads} handler threads",
            self.name(),
            self.comm.rank(),
            self.comm.size()
        );
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(receiver) = self.receiver.take() {
            if receiver.join().is_err() {
                warn!("receive thread panicked");
            }
            info!("{} has shut down", self.name());
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "MpiConsumer"
    }

    fn mnemonic(&self) -> &'static str {
        "mpi"
    }

    fn processing_units_estimate(&self) -> (usize, bool) {
        (self.comm.size().saturating_sub(1), true)
    }
}

impl<P: Processable, C: Communicator> Drop for MpiConsumer<P, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop<P: Processable, C: Communicator>(
    comm: Arc<C>,
    port: BrokerPort<P>,
    stop: Arc<AtomicBool>,
    handlers: ThreadPool,
    limits: Limits,
) {
    while !stop.load(Ordering::SeqCst) {
        let polled = comm
            .irecv(None, TAG_REQUEST_WORK_ITEM, limits.capacity)
            .and_then(|mut request| poll_until(&mut request, &stop, limits.poll_interval));

        let request = match polled {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(MpiError::Finalized) => {
                info!("communicator was finalized; receive thread is terminating");
                break;
            }
            Err(MpiError::Truncated {
                sender,
                size,
                capacity,
            }) => {
                error!(
                    "request of {size} bytes from rank {sender} exceeds the {capacity} byte buffer \
                     and was dropped; answering with NODATA"
                );
                let comm = Arc::clone(&comm);
                let stop = Arc::clone(&stop);
                let queued =
                    handlers.execute(move || reply_nodata::<P, C>(&*comm, sender, &stop, limits));
                if !queued {
                    warn!("handler pool is shutting down; rank {sender} gets no reply");
                }
                continue;
            }
            Err(e) => {
                debug!("dropping request: {e}");
                continue;
            }
        };

        let comm = Arc::clone(&comm);
        let port = port.clone();
        let stop = Arc::clone(&stop);
        let queued =
            handlers.execute(move || handle_request(&*comm, &port, request, &stop, limits));
        if !queued {
            warn!("handler pool is shutting down; request dropped");
        }
    }
    debug!("receive thread has terminated");
}

/// Tells `dest` to ask again, when its request could not be read.
fn reply_nodata<P: Processable, C: Communicator>(
    comm: &C,
    dest: usize,
    stop: &AtomicBool,
    limits: Limits,
) {
    let envelope = CommandEnvelope::<P>::new(Command::NoData, None);
    match codec::to_bytes(&envelope, limits.mode) {
        Ok(reply) => send_reply(comm, dest, reply, stop, limits),
        Err(e) => warn!("failed to encode reply to rank {dest}: {e}"),
    }
}

fn send_reply<C: Communicator>(
    comm: &C,
    dest: usize,
    reply: Vec<u8>,
    stop: &AtomicBool,
    limits: Limits,
) {
    let sent = comm
        .isend(reply, dest, TAG_SEND_WORK_ITEM)
        .and_then(|mut pending| poll_until(&mut pending, stop, limits.poll_interval));
    match sent {
        Ok(Some(())) => {}
        Ok(None) => debug!("reply to rank {dest} abandoned on shutdown"),
        Err(e) => warn!("failed to reply to rank {dest}: {e}"),
    }
}

/// Serves one completed request and sends the reply to its source.
fn handle_request<P: Processable, C: Communicator>(
    comm: &C,
    port: &BrokerPort<P>,
    request: Received,
    stop: &AtomicBool,
    limits: Limits,
) {
    let mut envelope = CommandEnvelope::default();
    let mut reply = match dispatch::serve(&request.data, &mut envelope, port, limits.mode) {
        Ok(reply) => reply,
        Err(e) => {
            debug!("dropping request from rank {}: {e}", request.source);
            return;
        }
    };

    if let Err(e) = check_size(&reply, limits.capacity) {
        error!(
            "reply to rank {}: {e}; the work item will be discarded",
            request.source
        );
        envelope.reset(Command::NoData, None);
        reply = match codec::to_bytes(&envelope, limits.mode) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("dropping request from rank {}: {e}", request.source);
                return;
            }
        };
    }

    send_reply(comm, request.source, reply, stop, limits);
}

/// Worker side of the message-passing transport. Valid on every rank but 0.
pub struct MpiWorker<P, C> {
    config: ConsumerConfig,
    comm: C,
    envelope: CommandEnvelope<P>,
    stats: ClientStats,
    nodata_backoff: Backoff,
    halt: Arc<AtomicBool>,
}

impl<P: Processable, C: Communicator> MpiWorker<P, C> {
    pub fn new(config: ConsumerConfig, comm: C) -> Result<Self, ClientError> {
        config.validate()?;
        if comm.rank() == MASTER_RANK {
            return Err(ConsumerError::NotWorker.into());
        }

        Ok(Self {
            config,
            comm,
            envelope: CommandEnvelope::default(),
            stats: ClientStats::default(),
            nodata_backoff: NODATA_BACKOFF,
            halt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_backoff(mut self, nodata: Backoff) -> Self {
        self.nodata_backoff = nodata;
        self
    }

    /// Flag that makes the worker return after its current exchange.
    pub fn with_halt(mut self, halt: Arc<AtomicBool>) -> Self {
        self.halt = halt;
        self
    }

    /// Encodes the pending request, replacing a result that does not fit the buffer.
    fn encode_request(&mut self) -> Result<Vec<u8>, ClientError> {
        let mode = self.config.serialization_mode;
        let capacity = self.config.mpi_buffer_size;

        let outgoing = dispatch::encode_request(&mut self.envelope, mode)?;
        match check_size(&outgoing, capacity) {
            Ok(()) => Ok(outgoing),
            Err(e) => {
                error!(
                    "rank {}: result {e}; the item will be discarded",
                    self.comm.rank()
                );
                self.envelope.reset(Command::GetData, None);
                let outgoing = codec::to_bytes(&self.envelope, mode)?;
                check_size(&outgoing, capacity)?;
                Ok(outgoing)
            }
        }
    }

    fn run_cycle(&mut self) -> Result<(), ClientError> {
        let mode = self.config.serialization_mode;
        let capacity = self.config.mpi_buffer_size;
        self.envelope.reset(Command::GetData, None);

        loop {
            // A pending result is delivered before a halt takes effect.
            let halting = self.halt.load(Ordering::SeqCst);
            if halting && self.envelope.command() != Command::Result {
                break;
            }
            let outgoing = self.encode_request()?;
            if self.envelope.command() == Command::Result {
                self.stats.processed += 1;
            }

            self.comm
                .send(&outgoing, MASTER_RANK, TAG_REQUEST_WORK_ITEM)?;
            let reply = self
                .comm
                .recv(Some(MASTER_RANK), TAG_SEND_WORK_ITEM, capacity)?;

            self.envelope = codec::from_bytes(&reply.data, mode).inspect_err(|e| {
                error!("rank {} received an unreadable reply: {e}", self.comm.rank())
            })?;

            if halting {
                if self.envelope.command() == Command::Compute {
                    warn!(
                        "rank {} is halting; the work item it was just handed is dropped",
                        self.comm.rank()
                    );
                }
                break;
            }

            match dispatch::respond(&mut self.envelope, false) {
                Ok(Next::Send) => {}
                Ok(Next::Backoff) => {
                    self.stats.nodata += 1;
                    thread::sleep(self.nodata_backoff.sample());
                }
                Err(e) => {
                    error!("rank {}: {e}; the worker will terminate", self.comm.rank());
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

impl<P: Processable, C: Communicator> Client for MpiWorker<P, C> {
    fn run(&mut self) -> Result<ClientStats, ClientError> {
        let result = match self.run_cycle() {
            Err(ClientError::Mpi(MpiError::Finalized)) => {
                info!("rank {}: communicator was finalized", self.comm.rank());
                Ok(())
            }
            other => other,
        };
        self.stats.log_summary("mpi worker");
        result.map(|()| self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::{
        broker::QueueBroker,
        consumer::testing::{HaltingItem, halt_flag},
        payload::ParaboloidItem,
        protocol::{CodecError, ProtocolError, UnknownCommand},
    };

    use super::*;

    const MODE: SerializationMode = SerializationMode::Binary;

    fn test_config(capacity: usize) -> ConsumerConfig {
        ConsumerConfig {
            serialization_mode: MODE,
            threads: 2,
            broker_timeout: Duration::from_millis(20),
            mpi_buffer_size: capacity,
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    struct Cluster {
        world: LocalWorld,
        broker: Arc<QueueBroker<ParaboloidItem>>,
        master: MpiConsumer<ParaboloidItem, LocalCommunicator>,
        halt: Arc<AtomicBool>,
        workers: Vec<thread::JoinHandle<Result<ClientStats, ClientError>>>,
    }

    impl Cluster {
        fn start(size: usize, capacity: usize) -> Self {
            let world = LocalWorld::new(size);
            let broker = Arc::new(QueueBroker::new(64));
            let mut master = MpiConsumer::new(
                test_config(capacity),
                world.communicator(0).unwrap(),
                broker.clone() as Arc<dyn Broker<ParaboloidItem>>,
            );
            master.start().unwrap();

            let halt = Arc::new(AtomicBool::new(false));
            let workers = (1..size)
                .map(|rank| {
                    let mut worker = MpiWorker::<ParaboloidItem, _>::new(
                        test_config(capacity),
                        world.communicator(rank).unwrap(),
                    )
                    .unwrap()
                    .with_backoff(Backoff::from_millis(1, 5))
                    .with_halt(Arc::clone(&halt));
                    thread::spawn(move || worker.run())
                })
                .collect();

            Self {
                world,
                broker,
                master,
                halt,
                workers,
            }
        }

        fn stop(mut self) -> Vec<ClientStats> {
            self.halt.store(true, Ordering::SeqCst);
            let stats = self
                .workers
                .drain(..)
                .map(|w| w.join().unwrap().unwrap())
                .collect();
            self.master.shutdown();
            self.world.finalize();
            stats
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn workers_process_all_items() {
        let cluster = Cluster::start(3, 4096);
        for id in 0..20 {
            cluster
                .broker
                .submit(ParaboloidItem::new(id, vec![1.0, id as f64]), Duration::ZERO);
        }

        let mut results = (0..20)
            .map(|_| cluster.broker.collect(Duration::from_secs(10)).unwrap())
            .collect::<Vec<_>>();
        results.sort_by_key(|item| item.id);
        for (id, item) in results.iter().enumerate() {
            assert_eq!(item.result, Some(1.0 + (id * id) as f64));
        }

        assert_eq!(cluster.master.processing_units_estimate(), (2, true));
        let processed: u64 = cluster.stop().iter().map(|s| s.processed).sum();
        assert!(processed >= 20);
    }

    #[test]
    fn oversized_reply_becomes_nodata() {
        let cluster = Cluster::start(2, 256);
        cluster
            .broker
            .submit(ParaboloidItem::new(1, vec![1.0; 100]), Duration::ZERO);

        wait_until(|| cluster.broker.pending() == 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cluster.broker.completed(), 0);

        let stats = cluster.stop();
        assert_eq!(stats[0].processed, 0);
        assert!(stats[0].nodata > 0);
    }

    #[test]
    fn oversized_result_is_discarded() {
        let item = ParaboloidItem::new(1, vec![2.0]);
        let compute = CommandEnvelope::new(Command::Compute, Some(item.clone()));
        let capacity = codec::to_bytes(&compute, MODE).unwrap().len();

        let cluster = Cluster::start(2, capacity);
        cluster.broker.submit(item, Duration::ZERO);

        wait_until(|| cluster.broker.pending() == 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cluster.broker.completed(), 0);

        let stats = cluster.stop();
        assert_eq!(stats[0].processed, 0);
    }

    #[test]
    fn malformed_request_is_dropped() {
        let world = LocalWorld::new(2);
        let broker = Arc::new(QueueBroker::<ParaboloidItem>::new(4));
        let mut master = MpiConsumer::new(
            test_config(4096),
            world.communicator(0).unwrap(),
            broker as Arc<dyn Broker<ParaboloidItem>>,
        );
        master.start().unwrap();
        let comm = world.communicator(1).unwrap();

        comm.send(b"\x2a", MASTER_RANK, TAG_REQUEST_WORK_ITEM).unwrap();
        let getdata = codec::to_bytes(
            &CommandEnvelope::<ParaboloidItem>::new(Command::GetData, None),
            MODE,
        )
        .unwrap();
        comm.send(&getdata, MASTER_RANK, TAG_REQUEST_WORK_ITEM).unwrap();

        let reply = comm.recv(Some(MASTER_RANK), TAG_SEND_WORK_ITEM, 4096).unwrap();
        let reply: CommandEnvelope<ParaboloidItem> =
            codec::from_bytes(&reply.data, MODE).unwrap();
        assert_eq!(reply.command(), Command::NoData);

        master.shutdown();
        assert!(master.stopped());
        world.finalize();
    }

    #[test]
    fn oversized_request_is_answered_with_nodata() {
        let world = LocalWorld::new(2);
        let broker = Arc::new(QueueBroker::<ParaboloidItem>::new(4));
        let mut master = MpiConsumer::new(
            test_config(64),
            world.communicator(0).unwrap(),
            broker.clone() as Arc<dyn Broker<ParaboloidItem>>,
        );
        master.start().unwrap();
        let comm = world.communicator(1).unwrap();

        let mut item = ParaboloidItem::new(1, vec![1.0; 40]);
        item.process().unwrap();
        let request =
            codec::to_bytes(&CommandEnvelope::new(Command::Result, Some(item)), MODE).unwrap();
        assert!(request.len() > 64);
        comm.send(&request, MASTER_RANK, TAG_REQUEST_WORK_ITEM).unwrap();

        let reply = comm.recv(Some(MASTER_RANK), TAG_SEND_WORK_ITEM, 64).unwrap();
        let reply: CommandEnvelope<ParaboloidItem> =
            codec::from_bytes(&reply.data, MODE).unwrap();
        assert_eq!(reply.command(), Command::NoData);
        assert_eq!(broker.completed(), 0);

        master.shutdown();
        world.finalize();
    }

    /// Plays rank 0 for a single exchange, answering with `reply`.
    fn answer_once(world: &LocalWorld, reply: Vec<u8>) -> thread::JoinHandle<()> {
        let master = world.communicator(MASTER_RANK).unwrap();
        thread::spawn(move || {
            let request = master.recv(None, TAG_REQUEST_WORK_ITEM, 4096).unwrap();
            master
                .send(&reply, request.source, TAG_SEND_WORK_ITEM)
                .unwrap();
        })
    }

    #[test]
    fn worker_terminates_on_unknown_command() {
        let world = LocalWorld::new(2);
        let mut reply = codec::to_bytes(
            &CommandEnvelope::<ParaboloidItem>::new(Command::GetData, None),
            MODE,
        )
        .unwrap();
        reply[0] = 42;
        let master = answer_once(&world, reply);

        let mut worker = MpiWorker::<ParaboloidItem, _>::new(
            test_config(4096),
            world.communicator(1).unwrap(),
        )
        .unwrap();
        let res = worker.run();

        assert!(matches!(
            res,
            Err(ClientError::Codec(CodecError::UnknownCommand(UnknownCommand(42))))
        ));
        master.join().unwrap();
    }

    #[test]
    fn worker_terminates_on_unexpected_command() {
        let world = LocalWorld::new(2);
        let reply = codec::to_bytes(
            &CommandEnvelope::<ParaboloidItem>::new(Command::GetData, None),
            MODE,
        )
        .unwrap();
        let master = answer_once(&world, reply);

        let mut worker = MpiWorker::<ParaboloidItem, _>::new(
            test_config(4096),
            world.communicator(1).unwrap(),
        )
        .unwrap();
        let res = worker.run();

        assert!(matches!(
            res,
            Err(ClientError::Protocol(ProtocolError::UnexpectedCommand(
                Command::GetData
            )))
        ));
        master.join().unwrap();
    }

    #[test]
    fn halted_worker_delivers_pending_result() {
        let world = LocalWorld::new(2);
        let broker = Arc::new(QueueBroker::<HaltingItem>::new(4));
        let mut master = MpiConsumer::new(
            test_config(4096),
            world.communicator(0).unwrap(),
            broker.clone() as Arc<dyn Broker<HaltingItem>>,
        );
        master.start().unwrap();
        broker.submit(HaltingItem::new("mpi-halt"), Duration::ZERO);

        let mut worker =
            MpiWorker::<HaltingItem, _>::new(test_config(4096), world.communicator(1).unwrap())
                .unwrap()
                .with_backoff(Backoff::from_millis(1, 5))
                .with_halt(halt_flag("mpi-halt"));
        let stats = worker.run().unwrap();

        assert_eq!(stats.processed, 1);
        let returned = broker.collect(Duration::from_secs(1)).unwrap();
        assert!(returned.processed);

        master.shutdown();
        world.finalize();
    }

    #[test]
    fn master_must_be_rank_zero() {
        let world = LocalWorld::new(2);
        let broker = Arc::new(QueueBroker::<ParaboloidItem>::new(1));
        let mut master = MpiConsumer::new(
            test_config(4096),
            world.communicator(1).unwrap(),
            broker as Arc<dyn Broker<ParaboloidItem>>,
        );

        assert!(matches!(master.start(), Err(ConsumerError::NotMaster(1))));
    }

    #[test]
    fn worker_must_not_be_rank_zero() {
        let world = LocalWorld::new(2);
        let comm = world.communicator(0).unwrap();
        let res = MpiWorker::<ParaboloidItem, _>::new(test_config(4096), comm);

        assert!(matches!(
            res,
            Err(ClientError::Config(ConsumerError::NotWorker))
        ));
    }

    #[test]
    fn worker_stops_when_world_is_finalized() {
        let world = LocalWorld::new(2);
        let mut worker = MpiWorker::<ParaboloidItem, _>::new(
            test_config(4096),
            world.communicator(1).unwrap(),
        )
        .unwrap();
        let handle = thread::spawn(move || worker.run());

        thread::sleep(Duration::from_millis(20));
        world.finalize();

        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats, ClientStats::default());
    }
}
