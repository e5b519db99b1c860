use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use ferry::{
    Broker, Client, Consumer, ParaboloidItem, QueueBroker,
    cli::{ConnectionArgs, Transport},
    consumer::{
        DEFAULT_BROKER_TIMEOUT_MS,
        mpi::{LocalWorld, MpiConsumer, MpiWorker},
        socket::SocketConsumer,
        thread::ThreadConsumer,
        websocket::WebsocketConsumer,
    },
};
use log::{info, warn};
use rand::Rng;

const WAIT_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(version, about = "Hands out paraboloid evaluations to ferry workers", long_about = None)]
struct Cli {
    /// Transport used to reach the workers
    #[arg(long, value_enum, default_value_t = Transport::Socket)]
    transport: Transport,
    #[command(flatten)]
    connection: ConnectionArgs,
    /// Number of work items to hand out
    #[arg(long, default_value_t = 1000)]
    items: u64,
    /// Parameters per work item
    #[arg(long, default_value_t = 8)]
    dimensions: usize,
    /// Threads serving connections or processing items locally; 0 uses every core
    #[arg(long, default_value_t = 0)]
    threads: usize,
    /// Pin serving threads to cores
    #[arg(long)]
    pin_threads: bool,
    /// Let all serving threads share a single event loop
    #[arg(long)]
    shared_context: bool,
    /// Do not set SO_REUSEADDR on the listening socket
    #[arg(long)]
    no_reuse_address: bool,
    /// Milliseconds to wait on the work queues
    #[arg(long, default_value_t = DEFAULT_BROKER_TIMEOUT_MS)]
    broker_timeout: u64,
    /// Capacity of both work queues
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    /// Ranks of the in-process world, including the master (mpi only)
    #[arg(long, default_value_t = 4)]
    ranks: usize,
}

fn random_item(id: u64, dimensions: usize) -> ParaboloidItem {
    let mut rng = rand::rng();
    let parameters = (0..dimensions)
        .map(|_| rng.random_range(-10.0..10.0))
        .collect();
    ParaboloidItem::new(id, parameters)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = cli.connection.config();
    config.threads = cli.threads;
    config.pin_threads = cli.pin_threads;
    config.multiple_contexts = !cli.shared_context;
    config.reuse_address = !cli.no_reuse_address;
    config.broker_timeout = Duration::from_millis(cli.broker_timeout);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    let broker = Arc::new(QueueBroker::<ParaboloidItem>::new(cli.queue_capacity));
    let port = Arc::clone(&broker) as Arc<dyn Broker<ParaboloidItem>>;

    let world = LocalWorld::new(cli.ranks.max(2));
    let halt = Arc::new(AtomicBool::new(false));
    let mut ranks = Vec::new();

    let mut consumer: Box<dyn Consumer> = match cli.transport {
        Transport::Socket => Box::new(SocketConsumer::new(config, port)),
        Transport::Ws => Box::new(WebsocketConsumer::new(config, port)),
        Transport::Mpi => {
            for rank in 1..world.size() {
                let mut worker =
                    MpiWorker::<ParaboloidItem, _>::new(config.clone(), world.communicator(rank)?)?
                        .with_halt(Arc::clone(&halt));
                ranks.push(thread::spawn(move || worker.run()));
            }
            Box::new(MpiConsumer::new(config, world.communicator(0)?, port))
        }
        Transport::Threads => Box::new(ThreadConsumer::new(config, port)),
        Transport::Serial => Box::new(ThreadConsumer::serial(config, port)),
    };

    consumer.start()?;
    let (units, exact) = consumer.processing_units_estimate();
    info!(
        "{} ({}) started; {} {units} processing units",
        consumer.name(),
        consumer.mnemonic(),
        if exact { "exactly" } else { "currently" }
    );

    let producer = {
        let broker = Arc::clone(&broker);
        let interrupted = Arc::clone(&interrupted);
        let (items, dimensions) = (cli.items, cli.dimensions);
        thread::spawn(move || {
            for id in 0..items {
                while !broker.submit(random_item(id, dimensions), WAIT_STEP) {
                    if interrupted.load(Ordering::SeqCst) {
                        return;
                    }
                }
            }
        })
    };

    let start = Instant::now();
    let mut collected = 0u64;
    let mut best: Option<ParaboloidItem> = None;
    while collected < cli.items && !interrupted.load(Ordering::SeqCst) {
        let Some(item) = broker.collect(WAIT_STEP) else {
            continue;
        };
        collected += 1;

        let better = match (&best, item.result) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(current), Some(result)) => current.result.is_none_or(|c| result < c),
        };
        if better {
            best = Some(item);
        }
    }

    info!(
        "collected {collected} of {} results in {:.2?}",
        cli.items,
        start.elapsed()
    );
    if let Some(best) = best {
        info!("best item #{} with value {:?}", best.id, best.result);
    }

    consumer.shutdown();
    halt.store(true, Ordering::SeqCst);
    world.finalize();
    for rank in ranks {
        match rank.join() {
            Ok(Ok(stats)) => info!("rank finished after processing {} items", stats.processed),
            Ok(Err(e)) => warn!("rank failed: {e}"),
            Err(_) => warn!("rank panicked"),
        }
    }
    if producer.join().is_err() {
        warn!("producer panicked");
    }

    Ok(())
}
