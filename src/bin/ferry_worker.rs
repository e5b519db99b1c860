use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use ferry::{
    Client, ParaboloidItem,
    cli::{ConnectionArgs, Transport},
    consumer::{DEFAULT_MAX_RECONNECTS, socket::SocketClient, websocket::WebsocketClient},
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about = "Processes work items handed out by a ferry server", long_about = None)]
struct Cli {
    /// Transport of the server to connect to
    #[arg(long, value_enum, default_value_t = Transport::Socket)]
    transport: Transport,
    #[command(flatten)]
    connection: ConnectionArgs,
    /// Consecutive failed connection attempts before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_RECONNECTS)]
    max_reconnects: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = cli.connection.config();
    config.max_reconnects = cli.max_reconnects;

    let halt = Arc::new(AtomicBool::new(false));
    {
        let halt = Arc::clone(&halt);
        ctrlc::set_handler(move || halt.store(true, Ordering::SeqCst))?;
    }

    let mut client: Box<dyn Client> = match cli.transport {
        Transport::Socket => {
            Box::new(SocketClient::<ParaboloidItem>::new(config)?.with_halt(halt))
        }
        Transport::Ws => Box::new(WebsocketClient::<ParaboloidItem>::new(config)?.with_halt(halt)),
        Transport::Mpi => {
            return Err("message-passing workers run inside ferry_server --transport mpi".into());
        }
        Transport::Threads | Transport::Serial => {
            return Err("local transports process items inside ferry_server".into());
        }
    };

    let stats = client.run()?;
    info!(
        "worker finished; {} items processed, {} empty replies",
        stats.processed, stats.nodata
    );
    Ok(())
}
