//! In-process consumers.
//!
//! Worker threads take items straight from the broker, process them and hand
//! them back. Nothing is serialized and there is no client side. The serial
//! flavour runs a single worker thread.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
};

use log::{debug, info, warn};

use crate::{
    broker::{Broker, BrokerPort},
    context::hardware_concurrency,
    payload::Processable,
};

use super::{Consumer, ConsumerConfig, ConsumerError};

/// Processes work items on local threads.
pub struct ThreadConsumer<P> {
    config: ConsumerConfig,
    port: BrokerPort<P>,
    serial: bool,
    stop: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<P: Processable> ThreadConsumer<P> {
    /// `config.threads` workers, or one per core if it is `0`.
    pub fn new(config: ConsumerConfig, broker: Arc<dyn Broker<P>>) -> Self {
        Self::build(config, broker, false)
    }

    /// A single worker thread, whatever `config.threads` says.
    pub fn serial(config: ConsumerConfig, broker: Arc<dyn Broker<P>>) -> Self {
        Self::build(config, broker, true)
    }

    fn build(config: ConsumerConfig, broker: Arc<dyn Broker<P>>, serial: bool) -> Self {
        let port = BrokerPort::new(broker, config.broker_timeout);
        Self {
            config,
            port,
            serial,
            stop: Arc::new(AtomicBool::new(true)),
            processed: Arc::new(AtomicU64::new(0)),
            workers: Vec::new(),
        }
    }

    pub fn threads(&self) -> usize {
        match (self.serial, self.config.threads) {
            (true, _) => 1,
            (false, 0) => hardware_concurrency(),
            (false, n) => n,
        }
    }

    /// Items processed and returned to the broker so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl<P: Processable> Consumer for ThreadConsumer<P> {
    fn start(&mut self) -> Result<(), ConsumerError> {
        self.config.validate()?;
        if !self.workers.is_empty() {
            warn!("{} is already running; start() ignored", self.name());
            return Ok(());
        }

        self.stop.store(false, Ordering::SeqCst);
        for id in 0..self.threads() {
            let port = self.port.clone();
            let stop = Arc::clone(&self.stop);
            let processed = Arc::clone(&self.processed);
            let spawned = thread::Builder::new()
                .name(format!("local-worker-{id}"))
                .spawn(move || work_loop(id, &port, &stop, &processed));

            match spawned {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    self.shutdown();
                    return Err(e.into());
                }
            }
        }

        info!("{} started with {} threads", self.name(), self.workers.len());
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.workers.is_empty() {
            return;
        }
        for (id, worker) in self.workers.drain(..).enumerate() {
            if worker.join().is_err() {
                warn!("local worker {id} panicked");
            }
        }
        info!(
            "{} has shut down after processing {} items",
            self.name(),
            self.processed()
        );
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        if self.serial {
            "SerialConsumer"
        } else {
            "ThreadConsumer"
        }
    }

    fn mnemonic(&self) -> &'static str {
        if self.serial { "sc" } else { "stc" }
    }

    fn processing_units_estimate(&self) -> (usize, bool) {
        (self.threads(), true)
    }
}

impl<P> Drop for ThreadConsumer<P> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Get, process, put until `stop` is raised. The broker timeout bounds each wait.
fn work_loop<P: Processable>(
    id: usize,
    port: &BrokerPort<P>,
    stop: &AtomicBool,
    processed: &AtomicU64,
) {
    while !stop.load(Ordering::SeqCst) {
        let Some(mut item) = port.get_payload_item() else {
            continue;
        };
        if let Err(e) = item.process() {
            warn!("local worker {id} discards an item: {e}");
            continue;
        }
        if port.put_payload_item(item) {
            processed.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!("local worker {id} has terminated");
}
