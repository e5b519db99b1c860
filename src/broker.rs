//! Access to the broker that connects producers of work items with consumers.
//!
//! The broker itself is an external collaborator: consumers only ever talk to it
//! through the timeout-bounded [`Broker::get`] / [`Broker::put`] pair. An expired
//! timeout is not an error. An empty `get` turns into a `NODATA` reply and a failed
//! `put` drops the item with a warning.
//!
//! [`QueueBroker`] is a small in-process implementation: a bounded queue of raw
//! items going out to workers, and a bounded queue of processed items coming back.
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use log::{trace, warn};

/// Timeout-bounded producer/consumer queue pair as seen from a consumer.
pub trait Broker<P>: Send + Sync {
    /// Takes the next raw work item, waiting at most `timeout`.
    fn get(&self, timeout: Duration) -> Option<P>;

    /// Returns a processed work item, waiting at most `timeout` for room.
    ///
    /// Returns `false` if the item could not be submitted in time.
    fn put(&self, item: P, timeout: Duration) -> bool;
}

/// The broker-facing functions shared by every session of a consumer.
pub struct BrokerPort<P> {
    broker: Arc<dyn Broker<P>>,
    timeout: Duration,
}

impl<P> Clone for BrokerPort<P> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            timeout: self.timeout,
        }
    }
}

impl<P> BrokerPort<P> {
    pub fn new(broker: Arc<dyn Broker<P>>, timeout: Duration) -> Self {
        Self { broker, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retrieves a work item, or `None` if the broker had nothing within the timeout.
    pub fn get_payload_item(&self) -> Option<P> {
        let item = self.broker.get(self.timeout);
        if item.is_none() {
            trace!("broker had no work item within {:?}", self.timeout);
        }
        item
    }

    /// Hands a processed item back to the broker.
    ///
    /// Items the broker does not accept within the timeout are discarded.
    pub fn put_payload_item(&self, item: P) -> bool {
        let accepted = self.broker.put(item, self.timeout);
        if !accepted {
            warn!(
                "work item could not be submitted to the broker within {:?}; the item will be discarded",
                self.timeout
            );
        }
        accepted
    }
}

struct BoundedQueue<P> {
    items: Mutex<VecDeque<P>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<P> BoundedQueue<P> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, item: P, timeout: Duration) -> Result<(), P> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);

        while items.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(item);
            }
            items = self
                .not_full
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Duration) -> Option<P> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            items = self
                .not_empty
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// In-process broker backed by two bounded queues.
pub struct QueueBroker<P> {
    raw: BoundedQueue<P>,
    processed: BoundedQueue<P>,
}

impl<P> QueueBroker<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            raw: BoundedQueue::new(capacity),
            processed: BoundedQueue::new(capacity),
        }
    }

    /// Producer side: enqueue a raw item for the workers.
    pub fn submit(&self, item: P, timeout: Duration) -> bool {
        self.raw.push(item, timeout).is_ok()
    }

    /// Producer side: take the next processed item.
    pub fn collect(&self, timeout: Duration) -> Option<P> {
        self.processed.pop(timeout)
    }

    pub fn pending(&self) -> usize {
        self.raw.len()
    }

    pub fn completed(&self) -> usize {
        self.processed.len()
    }
}

impl<P: Send> Broker<P> for QueueBroker<P> {
    fn get(&self, timeout: Duration) -> Option<P> {
        self.raw.pop(timeout)
    }

    fn put(&self, item: P, timeout: Duration) -> bool {
        self.processed.push(item, timeout).is_ok()
    }
}
