use std::{
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread,
};

use log::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of threads handling completed requests on the master.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> std::io::Result<Self> {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(i, Arc::clone(&receiver))?);
        }

        Ok(Self { workers, sender })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f` for execution. Returns `false` if the pool is shutting down.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down handler {}", worker.id);

            if worker.thread.join().is_err() {
                warn!("handler {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("mpi-handler-{id}"))
            .spawn(move || {
                loop {
                    let msg = receiver
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    match msg {
                        Ok(job) => {
                            debug!("handler {id} serving a request");
                            job();
                        }
                        Err(_) => {
                            debug!("handler {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[test]
    fn jobs_run_before_drop_returns() {
        let count = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(3).unwrap();
        assert_eq!(pool.size(), 3);

        for _ in 0..10 {
            let count = Arc::clone(&count);
            assert!(pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(pool);

        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
