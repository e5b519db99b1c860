//! In-process message-passing world.
//!
//! Every rank of a [`LocalWorld`] lives in the same process, usually on its own
//! thread. A send completes once a matching receive has taken the message, which
//! mirrors synchronous-mode sends of a real message-passing library.
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use super::{Communicator, MpiError, Received, Request, Tag};

#[derive(Debug)]
struct Posted {
    id: u64,
    source: usize,
    tag: Tag,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Mailboxes {
    queues: Vec<VecDeque<Posted>>,
    delivered: HashSet<u64>,
    next_id: u64,
    finalized: bool,
}

#[derive(Debug)]
struct WorldState {
    size: usize,
    mailboxes: Mutex<Mailboxes>,
    changed: Condvar,
}

impl WorldState {
    fn lock(&self) -> MutexGuard<'_, Mailboxes> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Mailboxes>) -> MutexGuard<'a, Mailboxes> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_rank(&self, rank: usize) -> Result<(), MpiError> {
        if rank < self.size {
            Ok(())
        } else {
            Err(MpiError::InvalidRank {
                rank,
                size: self.size,
            })
        }
    }

    fn post(
        &self,
        source: usize,
        dest: usize,
        tag: Tag,
        data: Vec<u8>,
    ) -> Result<u64, MpiError> {
        self.check_rank(dest)?;
        let mut boxes = self.lock();
        if boxes.finalized {
            return Err(MpiError::Finalized);
        }

        let id = boxes.next_id;
        boxes.next_id += 1;
        boxes.queues[dest].push_back(Posted {
            id,
            source,
            tag,
            data,
        });
        self.changed.notify_all();
        Ok(id)
    }

    /// Takes a matching message out of `rank`'s mailbox, if there is one.
    fn take(
        &self,
        boxes: &mut Mailboxes,
        rank: usize,
        source: Option<usize>,
        tag: Tag,
        capacity: usize,
    ) -> Option<Result<Received, MpiError>> {
        let queue = &mut boxes.queues[rank];
        let position = queue
            .iter()
            .position(|m| m.tag == tag && source.is_none_or(|s| s == m.source))?;
        let posted = queue.remove(position)?;

        boxes.delivered.insert(posted.id);
        self.changed.notify_all();

        if posted.data.len() > capacity {
            return Some(Err(MpiError::Truncated {
                sender: posted.source,
                size: posted.data.len(),
                capacity,
            }));
        }
        Some(Ok(Received {
            source: posted.source,
            data: posted.data,
        }))
    }

    fn delivered(&self, boxes: &mut Mailboxes, id: u64) -> Option<Result<(), MpiError>> {
        if boxes.delivered.remove(&id) {
            Some(Ok(()))
        } else if boxes.finalized {
            Some(Err(MpiError::Finalized))
        } else {
            None
        }
    }
}

/// A set of ranks connected by in-memory mailboxes.
#[derive(Debug, Clone)]
pub struct LocalWorld {
    state: Arc<WorldState>,
}

impl LocalWorld {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);

        let mailboxes = Mailboxes {
            queues: (0..size).map(|_| VecDeque::new()).collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(WorldState {
                size,
                mailboxes: Mutex::new(mailboxes),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.state.size
    }

    pub fn communicator(&self, rank: usize) -> Result<LocalCommunicator, MpiError> {
        self.state.check_rank(rank)?;
        Ok(LocalCommunicator {
            rank,
            state: Arc::clone(&self.state),
        })
    }

    /// One communicator per rank, in rank order.
    pub fn communicators(&self) -> Vec<LocalCommunicator> {
        (0..self.state.size)
            .map(|rank| LocalCommunicator {
                rank,
                state: Arc::clone(&self.state),
            })
            .collect()
    }

    /// Ends the world; blocked and future operations fail with [`MpiError::Finalized`].
    pub fn finalize(&self) {
        let mut boxes = self.state.lock();
        boxes.finalized = true;
        self.state.changed.notify_all();
    }
}

/// One rank's view of a [`LocalWorld`].
#[derive(Debug, Clone)]
pub struct LocalCommunicator {
    rank: usize,
    state: Arc<WorldState>,
}

impl Communicator for LocalCommunicator {
    type RecvRequest = LocalRecv;
    type SendRequest = LocalSend;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.size
    }

    fn send(&self, data: &[u8], dest: usize, tag: Tag) -> Result<(), MpiError> {
        let id = self.state.post(self.rank, dest, tag, data.to_vec())?;

        let mut boxes = self.state.lock();
        loop {
            if let Some(done) = self.state.delivered(&mut boxes, id) {
                return done;
            }
            boxes = self.state.wait(boxes);
        }
    }

    fn recv(
        &self,
        source: Option<usize>,
        tag: Tag,
        capacity: usize,
    ) -> Result<Received, MpiError> {
        if let Some(source) = source {
            self.state.check_rank(source)?;
        }

        let mut boxes = self.state.lock();
        loop {
            let taken = self
                .state
                .take(&mut boxes, self.rank, source, tag, capacity);
            if let Some(received) = taken {
                return received;
            }
            if boxes.finalized {
                return Err(MpiError::Finalized);
            }
            boxes = self.state.wait(boxes);
        }
    }

    fn irecv(
        &self,
        source: Option<usize>,
        tag: Tag,
        capacity: usize,
    ) -> Result<LocalRecv, MpiError> {
        if let Some(source) = source {
            self.state.check_rank(source)?;
        }
        Ok(LocalRecv {
            rank: self.rank,
            source,
            tag,
            capacity,
            state: Arc::clone(&self.state),
        })
    }

    fn isend(&self, data: Vec<u8>, dest: usize, tag: Tag) -> Result<LocalSend, MpiError> {
        let id = self.state.post(self.rank, dest, tag, data)?;
        Ok(LocalSend {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

/// Pending receive of a [`LocalCommunicator`].
#[derive(Debug)]
pub struct LocalRecv {
    rank: usize,
    source: Option<usize>,
    tag: Tag,
    capacity: usize,
    state: Arc<WorldState>,
}

impl Request for LocalRecv {
    type Output = Received;

    fn test(&mut self) -> Result<Option<Received>, MpiError> {
        let mut boxes = self.state.lock();
        match self
            .state
            .take(&mut boxes, self.rank, self.source, self.tag, self.capacity)
        {
            Some(received) => received.map(Some),
            None if boxes.finalized => Err(MpiError::Finalized),
            None => Ok(None),
        }
    }
}

/// Pending send of a [`LocalCommunicator`].
#[derive(Debug)]
pub struct LocalSend {
    id: u64,
    state: Arc<WorldState>,
}

impl Request for LocalSend {
    type Output = ();

    fn test(&mut self) -> Result<Option<()>, MpiError> {
        let mut boxes = self.state.lock();
        self.state.delivered(&mut boxes, self.id).transpose()
    }
}
