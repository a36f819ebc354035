//! Bounded single-producer/single-consumer handoff between a connector
//! thread and a committing thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cancel::WAIT_SLICE;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The other side gave up; stop cleanly.
    #[error("channel abandoned")]
    Abandoned,
    #[error("channel lock poisoned")]
    LockPoisoned,
}

/// What a consumer wait produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Fetched<T> {
    Item(T),
    /// Producer signalled done and the queue is drained.
    Done,
    /// Nothing arrived within the wait.
    Empty,
    Abandoned,
}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    done: bool,
    abandoned: bool,
}

#[derive(Debug)]
pub struct CrossThreadChannel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> CrossThreadChannel<T> {
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                done: false,
                abandoned: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State<T>>, ChannelError> {
        self.state.lock().map_err(|_| ChannelError::LockPoisoned)
    }

    /// Enqueue, blocking while full.
    ///
    /// # Errors
    ///
    /// `Abandoned` once [`abandon`](Self::abandon) was called; the item is
    /// dropped.
    pub fn add(&self, item: T) -> Result<(), ChannelError> {
        let mut state = self.lock()?;
        loop {
            if state.abandoned {
                return Err(ChannelError::Abandoned);
            }
            if state.queue.len() < self.capacity {
                state.queue.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = self
                .not_full
                .wait_timeout(state, WAIT_SLICE)
                .map_err(|_| ChannelError::LockPoisoned)?
                .0;
        }
    }

    /// Dequeue, blocking while empty and not done. `Ok(None)` is the
    /// end-of-stream sentinel.
    ///
    /// # Errors
    ///
    /// `Abandoned` once [`abandon`](Self::abandon) was called.
    pub fn fetch(&self) -> Result<Option<T>, ChannelError> {
        loop {
            match self.fetch_timeout(WAIT_SLICE)? {
                Fetched::Item(item) => return Ok(Some(item)),
                Fetched::Done => return Ok(None),
                Fetched::Abandoned => return Err(ChannelError::Abandoned),
                Fetched::Empty => {}
            }
        }
    }

    /// Dequeue, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Only on a poisoned lock.
    pub fn fetch_timeout(&self, timeout: Duration) -> Result<Fetched<T>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if state.abandoned {
                return Ok(Fetched::Abandoned);
            }
            if let Some(item) = state.queue.pop_front() {
                self.not_full.notify_one();
                return Ok(Fetched::Item(item));
            }
            if state.done {
                return Ok(Fetched::Done);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Fetched::Empty);
            }
            state = self
                .not_empty
                .wait_timeout(state, (deadline - now).min(WAIT_SLICE))
                .map_err(|_| ChannelError::LockPoisoned)?
                .0;
        }
    }

    /// No more items will be added.
    pub fn signal_done(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.done = true;
        }
        self.not_empty.notify_all();
    }

    /// Wake every waiter; later operations are no-ops.
    pub fn abandon(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.abandoned = true;
            state.queue.clear();
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.state.lock().map_or(true, |s| s.abandoned)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map_or(0, |s| s.queue.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for CrossThreadChannel<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
