//! Transmit packet queue.
//!
//! Two FIFOs per channel. Digipeated and otherwise expedited frames go in
//! the high priority queue and are taken first; everything else queues
//! low. Producers append from any thread; only the channel's own transmit
//! scheduler removes.

use crate::config::MAX_CHANS;
use ax25core::ax25::Ax25Frame;
use log::debug;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Hi,
    Lo,
}

#[derive(Default)]
struct ChanQueues {
    hi: VecDeque<Ax25Frame>,
    lo: VecDeque<Ax25Frame>,
}

impl ChanQueues {
    fn select(&mut self, prio: Priority) -> &mut VecDeque<Ax25Frame> {
        match prio {
            Priority::Hi => &mut self.hi,
            Priority::Lo => &mut self.lo,
        }
    }
}

struct Inner {
    chans: [ChanQueues; MAX_CHANS],
    closed: bool,
}

pub struct TxQueue {
    inner: Mutex<Inner>,
    avail: Condvar,
}

impl TxQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                chans: Default::default(),
                closed: false,
            }),
            avail: Condvar::new(),
        }
    }

    pub fn append(&self, chan: usize, prio: Priority, frame: Ax25Frame) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            debug!("discarding frame queued for channel {} after close", chan);
            return;
        }
        inner.chans[chan].select(prio).push_back(frame);
        self.avail.notify_all();
    }

    /// Strict FIFO within the given priority.
    pub fn remove(&self, chan: usize, prio: Priority) -> Option<Ax25Frame> {
        let mut inner = self.inner.lock().unwrap();
        inner.chans[chan].select(prio).pop_front()
    }

    /// A copy of the head frame, which may be gone by the next call.
    pub fn peek(&self, chan: usize, prio: Priority) -> Option<Ax25Frame> {
        let mut inner = self.inner.lock().unwrap();
        inner.chans[chan].select(prio).front().cloned()
    }

    /// Block until either queue for the channel is non-empty.
    ///
    /// Returns false if the queue was closed instead.
    pub fn wait_while_empty(&self, chan: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !inner.chans[chan].hi.is_empty() || !inner.chans[chan].lo.is_empty() {
                return true;
            }
            if inner.closed {
                return false;
            }
            inner = self.avail.wait(inner).unwrap();
        }
    }

    /// Wake all schedulers and make further appends no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.avail.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl Default for TxQueue {
    fn default() -> Self {
        Self::new()
    }
}
