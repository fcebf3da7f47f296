//! Delivery queue for received frames.
//!
//! Receive threads for each audio device append here; a single drain
//! thread consumes serially so downstream processing never needs to be
//! reentrant. If the queue keeps growing the consumer is stuck - the
//! classic cause is a pseudo-terminal client that stopped reading - so
//! appends past a soft bound log a warning.

use ax25core::ax25::Ax25Frame;
use ax25core::decode::RetryLevel;
use log::warn;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Queue length above which the consumer is presumed frozen.
const COMPLAIN_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecType {
    None,
    Fx25,
}

/// Demodulator signal strength figures, 0..=100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioLevel {
    pub rec: u8,
    pub mark: u8,
    pub space: u8,
}

impl fmt::Display for AudioLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}/{})", self.rec, self.mark, self.space)
    }
}

/// One received-frame event.
pub struct DlqItem {
    pub chan: u8,
    pub subchan: u8,
    pub slicer: u8,
    pub frame: Ax25Frame,
    pub alevel: AudioLevel,
    pub fec_type: FecType,
    pub retries: RetryLevel,
    /// One character per decoder slot showing which slots decoded this
    /// frame, subchannels separated by '.'.
    pub spectrum: String,
}

struct Inner {
    queue: VecDeque<DlqItem>,
    consumer_waiting: bool,
}

pub struct Dlq {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Dlq {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                consumer_waiting: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Append one event and wake the consumer if it is waiting.
    pub fn append(&self, item: DlqItem) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(item);
        if inner.queue.len() > COMPLAIN_LEN {
            warn!(
                "received frame queue is out of control, length {}; the reader thread \
                 is probably frozen (is anything draining the client side?)",
                inner.queue.len()
            );
        }
        if inner.consumer_waiting {
            self.wake.notify_one();
        }
    }

    /// Sleep while the queue is empty. A zero timeout waits forever.
    ///
    /// Returns true if the timeout expired before anything arrived.
    pub fn wait_while_empty(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queue.is_empty() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        inner.consumer_waiting = true;
        let timed_out = loop {
            if !inner.queue.is_empty() {
                break false;
            }
            if timeout.is_zero() {
                inner = self.wake.wait(inner).unwrap();
            } else {
                let now = Instant::now();
                if now >= deadline {
                    break true;
                }
                let (guard, _) = self.wake.wait_timeout(inner, deadline - now).unwrap();
                inner = guard;
            }
        };
        inner.consumer_waiting = false;
        timed_out
    }

    /// Take the head of the queue without blocking.
    pub fn remove(&self) -> Option<DlqItem> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Wake the consumer so it can notice a shutdown flag.
    pub fn nudge(&self) {
        let inner = self.inner.lock().unwrap();
        if inner.consumer_waiting {
            self.wake.notify_one();
        }
    }
}

impl Default for Dlq {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item(tag: u8) -> DlqItem {
        DlqItem {
            chan: 0,
            subchan: 0,
            slicer: 0,
            frame: Ax25Frame::new_ui("N0CALL", "APZ001", &[], &[tag]).unwrap(),
            alevel: AudioLevel::default(),
            fec_type: FecType::None,
            retries: RetryLevel::None,
            spectrum: String::new(),
        }
    }

    #[test]
    fn preserves_append_order() {
        let dlq = Dlq::new();
        for tag in 0..20 {
            dlq.append(item(tag));
        }
        for tag in 0..20 {
            assert_eq!(dlq.remove().unwrap().frame.info(), &[tag]);
        }
        assert!(dlq.remove().is_none());
    }

    #[test]
    fn timed_wait_expires() {
        let dlq = Dlq::new();
        let start = Instant::now();
        assert!(dlq.wait_while_empty(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_returns_immediately_when_non_empty() {
        let dlq = Dlq::new();
        dlq.append(item(1));
        assert!(!dlq.wait_while_empty(Duration::from_millis(500)));
    }

    #[test]
    fn producer_wakes_blocked_consumer() {
        let dlq = Arc::new(Dlq::new());
        let dlq2 = dlq.clone();
        let consumer = std::thread::spawn(move || {
            let timed_out = dlq2.wait_while_empty(Duration::ZERO);
            (timed_out, dlq2.remove().unwrap().frame.info().to_vec())
        });
        std::thread::sleep(Duration::from_millis(50));
        dlq.append(item(7));
        let (timed_out, info) = consumer.join().unwrap();
        assert!(!timed_out);
        assert_eq!(info, vec![7]);
    }

    #[test]
    fn audio_level_display() {
        let a = AudioLevel {
            rec: 42,
            mark: 10,
            space: 12,
        };
        assert_eq!(a.to_string(), "42(10/12)");
    }
}
