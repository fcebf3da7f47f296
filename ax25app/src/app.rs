//! Serial consumer of the delivery queue.
//!
//! A single thread drains received-frame events: each one is printed as
//! a monitoring line and forwarded as a KISS data frame to every
//! configured client sink. Keeping this single-threaded means printing
//! and client writes never need to be reentrant.

use crate::dlq::{Dlq, DlqItem, FecType};
use crate::xmit::safe_info;
use ax25core::decode::RetryLevel;
use ax25core::kiss::KissFrame;
use log::{debug, warn};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Client-facing transport for received frames. The sink applies its own
/// framing/escaping; it receives raw AX.25 bytes.
pub trait KissSink: Send {
    fn send_frame(&mut self, chan: u8, frame: &[u8]) -> std::io::Result<()>;
}

/// Wraps any byte stream (TCP socket, pseudo-terminal, file) as a KISS
/// sink, applying standard KISS escaping.
pub struct WriteKissSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriteKissSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> KissSink for WriteKissSink<W> {
    fn send_frame(&mut self, chan: u8, frame: &[u8]) -> std::io::Result<()> {
        let kiss = KissFrame::new_data_frame(chan, frame)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "oversized frame"))?;
        self.writer.write_all(kiss.as_bytes())?;
        self.writer.flush()
    }
}

pub struct AppDispatcher {
    pub dlq: Arc<Dlq>,
    pub sinks: Vec<Box<dyn KissSink>>,
    pub shutdown: Arc<AtomicBool>,
    pub monitor: Box<dyn Write + Send>,
}

impl AppDispatcher {
    pub fn with_stdout(
        dlq: Arc<Dlq>,
        sinks: Vec<Box<dyn KissSink>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            dlq,
            sinks,
            shutdown,
            monitor: Box::new(std::io::stdout()),
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while !self.shutdown.load(Ordering::Relaxed) {
                if self.dlq.wait_while_empty(Duration::from_millis(100)) {
                    continue;
                }
                while let Some(item) = self.dlq.remove() {
                    self.deliver(&item);
                }
            }
        })
    }

    fn deliver(&mut self, item: &DlqItem) {
        let line = monitor_line(item);
        // One write per line so concurrent logging cannot interleave it.
        if self.monitor.write_all(line.as_bytes()).is_err() {
            debug!("monitor output failed");
        }
        let _ = self.monitor.flush();

        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.send_frame(item.chan, item.frame.as_bytes()) {
                warn!("failed to forward frame to KISS client: {}", e);
            }
        }
    }
}

fn monitor_line(item: &DlqItem) -> String {
    let fec = match item.fec_type {
        FecType::None => "",
        FecType::Fx25 => " FX.25",
    };
    let fix = if item.retries == RetryLevel::None {
        String::new()
    } else {
        format!(" fix={}", item.retries.label())
    };
    format!(
        "[{}.{}.{}] audio level = {} {}{}{} {}{}\n",
        item.chan,
        item.subchan,
        item.slicer,
        item.alevel,
        item.spectrum,
        fec,
        fix,
        item.frame.format_addrs(),
        safe_info(item.frame.info()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::AudioLevel;
    use ax25core::ax25::Ax25Frame;
    use std::sync::Mutex;

    struct Collect(Arc<Mutex<Vec<(u8, Vec<u8>)>>>);

    impl KissSink for Collect {
        fn send_frame(&mut self, chan: u8, frame: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().push((chan, frame.to_vec()));
            Ok(())
        }
    }

    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn item(tag: &[u8]) -> DlqItem {
        DlqItem {
            chan: 1,
            subchan: 0,
            slicer: 2,
            frame: Ax25Frame::new_ui("N0CALL-7", "APZ001", &[("WIDE1-1", true)], tag).unwrap(),
            alevel: AudioLevel {
                rec: 50,
                mark: 25,
                space: 26,
            },
            fec_type: FecType::None,
            retries: RetryLevel::SingleBit,
            spectrum: "_|_".into(),
        }
    }

    #[test]
    fn monitor_line_contents() {
        let line = monitor_line(&item(b"HELLO\x01"));
        assert_eq!(
            line,
            "[1.0.2] audio level = 50(25/26) _|_ fix=single N0CALL-7>APZ001,WIDE1-1*:HELLO.\n"
        );
    }

    #[test]
    fn dispatcher_forwards_to_all_sinks_in_order() {
        let dlq = Arc::new(Dlq::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let sink_a = Arc::new(Mutex::new(Vec::new()));
        let sink_b = Arc::new(Mutex::new(Vec::new()));
        let monitor = SharedBuf(Arc::new(Mutex::new(Vec::new())));

        let handle = AppDispatcher {
            dlq: dlq.clone(),
            sinks: vec![
                Box::new(Collect(sink_a.clone())),
                Box::new(Collect(sink_b.clone())),
            ],
            shutdown: shutdown.clone(),
            monitor: Box::new(monitor.clone()),
        }
        .spawn();

        let first = item(b"ONE");
        let expect = first.frame.as_bytes().to_vec();
        dlq.append(first);
        dlq.append(item(b"TWO"));

        // Dispatcher polls with a 100 ms timeout.
        for _ in 0..50 {
            if sink_b.lock().unwrap().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::Relaxed);
        dlq.nudge();
        handle.join().unwrap();

        let a = sink_a.lock().unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0], (1, expect.clone()));
        assert_eq!(*a, *sink_b.lock().unwrap());

        let text = String::from_utf8(monitor.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("ONE"));
    }

    #[test]
    fn write_kiss_sink_escapes_and_frames() {
        let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let mut sink = WriteKissSink::new(buf.clone());
        sink.send_frame(3, &[0x01, 0xC0, 0x02]).unwrap();
        let written = buf.0.lock().unwrap().clone();
        assert_eq!(written, vec![0xC0, 0x30, 0x01, 0xDB, 0xDC, 0x02, 0xC0]);
    }
}
