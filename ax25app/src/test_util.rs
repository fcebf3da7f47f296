//! Shared fakes for exercising the pipeline without sound hardware.

use crate::audio::{SampleSink, SampleSource};
use crate::error::TncError;
use crate::ptt::{OutputControl, PttControl, PttLine, SharedPtt};
use crate::xmit::FrameModulator;
use ax25core::ax25::Ax25Frame;
use ax25core::modem::Demodulator;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Emits a pre-scripted raw bit per slicer for each incoming sample.
pub struct ScriptedDemodulator {
    streams: Vec<VecDeque<bool>>,
    dcds: Vec<Arc<AtomicBool>>,
}

impl ScriptedDemodulator {
    pub fn new(num_slicers: usize, scripts: Vec<Vec<bool>>) -> Self {
        let mut streams: Vec<VecDeque<bool>> =
            scripts.into_iter().map(VecDeque::from).collect();
        streams.resize(num_slicers, VecDeque::new());
        Self {
            streams,
            dcds: (0..num_slicers)
                .map(|_| Arc::new(AtomicBool::new(false)))
                .collect(),
        }
    }

    pub fn dcd_handle(&self, slicer: usize) -> Arc<AtomicBool> {
        self.dcds[slicer].clone()
    }
}

impl Demodulator for ScriptedDemodulator {
    fn process_sample(&mut self, _sample: i16, bits: &mut dyn FnMut(u8, bool)) {
        for (slicer, stream) in self.streams.iter_mut().enumerate() {
            if let Some(bit) = stream.pop_front() {
                bits(slicer as u8, bit);
            }
        }
    }

    fn slicer_dcd(&self, slicer: u8) -> bool {
        self.dcds[slicer as usize].load(std::sync::atomic::Ordering::Relaxed)
    }

    fn num_slicers(&self) -> u8 {
        self.streams.len() as u8
    }

    fn audio_level(&self) -> (u8, u8, u8) {
        (50, 25, 25)
    }
}

/// Everything the transmit path does, in order, PTT edges included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxEvent {
    PttOn,
    PttOff,
    Preamble(usize),
    Frame(Vec<u8>, bool),
    Postamble(usize),
}

pub type EventLog = Arc<Mutex<Vec<TxEvent>>>;

/// PTT line that records keying edges into a shared event log.
pub struct LogPtt(pub EventLog);

impl PttLine for LogPtt {
    fn set(&mut self, on: bool) -> Result<(), TncError> {
        self.0
            .lock()
            .unwrap()
            .push(if on { TxEvent::PttOn } else { TxEvent::PttOff });
        Ok(())
    }
}

/// Modulator double that records what it is asked to send.
///
/// Bit counts are nominal (eight per preamble/postamble flag byte, eight
/// per frame byte) so duration math stays exercised.
pub struct FakeModulator(pub EventLog);

impl FrameModulator for FakeModulator {
    fn preamble(&mut self, nflags: usize) -> usize {
        self.0.lock().unwrap().push(TxEvent::Preamble(nflags));
        nflags * 8
    }

    fn frame(&mut self, frame: &Ax25Frame, bad_fcs: bool) -> usize {
        self.0
            .lock()
            .unwrap()
            .push(TxEvent::Frame(frame.as_bytes().to_vec(), bad_fcs));
        (frame.len() + 2) * 8 + 16
    }

    fn postamble(&mut self, nflags: usize) -> usize {
        self.0.lock().unwrap().push(TxEvent::Postamble(nflags));
        nflags * 8
    }

    fn wait_drain(&mut self) {}
}

/// PTT control with a single counting line attached, for DCD tests.
pub struct CountingPtt;

impl CountingPtt {
    pub fn shared(octype: OutputControl, chan: usize) -> (SharedPtt, Arc<Mutex<Vec<bool>>>) {
        struct Line(Arc<Mutex<Vec<bool>>>);
        impl PttLine for Line {
            fn set(&mut self, on: bool) -> Result<(), TncError> {
                self.0.lock().unwrap().push(on);
                Ok(())
            }
        }
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut control = PttControl::new();
        control.attach(octype, chan, Box::new(Line(log.clone())));
        (crate::ptt::shared(control), log)
    }
}

/// Sample source fed through a channel; yields `None` when the sender is
/// dropped or the stop flag is raised.
pub struct ChannelSource {
    pub rx: Receiver<i16>,
    pub stop: Arc<AtomicBool>,
}

impl SampleSource for ChannelSource {
    fn read_sample(&mut self) -> Option<i16> {
        loop {
            if self.stop.load(std::sync::atomic::Ordering::Relaxed) {
                return None;
            }
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(s) => return Some(s),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// Sink that just remembers every sample.
pub struct CollectSink(pub Arc<Mutex<Vec<i16>>>);

impl SampleSink for CollectSink {
    fn put_sample(&mut self, sample: i16) {
        self.0.lock().unwrap().push(sample);
    }

    fn flush(&mut self) {}

    fn wait_drain(&mut self) {}
}
