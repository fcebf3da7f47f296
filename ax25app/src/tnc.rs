//! Top-level runtime: owns the queues and spawns every thread.
//!
//! One receive dispatcher per audio device, one transmit scheduler per
//! radio channel, and a single delivery drain. Shutdown is a token
//! observed at every suspension point; the last act is forcing every PTT
//! line off.

use crate::app::{AppDispatcher, KissSink};
use crate::audio::{AudioOut, SampleSink, SampleSource};
use crate::config::{adev_first_chan, ChannelConfig, MAX_CHANS};
use crate::dlq::Dlq;
use crate::error::TncError;
use crate::ptt::{PttControl, SharedPtt};
use crate::recv::{ChannelStatus, RecvChannel, RecvDispatcher};
use crate::txq::{Priority, TxQueue};
use crate::xmit::{spawn_xmit_thread, AfskModulator, XmitChannel, XmitTimings};
use ax25core::ax25::Ax25Frame;
use ax25core::kiss::{KissBuffer, KissCommand, MAX_KISS_FRAME_LEN};
use ax25core::modem::Demodulator;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// One radio channel carried by an audio device.
pub struct ChannelSetup {
    pub config: Arc<ChannelConfig>,
    /// One demodulator per subchannel.
    pub demodulators: Vec<Box<dyn Demodulator>>,
}

/// One audio device and the channels it carries (mono: one, stereo: two).
pub struct DeviceSetup {
    pub source: Box<dyn SampleSource>,
    pub sink: Box<dyn SampleSink>,
    pub sample_rate: u32,
    pub channels: Vec<ChannelSetup>,
    /// Raised on shutdown so a blocked `read_sample` returns.
    pub source_stop: Option<Arc<AtomicBool>>,
}

pub struct Tnc {
    txq: Arc<TxQueue>,
    dlq: Arc<Dlq>,
    shutdown: Arc<AtomicBool>,
    fatal: Arc<AtomicBool>,
    ptt: SharedPtt,
    configs: Vec<Option<Arc<ChannelConfig>>>,
    statuses: Vec<Option<Arc<ChannelStatus>>>,
    source_stops: Vec<Arc<AtomicBool>>,
    threads: Vec<JoinHandle<()>>,
}

impl Tnc {
    /// Wire up queues and spawn every thread. The TNC is live on return.
    pub fn start(
        devices: Vec<DeviceSetup>,
        ptt: PttControl,
        kiss_sinks: Vec<Box<dyn KissSink>>,
        timings: XmitTimings,
    ) -> Self {
        let txq = Arc::new(TxQueue::new());
        let dlq = Arc::new(Dlq::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let fatal = Arc::new(AtomicBool::new(false));
        let ptt: SharedPtt = Arc::new(Mutex::new(ptt));
        let mut configs: Vec<Option<Arc<ChannelConfig>>> = vec![None; MAX_CHANS];
        let mut statuses: Vec<Option<Arc<ChannelStatus>>> = vec![None; MAX_CHANS];
        let mut source_stops = Vec::new();
        let mut threads = Vec::new();

        for (adev, dev) in devices.into_iter().enumerate() {
            let num_channels = dev.channels.len() as u8;
            debug_assert!(num_channels == 1 || num_channels == 2);
            let audio_out = Arc::new(Mutex::new(AudioOut::new(dev.sink, adev, num_channels)));
            let dev_tx_lock = Arc::new(Mutex::new(()));
            let mut recv_channels = Vec::new();

            for (i, setup) in dev.channels.into_iter().enumerate() {
                let chan = adev_first_chan(adev) + i;
                let status = Arc::new(ChannelStatus::new());
                configs[chan] = Some(setup.config.clone());
                statuses[chan] = Some(status.clone());

                recv_channels.push(RecvChannel::new(
                    chan as u8,
                    setup.config.clone(),
                    status.clone(),
                    setup.demodulators,
                    dev.sample_rate,
                ));

                let modulator = AfskModulator::new(
                    chan,
                    &setup.config,
                    dev.sample_rate,
                    audio_out.clone(),
                );
                threads.push(spawn_xmit_thread(XmitChannel {
                    chan,
                    config: setup.config,
                    status,
                    txq: txq.clone(),
                    ptt: ptt.clone(),
                    dev_tx_lock: dev_tx_lock.clone(),
                    modulator: Box::new(modulator),
                    timings,
                    shutdown: shutdown.clone(),
                }));
            }

            if let Some(stop) = dev.source_stop {
                source_stops.push(stop);
            }
            threads.push(
                RecvDispatcher {
                    source: dev.source,
                    channels: recv_channels,
                    dlq: dlq.clone(),
                    ptt: ptt.clone(),
                    shutdown: shutdown.clone(),
                    fatal: fatal.clone(),
                }
                .spawn(),
            );
        }

        threads.push(
            AppDispatcher {
                dlq: dlq.clone(),
                sinks: kiss_sinks,
                shutdown: shutdown.clone(),
                monitor: Box::new(std::io::stdout()),
            }
            .spawn(),
        );

        Self {
            txq,
            dlq,
            shutdown,
            fatal,
            ptt,
            configs,
            statuses,
            source_stops,
            threads,
        }
    }

    /// Queue a frame for transmission. Digipeated traffic should use
    /// [`Priority::Hi`].
    pub fn queue_frame(
        &self,
        chan: usize,
        prio: Priority,
        frame: Ax25Frame,
    ) -> Result<(), TncError> {
        if chan >= MAX_CHANS || self.configs[chan].is_none() {
            return Err(TncError::ChannelOutOfRange(chan));
        }
        if self.txq.is_closed() {
            return Err(TncError::QueueClosed);
        }
        self.txq.append(chan, prio, frame);
        Ok(())
    }

    /// Handle for one host KISS connection.
    pub fn host_kiss(&self) -> HostKiss {
        HostKiss {
            buffer: KissBuffer::new(),
            txq: self.txq.clone(),
            configs: self.configs.clone(),
            scratch: [0u8; MAX_KISS_FRAME_LEN],
        }
    }

    /// Composite busy state, exposed for an external TX-inhibit input.
    pub fn channel_status(&self, chan: usize) -> Option<Arc<ChannelStatus>> {
        self.statuses.get(chan)?.clone()
    }

    /// True after an unrecoverable failure such as audio stream EOF; the
    /// embedding application should exit nonzero.
    pub fn failed(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    /// Stop every thread, then force PTT off.
    pub fn close(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.txq.close();
        self.dlq.nudge();
        for stop in &self.source_stops {
            stop.store(true, Ordering::Relaxed);
        }
        for handle in self.threads {
            if handle.join().is_err() {
                warn!("a TNC thread panicked during shutdown");
            }
        }
        self.ptt.lock().unwrap().all_ptt_off();
    }
}

/// Reassembles and acts on KISS bytes arriving from one host client:
/// data frames are queued for transmission, parameter commands update
/// the channel's timing configuration.
pub struct HostKiss {
    buffer: KissBuffer,
    txq: Arc<TxQueue>,
    configs: Vec<Option<Arc<ChannelConfig>>>,
    scratch: [u8; MAX_KISS_FRAME_LEN],
}

impl HostKiss {
    /// Feed bytes as they arrive off the wire, in any chunking.
    pub fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let target = self.buffer.buf_remaining();
            let n = bytes.len().min(target.len());
            target[0..n].copy_from_slice(&bytes[0..n]);
            self.buffer.did_write(n);
            bytes = &bytes[n..];

            while let Some(frame) = self.buffer.next_frame() {
                let Ok(port) = frame.port() else { continue };
                let Ok(command) = frame.command() else {
                    debug!("ignoring unsupported KISS command from host");
                    continue;
                };
                let chan = port as usize;
                let Some(config) = self.configs.get(chan).and_then(|c| c.clone()) else {
                    debug!("KISS frame for unconfigured port {}", port);
                    continue;
                };

                let Ok(len) = frame.decode_payload(&mut self.scratch) else {
                    continue;
                };
                let payload = &self.scratch[0..len];

                match command {
                    KissCommand::DataFrame => match Ax25Frame::from_bytes(payload) {
                        Ok(frame) => self.txq.append(chan, Priority::Lo, frame),
                        Err(e) => warn!("host sent invalid AX.25 frame: {:?}", e),
                    },
                    KissCommand::TxDelay => {
                        if let [v] = payload {
                            config.set_txdelay(*v as u32);
                        }
                    }
                    KissCommand::Persistence => {
                        if let [v] = payload {
                            config.set_persist(*v as u32);
                        }
                    }
                    KissCommand::SlotTime => {
                        if let [v] = payload {
                            config.set_slottime(*v as u32);
                        }
                    }
                    KissCommand::TxTail => {
                        if let [v] = payload {
                            config.set_txtail(*v as u32);
                        }
                    }
                    KissCommand::FullDuplex => {
                        if let [v] = payload {
                            config.set_fulldup(*v != 0);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptt::OutputControl;
    use crate::test_util::{ChannelSource, CollectSink, ScriptedDemodulator};
    use ax25core::encode::HdlcEncoder;
    use ax25core::kiss::KissFrame;
    use std::sync::mpsc;
    use std::time::Duration;

    fn fast_config() -> Arc<ChannelConfig> {
        let config = Arc::new(ChannelConfig::new(48000, 1200, 2200));
        config.set_txdelay(1);
        config.set_txtail(1);
        config.set_slottime(0);
        config.set_persist(255);
        config
    }

    fn start_single_channel_tnc(
        demod: ScriptedDemodulator,
        config: Arc<ChannelConfig>,
        kiss_sinks: Vec<Box<dyn KissSink>>,
    ) -> (Tnc, Arc<Mutex<Vec<i16>>>, Arc<Mutex<Vec<bool>>>, mpsc::Sender<i16>) {
        let (sample_tx, sample_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let samples_out = Arc::new(Mutex::new(Vec::new()));

        let ptt_log = Arc::new(Mutex::new(Vec::new()));
        struct Line(Arc<Mutex<Vec<bool>>>);
        impl crate::ptt::PttLine for Line {
            fn set(&mut self, on: bool) -> Result<(), TncError> {
                self.0.lock().unwrap().push(on);
                Ok(())
            }
        }
        let mut ptt = PttControl::new();
        ptt.attach(OutputControl::Ptt, 0, Box::new(Line(ptt_log.clone())));

        let tnc = Tnc::start(
            vec![DeviceSetup {
                source: Box::new(ChannelSource {
                    rx: sample_rx,
                    stop: stop.clone(),
                }),
                sink: Box::new(CollectSink(samples_out.clone())),
                sample_rate: 48000,
                channels: vec![ChannelSetup {
                    config,
                    demodulators: vec![Box::new(demod)],
                }],
                source_stop: Some(stop),
            }],
            ptt,
            kiss_sinks,
            XmitTimings::default(),
        );
        (tnc, samples_out, ptt_log, sample_tx)
    }

    #[test]
    fn transmit_path_produces_audio_between_ptt_edges() {
        let demod = ScriptedDemodulator::new(1, vec![]);
        let (tnc, samples, ptt_log, _sample_tx) =
            start_single_channel_tnc(demod, fast_config(), Vec::new());

        let frame = Ax25Frame::new_ui("N0CALL", "APZ001", &[], b"TEST").unwrap();
        tnc.queue_frame(0, Priority::Lo, frame).unwrap();

        for _ in 0..100 {
            if matches!(ptt_log.lock().unwrap().as_slice(), [true, false]) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*ptt_log.lock().unwrap(), vec![true, false]);
        // Preamble + frame + postamble at one sample per bit, at least.
        assert!(samples.lock().unwrap().len() > 300);
        tnc.close();
    }

    #[test]
    fn queue_frame_validates_channel() {
        let demod = ScriptedDemodulator::new(1, vec![]);
        let (tnc, _, _, _tx) = start_single_channel_tnc(demod, fast_config(), Vec::new());
        let frame = Ax25Frame::new_ui("N0CALL", "APZ001", &[], b"X").unwrap();
        assert!(matches!(
            tnc.queue_frame(5, Priority::Lo, frame),
            Err(TncError::ChannelOutOfRange(5))
        ));
        tnc.close();
    }

    #[test]
    fn host_kiss_data_frame_is_transmitted() {
        let demod = ScriptedDemodulator::new(1, vec![]);
        let (tnc, samples, ptt_log, _tx) =
            start_single_channel_tnc(demod, fast_config(), Vec::new());

        let frame = Ax25Frame::new_ui("N0CALL", "APZ001", &[], b"VIAKISS").unwrap();
        let kiss = KissFrame::new_data_frame(0, frame.as_bytes()).unwrap();
        let mut host = tnc.host_kiss();
        // Deliver in awkward chunks.
        for chunk in kiss.as_bytes().chunks(5) {
            host.write(chunk);
        }

        for _ in 0..100 {
            if matches!(ptt_log.lock().unwrap().as_slice(), [true, false]) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*ptt_log.lock().unwrap(), vec![true, false]);
        assert!(!samples.lock().unwrap().is_empty());
        tnc.close();
    }

    #[test]
    fn host_kiss_commands_update_config() {
        let demod = ScriptedDemodulator::new(1, vec![]);
        let config = fast_config();
        let (tnc, _, _, _tx) = start_single_channel_tnc(demod, config.clone(), Vec::new());

        let mut host = tnc.host_kiss();
        host.write(KissFrame::new_command(0, KissCommand::TxDelay, 45).as_bytes());
        host.write(KissFrame::new_command(0, KissCommand::Persistence, 128).as_bytes());
        host.write(KissFrame::new_command(0, KissCommand::SlotTime, 20).as_bytes());
        host.write(KissFrame::new_command(0, KissCommand::TxTail, 7).as_bytes());
        host.write(KissFrame::new_command(0, KissCommand::FullDuplex, 1).as_bytes());

        assert_eq!(config.txdelay(), 45);
        assert_eq!(config.persist(), 128);
        assert_eq!(config.slottime(), 20);
        assert_eq!(config.txtail(), 7);
        assert!(config.fulldup());
        tnc.close();
    }

    #[test]
    fn receive_path_through_running_tnc() {
        let frame = Ax25Frame::new_ui("N0CALL", "APZ001", &[], b"RXTEST").unwrap();
        let mut enc = HdlcEncoder::new();
        let mut bits = Vec::new();
        enc.send_flags(&mut |b: bool| bits.push(b), 4);
        enc.send_frame(&mut |b: bool| bits.push(b), frame.as_bytes(), false);
        enc.send_flags(&mut |b: bool| bits.push(b), 2);
        let nbits = bits.len();

        struct Collect(Arc<Mutex<Vec<(u8, Vec<u8>)>>>);
        impl KissSink for Collect {
            fn send_frame(&mut self, chan: u8, frame: &[u8]) -> std::io::Result<()> {
                self.0.lock().unwrap().push((chan, frame.to_vec()));
                Ok(())
            }
        }
        let received = Arc::new(Mutex::new(Vec::new()));
        let demod = ScriptedDemodulator::new(1, vec![bits]);
        let (tnc, _, _, sample_tx) = start_single_channel_tnc(
            demod,
            fast_config(),
            vec![Box::new(Collect(received.clone()))],
        );

        // One scripted bit is consumed per sample.
        for _ in 0..nbits {
            sample_tx.send(0).unwrap();
        }

        for _ in 0..100 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let got = received.lock().unwrap();
        assert_eq!(got.as_slice(), &[(0u8, frame.as_bytes().to_vec())]);
        drop(got);
        tnc.close();
    }
}
