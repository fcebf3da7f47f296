//! Real sound devices via cpal.
//!
//! cpal streams are callback-driven and not `Send`, so each direction is
//! owned by a small worker thread; the TNC side sees the blocking
//! [`SampleSource`] / [`SampleSink`] traits it expects. A stereo device
//! is opened with both channels and samples stay interleaved.

use crate::audio::{SampleSink, SampleSource};
use crate::error::TncError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, SupportedStreamConfigRange};
use log::{debug, warn};
use std::borrow::Borrow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

fn config_is_compatible<C: Borrow<SupportedStreamConfigRange>>(
    config: C,
    channels: u16,
    sample_rate: u32,
) -> bool {
    let config = config.borrow();
    config.channels() == channels
        && config.sample_format() == SampleFormat::I16
        && config.min_sample_rate().0 <= sample_rate
        && config.max_sample_rate().0 >= sample_rate
}

/// List cards able to capture i16 at the given shape.
pub fn supported_input_cards(channels: u16, sample_rate: u32) -> Vec<String> {
    let mut out = vec![];
    let host = cpal::default_host();
    let Ok(input_devices) = host.input_devices() else {
        return out;
    };
    for d in input_devices {
        let Ok(mut configs) = d.supported_input_configs() else {
            continue;
        };
        if configs.any(|c| config_is_compatible(c, channels, sample_rate)) {
            let Ok(name) = d.name() else {
                continue;
            };
            out.push(name);
        }
    }
    out.sort();
    out
}

/// List cards able to play i16 at the given shape.
pub fn supported_output_cards(channels: u16, sample_rate: u32) -> Vec<String> {
    let mut out = vec![];
    let host = cpal::default_host();
    let Ok(output_devices) = host.output_devices() else {
        return out;
    };
    for d in output_devices {
        let Ok(mut configs) = d.supported_output_configs() else {
            continue;
        };
        if configs.any(|c| config_is_compatible(c, channels, sample_rate)) {
            let Ok(name) = d.name() else {
                continue;
            };
            out.push(name);
        }
    }
    out.sort();
    out
}

/// Blocking capture side of a sound card.
pub struct SoundcardInput {
    chunk_rx: Receiver<Vec<i16>>,
    current: VecDeque<i16>,
    stop: Arc<AtomicBool>,
}

impl SoundcardInput {
    pub fn new(card_name: &str, channels: u16, sample_rate: u32) -> Result<Self, TncError> {
        let (chunk_tx, chunk_rx) = sync_channel(64);
        let (setup_tx, setup_rx) = sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));
        spawn_input_worker(
            card_name.to_string(),
            channels,
            sample_rate,
            chunk_tx,
            setup_tx,
            stop.clone(),
        );
        match setup_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                chunk_rx,
                current: VecDeque::new(),
                stop,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TncError::SoundcardInit),
        }
    }

    /// Raise to make a blocked `read_sample` return end-of-stream.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

impl SampleSource for SoundcardInput {
    fn read_sample(&mut self) -> Option<i16> {
        loop {
            if let Some(s) = self.current.pop_front() {
                return Some(s);
            }
            if self.stop.load(Ordering::Relaxed) {
                return None;
            }
            match self.chunk_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(chunk) => self.current = VecDeque::from(chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

fn spawn_input_worker(
    card_name: String,
    channels: u16,
    sample_rate: u32,
    chunk_tx: SyncSender<Vec<i16>>,
    setup_tx: SyncSender<Result<(), TncError>>,
    stop: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host
            .input_devices()
            .ok()
            .and_then(|mut d| d.find(|d| d.name().map(|n| n == card_name).unwrap_or(false)))
        {
            Some(d) => d,
            None => {
                let _ = setup_tx.send(Err(TncError::SoundcardNotFound(card_name)));
                return;
            }
        };
        let config = match device
            .supported_input_configs()
            .ok()
            .and_then(|mut c| c.find(|c| config_is_compatible(c, channels, sample_rate)))
        {
            Some(c) => c.with_sample_rate(SampleRate(sample_rate)),
            None => {
                let _ = setup_tx.send(Err(TncError::NoValidConfigAvailable));
                return;
            }
        };
        let stream = match device.build_input_stream(
            &config.into(),
            move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                if let Err(TrySendError::Full(_)) = chunk_tx.try_send(data.to_vec()) {
                    debug!("receive side fell behind; dropping audio");
                }
            },
            move |e| {
                warn!("soundcard input stream error: {}", e);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = setup_tx.send(Err(TncError::StreamBuild(e)));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = setup_tx.send(Err(TncError::StreamPlay(e)));
            return;
        }
        let _ = setup_tx.send(Ok(()));

        // The stream lives as long as this thread does.
        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
        }
    });
}

struct OutBuffer {
    samples: VecDeque<i16>,
}

/// Playback side of a sound card, with blocking backpressure.
pub struct SoundcardOutput {
    buffer: Arc<(Mutex<OutBuffer>, Condvar)>,
    /// Soft cap on queued audio; puts block while the buffer is above it.
    capacity: usize,
    sample_rate: u32,
    stop: Arc<AtomicBool>,
}

impl SoundcardOutput {
    pub fn new(card_name: &str, channels: u16, sample_rate: u32) -> Result<Self, TncError> {
        let buffer = Arc::new((
            Mutex::new(OutBuffer {
                samples: VecDeque::new(),
            }),
            Condvar::new(),
        ));
        let (setup_tx, setup_rx) = sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));
        spawn_output_worker(
            card_name.to_string(),
            channels,
            sample_rate,
            buffer.clone(),
            setup_tx,
            stop.clone(),
        );
        match setup_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                buffer,
                capacity: sample_rate as usize * channels as usize,
                sample_rate,
                stop,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TncError::SoundcardInit),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

impl SampleSink for SoundcardOutput {
    fn put_sample(&mut self, sample: i16) {
        let (lock, drained) = &*self.buffer;
        let mut buf = lock.lock().unwrap();
        while buf.samples.len() >= self.capacity {
            let (guard, _) = drained
                .wait_timeout(buf, Duration::from_millis(100))
                .unwrap();
            buf = guard;
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
        }
        buf.samples.push_back(sample);
    }

    fn flush(&mut self) {
        // The device callback pulls continuously; nothing buffered here.
    }

    fn wait_drain(&mut self) {
        let (lock, drained) = &*self.buffer;
        let mut buf = lock.lock().unwrap();
        while !buf.samples.is_empty() {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            let (guard, _) = drained
                .wait_timeout(buf, Duration::from_millis(100))
                .unwrap();
            buf = guard;
        }
        drop(buf);
        // Allowance for what the DAC is still playing out.
        std::thread::sleep(Duration::from_millis(
            50u64.max(4096 * 1000 / self.sample_rate as u64),
        ));
    }
}

fn spawn_output_worker(
    card_name: String,
    channels: u16,
    sample_rate: u32,
    buffer: Arc<(Mutex<OutBuffer>, Condvar)>,
    setup_tx: SyncSender<Result<(), TncError>>,
    stop: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host
            .output_devices()
            .ok()
            .and_then(|mut d| d.find(|d| d.name().map(|n| n == card_name).unwrap_or(false)))
        {
            Some(d) => d,
            None => {
                let _ = setup_tx.send(Err(TncError::SoundcardNotFound(card_name)));
                return;
            }
        };
        let config = match device
            .supported_output_configs()
            .ok()
            .and_then(|mut c| c.find(|c| config_is_compatible(c, channels, sample_rate)))
        {
            Some(c) => c.with_sample_rate(SampleRate(sample_rate)),
            None => {
                let _ = setup_tx.send(Err(TncError::NoValidConfigAvailable));
                return;
            }
        };
        let cb_buffer = buffer.clone();
        let stream = match device.build_output_stream(
            &config.into(),
            move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                let (lock, drained) = &*cb_buffer;
                let mut buf = lock.lock().unwrap();
                for out in data.iter_mut() {
                    *out = buf.samples.pop_front().unwrap_or(0);
                }
                drained.notify_all();
            },
            move |e| {
                warn!("soundcard output stream error: {}", e);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = setup_tx.send(Err(TncError::StreamBuild(e)));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = setup_tx.send(Err(TncError::StreamPlay(e)));
            return;
        }
        let _ = setup_tx.send(Ok(()));

        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
        }
    });
}
