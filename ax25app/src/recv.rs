//! Receive side: one dispatch thread per audio device.
//!
//! Each thread pulls one sample per device channel (stereo devices carry
//! two radio channels), feeds every subchannel demodulator, and steps an
//! HDLC decoder slot for each recovered raw bit. Valid frames from any
//! slot go through the duplicate-suppressing voter into the delivery
//! queue. End of the audio stream is fatal: the TNC cannot run deaf.

use crate::audio::SampleSource;
use crate::config::{ChannelConfig, MAX_SLICERS, MAX_SUBCHANS};
use crate::dlq::{AudioLevel, Dlq, DlqItem, FecType};
use crate::ptt::{OutputControl, SharedPtt};
use ax25core::ax25::Ax25Frame;
use ax25core::decode::{try_decode, HdlcDecoder, RetryLevel};
use ax25core::modem::Demodulator;
use ax25core::random::Lcg;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Composite carrier-detect and transmit-inhibit state of one channel,
/// shared between the receive and transmit sides.
pub struct ChannelStatus {
    /// One bit per (subchannel, slicer) slot.
    dcd: AtomicU32,
    tx_inhibit: AtomicBool,
}

impl ChannelStatus {
    pub fn new() -> Self {
        Self {
            dcd: AtomicU32::new(0),
            tx_inhibit: AtomicBool::new(false),
        }
    }

    fn slot_bit(subchan: u8, slicer: u8) -> u32 {
        1 << (subchan as usize * MAX_SLICERS + slicer as usize)
    }

    /// Record one slot's DCD, driving the channel's DCD indicator when
    /// the composite state changes.
    pub fn dcd_change(&self, chan: u8, subchan: u8, slicer: u8, state: bool, ptt: &SharedPtt) {
        let bit = Self::slot_bit(subchan, slicer);
        let old = if state {
            self.dcd.fetch_or(bit, Ordering::Relaxed)
        } else {
            self.dcd.fetch_and(!bit, Ordering::Relaxed)
        };
        let new = if state { old | bit } else { old & !bit };
        if (old != 0) != (new != 0) {
            ptt.lock()
                .unwrap()
                .set(OutputControl::Dcd, chan as usize, new != 0);
        }
    }

    pub fn any_dcd(&self) -> bool {
        self.dcd.load(Ordering::Relaxed) != 0
    }

    pub fn set_tx_inhibit(&self, inhibit: bool) {
        self.tx_inhibit.store(inhibit, Ordering::Relaxed);
    }

    /// True when the transmit scheduler must hold off.
    pub fn busy(&self) -> bool {
        self.any_dcd() || self.tx_inhibit.load(Ordering::Relaxed)
    }
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self::new()
    }
}

struct Subchannel {
    demod: Box<dyn Demodulator>,
    slots: Vec<HdlcDecoder>,
    dcd_last: Vec<bool>,
}

/// Receive state for one radio channel.
pub struct RecvChannel {
    pub chan: u8,
    config: Arc<ChannelConfig>,
    status: Arc<ChannelStatus>,
    subchans: Vec<Subchannel>,
    ber_rng: Lcg,
    /// Recently delivered frame bytes, for duplicate suppression across
    /// slots that finish a bit or two apart.
    last_delivered: Option<(Vec<u8>, u64)>,
    dup_window: u64,
    sample_count: u64,
}

impl RecvChannel {
    pub fn new(
        chan: u8,
        config: Arc<ChannelConfig>,
        status: Arc<ChannelStatus>,
        demods: Vec<Box<dyn Demodulator>>,
        sample_rate: u32,
    ) -> Self {
        assert!(!demods.is_empty() && demods.len() <= MAX_SUBCHANS);
        let subchans = demods
            .into_iter()
            .map(|demod| {
                let n = (demod.num_slicers() as usize).min(MAX_SLICERS);
                Subchannel {
                    demod,
                    slots: (0..n).map(|_| HdlcDecoder::new()).collect(),
                    dcd_last: vec![false; n],
                }
            })
            .collect();
        Self {
            chan,
            config,
            status,
            subchans,
            ber_rng: Lcg::new(1),
            last_delivered: None,
            dup_window: sample_rate as u64 / 2,
            sample_count: 0,
        }
    }

    /// Feed one PCM sample through every demodulator and decoder slot.
    pub fn process_sample(&mut self, sample: i16, dlq: &Dlq, ptt: &SharedPtt) {
        self.sample_count += 1;
        let mut decoded: Vec<(u8, u8, Ax25Frame, RetryLevel)> = Vec::new();

        for (sub_idx, sub) in self.subchans.iter_mut().enumerate() {
            let mut bits: Vec<(u8, bool)> = Vec::new();
            sub.demod.process_sample(sample, &mut |slicer, bit| {
                bits.push((slicer, bit));
            });

            for (slicer, mut raw) in bits {
                if self.config.recv_ber != 0.0 && self.ber_rng.chance(self.config.recv_ber) {
                    raw = !raw;
                }
                let Some(slot) = sub.slots.get_mut(slicer as usize) else {
                    continue;
                };
                let Some(candidate) = slot.rec_bit(raw) else {
                    continue;
                };
                let Some((frame, retry)) = try_decode(&candidate, self.config.fix_bits) else {
                    continue;
                };
                match Ax25Frame::from_bytes(frame.as_bytes()) {
                    Ok(frame) => decoded.push((sub_idx as u8, slicer, frame, retry)),
                    Err(e) => debug!("FCS-valid bytes rejected as AX.25: {:?}", e),
                }
            }

            for slicer in 0..sub.dcd_last.len() {
                let dcd = sub.demod.slicer_dcd(slicer as u8);
                if dcd != sub.dcd_last[slicer] {
                    sub.dcd_last[slicer] = dcd;
                    self.status
                        .dcd_change(self.chan, sub_idx as u8, slicer as u8, dcd, ptt);
                }
            }
        }

        if let Some(item) = self.vote(decoded) {
            dlq.append(item);
        }
    }

    // Deterministic choice among slots that decoded in this sample:
    // lowest subchannel, then lowest slicer. A copy of a frame already
    // delivered moments ago by another slot is dropped.
    fn vote(&mut self, mut decoded: Vec<(u8, u8, Ax25Frame, RetryLevel)>) -> Option<DlqItem> {
        // Demodulators make no promise about callback order within a sample.
        decoded.sort_by_key(|(subchan, slicer, _, _)| (*subchan, *slicer));
        let (subchan, slicer, frame, retries) = decoded.first()?.clone();

        if let Some((bytes, at)) = &self.last_delivered {
            if bytes == frame.as_bytes() && self.sample_count - at < self.dup_window {
                debug!(
                    "channel {} subchan {} slicer {}: duplicate decode suppressed",
                    self.chan, subchan, slicer
                );
                return None;
            }
        }
        self.last_delivered = Some((frame.as_bytes().to_vec(), self.sample_count));

        let mut spectrum = String::new();
        for (sub_idx, sub) in self.subchans.iter().enumerate() {
            if sub_idx > 0 {
                spectrum.push('.');
            }
            for sl in 0..sub.slots.len() {
                let hit = decoded
                    .iter()
                    .any(|(s, l, f, _)| {
                        *s == sub_idx as u8 && *l == sl as u8 && f.as_bytes() == frame.as_bytes()
                    });
                spectrum.push(if hit { '|' } else { '_' });
            }
        }

        let (rec, mark, space) = self.subchans[subchan as usize].demod.audio_level();
        Some(DlqItem {
            chan: self.chan,
            subchan,
            slicer,
            frame,
            alevel: AudioLevel { rec, mark, space },
            fec_type: FecType::None,
            retries,
            spectrum,
        })
    }
}

/// One per audio device: owns the blocking sample source and the receive
/// state of the channels it carries.
pub struct RecvDispatcher {
    pub source: Box<dyn SampleSource>,
    pub channels: Vec<RecvChannel>,
    pub dlq: Arc<Dlq>,
    pub ptt: SharedPtt,
    pub shutdown: Arc<AtomicBool>,
    /// Set when the audio stream dies; the owner should treat this as a
    /// reason to exit with a failure status.
    pub fatal: Arc<AtomicBool>,
}

impl RecvDispatcher {
    pub fn spawn(mut self) -> JoinHandle<()> {
        std::thread::spawn(move || {
            'outer: while !self.shutdown.load(Ordering::Relaxed) {
                for ch in self.channels.iter_mut() {
                    let Some(sample) = self.source.read_sample() else {
                        if !self.shutdown.load(Ordering::Relaxed) {
                            error!("terminating after audio input failure");
                            self.fatal.store(true, Ordering::Relaxed);
                            self.shutdown.store(true, Ordering::Relaxed);
                            self.dlq.nudge();
                        }
                        break 'outer;
                    };
                    ch.process_sample(sample, &self.dlq, &self.ptt);
                }
            }
        })
    }
}
