//! Per-channel modem and timing configuration.
//!
//! Timing parameters can be changed at runtime by client protocol
//! commands while the transmit scheduler reads them, so they are plain
//! word-sized atomics. Modem parameters are fixed once the channel is
//! running.

use ax25core::decode::FixBits;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const MAX_CHANS: usize = 6;
pub const MAX_ADEVS: usize = 3;
pub const MAX_SUBCHANS: usize = 4;
pub const MAX_SLICERS: usize = 8;

/// Audio device carrying a given channel: two channels per stereo device.
pub fn chan_to_adev(chan: usize) -> usize {
    chan / 2
}

/// First channel carried by an audio device.
pub fn adev_first_chan(adev: usize) -> usize {
    adev * 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer2Xmit {
    Ax25,
    Fx25,
}

pub struct ChannelConfig {
    pub baud: u32,
    pub mark_freq: u32,
    pub space_freq: u32,
    pub fix_bits: FixBits,
    pub layer2_xmit: Layer2Xmit,
    pub fx25_strength: u8,
    /// Percent of transmitted frames deliberately sent with a bad FCS.
    pub xmit_error_rate: u8,
    /// Probability of flipping each received raw bit.
    pub recv_ber: f32,

    slottime: AtomicU32,
    persist: AtomicU32,
    txdelay: AtomicU32,
    txtail: AtomicU32,
    dwait: AtomicU32,
    fulldup: AtomicBool,
}

impl ChannelConfig {
    pub fn new(baud: u32, mark_freq: u32, space_freq: u32) -> Self {
        Self {
            baud,
            mark_freq,
            space_freq,
            fix_bits: FixBits::None,
            layer2_xmit: Layer2Xmit::Ax25,
            fx25_strength: 0,
            xmit_error_rate: 0,
            recv_ber: 0.0,
            slottime: AtomicU32::new(10),
            persist: AtomicU32::new(63),
            txdelay: AtomicU32::new(30),
            txtail: AtomicU32::new(10),
            dwait: AtomicU32::new(0),
            fulldup: AtomicBool::new(false),
        }
    }

    // All timing values are in 10 ms units.

    pub fn slottime(&self) -> u32 {
        self.slottime.load(Ordering::Relaxed)
    }

    pub fn set_slottime(&self, value: u32) {
        self.slottime.store(value, Ordering::Relaxed);
    }

    pub fn persist(&self) -> u32 {
        self.persist.load(Ordering::Relaxed)
    }

    pub fn set_persist(&self, value: u32) {
        self.persist.store(value.min(255), Ordering::Relaxed);
    }

    pub fn txdelay(&self) -> u32 {
        self.txdelay.load(Ordering::Relaxed)
    }

    pub fn set_txdelay(&self, value: u32) {
        self.txdelay.store(value, Ordering::Relaxed);
    }

    pub fn txtail(&self) -> u32 {
        self.txtail.load(Ordering::Relaxed)
    }

    pub fn set_txtail(&self, value: u32) {
        self.txtail.store(value, Ordering::Relaxed);
    }

    pub fn dwait(&self) -> u32 {
        self.dwait.load(Ordering::Relaxed)
    }

    pub fn set_dwait(&self, value: u32) {
        self.dwait.store(value, Ordering::Relaxed);
    }

    pub fn fulldup(&self) -> bool {
        self.fulldup.load(Ordering::Relaxed)
    }

    pub fn set_fulldup(&self, value: bool) {
        self.fulldup.store(value, Ordering::Relaxed);
    }
}

impl Default for ChannelConfig {
    /// Standard 1200 baud VHF packet: 1200 Hz mark, 2200 Hz space.
    fn default() -> Self {
        Self::new(1200, 1200, 2200)
    }
}
