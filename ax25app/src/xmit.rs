//! Transmit scheduler: one long-running thread per radio channel.
//!
//! Producers append packets and move on; this thread waits for clear air
//! using the p-persistent CSMA algorithm, keys PTT, sends TXDELAY flags,
//! one or more frames, TXTAIL flags, and drops PTT only after the audio
//! has actually been played out. Channels sharing a stereo device take an
//! exclusive lock on it for the whole PTT window so their transmissions
//! never overlap.

use crate::audio::SharedAudioOut;
use crate::config::{ChannelConfig, Layer2Xmit};
use crate::ptt::{OutputControl, SharedPtt};
use crate::recv::ChannelStatus;
use crate::txq::{Priority, TxQueue};
use ax25core::ax25::{Ax25Frame, ADDR_REPEATER_1};
use ax25core::encode::HdlcEncoder;
use ax25core::modem::ToneGen;
use ax25core::random::Lcg;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Frames which can never share a transmission with others.
const NO_BUNDLE: usize = 1;
/// Everything else empties the queues while we hold the channel.
const MAX_BUNDLE: usize = 256;

/// CSMA pacing, injectable so tests do not sit through the production
/// sixty-second give-up.
#[derive(Debug, Clone, Copy)]
pub struct XmitTimings {
    pub check_every: Duration,
    pub wait_timeout: Duration,
}

impl Default for XmitTimings {
    fn default() -> Self {
        Self {
            check_every: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(60),
        }
    }
}

/// Turns queued frames into line bits and audio. The production
/// implementation is [`AfskModulator`]; tests substitute a recorder.
pub trait FrameModulator: Send {
    /// Emit `nflags` flag bytes of preamble. Returns bits emitted.
    fn preamble(&mut self, nflags: usize) -> usize;
    /// Emit one frame. Returns bits emitted including flags and stuffing.
    fn frame(&mut self, frame: &Ax25Frame, bad_fcs: bool) -> usize;
    /// Emit `nflags` flag bytes of postamble and flush the device.
    fn postamble(&mut self, nflags: usize) -> usize;
    /// Block until the device has played everything out.
    fn wait_drain(&mut self);
}

/// HDLC encoder driving a tone generator into one channel of a shared
/// audio output device.
pub struct AfskModulator {
    chan: usize,
    encoder: HdlcEncoder,
    tone: ToneGen,
    out: SharedAudioOut,
    layer2: Layer2Xmit,
}

impl AfskModulator {
    pub fn new(chan: usize, config: &ChannelConfig, sample_rate: u32, out: SharedAudioOut) -> Self {
        Self {
            chan,
            encoder: HdlcEncoder::new(),
            tone: ToneGen::new(
                sample_rate,
                config.baud,
                config.mark_freq,
                config.space_freq,
                100,
            ),
            out,
            layer2: config.layer2_xmit,
        }
    }
}

impl FrameModulator for AfskModulator {
    fn preamble(&mut self, nflags: usize) -> usize {
        let mut out = self.out.lock().unwrap();
        let chan = self.chan;
        let tone = &mut self.tone;
        self.encoder
            .send_flags(&mut |bit: bool| tone.put_bit(&mut |s: i16| out.put(chan, s), bit), nflags)
    }

    fn frame(&mut self, frame: &Ax25Frame, bad_fcs: bool) -> usize {
        if self.layer2 == Layer2Xmit::Fx25 {
            info!("FX.25 transmit is not available; falling back to regular AX.25");
        }
        let mut out = self.out.lock().unwrap();
        let chan = self.chan;
        let tone = &mut self.tone;
        self.encoder.send_frame(
            &mut |bit: bool| tone.put_bit(&mut |s: i16| out.put(chan, s), bit),
            frame.as_bytes(),
            bad_fcs,
        )
    }

    fn postamble(&mut self, nflags: usize) -> usize {
        let mut out = self.out.lock().unwrap();
        let chan = self.chan;
        let tone = &mut self.tone;
        let n = self
            .encoder
            .send_flags(&mut |bit: bool| tone.put_bit(&mut |s: i16| out.put(chan, s), bit), nflags);
        out.flush();
        n
    }

    fn wait_drain(&mut self) {
        self.out.lock().unwrap().wait_drain();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    AprsNew,
    AprsDigi,
    Other,
}

// Digipeated APRS goes out alone; everything else may be bundled.
fn frame_flavor(frame: &Ax25Frame) -> Flavor {
    if frame.is_aprs() {
        if frame.num_repeaters() >= 1 && frame.address_used(ADDR_REPEATER_1) {
            Flavor::AprsDigi
        } else {
            Flavor::AprsNew
        }
    } else {
        Flavor::Other
    }
}

fn ms_to_bits(ms: u32, baud: u32) -> usize {
    (ms as u64 * baud as u64 / 1000) as usize
}

fn bits_to_ms(bits: usize, baud: u32) -> u64 {
    bits as u64 * 1000 / baud as u64
}

pub struct XmitChannel {
    pub chan: usize,
    pub config: Arc<ChannelConfig>,
    pub status: Arc<ChannelStatus>,
    pub txq: Arc<TxQueue>,
    pub ptt: SharedPtt,
    /// Held for the whole PTT window; shared by both channels of a
    /// stereo device.
    pub dev_tx_lock: Arc<Mutex<()>>,
    pub modulator: Box<dyn FrameModulator>,
    pub timings: XmitTimings,
    pub shutdown: Arc<AtomicBool>,
}

pub fn spawn_xmit_thread(x: XmitChannel) -> JoinHandle<()> {
    std::thread::spawn(move || xmit_loop(x))
}

fn xmit_loop(mut x: XmitChannel) {
    let mut rng = Lcg::new(0x5EED + x.chan as u32);
    loop {
        if !x.txq.wait_while_empty(x.chan) {
            return; // queue closed
        }
        while x.txq.peek(x.chan, Priority::Hi).is_some()
            || x.txq.peek(x.chan, Priority::Lo).is_some()
        {
            if x.shutdown.load(Ordering::Relaxed) {
                return;
            }

            // Wait for the channel to be clear, then grab the device.
            // If anything is queued high priority we begin immediately
            // after the channel clears; otherwise a random backoff
            // spreads stations out.
            let mut waited = Duration::ZERO;
            let clear = csma_wait(&x, &mut rng, &mut waited);
            let dev_lock = Arc::clone(&x.dev_tx_lock);
            let guard = if clear {
                lock_device(&dev_lock, &x, &mut waited)
            } else {
                None
            };

            let (frame, prio) = match x.txq.remove(x.chan, Priority::Hi) {
                Some(frame) => (frame, Priority::Hi),
                None => match x.txq.remove(x.chan, Priority::Lo) {
                    Some(frame) => (frame, Priority::Lo),
                    None => continue,
                },
            };

            match guard {
                Some(guard) => {
                    let bundle_cap = match frame_flavor(&frame) {
                        Flavor::AprsDigi => NO_BUNDLE,
                        Flavor::AprsNew | Flavor::Other => MAX_BUNDLE,
                    };
                    xmit_ax25_frames(&mut x, &mut rng, prio, frame, bundle_cap);
                    drop(guard);
                }
                None => {
                    warn!(
                        "waited too long for clear channel; discarding [{}{}] {}",
                        x.chan,
                        prio_letter(prio),
                        frame.format_addrs()
                    );
                }
            }
        }
    }
}

// Busy-wait, squelch-tail allowance, then the p-persistence slot loop.
// Only the busy polls count toward the give-up time; dwait and slot
// sleeps do not.
fn csma_wait(x: &XmitChannel, rng: &mut Lcg, waited: &mut Duration) -> bool {
    if x.config.fulldup() {
        return true;
    }
    'start_over: loop {
        while x.status.busy() {
            if x.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            std::thread::sleep(x.timings.check_every);
            *waited += x.timings.check_every;
            if *waited > x.timings.wait_timeout {
                return false;
            }
        }

        // Allowance for slow receiver squelch turnaround.
        let dwait = x.config.dwait();
        if dwait > 0 {
            std::thread::sleep(Duration::from_millis(dwait as u64 * 10));
        }
        if x.status.busy() {
            continue 'start_over;
        }

        // Anything high priority goes now; otherwise transmit in this
        // slot with probability persist/256.
        while x.txq.peek(x.chan, Priority::Hi).is_none() {
            std::thread::sleep(Duration::from_millis(x.config.slottime() as u64 * 10));
            if x.status.busy() {
                continue 'start_over;
            }
            if rng.next_byte() as u32 <= x.config.persist() {
                break;
            }
        }
        return true;
    }
}

// One transmission may be in flight per audio device.
fn lock_device<'a>(
    lock: &'a Mutex<()>,
    x: &XmitChannel,
    waited: &mut Duration,
) -> Option<MutexGuard<'a, ()>> {
    loop {
        if let Ok(guard) = lock.try_lock() {
            return Some(guard);
        }
        if x.shutdown.load(Ordering::Relaxed) {
            return None;
        }
        std::thread::sleep(x.timings.check_every);
        *waited += x.timings.check_every;
        if *waited > x.timings.wait_timeout {
            return None;
        }
    }
}

// PTT on, preamble, frame(s), postamble, drain, PTT off.
fn xmit_ax25_frames(
    x: &mut XmitChannel,
    rng: &mut Lcg,
    prio: Priority,
    first: Ax25Frame,
    bundle_cap: usize,
) {
    let ptt_on_at = Instant::now();
    x.ptt.lock().unwrap().set(OutputControl::Ptt, x.chan, true);

    let baud = x.config.baud;
    let pre_flags = ms_to_bits(x.config.txdelay() * 10, baud) / 8;
    let mut num_bits = x.modulator.preamble(pre_flags);

    num_bits += send_one_frame(x, rng, prio, &first);
    let mut numframe = 1;
    drop(first);

    while numframe < bundle_cap {
        let (peeked, prio) = match x.txq.peek(x.chan, Priority::Hi) {
            Some(frame) => (frame, Priority::Hi),
            None => match x.txq.peek(x.chan, Priority::Lo) {
                Some(frame) => (frame, Priority::Lo),
                None => break,
            },
        };
        if frame_flavor(&peeked) == Flavor::AprsDigi {
            break; // not eligible for bundling
        }
        let Some(frame) = x.txq.remove(x.chan, prio) else {
            continue;
        };
        num_bits += send_one_frame(x, rng, prio, &frame);
        numframe += 1;
    }

    // TXTAIL covers not knowing exactly when the sound finishes.
    let post_flags = ms_to_bits(x.config.txtail() * 10, baud) / 8;
    num_bits += x.modulator.postamble(post_flags);

    x.modulator.wait_drain();

    // Safety net: if the drain returned early, hold PTT until the
    // computed duration of everything we emitted has really elapsed.
    let duration = Duration::from_millis(bits_to_ms(num_bits, baud));
    let elapsed = ptt_on_at.elapsed();
    if elapsed < duration {
        std::thread::sleep(duration - elapsed);
    }

    x.ptt.lock().unwrap().set(OutputControl::Ptt, x.chan, false);
    debug!(
        "channel {}: sent {} frame(s), {} bits, PTT held {:?}",
        x.chan,
        numframe,
        num_bits,
        ptt_on_at.elapsed()
    );
}

fn send_one_frame(x: &mut XmitChannel, rng: &mut Lcg, prio: Priority, frame: &Ax25Frame) -> usize {
    info!(
        "[{}{}] {}{}",
        x.chan,
        prio_letter(prio),
        frame.format_addrs(),
        safe_info(frame.info())
    );

    let mut bad_fcs = false;
    if x.config.xmit_error_rate != 0 && rng.chance(x.config.xmit_error_rate as f32 / 100.0) {
        info!(
            "intentionally sending invalid FCS, xmit error rate = {} percent",
            x.config.xmit_error_rate
        );
        bad_fcs = true;
    }
    x.modulator.frame(frame, bad_fcs)
}

fn prio_letter(prio: Priority) -> char {
    match prio {
        Priority::Hi => 'H',
        Priority::Lo => 'L',
    }
}

/// Printable rendering of an info field for the console.
pub fn safe_info(info: &[u8]) -> String {
    info.iter()
        .map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            }
        })
        .collect()
}
