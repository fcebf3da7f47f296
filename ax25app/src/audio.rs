//! Blocking audio sample plumbing.
//!
//! The receive and transmit pipelines talk to trait objects so a cpal
//! soundcard, a file feed, or a test double can stand behind them. A
//! stereo device carries two radio channels: left (even channel number)
//! then right, one sample each, interleaved.

use crate::config::adev_first_chan;
use std::sync::{Arc, Mutex};

/// Blocking source of interleaved PCM samples for one audio device.
pub trait SampleSource: Send {
    /// Next sample, or `None` once the device has reached end of stream.
    fn read_sample(&mut self) -> Option<i16>;
}

/// Sink of interleaved PCM samples for one audio device.
pub trait SampleSink: Send {
    fn put_sample(&mut self, sample: i16);
    /// Push out any partially filled buffer.
    fn flush(&mut self);
    /// Block until queued audio has been played out.
    fn wait_drain(&mut self);
}

/// Output side of one audio device, mapping radio channels onto the
/// device's mono or stereo sample stream.
pub struct AudioOut {
    sink: Box<dyn SampleSink>,
    adev: usize,
    num_channels: u8,
}

impl AudioOut {
    pub fn new(sink: Box<dyn SampleSink>, adev: usize, num_channels: u8) -> Self {
        debug_assert!(num_channels == 1 || num_channels == 2);
        Self {
            sink,
            adev,
            num_channels,
        }
    }

    /// Ship one sample for the given radio channel, zero-filling the
    /// other half of a stereo pair.
    pub fn put(&mut self, chan: usize, sample: i16) {
        if self.num_channels == 1 {
            self.sink.put_sample(sample);
        } else if chan == adev_first_chan(self.adev) {
            self.sink.put_sample(sample);
            self.sink.put_sample(0);
        } else {
            self.sink.put_sample(0);
            self.sink.put_sample(sample);
        }
    }

    pub fn flush(&mut self) {
        self.sink.flush();
    }

    pub fn wait_drain(&mut self) {
        self.sink.wait_drain();
    }
}

/// Shared handle: the whole PTT-on to PTT-off window of one channel holds
/// the lock so stereo pairs never interleave transmissions.
pub type SharedAudioOut = Arc<Mutex<AudioOut>>;
