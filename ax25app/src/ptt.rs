//! Radio control lines: push-to-talk and friends.
//!
//! The core only needs `ptt_set(octype, channel, state)`. Concrete lines
//! may be serial RTS/DTR (optionally inverted, optionally with the other
//! pin driven in opposite polarity); anything else can implement
//! [`PttLine`]. Write failures are logged and otherwise ignored - losing
//! a status line is not worth killing a transmission over.

use crate::config::MAX_CHANS;
use crate::error::TncError;
use log::{debug, warn};
use serialport::SerialPort;
use std::sync::{Arc, Mutex};

/// Which output line of a channel is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputControl {
    /// Transmitter keying.
    Ptt,
    /// Data carrier detect indicator.
    Dcd,
    /// Connected/activity indicator.
    Con,
}

const NUM_OCTYPES: usize = 3;

pub trait PttLine: Send {
    fn set(&mut self, on: bool) -> Result<(), TncError>;
}

/// The pin on a serial port which drives the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttPin {
    Rts,
    Dtr,
}

pub struct SerialPtt {
    port: Box<dyn SerialPort>,
    pin: PttPin,
    invert: bool,
    /// Drive the other pin in opposite polarity, for interfaces that key
    /// off the voltage between the two.
    complement: bool,
}

impl SerialPtt {
    pub fn available_ports() -> impl Iterator<Item = String> {
        serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|i| i.port_name)
    }

    pub fn new(port_name: &str, pin: PttPin, invert: bool, complement: bool) -> Result<Self, TncError> {
        let port = serialport::new(port_name, 9600).open()?;
        let mut s = Self {
            port,
            pin,
            invert,
            complement,
        };
        s.set(false)?;
        Ok(s)
    }

    fn write_pin(&mut self, pin: PttPin, level: bool) -> Result<(), serialport::Error> {
        match pin {
            PttPin::Rts => self.port.write_request_to_send(level),
            PttPin::Dtr => self.port.write_data_terminal_ready(level),
        }
    }
}

impl PttLine for SerialPtt {
    fn set(&mut self, on: bool) -> Result<(), TncError> {
        let level = on != self.invert;
        self.write_pin(self.pin, level)?;
        if self.complement {
            let other = match self.pin {
                PttPin::Rts => PttPin::Dtr,
                PttPin::Dtr => PttPin::Rts,
            };
            self.write_pin(other, !level)?;
        }
        Ok(())
    }
}

/// There is no PTT because this TNC will never key a real transmitter.
pub struct NullPtt;

impl PttLine for NullPtt {
    fn set(&mut self, _on: bool) -> Result<(), TncError> {
        Ok(())
    }
}

/// Routes `(octype, channel)` to whatever line is wired up, if any.
pub struct PttControl {
    lines: [[Option<Box<dyn PttLine>>; NUM_OCTYPES]; MAX_CHANS],
}

impl PttControl {
    pub fn new() -> Self {
        Self {
            lines: std::array::from_fn(|_| std::array::from_fn(|_| None)),
        }
    }

    pub fn attach(&mut self, octype: OutputControl, chan: usize, line: Box<dyn PttLine>) {
        self.lines[chan][octype as usize] = Some(line);
    }

    /// Drive a line. Best effort: failures are logged, never propagated.
    pub fn set(&mut self, octype: OutputControl, chan: usize, on: bool) {
        debug!("ptt_set {:?} chan {} = {}", octype, chan, on);
        if let Some(line) = &mut self.lines[chan][octype as usize] {
            if let Err(e) = line.set(on) {
                warn!("failed to drive {:?} line for channel {}: {}", octype, chan, e);
            }
        }
    }

    /// Drop every PTT line, for shutdown paths.
    pub fn all_ptt_off(&mut self) {
        for chan in 0..MAX_CHANS {
            self.set(OutputControl::Ptt, chan, false);
        }
    }
}

impl Default for PttControl {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedPtt = Arc<Mutex<PttControl>>;

pub fn shared(control: PttControl) -> SharedPtt {
    Arc::new(Mutex::new(control))
}
