//! Soundcard AX.25 TNC.
//!
//! Audio samples from a sound device are demodulated into bits, framed
//! into AX.25 packets and delivered to client sinks; client frames are
//! queued per channel and transmitted as AFSK under p-persistent CSMA
//! with PTT bracketing each burst.

pub mod app;
pub mod audio;
pub mod config;
pub mod dlq;
pub mod error;
pub mod ptt;
pub mod recv;
pub mod soundcard;
pub mod tnc;
pub mod txq;
pub mod xmit;

#[cfg(test)]
mod test_util;

// Frame and decoder types clients need to enqueue and interpret traffic
pub use ax25core::ax25::Ax25Frame;
pub use ax25core::decode::{FixBits, RetryLevel};
