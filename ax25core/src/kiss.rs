//! KISS framing for host links.
//!
//! Received AX.25 frames are wrapped as KISS data frames for client
//! applications; inbound host bytes are reassembled into frames which are
//! either data to transmit or TNC parameter commands.

const FEND: u8 = 0xC0;
const FESC: u8 = 0xDB;
const TFEND: u8 = 0xDC;
const TFESC: u8 = 0xDD;

/// Maximum size of any valid KISS frame we produce or accept.
///
/// The largest AX.25 frame is 330 bytes. In the (impossible) worst case
/// every byte is FEND or FESC, so 660 bytes of payload. With a FEND at
/// each end and the header byte we get 663.
pub const MAX_KISS_FRAME_LEN: usize = 663;

/// Holder for one KISS frame.
///
/// For efficiency, `data` and `len` are exposed directly so received KISS
/// data may be streamed into a pre-allocated `KissFrame`.
pub struct KissFrame {
    pub data: [u8; MAX_KISS_FRAME_LEN],
    pub len: usize,
}

impl KissFrame {
    pub fn new_empty() -> Self {
        Self {
            data: [0u8; MAX_KISS_FRAME_LEN],
            len: 0,
        }
    }

    /// Wrap AX.25 frame bytes as a data frame for the given radio port.
    pub fn new_data_frame(port: u8, payload: &[u8]) -> Result<Self, KissError> {
        if payload.len() > (MAX_KISS_FRAME_LEN - 3) / 2 {
            return Err(KissError::PayloadTooBig);
        }
        let mut data = [0u8; MAX_KISS_FRAME_LEN];
        let mut i = 0;
        push(&mut data, &mut i, FEND);
        push(
            &mut data,
            &mut i,
            kiss_header(port, KissCommand::DataFrame.proto_value()),
        );
        i += escape(payload, &mut data[i..]);
        push(&mut data, &mut i, FEND);
        Ok(KissFrame { data, len: i })
    }

    /// Build a one-byte parameter command (TXDELAY, P, ...).
    pub fn new_command(port: u8, command: KissCommand, value: u8) -> Self {
        let mut data = [0u8; MAX_KISS_FRAME_LEN];
        let mut i = 0;
        push(&mut data, &mut i, FEND);
        push(&mut data, &mut i, kiss_header(port, command.proto_value()));
        push(&mut data, &mut i, value);
        push(&mut data, &mut i, FEND);
        KissFrame { data, len: i }
    }

    /// Return this frame's KISS command type.
    pub fn command(&self) -> Result<KissCommand, KissError> {
        KissCommand::from_proto(self.header_byte()? & 0x0f)
    }

    /// Radio port (channel) this frame addresses.
    pub fn port(&self) -> Result<u8, KissError> {
        Ok(self.header_byte()? >> 4)
    }

    /// Payload between the header byte and the trailing FEND, unescaped.
    pub fn decode_payload(&self, out: &mut [u8]) -> Result<usize, KissError> {
        let start = self
            .data
            .iter()
            .take(self.len)
            .enumerate()
            .skip_while(|(_, b)| **b == FEND)
            .nth(1)
            .ok_or(KissError::MalformedKissFrame)?
            .0;
        let end = self.data[start..self.len]
            .iter()
            .position(|b| *b == FEND)
            .map(|p| p + start)
            .unwrap_or(self.len);
        Ok(unescape(&self.data[start..end], out))
    }

    /// Borrow the frame as a slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn header_byte(&self) -> Result<u8, KissError> {
        self.data
            .iter()
            .take(self.len)
            .find(|b| **b != FEND)
            .copied()
            .ok_or(KissError::MalformedKissFrame)
    }
}

fn kiss_header(port: u8, command: u8) -> u8 {
    (port << 4) | (command & 0x0f)
}

fn push(data: &mut [u8], idx: &mut usize, value: u8) {
    data[*idx] = value;
    *idx += 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KissCommand {
    DataFrame,
    TxDelay,
    Persistence,
    SlotTime,
    TxTail,
    FullDuplex,
}

impl KissCommand {
    fn from_proto(value: u8) -> Result<Self, KissError> {
        Ok(match value {
            0 => KissCommand::DataFrame,
            1 => KissCommand::TxDelay,
            2 => KissCommand::Persistence,
            3 => KissCommand::SlotTime,
            4 => KissCommand::TxTail,
            5 => KissCommand::FullDuplex,
            _ => return Err(KissError::UnsupportedKissCommand),
        })
    }

    fn proto_value(&self) -> u8 {
        match self {
            KissCommand::DataFrame => 0,
            KissCommand::TxDelay => 1,
            KissCommand::Persistence => 2,
            KissCommand::SlotTime => 3,
            KissCommand::TxTail => 4,
            KissCommand::FullDuplex => 5,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum KissError {
    MalformedKissFrame,
    UnsupportedKissCommand,
    PayloadTooBig,
}

/// Reassembles KISS frames from arbitrarily-chunked host bytes.
pub struct KissBuffer {
    buf: [u8; MAX_KISS_FRAME_LEN * 2],
    len: usize,
}

impl KissBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0u8; MAX_KISS_FRAME_LEN * 2],
            len: 0,
        }
    }

    /// Space the caller may write incoming bytes into.
    pub fn buf_remaining(&mut self) -> &mut [u8] {
        if self.len == self.buf.len() {
            // Full with no frame boundary in sight - drop the garbage.
            self.len = 0;
        }
        &mut self.buf[self.len..]
    }

    /// Record that `n` bytes were written into `buf_remaining()`.
    pub fn did_write(&mut self, n: usize) {
        self.len += n;
    }

    /// Extract the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<KissFrame> {
        let mut start = 0;
        while start < self.len && self.buf[start] == FEND {
            start += 1;
        }
        let end = self.buf[start..self.len]
            .iter()
            .position(|b| *b == FEND)
            .map(|p| p + start)?;

        let mut frame = KissFrame::new_empty();
        let content = &self.buf[start..end];
        if content.len() + 2 <= MAX_KISS_FRAME_LEN {
            frame.data[0] = FEND;
            frame.data[1..1 + content.len()].copy_from_slice(content);
            frame.data[1 + content.len()] = FEND;
            frame.len = content.len() + 2;
        }

        // Keep the closing FEND: it can open the next frame.
        self.buf.copy_within(end..self.len, 0);
        self.len -= end;

        if frame.len == 0 {
            // Oversized frame was dropped; try again on what remains.
            return self.next_frame();
        }
        Some(frame)
    }
}

impl Default for KissBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn escape(src: &[u8], dst: &mut [u8]) -> usize {
    let mut i = 0;
    let mut j = 0;
    while i < src.len() && j < dst.len() {
        if src[i] == FEND {
            dst[j] = FESC;
            j += 1;
            dst[j] = TFEND;
        } else if src[i] == FESC {
            dst[j] = FESC;
            j += 1;
            dst[j] = TFESC;
        } else {
            dst[j] = src[i];
        }
        i += 1;
        j += 1;
    }
    j
}

fn unescape(src: &[u8], dst: &mut [u8]) -> usize {
    let mut i = 0;
    let mut j = 0;
    while i < src.len() && j < dst.len() {
        if src[i] == FESC {
            if i == src.len() - 1 {
                break;
            }
            i += 1;
            if src[i] == TFEND {
                dst[j] = FEND;
            } else if src[i] == TFESC {
                dst[j] = FESC;
            }
        } else {
            dst[j] = src[i];
        }
        i += 1;
        j += 1;
    }
    j
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        let mut buf = [0u8; 1024];

        let src = [0, 1, 2, 3, 4, 5];
        let n = escape(&src, &mut buf);
        assert_eq!(n, 6);
        assert_eq!(&buf[0..6], src);

        let src = [0, 1, FEND, 3, 4, FESC];
        let n = escape(&src, &mut buf);
        assert_eq!(n, 8);
        assert_eq!(&buf[0..8], &[0, 1, FESC, TFEND, 3, 4, FESC, TFESC]);
    }

    #[test]
    fn test_unescape() {
        let mut buf = [0u8; 1024];

        let src = [0, 1, FESC, TFEND, 3, 4, FESC, TFESC];
        let n = unescape(&src, &mut buf);
        assert_eq!(n, 6);
        assert_eq!(&buf[0..6], &[0, 1, FEND, 3, 4, FESC]);
    }

    #[test]
    fn data_frame_roundtrip() {
        let f = KissFrame::new_data_frame(2, &[0, 1, FEND, 3]).unwrap();
        assert_eq!(f.as_bytes(), &[FEND, 0x20, 0, 1, FESC, TFEND, 3, FEND]);
        assert_eq!(f.port().unwrap(), 2);
        assert_eq!(f.command().unwrap(), KissCommand::DataFrame);
        let mut buf = [0u8; 1024];
        let n = f.decode_payload(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0, 1, FEND, 3]);
    }

    #[test]
    fn command_frame() {
        let f = KissFrame::new_command(1, KissCommand::TxDelay, 30);
        assert_eq!(f.as_bytes(), &[FEND, 0x11, 30, FEND]);
        assert_eq!(f.command().unwrap(), KissCommand::TxDelay);
        let mut buf = [0u8; 8];
        assert_eq!(f.decode_payload(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 30);
    }

    #[test]
    fn buffer_reassembles_split_frames() {
        let mut kb = KissBuffer::new();
        let frame = KissFrame::new_data_frame(0, b"hello").unwrap();
        let bytes = frame.as_bytes();

        // Deliver in two fragments.
        let split = 3;
        kb.buf_remaining()[..split].copy_from_slice(&bytes[..split]);
        kb.did_write(split);
        assert!(kb.next_frame().is_none());
        kb.buf_remaining()[..bytes.len() - split].copy_from_slice(&bytes[split..]);
        kb.did_write(bytes.len() - split);

        let got = kb.next_frame().unwrap();
        assert_eq!(got.command().unwrap(), KissCommand::DataFrame);
        let mut buf = [0u8; 16];
        let n = got.decode_payload(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn buffer_handles_back_to_back_frames() {
        let mut kb = KissBuffer::new();
        let f1 = KissFrame::new_data_frame(0, b"one").unwrap();
        let f2 = KissFrame::new_command(0, KissCommand::Persistence, 63);
        let all: Vec<u8> = f1.as_bytes().iter().chain(f2.as_bytes()).copied().collect();
        kb.buf_remaining()[..all.len()].copy_from_slice(&all);
        kb.did_write(all.len());

        let got1 = kb.next_frame().unwrap();
        assert_eq!(got1.command().unwrap(), KissCommand::DataFrame);
        let got2 = kb.next_frame().unwrap();
        assert_eq!(got2.command().unwrap(), KissCommand::Persistence);
        assert!(kb.next_frame().is_none());
    }
}
