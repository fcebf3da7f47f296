//! AX.25 frame model.
//!
//! A frame is held as raw wire bytes (address field, control, optional PID,
//! info) without the FCS, which is only materialised during HDLC emission.
//! Frames are immutable once built.

pub const MIN_ADDRS: usize = 2;
pub const MAX_ADDRS: usize = 10;

/// Smallest valid frame excluding FCS: two addresses plus a control octet.
pub const MIN_PACKET_LEN: usize = 7 * MIN_ADDRS + 1;
pub const MAX_PACKET_LEN: usize = 330;

/// Sizes including the two FCS octets, as seen by the HDLC layer.
pub const MIN_FRAME_LEN: usize = MIN_PACKET_LEN + 2;
pub const MAX_FRAME_LEN: usize = MAX_PACKET_LEN + 2;

/// Control octet for an Unnumbered Information frame, ignoring the P/F bit.
const CONTROL_UI: u8 = 0x03;

/// "No layer 3" protocol id, used by APRS.
pub const PID_NO_LAYER3: u8 = 0xF0;

/// Position of an address within the address field.
pub const ADDR_DESTINATION: usize = 0;
pub const ADDR_SOURCE: usize = 1;
pub const ADDR_REPEATER_1: usize = 2;

const SSID_H: u8 = 0x80;
const SSID_RESERVED: u8 = 0x60;
const SSID_LAST: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ax25Error {
    /// Callsign is empty, longer than six characters, or not A-Z/0-9.
    InvalidCallsign,
    /// SSID outside 0..=15.
    InvalidSsid,
    /// Fewer than two or more than ten addresses.
    BadAddressCount,
    /// Frame bytes do not form a valid frame of 15..=330 octets.
    BadFrameLength,
    /// Address field never terminates.
    UnterminatedAddresses,
}

/// One AX.25 frame, excluding FCS.
#[derive(Clone, PartialEq, Eq)]
pub struct Ax25Frame {
    data: [u8; MAX_PACKET_LEN],
    len: usize,
}

impl Ax25Frame {
    /// Accept received wire bytes as a frame, validating the address field.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Ax25Error> {
        if bytes.len() < MIN_PACKET_LEN || bytes.len() > MAX_PACKET_LEN {
            return Err(Ax25Error::BadFrameLength);
        }
        let mut data = [0u8; MAX_PACKET_LEN];
        data[0..bytes.len()].copy_from_slice(bytes);
        let frame = Self {
            data,
            len: bytes.len(),
        };
        let n = frame.num_addresses().ok_or(Ax25Error::UnterminatedAddresses)?;
        if !(MIN_ADDRS..=MAX_ADDRS).contains(&n) {
            return Err(Ax25Error::BadAddressCount);
        }
        if bytes.len() < 7 * n + 1 {
            return Err(Ax25Error::BadFrameLength);
        }
        Ok(frame)
    }

    /// Build a UI frame with PID 0xF0 in the conventional source > destination
    /// form. `path` lists repeater callsigns with their has-been-used flags.
    pub fn new_ui(
        source: &str,
        destination: &str,
        path: &[(&str, bool)],
        info: &[u8],
    ) -> Result<Self, Ax25Error> {
        if path.len() > MAX_ADDRS - MIN_ADDRS {
            return Err(Ax25Error::BadAddressCount);
        }
        let mut data = [0u8; MAX_PACKET_LEN];
        let mut len = 0;

        encode_address(destination, false, &mut data[len..len + 7])?;
        len += 7;
        encode_address(source, false, &mut data[len..len + 7])?;
        len += 7;
        for (call, used) in path {
            encode_address(call, *used, &mut data[len..len + 7])?;
            len += 7;
        }
        data[len - 1] |= SSID_LAST;

        data[len] = CONTROL_UI;
        len += 1;
        data[len] = PID_NO_LAYER3;
        len += 1;

        if len + info.len() > MAX_PACKET_LEN {
            return Err(Ax25Error::BadFrameLength);
        }
        data[len..len + info.len()].copy_from_slice(info);
        len += info.len();

        Ok(Self { data, len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[0..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of addresses, or `None` if the end-of-address bit never appears.
    pub fn num_addresses(&self) -> Option<usize> {
        for i in 0..MAX_ADDRS {
            let ssid = 7 * i + 6;
            if ssid >= self.len {
                return None;
            }
            if self.data[ssid] & SSID_LAST != 0 {
                return Some(i + 1);
            }
        }
        None
    }

    pub fn num_repeaters(&self) -> usize {
        self.num_addresses().map_or(0, |n| n.saturating_sub(2))
    }

    /// Has-been-repeated bit of the given address slot.
    pub fn address_used(&self, index: usize) -> bool {
        self.data[7 * index + 6] & SSID_H != 0
    }

    /// Callsign-SSID text of the given address slot.
    pub fn address_text(&self, index: usize) -> AddrText {
        let mut out = AddrText::new();
        let field = &self.data[7 * index..7 * index + 7];
        for b in &field[0..6] {
            let c = b >> 1;
            if c != b' ' {
                out.push(c);
            }
        }
        let ssid = (field[6] >> 1) & 0x0f;
        if ssid != 0 {
            out.push(b'-');
            if ssid >= 10 {
                out.push(b'1');
            }
            out.push(b'0' + ssid % 10);
        }
        out
    }

    fn control_offset(&self) -> usize {
        7 * self.num_addresses().unwrap_or(MIN_ADDRS)
    }

    pub fn control(&self) -> u8 {
        self.data[self.control_offset()]
    }

    pub fn pid(&self) -> Option<u8> {
        // Only UI frames carry a PID in the traffic we handle.
        let off = self.control_offset() + 1;
        if self.control() & !0x10 == CONTROL_UI && off < self.len {
            Some(self.data[off])
        } else {
            None
        }
    }

    pub fn info(&self) -> &[u8] {
        let mut off = self.control_offset() + 1;
        if self.pid().is_some() {
            off += 1;
        }
        if off >= self.len {
            return &[];
        }
        &self.data[off..self.len]
    }

    /// UI frame with PID 0xF0, i.e. APRS.
    pub fn is_aprs(&self) -> bool {
        self.control() & !0x10 == CONTROL_UI && self.pid() == Some(PID_NO_LAYER3)
    }

    /// Station path in monitor format: `SRC>DST,DIGI*,DIGI:`
    pub fn format_addrs(&self) -> AddrText {
        let mut out = AddrText::new();
        let n = self.num_addresses().unwrap_or(MIN_ADDRS);
        out.extend(&self.address_text(ADDR_SOURCE));
        out.push(b'>');
        out.extend(&self.address_text(ADDR_DESTINATION));
        for i in ADDR_REPEATER_1..n {
            out.push(b',');
            out.extend(&self.address_text(i));
            if self.address_used(i) {
                out.push(b'*');
            }
        }
        out.push(b':');
        out
    }
}

impl core::fmt::Debug for Ax25Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Ax25Frame({})", self.format_addrs().as_str())
    }
}

fn encode_address(text: &str, used: bool, out: &mut [u8]) -> Result<(), Ax25Error> {
    let (call, ssid) = match text.split_once('-') {
        Some((call, ssid)) => {
            let ssid: u8 = ssid.parse().map_err(|_| Ax25Error::InvalidSsid)?;
            if ssid > 15 {
                return Err(Ax25Error::InvalidSsid);
            }
            (call, ssid)
        }
        None => (text, 0),
    };
    if call.is_empty() || call.len() > 6 {
        return Err(Ax25Error::InvalidCallsign);
    }
    for (i, c) in call.bytes().enumerate() {
        if !c.is_ascii_uppercase() && !c.is_ascii_digit() {
            return Err(Ax25Error::InvalidCallsign);
        }
        out[i] = c << 1;
    }
    for slot in out.iter_mut().take(6).skip(call.len()) {
        *slot = b' ' << 1;
    }
    out[6] = SSID_RESERVED | (ssid << 1) | if used { SSID_H } else { 0 };
    Ok(())
}

/// Short stack-allocated text fragment, enough for a full station path.
#[derive(Clone, PartialEq, Eq)]
pub struct AddrText {
    buf: [u8; 120],
    len: usize,
}

impl AddrText {
    fn new() -> Self {
        Self {
            buf: [0u8; 120],
            len: 0,
        }
    }

    fn push(&mut self, b: u8) {
        if self.len < self.buf.len() {
            self.buf[self.len] = b;
            self.len += 1;
        }
    }

    fn extend(&mut self, other: &AddrText) {
        for b in other.as_str().bytes() {
            self.push(b);
        }
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII is ever pushed.
        core::str::from_utf8(&self.buf[0..self.len]).unwrap_or("")
    }
}

impl core::fmt::Display for AddrText {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
