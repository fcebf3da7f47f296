//! Frame Check Sequence for AX.25.
//!
//! CRC-16/X-25: the CCITT polynomial in reflected form (0x8408), initial
//! value 0xFFFF, final register complemented. The FCS is appended to the
//! frame low byte first.

pub const AX25_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xFFFF,
    refin: true,
    refout: true,
    xorout: 0xFFFF,
    check: 0x906E,
    residue: 0xF0B8,
};

pub fn fcs_calc(input: &[u8]) -> u16 {
    let crc = crc::Crc::<u16>::new(&AX25_ALG);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}

/// True if `frame` (data followed by two FCS octets, low byte first) is intact.
pub fn fcs_check(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (data, fcs) = frame.split_at(frame.len() - 2);
    fcs_calc(data) == u16::from_le_bytes([fcs[0], fcs[1]])
}
