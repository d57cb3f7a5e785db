//! Fixed RTP header (RFC 3550), 12 bytes

use bitstream_io::{BigEndian, BitRead, BitReader};

use crate::constants::{RTP_HEADER_SIZE, RTP_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    /// Wraps at 65535
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header. Returns `None` for short input; the version
    /// is reported as-is so the caller can count malformed datagrams.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_SIZE {
            return None;
        }
        let mut br = BitReader::endian(&data[..RTP_HEADER_SIZE], BigEndian);
        let version = br.read::<2, u8>().ok()?;
        let padding = br.read::<1, u8>().ok()? != 0;
        let extension = br.read::<1, u8>().ok()? != 0;
        let csrc_count = br.read::<4, u8>().ok()?;
        let marker = br.read::<1, u8>().ok()? != 0;
        let payload_type = br.read::<7, u8>().ok()?;
        let sequence = br.read::<16, u16>().ok()?;
        let timestamp = br.read::<32, u32>().ok()?;
        let ssrc = br.read::<32, u32>().ok()?;

        Some(Self {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.version == RTP_VERSION
    }
}

/// Payload bytes forwarded for a datagram: everything after the fixed
/// header. Tuners send neither CSRC lists nor extensions, and the bytes are
/// forwarded verbatim.
pub fn payload_of(datagram: &[u8]) -> &[u8] {
    datagram.get(RTP_HEADER_SIZE..).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_header_fields() {
        let datagram = [
            0x80, 0xA1, 0x12, 0x34, // v2, marker, pt 33, seq 0x1234
            0x00, 0x01, 0x5F, 0x90, // timestamp 90000
            0xDE, 0xAD, 0xBE, 0xEF, // ssrc
            0x47, 0x00,
        ];
        let header = RtpHeader::parse(&datagram).expect("header");
        assert!(header.is_valid());
        assert!(header.marker);
        assert!(!header.padding);
        assert_eq!(header.payload_type, 33);
        assert_eq!(header.sequence, 0x1234);
        assert_eq!(header.timestamp, 90_000);
        assert_eq!(header.ssrc, 0xDEAD_BEEF);
        assert_eq!(payload_of(&datagram), &[0x47, 0x00]);
    }

    #[test]
    fn short_or_wrong_version() {
        assert!(RtpHeader::parse(&[0x80; 11]).is_none());
        let header = RtpHeader::parse(&[0x40; 12]).expect("header");
        assert_eq!(header.version, 1);
        assert!(!header.is_valid());
        assert!(payload_of(&[0u8; 12]).is_empty());
    }
}
