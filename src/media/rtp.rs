//! RTP packetization
//!
//! Minimal deterministic packetizer used when a stream is created with RTP
//! generation enabled. Given the same units, PTS values and MTU, the emitted
//! packet sequence is identical across runs: sequence numbers start at zero
//! and the SSRC is derived from the payload type.
//!
//! RTP fixed header:
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |        sequence number        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::format::Format;
use super::unit::Payload;
use crate::error::{Error, Result};

/// Size of the fixed RTP header in bytes.
pub const RTP_HEADER_SIZE: usize = 12;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// One RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Serialize header + payload.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.put_u8(0x80); // V=2, no padding, no extension, no CSRC
        buf.put_u8((u8::from(self.marker) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Per-format packetizer.
pub struct Packetizer {
    payload_type: u8,
    clock_rate: u32,
    max_payload: usize,
    sequence_number: u16,
    ssrc: u32,
}

impl Packetizer {
    /// Fails when the MTU cannot even hold the fixed header plus one byte,
    /// or when the format has no RTP mapping (LPCM depths other than
    /// 8/16/24 bits).
    pub fn new(format: &Format, udp_max_payload_size: usize) -> Result<Self> {
        if udp_max_payload_size <= RTP_HEADER_SIZE {
            return Err(Error::InvalidStream(format!(
                "udp max payload size {} does not fit an RTP header",
                udp_max_payload_size
            )));
        }

        if let Format::Lpcm { bit_depth, .. } = format {
            if !matches!(bit_depth, 8 | 16 | 24) {
                return Err(Error::InvalidStream(format!(
                    "no RTP mapping for {}-bit LPCM",
                    bit_depth
                )));
            }
        }

        Ok(Self {
            payload_type: format.payload_type(),
            clock_rate: format.clock_rate(),
            max_payload: udp_max_payload_size - RTP_HEADER_SIZE,
            sequence_number: 0,
            ssrc: 0x4D48_0000 | u32::from(format.payload_type()),
        })
    }

    fn rtp_time(&self, pts: i64) -> u32 {
        // i128 keeps the multiplication exact for any clock rate.
        let ticks = (pts as i128 * self.clock_rate as i128) / NANOS_PER_SEC as i128;
        ticks as i64 as u32
    }

    /// Split a unit payload into MTU-bound packets.
    ///
    /// All packets of the unit share its timestamp; the marker bit is set on
    /// the last one.
    pub fn packetize(&mut self, payload: &Payload, pts: i64) -> Vec<RtpPacket> {
        let mut flat = BytesMut::new();
        match payload {
            Payload::VideoAccessUnit(nalus) => {
                for n in nalus {
                    flat.put_slice(n);
                }
            }
            Payload::AudioAccessUnits(aus) => {
                for a in aus {
                    flat.put_slice(a);
                }
            }
            Payload::Samples(s) => flat.put_slice(s),
        }
        let flat = flat.freeze();

        if flat.is_empty() {
            return Vec::new();
        }

        let timestamp = self.rtp_time(pts);
        let count = flat.len().div_ceil(self.max_payload);
        let mut packets = Vec::with_capacity(count);

        for (i, chunk) in flat.chunks(self.max_payload).enumerate() {
            packets.push(RtpPacket {
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp,
                ssrc: self.ssrc,
                marker: i == count - 1,
                payload: flat.slice_ref(chunk),
            });
            self.sequence_number = self.sequence_number.wrapping_add(1);
        }

        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mtu_too_small() {
        assert!(Packetizer::new(&Format::h264(96), RTP_HEADER_SIZE).is_err());
        assert!(Packetizer::new(&Format::h264(96), RTP_HEADER_SIZE + 1).is_ok());
    }

    #[test]
    fn test_unsupported_lpcm_depth() {
        let format = Format::Lpcm {
            payload_type: 96,
            bit_depth: 32,
            sample_rate: 44100,
            channel_count: 2,
        };
        assert!(Packetizer::new(&format, 1460).is_err());
    }

    #[test]
    fn test_split_and_marker() {
        let mut p = Packetizer::new(&Format::h264(96), RTP_HEADER_SIZE + 4).unwrap();
        let payload = Payload::VideoAccessUnit(vec![Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7])]);

        let packets = p.packetize(&payload, 0);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload.as_ref(), &[1, 2, 3, 4]);
        assert_eq!(packets[1].payload.as_ref(), &[5, 6, 7]);
        assert!(!packets[0].marker);
        assert!(packets[1].marker);
        assert_eq!(packets[0].sequence_number, 0);
        assert_eq!(packets[1].sequence_number, 1);
    }

    #[test]
    fn test_deterministic_timestamps() {
        let mut a = Packetizer::new(&Format::h264(96), 1460).unwrap();
        let mut b = Packetizer::new(&Format::h264(96), 1460).unwrap();
        let payload = Payload::VideoAccessUnit(vec![Bytes::from_static(&[0x65])]);

        let pa = a.packetize(&payload, 33_333_333);
        let pb = b.packetize(&payload, 33_333_333);
        assert_eq!(pa, pb);
        // 1/30 s at 90 kHz
        assert_eq!(pa[0].timestamp, 2999);
    }

    #[test]
    fn test_negative_pts_wraps() {
        let mut p = Packetizer::new(&Format::h264(96), 1460).unwrap();
        let payload = Payload::VideoAccessUnit(vec![Bytes::from_static(&[0x65])]);

        let packets = p.packetize(&payload, -1_000_000_000);
        assert_eq!(packets[0].timestamp, (-90_000i64) as u32);
    }

    #[test]
    fn test_marshal_header() {
        let pkt = RtpPacket {
            payload_type: 96,
            sequence_number: 0x0102,
            timestamp: 0x03040506,
            ssrc: 0x0708090A,
            marker: true,
            payload: Bytes::from_static(&[0xAA]),
        };
        let bytes = pkt.marshal();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x80 | 96);
        assert_eq!(&bytes[2..4], &[0x01, 0x02]);
        assert_eq!(bytes[12], 0xAA);
    }
}
