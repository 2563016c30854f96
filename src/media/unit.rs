//! Media units
//!
//! A unit is one media quantum: a video access unit, a group of audio access
//! units, or a PCM sample batch. Units are immutable once handed to a
//! stream.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::format::Format;
use super::rtp::RtpPacket;

/// Payload of a unit.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Video access unit: NAL units without start codes (H.264/H.265).
    VideoAccessUnit(Vec<Bytes>),
    /// One or more audio access units (AAC, Opus).
    AudioAccessUnits(Vec<Bytes>),
    /// Raw sample batch (G.711, LPCM).
    Samples(Bytes),
}

impl Payload {
    pub fn byte_len(&self) -> usize {
        match self {
            Payload::VideoAccessUnit(nalus) => nalus.iter().map(|n| n.len()).sum(),
            Payload::AudioAccessUnits(aus) => aus.iter().map(|a| a.len()).sum(),
            Payload::Samples(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::VideoAccessUnit(nalus) => nalus.is_empty(),
            Payload::AudioAccessUnits(aus) => aus.is_empty(),
            Payload::Samples(s) => s.is_empty(),
        }
    }
}

/// One media quantum with timestamps.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Presentation timestamp in nanoseconds, monotonically non-decreasing
    /// per format within a session. May start negative.
    pub pts: i64,
    /// NTP-derived wall-clock timestamp of the unit, when known.
    pub ntp: Option<DateTime<Utc>>,
    pub payload: Payload,
    /// Filled by the stream when RTP generation is enabled.
    pub rtp_packets: Vec<RtpPacket>,
}

impl Unit {
    pub fn new(pts: i64, ntp: Option<DateTime<Utc>>, payload: Payload) -> Self {
        Self {
            pts,
            ntp,
            payload,
            rtp_packets: Vec::new(),
        }
    }

    /// Whether a decoder can start from this unit.
    ///
    /// Audio and PCM units are always random access. For video the NAL units
    /// are inspected: H.264 IDR (type 5), H.265 BLA/IDR/CRA (types 16..23).
    pub fn is_random_access(&self, format: &Format) -> bool {
        let nalus = match &self.payload {
            Payload::VideoAccessUnit(nalus) => nalus,
            _ => return true,
        };

        match format {
            Format::H264 { .. } => nalus
                .iter()
                .any(|n| !n.is_empty() && n[0] & 0x1F == 5),
            Format::H265 { .. } => nalus.iter().any(|n| {
                if n.is_empty() {
                    return false;
                }
                let typ = (n[0] >> 1) & 0x3F;
                (16..=23).contains(&typ)
            }),
            _ => true,
        }
    }
}

/// In-band H.264 parameter sets of an access unit, if present.
pub(crate) fn h264_inband_params(nalus: &[Bytes]) -> (Option<Bytes>, Option<Bytes>) {
    let mut sps = None;
    let mut pps = None;
    for n in nalus {
        if n.is_empty() {
            continue;
        }
        match n[0] & 0x1F {
            7 => sps = Some(n.clone()),
            8 => pps = Some(n.clone()),
            _ => {}
        }
    }
    (sps, pps)
}

/// In-band H.265 parameter sets of an access unit, if present.
pub(crate) fn h265_inband_params(nalus: &[Bytes]) -> (Option<Bytes>, Option<Bytes>, Option<Bytes>) {
    let mut vps = None;
    let mut sps = None;
    let mut pps = None;
    for n in nalus {
        if n.is_empty() {
            continue;
        }
        match (n[0] >> 1) & 0x3F {
            32 => vps = Some(n.clone()),
            33 => sps = Some(n.clone()),
            34 => pps = Some(n.clone()),
            _ => {}
        }
    }
    (vps, sps, pps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_random_access() {
        let format = Format::h264(96);

        let idr = Unit::new(
            0,
            None,
            Payload::VideoAccessUnit(vec![Bytes::from_static(&[0x65, 0x00])]),
        );
        assert!(idr.is_random_access(&format));

        let non_idr = Unit::new(
            0,
            None,
            Payload::VideoAccessUnit(vec![Bytes::from_static(&[0x41, 0x00])]),
        );
        assert!(!non_idr.is_random_access(&format));
    }

    #[test]
    fn test_h265_random_access() {
        let format = Format::h265(96);

        // CRA_NUT (21) << 1 = 0x2A
        let cra = Unit::new(
            0,
            None,
            Payload::VideoAccessUnit(vec![Bytes::from_static(&[0x2A, 0x00])]),
        );
        assert!(cra.is_random_access(&format));

        // TRAIL_R (1) << 1 = 0x02
        let trail = Unit::new(
            0,
            None,
            Payload::VideoAccessUnit(vec![Bytes::from_static(&[0x02, 0x00])]),
        );
        assert!(!trail.is_random_access(&format));
    }

    #[test]
    fn test_audio_always_random_access() {
        let format = Format::G711 {
            mulaw: false,
            sample_rate: 8000,
            channel_count: 1,
        };
        let unit = Unit::new(0, None, Payload::Samples(Bytes::from_static(&[1, 2, 3])));
        assert!(unit.is_random_access(&format));
    }

    #[test]
    fn test_inband_h264_params() {
        let sps = Bytes::from_static(&[0x67, 0x42]);
        let pps = Bytes::from_static(&[0x68, 0xCE]);
        let nalus = vec![sps.clone(), pps.clone(), Bytes::from_static(&[0x65])];

        let (got_sps, got_pps) = h264_inband_params(&nalus);
        assert_eq!(got_sps, Some(sps));
        assert_eq!(got_pps, Some(pps));
    }

    #[test]
    fn test_payload_byte_len() {
        let payload = Payload::VideoAccessUnit(vec![
            Bytes::from_static(&[1, 2, 3]),
            Bytes::from_static(&[4, 5]),
        ]);
        assert_eq!(payload.byte_len(), 5);
        assert!(!payload.is_empty());
    }
}
