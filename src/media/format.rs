//! Format catalog
//!
//! Each format carries the codec parameters the rest of the core needs:
//! RTP clock rate, codec descriptors for recording, payload type. The design
//! is format-agnostic; codec-specific knowledge is confined to the optional
//! packetizers and the recorder's descriptor emitter.

use bytes::{BufMut, Bytes, BytesMut};

/// MPEG-4 Audio (AAC) configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AacConfig {
    /// Audio object type (2 = AAC-LC).
    pub object_type: u8,
    pub sample_rate: u32,
    pub channel_count: u32,
}

impl AacConfig {
    /// Index into the MPEG-4 sampling frequency table, if the rate is listed.
    fn sample_rate_index(&self) -> Option<u8> {
        const RATES: [u32; 13] = [
            96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
            7350,
        ];
        RATES.iter().position(|&r| r == self.sample_rate).map(|i| i as u8)
    }

    /// Serialize as a 2-byte AudioSpecificConfig (explicit rates unsupported).
    pub fn marshal(&self) -> Bytes {
        let idx = self.sample_rate_index().unwrap_or(15);
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8((self.object_type << 3) | (idx >> 1));
        buf.put_u8(((idx & 0x01) << 7) | ((self.channel_count as u8) << 3));
        buf.freeze()
    }
}

/// A format of a media.
///
/// Codec parameters for H.264/H.265 are optional at creation and can be
/// learned from in-band parameter sets before the first recorded segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    H264 {
        payload_type: u8,
        sps: Option<Bytes>,
        pps: Option<Bytes>,
    },
    H265 {
        payload_type: u8,
        vps: Option<Bytes>,
        sps: Option<Bytes>,
        pps: Option<Bytes>,
    },
    Mpeg4Audio {
        payload_type: u8,
        config: AacConfig,
    },
    G711 {
        mulaw: bool,
        sample_rate: u32,
        channel_count: u32,
    },
    Lpcm {
        payload_type: u8,
        bit_depth: u32,
        sample_rate: u32,
        channel_count: u32,
    },
    Opus {
        payload_type: u8,
        channel_count: u32,
    },
}

impl Format {
    /// H.264 with no out-of-band parameter sets.
    pub fn h264(payload_type: u8) -> Self {
        Format::H264 {
            payload_type,
            sps: None,
            pps: None,
        }
    }

    /// H.265 with no out-of-band parameter sets.
    pub fn h265(payload_type: u8) -> Self {
        Format::H265 {
            payload_type,
            vps: None,
            sps: None,
            pps: None,
        }
    }

    pub fn codec_name(&self) -> &'static str {
        match self {
            Format::H264 { .. } => "H264",
            Format::H265 { .. } => "H265",
            Format::Mpeg4Audio { .. } => "MPEG-4 Audio",
            Format::G711 { mulaw: true, .. } => "G711 mu-law",
            Format::G711 { mulaw: false, .. } => "G711 A-law",
            Format::Lpcm { .. } => "LPCM",
            Format::Opus { .. } => "Opus",
        }
    }

    /// RTP payload type. G.711 uses the static assignments.
    pub fn payload_type(&self) -> u8 {
        match self {
            Format::H264 { payload_type, .. }
            | Format::H265 { payload_type, .. }
            | Format::Mpeg4Audio { payload_type, .. }
            | Format::Lpcm { payload_type, .. }
            | Format::Opus { payload_type, .. } => *payload_type,
            Format::G711 { mulaw, .. } => {
                if *mulaw {
                    0
                } else {
                    8
                }
            }
        }
    }

    /// RTP clock rate: 90 kHz for video, the sample rate for audio.
    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::H264 { .. } | Format::H265 { .. } => 90_000,
            Format::Mpeg4Audio { config, .. } => config.sample_rate,
            Format::G711 { sample_rate, .. } | Format::Lpcm { sample_rate, .. } => *sample_rate,
            Format::Opus { .. } => 48_000,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Format::H264 { .. } | Format::H265 { .. })
    }
}
