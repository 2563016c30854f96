//! Media description model
//!
//! A publisher installs a `Description`: an ordered list of medias, each
//! carrying one or more formats. The description is immutable once a stream
//! has been created from it.

mod format;
mod rtp;
mod unit;

pub use format::{AacConfig, Format};
pub use rtp::{Packetizer, RtpPacket, RTP_HEADER_SIZE};
pub use unit::{Payload, Unit};
pub(crate) use unit::{h264_inband_params, h265_inband_params};

/// Kind of a media within a description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
            MediaType::Application => write!(f, "application"),
        }
    }
}

/// One media of a description (e.g. the video track), with its formats.
#[derive(Debug, Clone)]
pub struct Media {
    pub media_type: MediaType,
    pub formats: Vec<Format>,
}

impl Media {
    pub fn new(media_type: MediaType, formats: Vec<Format>) -> Self {
        Self {
            media_type,
            formats,
        }
    }
}

/// Ordered list of medias installed by a publisher.
#[derive(Debug, Clone, Default)]
pub struct Description {
    pub medias: Vec<Media>,
}

impl Description {
    pub fn new(medias: Vec<Media>) -> Self {
        Self { medias }
    }

    pub fn is_empty(&self) -> bool {
        self.medias.is_empty()
    }

    /// Total number of (media, format) pairs.
    pub fn format_count(&self) -> usize {
        self.medias.iter().map(|m| m.formats.len()).sum()
    }

    /// Human-readable codec list, used by session logs and the API.
    pub fn formats_info(&self) -> String {
        let names: Vec<&str> = self
            .medias
            .iter()
            .flat_map(|m| m.formats.iter().map(|f| f.codec_name()))
            .collect();
        format!("{} track(s) ({})", names.len(), names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats_info() {
        let desc = Description::new(vec![
            Media::new(MediaType::Video, vec![Format::h264(96)]),
            Media::new(
                MediaType::Audio,
                vec![Format::Mpeg4Audio {
                    payload_type: 96,
                    config: AacConfig {
                        object_type: 2,
                        sample_rate: 44100,
                        channel_count: 2,
                    },
                }],
            ),
        ]);

        assert_eq!(desc.format_count(), 2);
        assert_eq!(desc.formats_info(), "2 track(s) (H264, MPEG-4 Audio)");
    }

    #[test]
    fn test_empty_description() {
        let desc = Description::default();
        assert!(desc.is_empty());
        assert_eq!(desc.format_count(), 0);
    }
}
