//! Stream fan-out
//!
//! In-memory pub/sub of media units: one writer (the publisher's session),
//! any number of readers, each reached through a callback that enqueues into
//! that reader's bounded queue. The writer never blocks on a reader.

mod format;

pub use format::{OnUnit, ReaderId, StreamFormat};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::media::{Description, Packetizer, Unit};

/// Fan-out structure bound to one description.
///
/// The description is immutable after creation. Writes must come from a
/// single task; reads may happen concurrently from any number of readers.
#[derive(Debug)]
pub struct Stream {
    description: Description,
    /// One entry per media, mirroring `description.medias`.
    formats: Vec<Vec<StreamFormat>>,
    closed: AtomicBool,
}

impl Stream {
    /// Build the per-format fan-out state.
    ///
    /// Fails when the description is empty, when `generate_rtp_packets` is
    /// requested for a format without an RTP mapping, or when the MTU cannot
    /// hold the fixed RTP header.
    pub fn new(
        udp_max_payload_size: usize,
        description: Description,
        generate_rtp_packets: bool,
    ) -> Result<Arc<Self>> {
        if description.is_empty() {
            return Err(Error::InvalidStream("empty description".into()));
        }

        let mut formats = Vec::with_capacity(description.medias.len());
        for media in &description.medias {
            let mut media_formats = Vec::with_capacity(media.formats.len());
            for format in &media.formats {
                let packetizer = if generate_rtp_packets {
                    Some(Packetizer::new(format, udp_max_payload_size)?)
                } else {
                    None
                };
                media_formats.push(StreamFormat::new(
                    media.media_type,
                    format.clone(),
                    packetizer,
                ));
            }
            formats.push(media_formats);
        }

        Ok(Arc::new(Self {
            description,
            formats,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn description(&self) -> &Description {
        &self.description
    }

    /// Drop every subscriber. Subsequent writes are discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for media in &self.formats {
            for sf in media {
                sf.clear_subscribers();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stream_format(&self, media_idx: usize, format_idx: usize) -> Option<&StreamFormat> {
        self.formats.get(media_idx)?.get(format_idx)
    }

    /// Per-format state, for recorders and sessions that walk every format.
    pub fn formats(&self) -> impl Iterator<Item = ((usize, usize), &StreamFormat)> + '_ {
        self.formats
            .iter()
            .enumerate()
            .flat_map(|(mi, media)| media.iter().enumerate().map(move |(fi, sf)| ((mi, fi), sf)))
    }

    /// Subscribe a reader to one format.
    pub fn add_reader(
        &self,
        reader: ReaderId,
        media_idx: usize,
        format_idx: usize,
        on_unit: OnUnit,
    ) {
        if self.is_closed() {
            return;
        }
        if let Some(sf) = self.stream_format(media_idx, format_idx) {
            sf.add_subscriber(reader, on_unit);
        }
    }

    /// Unsubscribe a reader from every format it was added to.
    pub fn remove_reader(&self, reader: ReaderId) {
        for media in &self.formats {
            for sf in media {
                sf.remove_subscriber(reader);
            }
        }
    }

    /// Formats the given reader is subscribed to, in description order.
    pub fn formats_for_reader(&self, reader: ReaderId) -> Vec<&crate::media::Format> {
        let mut out = Vec::new();
        for media in &self.formats {
            for sf in media {
                if sf.has_subscriber(reader) {
                    out.push(sf.format());
                }
            }
        }
        out
    }

    /// Write one unit from the publisher.
    ///
    /// Infallible from the writer's perspective: overflow is absorbed by the
    /// readers' own queues. Out-of-range indices and writes after close are
    /// discarded.
    pub fn write_unit(&self, media_idx: usize, format_idx: usize, unit: Unit) {
        if self.is_closed() {
            return;
        }
        if let Some(sf) = self.stream_format(media_idx, format_idx) {
            sf.write_unit(unit);
        }
    }

    /// Total payload bytes accepted since creation.
    pub fn bytes_received(&self) -> u64 {
        self.formats
            .iter()
            .flatten()
            .map(|sf| sf.bytes_received())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Format, Media, MediaType, Payload};
    use bytes::Bytes;
    use std::sync::Mutex;

    fn video_desc() -> Description {
        Description::new(vec![Media::new(MediaType::Video, vec![Format::h264(96)])])
    }

    fn video_unit(pts: i64) -> Unit {
        Unit::new(
            pts,
            None,
            Payload::VideoAccessUnit(vec![Bytes::from_static(&[0x65, 1, 2, 3])]),
        )
    }

    #[test]
    fn test_new_rejects_empty_description() {
        let res = Stream::new(1460, Description::default(), false);
        assert!(matches!(res, Err(Error::InvalidStream(_))));
    }

    #[test]
    fn test_new_rejects_small_mtu() {
        let res = Stream::new(4, video_desc(), true);
        assert!(matches!(res, Err(Error::InvalidStream(_))));
    }

    #[test]
    fn test_units_delivered_in_order() {
        let stream = Stream::new(1460, video_desc(), false).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = Arc::clone(&seen);
        stream.add_reader(
            1,
            0,
            0,
            Arc::new(move |unit| seen2.lock().unwrap().push(unit.pts)),
        );

        for i in 0..100 {
            stream.write_unit(0, 0, video_unit(i * 33_333_333));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_removed_reader_sees_nothing() {
        let stream = Stream::new(1460, video_desc(), false).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = Arc::clone(&seen);
        stream.add_reader(
            7,
            0,
            0,
            Arc::new(move |unit| seen2.lock().unwrap().push(unit.pts)),
        );

        stream.write_unit(0, 0, video_unit(0));
        stream.remove_reader(7);
        stream.write_unit(0, 0, video_unit(1));

        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert!(stream.formats_for_reader(7).is_empty());
    }

    #[test]
    fn test_rtp_generation() {
        let stream = Stream::new(1460, video_desc(), true).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = Arc::clone(&seen);
        stream.add_reader(
            1,
            0,
            0,
            Arc::new(move |unit| seen2.lock().unwrap().push(unit.rtp_packets.len())),
        );

        stream.write_unit(0, 0, video_unit(0));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_counters_and_ring() {
        let stream = Stream::new(1460, video_desc(), false).unwrap();

        stream.write_unit(0, 0, video_unit(0));
        stream.write_unit(0, 0, video_unit(1));

        assert_eq!(stream.bytes_received(), 8);
        let (_, sf) = stream.formats().next().unwrap();
        assert_eq!(sf.units_received(), 2);
        assert_eq!(sf.recent_units().len(), 2);
    }

    #[test]
    fn test_write_after_close_is_discarded() {
        let stream = Stream::new(1460, video_desc(), false).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = Arc::clone(&seen);
        stream.add_reader(
            1,
            0,
            0,
            Arc::new(move |unit| seen2.lock().unwrap().push(unit.pts)),
        );

        stream.close();
        stream.write_unit(0, 0, video_unit(0));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_formats_for_reader_order() {
        let desc = Description::new(vec![
            Media::new(MediaType::Video, vec![Format::h264(96)]),
            Media::new(
                MediaType::Audio,
                vec![Format::G711 {
                    mulaw: false,
                    sample_rate: 8000,
                    channel_count: 1,
                }],
            ),
        ]);
        let stream = Stream::new(1460, desc, false).unwrap();

        stream.add_reader(1, 0, 0, Arc::new(|_| {}));
        stream.add_reader(1, 1, 0, Arc::new(|_| {}));

        let formats = stream.formats_for_reader(1);
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0].codec_name(), "H264");
        assert_eq!(formats[1].codec_name(), "G711 A-law");
    }
}
