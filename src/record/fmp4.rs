//! Fragmented-MP4 muxing
//!
//! Writes the ISO BMFF boxes the recorder needs: an init section (ftyp +
//! moov with one trak per recorded track) and parts (moof + mdat). The init
//! is written inline at the start of every segment file.

use bytes::{BufMut, Bytes, BytesMut};

use crate::media::AacConfig;

/// Codec descriptor of an init track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    H264 {
        sps: Bytes,
        pps: Bytes,
    },
    H265 {
        vps: Bytes,
        sps: Bytes,
        pps: Bytes,
    },
    Mpeg4Audio {
        config: AacConfig,
    },
    Lpcm {
        bit_depth: u32,
        sample_rate: u32,
        channel_count: u32,
    },
    Opus {
        channel_count: u32,
    },
}

impl Codec {
    fn is_video(&self) -> bool {
        matches!(self, Codec::H264 { .. } | Codec::H265 { .. })
    }
}

/// One track of the init section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTrack {
    /// 1-based, stable in description order.
    pub id: u32,
    pub time_scale: u32,
    pub codec: Codec,
}

/// Init section: ftyp + moov.
#[derive(Debug, Clone, Default)]
pub struct Init {
    pub tracks: Vec<InitTrack>,
}

/// One sample of a part track.
#[derive(Debug, Clone)]
pub struct PartSample {
    pub duration: u32,
    pub is_non_sync: bool,
    pub payload: Bytes,
}

/// Contiguous run of samples of one track.
#[derive(Debug, Clone)]
pub struct PartTrack {
    pub id: u32,
    /// Base decode time in track time scale units.
    pub base_time: u64,
    pub samples: Vec<PartSample>,
}

/// One part: moof + mdat.
#[derive(Debug, Clone)]
pub struct Part {
    pub sequence_number: u32,
    pub tracks: Vec<PartTrack>,
}

fn write_box(buf: &mut BytesMut, name: &[u8; 4], f: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(name);
    f(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(
    buf: &mut BytesMut,
    name: &[u8; 4],
    version: u8,
    flags: u32,
    f: impl FnOnce(&mut BytesMut),
) {
    write_box(buf, name, |buf| {
        buf.put_u32((u32::from(version) << 24) | (flags & 0x00FF_FFFF));
        f(buf);
    });
}

const IDENTITY_MATRIX: [u32; 9] = [
    0x0001_0000,
    0,
    0,
    0,
    0x0001_0000,
    0,
    0,
    0,
    0x4000_0000,
];

impl Init {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1024);

        write_box(&mut buf, b"ftyp", |buf| {
            buf.put_slice(b"mp42");
            buf.put_u32(1);
            buf.put_slice(b"mp41");
            buf.put_slice(b"mp42");
            buf.put_slice(b"isom");
        });

        write_box(&mut buf, b"moov", |buf| {
            write_full_box(buf, b"mvhd", 0, 0, |buf| {
                buf.put_u32(0); // creation time
                buf.put_u32(0); // modification time
                buf.put_u32(1000); // time scale
                buf.put_u32(0); // duration
                buf.put_u32(0x0001_0000); // rate
                buf.put_u16(0x0100); // volume
                buf.put_bytes(0, 10);
                for v in IDENTITY_MATRIX {
                    buf.put_u32(v);
                }
                buf.put_bytes(0, 24);
                buf.put_u32(self.tracks.len() as u32 + 1); // next track ID
            });

            for track in &self.tracks {
                write_trak(buf, track);
            }

            write_box(buf, b"mvex", |buf| {
                for track in &self.tracks {
                    write_full_box(buf, b"trex", 0, 0, |buf| {
                        buf.put_u32(track.id);
                        buf.put_u32(1); // default sample description index
                        buf.put_u32(0);
                        buf.put_u32(0);
                        buf.put_u32(0);
                    });
                }
            });
        });

        buf.freeze()
    }
}

fn write_trak(buf: &mut BytesMut, track: &InitTrack) {
    write_box(buf, b"trak", |buf| {
        write_full_box(buf, b"tkhd", 0, 3, |buf| {
            buf.put_u32(0); // creation time
            buf.put_u32(0); // modification time
            buf.put_u32(track.id);
            buf.put_u32(0);
            buf.put_u32(0); // duration
            buf.put_bytes(0, 8);
            buf.put_u16(0); // layer
            buf.put_u16(0); // alternate group
            buf.put_u16(if track.codec.is_video() { 0 } else { 0x0100 });
            buf.put_u16(0);
            for v in IDENTITY_MATRIX {
                buf.put_u32(v);
            }
            buf.put_u32(0); // width
            buf.put_u32(0); // height
        });

        write_box(buf, b"mdia", |buf| {
            write_full_box(buf, b"mdhd", 0, 0, |buf| {
                buf.put_u32(0);
                buf.put_u32(0);
                buf.put_u32(track.time_scale);
                buf.put_u32(0);
                buf.put_u16(0x55C4); // und
                buf.put_u16(0);
            });

            write_full_box(buf, b"hdlr", 0, 0, |buf| {
                buf.put_u32(0);
                if track.codec.is_video() {
                    buf.put_slice(b"vide");
                } else {
                    buf.put_slice(b"soun");
                }
                buf.put_bytes(0, 12);
                if track.codec.is_video() {
                    buf.put_slice(b"VideoHandler\0");
                } else {
                    buf.put_slice(b"SoundHandler\0");
                }
            });

            write_box(buf, b"minf", |buf| {
                if track.codec.is_video() {
                    write_full_box(buf, b"vmhd", 0, 1, |buf| {
                        buf.put_u16(0);
                        buf.put_bytes(0, 6);
                    });
                } else {
                    write_full_box(buf, b"smhd", 0, 0, |buf| {
                        buf.put_u32(0);
                    });
                }

                write_box(buf, b"dinf", |buf| {
                    write_full_box(buf, b"dref", 0, 0, |buf| {
                        buf.put_u32(1);
                        write_full_box(buf, b"url ", 0, 1, |_| {});
                    });
                });

                write_box(buf, b"stbl", |buf| {
                    write_full_box(buf, b"stsd", 0, 0, |buf| {
                        buf.put_u32(1);
                        write_sample_entry(buf, track);
                    });
                    write_full_box(buf, b"stts", 0, 0, |buf| buf.put_u32(0));
                    write_full_box(buf, b"stsc", 0, 0, |buf| buf.put_u32(0));
                    write_full_box(buf, b"stsz", 0, 0, |buf| {
                        buf.put_u32(0);
                        buf.put_u32(0);
                    });
                    write_full_box(buf, b"stco", 0, 0, |buf| buf.put_u32(0));
                });
            });
        });
    });
}

fn write_visual_entry_header(buf: &mut BytesMut) {
    buf.put_bytes(0, 6);
    buf.put_u16(1); // data reference index
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_bytes(0, 12);
    buf.put_u16(640); // width
    buf.put_u16(480); // height
    buf.put_u32(0x0048_0000); // 72 dpi
    buf.put_u32(0x0048_0000);
    buf.put_u32(0);
    buf.put_u16(1); // frame count
    buf.put_bytes(0, 32); // compressor name
    buf.put_u16(0x0018); // depth
    buf.put_u16(0xFFFF);
}

fn write_audio_entry_header(buf: &mut BytesMut, channel_count: u32, sample_size: u16, rate: u32) {
    buf.put_bytes(0, 6);
    buf.put_u16(1); // data reference index
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u16(channel_count as u16);
    buf.put_u16(sample_size);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u32(rate << 16);
}

fn write_sample_entry(buf: &mut BytesMut, track: &InitTrack) {
    match &track.codec {
        Codec::H264 { sps, pps } => {
            write_box(buf, b"avc1", |buf| {
                write_visual_entry_header(buf);
                write_box(buf, b"avcC", |buf| {
                    buf.put_u8(1); // configuration version
                    buf.put_u8(sps.get(1).copied().unwrap_or(0x42));
                    buf.put_u8(sps.get(2).copied().unwrap_or(0));
                    buf.put_u8(sps.get(3).copied().unwrap_or(0x1E));
                    buf.put_u8(0xFC | 3); // NALU length size - 1
                    buf.put_u8(0xE0 | 1); // SPS count
                    buf.put_u16(sps.len() as u16);
                    buf.put_slice(sps);
                    buf.put_u8(1); // PPS count
                    buf.put_u16(pps.len() as u16);
                    buf.put_slice(pps);
                });
            });
        }
        Codec::H265 { vps, sps, pps } => {
            write_box(buf, b"hvc1", |buf| {
                write_visual_entry_header(buf);
                write_box(buf, b"hvcC", |buf| {
                    buf.put_u8(1); // configuration version
                    buf.put_u8(0x01); // profile space / tier / profile idc
                    buf.put_u32(0x6000_0000); // profile compatibility
                    buf.put_slice(&[0x90, 0, 0, 0, 0, 0]); // constraint flags
                    buf.put_u8(120); // level idc
                    buf.put_u16(0xF000); // min spatial segmentation
                    buf.put_u8(0xFC); // parallelism type
                    buf.put_u8(0xFD); // chroma format 4:2:0
                    buf.put_u8(0xF8); // bit depth luma - 8
                    buf.put_u8(0xF8); // bit depth chroma - 8
                    buf.put_u16(0); // average frame rate
                    buf.put_u8(0x03); // NALU length size - 1, no temporal layering
                    buf.put_u8(3); // number of arrays
                    for (nal_type, ps) in [(32u8, vps), (33, sps), (34, pps)] {
                        buf.put_u8(0x80 | nal_type);
                        buf.put_u16(1);
                        buf.put_u16(ps.len() as u16);
                        buf.put_slice(ps);
                    }
                });
            });
        }
        Codec::Mpeg4Audio { config } => {
            write_box(buf, b"mp4a", |buf| {
                write_audio_entry_header(buf, config.channel_count, 16, config.sample_rate);
                let asc = config.marshal();
                write_full_box(buf, b"esds", 0, 0, |buf| {
                    let dec_specific_len = asc.len() as u8;
                    let dec_config_len = 13 + 2 + dec_specific_len;
                    let es_len = 3 + 2 + dec_config_len + 3;

                    buf.put_u8(0x03); // ES descriptor
                    buf.put_u8(es_len);
                    buf.put_u16(0); // ES ID
                    buf.put_u8(0);
                    buf.put_u8(0x04); // decoder config descriptor
                    buf.put_u8(dec_config_len);
                    buf.put_u8(0x40); // MPEG-4 audio
                    buf.put_u8(0x15); // audio stream
                    buf.put_bytes(0, 3); // buffer size
                    buf.put_u32(0); // max bitrate
                    buf.put_u32(0); // average bitrate
                    buf.put_u8(0x05); // decoder specific info
                    buf.put_u8(dec_specific_len);
                    buf.put_slice(&asc);
                    buf.put_u8(0x06); // SL config descriptor
                    buf.put_u8(1);
                    buf.put_u8(0x02);
                });
            });
        }
        Codec::Lpcm {
            bit_depth,
            sample_rate,
            channel_count,
        } => {
            write_box(buf, b"ipcm", |buf| {
                write_audio_entry_header(buf, *channel_count, *bit_depth as u16, *sample_rate);
                write_full_box(buf, b"pcmC", 0, 0, |buf| {
                    buf.put_u8(0); // big endian
                    buf.put_u8(*bit_depth as u8);
                });
            });
        }
        Codec::Opus { channel_count } => {
            write_box(buf, b"Opus", |buf| {
                write_audio_entry_header(buf, *channel_count, 16, 48_000);
                write_box(buf, b"dOps", |buf| {
                    buf.put_u8(0); // version
                    buf.put_u8(*channel_count as u8);
                    buf.put_u16(312); // pre-skip
                    buf.put_u32(48_000); // input sample rate
                    buf.put_u16(0); // output gain
                    buf.put_u8(0); // channel mapping family
                });
            });
        }
    }
}

const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

impl Part {
    pub fn marshal(&self) -> Bytes {
        // moof size is computed up front so each trun can carry the offset
        // of its track's payload inside the mdat
        let moof_size: usize = 8
            + 16
            + self
                .tracks
                .iter()
                .map(|t| 64 + 12 * t.samples.len())
                .sum::<usize>();

        let mdat_payload: usize = self
            .tracks
            .iter()
            .flat_map(|t| t.samples.iter())
            .map(|s| s.payload.len())
            .sum();

        let mut buf = BytesMut::with_capacity(moof_size + 8 + mdat_payload);

        write_box(&mut buf, b"moof", |buf| {
            write_full_box(buf, b"mfhd", 0, 0, |buf| {
                buf.put_u32(self.sequence_number);
            });

            let mut data_offset = moof_size + 8;
            for track in &self.tracks {
                write_box(buf, b"traf", |buf| {
                    // default-base-is-moof
                    write_full_box(buf, b"tfhd", 0, 0x0002_0000, |buf| {
                        buf.put_u32(track.id);
                    });
                    write_full_box(buf, b"tfdt", 1, 0, |buf| {
                        buf.put_u64(track.base_time);
                    });
                    // data offset + per-sample duration, size, flags
                    write_full_box(buf, b"trun", 0, 0x0701, |buf| {
                        buf.put_u32(track.samples.len() as u32);
                        buf.put_u32(data_offset as u32);
                        for sample in &track.samples {
                            buf.put_u32(sample.duration);
                            buf.put_u32(sample.payload.len() as u32);
                            buf.put_u32(if sample.is_non_sync {
                                SAMPLE_FLAGS_NON_SYNC
                            } else {
                                SAMPLE_FLAGS_SYNC
                            });
                        }
                    });
                });
                data_offset += track
                    .samples
                    .iter()
                    .map(|s| s.payload.len())
                    .sum::<usize>();
            }
        });

        write_box(&mut buf, b"mdat", |buf| {
            for track in &self.tracks {
                for sample in &track.samples {
                    buf.put_slice(&sample.payload);
                }
            }
        });

        buf.freeze()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use testparse::*;

    fn sample_init() -> Init {
        Init {
            tracks: vec![
                InitTrack {
                    id: 1,
                    time_scale: 90_000,
                    codec: Codec::H264 {
                        sps: Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0xD9]),
                        pps: Bytes::from_static(&[0x68, 0xCE, 0x38, 0x80]),
                    },
                },
                InitTrack {
                    id: 2,
                    time_scale: 44_100,
                    codec: Codec::Mpeg4Audio {
                        config: AacConfig {
                            object_type: 2,
                            sample_rate: 44_100,
                            channel_count: 2,
                        },
                    },
                },
                InitTrack {
                    id: 3,
                    time_scale: 8_000,
                    codec: Codec::Lpcm {
                        bit_depth: 16,
                        sample_rate: 8_000,
                        channel_count: 1,
                    },
                },
            ],
        }
    }

    #[test]
    fn test_init_round_trip() {
        let init = sample_init();
        let data = init.marshal();

        let tracks = init_tracks(&data);
        assert_eq!(
            tracks,
            vec![
                (1, 90_000, "avc1".to_string()),
                (2, 44_100, "mp4a".to_string()),
                (3, 8_000, "ipcm".to_string()),
            ]
        );
    }

    #[test]
    fn test_init_starts_with_ftyp() {
        let data = sample_init().marshal();
        assert_eq!(&data[4..8], b"ftyp");
    }

    #[test]
    fn test_part_offsets() {
        let part = Part {
            sequence_number: 1,
            tracks: vec![
                PartTrack {
                    id: 1,
                    base_time: 4500,
                    samples: vec![
                        PartSample {
                            duration: 3000,
                            is_non_sync: false,
                            payload: Bytes::from_static(&[1, 2, 3]),
                        },
                        PartSample {
                            duration: 3000,
                            is_non_sync: true,
                            payload: Bytes::from_static(&[4, 5]),
                        },
                    ],
                },
                PartTrack {
                    id: 2,
                    base_time: 0,
                    samples: vec![PartSample {
                        duration: 1024,
                        is_non_sync: false,
                        payload: Bytes::from_static(&[6]),
                    }],
                },
            ],
        };

        let data = part.marshal();
        let boxes = children(&data);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].0, b"moof");
        assert_eq!(boxes[1].0, b"mdat");

        // mdat holds every payload in track order
        assert_eq!(boxes[1].1, &[1, 2, 3, 4, 5, 6]);

        // base times survive
        let moof_size = boxes[0].1.len() + 8;
        assert_eq!(
            part_base_times(&data),
            vec![(1, 4500), (2, 0)]
        );

        // first track's trun points at the start of the mdat payload
        let traf = children_named(boxes[0].1, b"traf")[0];
        let trun = child(traf, b"trun").unwrap();
        let data_offset = u32::from_be_bytes(trun[8..12].try_into().unwrap());
        assert_eq!(data_offset as usize, moof_size + 8);
    }
}
