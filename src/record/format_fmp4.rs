//! Fragmented-MP4 segmenter
//!
//! Drives segment and part boundaries for one recorded stream. Boundaries
//! follow the leading track (the first video track, or track 0): a segment
//! opens on a random-access unit, switches when the elapsed PTS reaches the
//! segment duration and another random-access unit arrives; parts close on
//! the part duration alone.
//!
//! Negative DTS windows at session start are normalized: every base time is
//! offset by the minimum first PTS across tracks. The offset stays open to
//! late-starting tracks until the first part is serialized, then freezes,
//! so the earliest track starts at zero and inter-track alignment is kept.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::media::{Format, Payload, Unit};

use super::fmp4::{Codec, Init, InitTrack, Part, PartSample, PartTrack};
use super::path_format;
use super::{Segmenter, SegmenterParams, TrackDesc};

const NANOS_PER_SEC: i64 = 1_000_000_000;

fn to_scale(ns: i64, time_scale: u32) -> u64 {
    if ns <= 0 {
        return 0;
    }
    ((ns as i128 * time_scale as i128) / NANOS_PER_SEC as i128) as u64
}

fn duration_to_scale(ns: i64, time_scale: u32) -> u32 {
    to_scale(ns, time_scale) as u32
}

// G.711 decoding, ITU-T reference behavior

fn mulaw_to_linear(v: u8) -> i16 {
    let u = !v;
    let mut t = ((i32::from(u) & 0x0F) << 3) + 0x84;
    t <<= (i32::from(u) & 0x70) >> 4;
    (if u & 0x80 != 0 { 0x84 - t } else { t - 0x84 }) as i16
}

fn alaw_to_linear(v: u8) -> i16 {
    let a = v ^ 0x55;
    let mut t = (i32::from(a) & 0x0F) << 4;
    let seg = (i32::from(a) & 0x70) >> 4;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    (if a & 0x80 != 0 { t } else { -t }) as i16
}

fn decode_g711(samples: &[u8], mulaw: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        let linear = if mulaw {
            mulaw_to_linear(s)
        } else {
            alaw_to_linear(s)
        };
        out.put_i16(linear);
    }
    out.freeze()
}

/// NAL units are stored length-prefixed inside mp4 samples.
fn avcc_payload(nalus: &[Bytes]) -> Bytes {
    let total: usize = nalus.iter().map(|n| 4 + n.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for n in nalus {
        out.put_u32(n.len() as u32);
        out.put_slice(n);
    }
    out.freeze()
}

struct QueuedSample {
    pts: i64,
    is_non_sync: bool,
    payload: Bytes,
}

struct TrackState {
    id: u32,
    format: Format,
    time_scale: u32,
    queued: Option<QueuedSample>,
    /// PTS of the first unit accepted for writing; feeds the base-time
    /// shift until that freezes.
    first_pts: Option<i64>,
    last_duration: i64,
}

impl TrackState {
    fn codec(&self) -> Codec {
        match &self.format {
            Format::H264 { sps, pps, .. } => Codec::H264 {
                sps: sps.clone().unwrap_or_default(),
                pps: pps.clone().unwrap_or_default(),
            },
            Format::H265 { vps, sps, pps, .. } => Codec::H265 {
                vps: vps.clone().unwrap_or_default(),
                sps: sps.clone().unwrap_or_default(),
                pps: pps.clone().unwrap_or_default(),
            },
            Format::Mpeg4Audio { config, .. } => Codec::Mpeg4Audio {
                config: config.clone(),
            },
            Format::G711 {
                sample_rate,
                channel_count,
                ..
            } => Codec::Lpcm {
                bit_depth: 16,
                sample_rate: *sample_rate,
                channel_count: *channel_count,
            },
            Format::Lpcm {
                bit_depth,
                sample_rate,
                channel_count,
                ..
            } => Codec::Lpcm {
                bit_depth: *bit_depth,
                sample_rate: *sample_rate,
                channel_count: *channel_count,
            },
            Format::Opus { channel_count, .. } => Codec::Opus {
                channel_count: *channel_count,
            },
        }
    }

    /// Pick up in-band parameter sets before the init is emitted.
    fn learn_params(&mut self, unit: &Unit) {
        let Payload::VideoAccessUnit(nalus) = &unit.payload else {
            return;
        };
        match &mut self.format {
            Format::H264 { sps, pps, .. } => {
                let (new_sps, new_pps) = crate::media::h264_inband_params(nalus);
                if new_sps.is_some() {
                    *sps = new_sps;
                }
                if new_pps.is_some() {
                    *pps = new_pps;
                }
            }
            Format::H265 { vps, sps, pps, .. } => {
                let (new_vps, new_sps, new_pps) = crate::media::h265_inband_params(nalus);
                if new_vps.is_some() {
                    *vps = new_vps;
                }
                if new_sps.is_some() {
                    *sps = new_sps;
                }
                if new_pps.is_some() {
                    *pps = new_pps;
                }
            }
            _ => {}
        }
    }

    fn convert_payload(&self, payload: &Payload) -> Bytes {
        match (payload, &self.format) {
            (Payload::VideoAccessUnit(nalus), _) => avcc_payload(nalus),
            (Payload::AudioAccessUnits(aus), _) => {
                let mut out = BytesMut::new();
                for au in aus {
                    out.put_slice(au);
                }
                out.freeze()
            }
            (Payload::Samples(s), Format::G711 { mulaw, .. }) => decode_g711(s, *mulaw),
            (Payload::Samples(s), _) => s.clone(),
        }
    }
}

struct PartBuf {
    /// PTS of the first buffered sample; turned into a base time only when
    /// the part is serialized.
    first_pts: Option<i64>,
    samples: Vec<PartSample>,
}

struct OpenSegment {
    file: fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    start_pts: i64,
    part_start_pts: i64,
    parts: Vec<PartBuf>,
}

pub(crate) struct Fmp4Segmenter {
    params: SegmenterParams,
    tracks: Vec<TrackState>,
    leading: usize,
    start_dts: Option<i64>,
    sequence_number: u32,
    current: Option<OpenSegment>,
}

impl Fmp4Segmenter {
    pub(crate) fn new(params: SegmenterParams, descs: &[TrackDesc]) -> Self {
        let tracks: Vec<TrackState> = descs
            .iter()
            .enumerate()
            .map(|(i, d)| TrackState {
                id: i as u32 + 1,
                format: d.format.clone(),
                time_scale: d.format.clock_rate(),
                queued: None,
                first_pts: None,
                last_duration: 0,
            })
            .collect();

        let leading = tracks
            .iter()
            .position(|t| t.format.is_video())
            .unwrap_or(0);

        Self {
            params,
            tracks,
            leading,
            start_dts: None,
            sequence_number: 0,
            current: None,
        }
    }

    fn build_init(&self) -> Init {
        Init {
            tracks: self
                .tracks
                .iter()
                .map(|t| InitTrack {
                    id: t.id,
                    time_scale: t.time_scale,
                    codec: t.codec(),
                })
                .collect(),
        }
    }

    fn open_segment(&mut self, start_pts: i64, ntp: Option<DateTime<Utc>>) -> Result<()> {
        let start = ntp.unwrap_or_else(Utc::now);
        let base = path_format::encode(&self.params.path_format, &self.params.path_name, start);
        let final_path = PathBuf::from(format!("{}.mp4", base));
        let tmp_path = PathBuf::from(format!("{}.mp4.tmp", base));

        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir)?;
        }

        // announced before any byte exists on disk
        tracing::debug!(path = %final_path.display(), "creating segment");
        self.params.segment_created(&final_path);

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&self.build_init().marshal())?;

        self.current = Some(OpenSegment {
            file,
            tmp_path,
            final_path,
            start_pts,
            part_start_pts: start_pts,
            parts: self
                .tracks
                .iter()
                .map(|_| PartBuf {
                    first_pts: None,
                    samples: Vec::new(),
                })
                .collect(),
        });
        Ok(())
    }

    fn flush_part(&mut self) -> Result<()> {
        let has_samples = self
            .current
            .as_ref()
            .is_some_and(|seg| seg.parts.iter().any(|p| !p.samples.is_empty()));
        if !has_samples {
            return Ok(());
        }

        // the shift freezes the moment base times first reach the file;
        // until then every track that has queued a sample can still lower it
        if self.start_dts.is_none() {
            self.start_dts = Some(
                self.tracks
                    .iter()
                    .filter_map(|t| t.first_pts)
                    .min()
                    .unwrap_or(0),
            );
        }
        let start_dts = self.start_dts.unwrap_or(0);

        self.sequence_number += 1;
        let sequence_number = self.sequence_number;
        let tracks = &self.tracks;
        let seg = self.current.as_mut().expect("segment is open");

        let part = Part {
            sequence_number,
            tracks: tracks
                .iter()
                .zip(seg.parts.iter_mut())
                .filter(|(_, p)| !p.samples.is_empty())
                .map(|(t, p)| PartTrack {
                    id: t.id,
                    base_time: to_scale(
                        p.first_pts.take().unwrap_or(start_dts) - start_dts,
                        t.time_scale,
                    ),
                    samples: std::mem::take(&mut p.samples),
                })
                .collect(),
        };

        seg.file.write_all(&part.marshal())?;
        Ok(())
    }

    fn close_segment(&mut self) -> Result<()> {
        self.flush_part()?;

        if let Some(mut seg) = self.current.take() {
            seg.file.flush()?;
            drop(seg.file);
            fs::rename(&seg.tmp_path, &seg.final_path)?;
            tracing::debug!(path = %seg.final_path.display(), "closing segment");
            self.params.segment_completed(&seg.final_path);
        }
        Ok(())
    }

    /// Move a resolved sample into the open part buffer.
    fn append_sample(&mut self, track_idx: usize, sample: QueuedSample, duration: i64) {
        let time_scale = self.tracks[track_idx].time_scale;

        let Some(seg) = &mut self.current else {
            return;
        };

        let part = &mut seg.parts[track_idx];
        if part.first_pts.is_none() {
            part.first_pts = Some(sample.pts);
        }
        part.samples.push(PartSample {
            duration: duration_to_scale(duration, time_scale),
            is_non_sync: sample.is_non_sync,
            payload: sample.payload,
        });
    }

    /// Flush the queued sample of one track, using `until` as its end time.
    fn flush_queued(&mut self, track_idx: usize, until: i64) {
        if let Some(queued) = self.tracks[track_idx].queued.take() {
            let duration = (until - queued.pts).max(0);
            self.tracks[track_idx].last_duration = duration;
            self.append_sample(track_idx, queued, duration);
        }
    }
}

impl Segmenter for Fmp4Segmenter {
    fn write_unit(&mut self, track_idx: usize, unit: &Unit) -> Result<()> {
        if track_idx >= self.tracks.len() {
            return Ok(());
        }

        self.tracks[track_idx].learn_params(unit);

        let random_access = unit.is_random_access(&self.tracks[track_idx].format);
        let payload = self.tracks[track_idx].convert_payload(&unit.payload);

        if let Some(queued) = &self.tracks[track_idx].queued {
            if unit.pts < queued.pts {
                return Err(Error::Write(format!(
                    "sample duration of track {} is negative",
                    self.tracks[track_idx].id
                )));
            }
        }

        // segment boundaries follow the leading track
        if track_idx == self.leading && random_access {
            let elapsed = self
                .current
                .as_ref()
                .map(|seg| unit.pts - seg.start_pts);
            match elapsed {
                None => {
                    self.open_segment(unit.pts, unit.ntp)?;
                }
                Some(elapsed) if elapsed >= self.params.segment_duration_ns() => {
                    for i in 0..self.tracks.len() {
                        self.flush_queued(i, unit.pts);
                    }
                    self.close_segment()?;
                    self.open_segment(unit.pts, unit.ntp)?;
                }
                Some(_) => {}
            }
        }

        // units arriving before any segment is open are discarded
        if self.current.is_none() {
            return Ok(());
        }

        self.flush_queued(track_idx, unit.pts);

        if self.tracks[track_idx].first_pts.is_none() {
            self.tracks[track_idx].first_pts = Some(unit.pts);
        }
        self.tracks[track_idx].queued = Some(QueuedSample {
            pts: unit.pts,
            is_non_sync: !random_access,
            payload,
        });

        // part boundary, independent of random access
        let part_elapsed = self
            .current
            .as_ref()
            .is_some_and(|seg| unit.pts - seg.part_start_pts >= self.params.part_duration_ns());
        if part_elapsed {
            self.flush_part()?;
            if let Some(seg) = &mut self.current {
                seg.part_start_pts = unit.pts;
            }
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for i in 0..self.tracks.len() {
            if let Some(queued) = self.tracks[i].queued.take() {
                let duration = self.tracks[i].last_duration;
                self.append_sample(i, queued, duration);
            }
        }
        self.close_segment()
    }
}
