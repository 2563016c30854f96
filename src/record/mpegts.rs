//! MPEG-TS segmenter
//!
//! Writes segments made of 188-byte transport packets: PAT and PMT at the
//! start of every segment, then one PES packet per unit. Unlike the fmp4
//! segmenter no sample durations are needed, so units are written as they
//! arrive; parts only control how often the in-memory buffer reaches the
//! file.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::media::{Format, Payload, Unit};

use super::path_format;
use super::{Segmenter, SegmenterParams, TrackDesc};

const TS_PACKET_SIZE: usize = 188;
const PMT_PID: u16 = 0x1000;
const FIRST_ES_PID: u16 = 256;

const NANOS_PER_SEC: i64 = 1_000_000_000;

fn pts_90khz(pts: i64) -> u64 {
    if pts <= 0 {
        return 0;
    }
    (((pts as i128) * 90_000) / NANOS_PER_SEC as i128) as u64 & 0x1_FFFF_FFFF
}

/// CRC-32/MPEG-2 over PSI sections.
fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn stream_type(format: &Format) -> u8 {
    match format {
        Format::H264 { .. } => 0x1B,
        Format::H265 { .. } => 0x24,
        Format::Mpeg4Audio { .. } => 0x0F,
        // private data for codecs without a registered type
        Format::G711 { .. } | Format::Lpcm { .. } | Format::Opus { .. } => 0x06,
    }
}

fn pes_stream_id(format: &Format) -> u8 {
    match format {
        Format::H264 { .. } | Format::H265 { .. } => 0xE0,
        Format::Mpeg4Audio { .. } => 0xC0,
        _ => 0xBD,
    }
}

fn adts_header(config: &crate::media::AacConfig, aac_len: usize) -> [u8; 7] {
    const RATES: [u32; 13] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
    ];
    let sf_index = RATES
        .iter()
        .position(|&r| r == config.sample_rate)
        .unwrap_or(4) as u8;
    let profile = config.object_type.saturating_sub(1) & 0x03;
    let channels = config.channel_count as u8 & 0x07;
    let frame_len = (aac_len + 7) as u16;

    [
        0xFF,
        0xF1,
        (profile << 6) | (sf_index << 2) | (channels >> 2),
        ((channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
        (frame_len >> 3) as u8,
        (((frame_len & 0x07) as u8) << 5) | 0x1F,
        0xFC,
    ]
}

struct TrackState {
    pid: u16,
    format: Format,
    continuity: u8,
    last_pts: Option<i64>,
}

struct OpenSegment {
    file: fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    start_pts: i64,
    part_start_pts: i64,
    buf: BytesMut,
}

pub(crate) struct MpegtsSegmenter {
    params: SegmenterParams,
    tracks: Vec<TrackState>,
    leading: usize,
    pat_continuity: u8,
    pmt_continuity: u8,
    current: Option<OpenSegment>,
}

impl MpegtsSegmenter {
    pub(crate) fn new(params: SegmenterParams, descs: &[TrackDesc]) -> Self {
        let tracks: Vec<TrackState> = descs
            .iter()
            .enumerate()
            .map(|(i, d)| TrackState {
                pid: FIRST_ES_PID + i as u16,
                format: d.format.clone(),
                continuity: 0,
                last_pts: None,
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
            pat_continuity: 0,
            pmt_continuity: 0,
            current: None,
        }
    }

    fn write_section(buf: &mut BytesMut, pid: u16, continuity: &mut u8, section: &[u8]) {
        let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
        packet.put_u8(0x47);
        packet.put_u8(0x40 | ((pid >> 8) as u8 & 0x1F));
        packet.put_u8(pid as u8);
        packet.put_u8(0x10 | (*continuity & 0x0F));
        *continuity = continuity.wrapping_add(1);
        packet.put_u8(0); // pointer field
        packet.put_slice(section);
        packet.resize(TS_PACKET_SIZE, 0xFF);
        buf.put_slice(&packet);
    }

    fn pat_section(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0x00); // table id
        let section_length = 5 + 4 + 4; // fixed part + one program + CRC
        body.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
        body.push(section_length as u8);
        body.extend_from_slice(&1u16.to_be_bytes()); // transport stream id
        body.push(0xC1); // version 0, current
        body.push(0); // section number
        body.push(0); // last section number
        body.extend_from_slice(&1u16.to_be_bytes()); // program number
        body.push(0xE0 | ((PMT_PID >> 8) as u8 & 0x1F));
        body.push(PMT_PID as u8);
        let crc = crc32_mpeg(&body);
        body.extend_from_slice(&crc.to_be_bytes());
        body
    }

    fn pmt_section(&self) -> Vec<u8> {
        let pcr_pid = self.tracks[self.leading].pid;

        let mut body = Vec::new();
        body.push(0x02); // table id
        let section_length = 9 + self.tracks.len() * 5 + 4;
        body.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
        body.push(section_length as u8);
        body.extend_from_slice(&1u16.to_be_bytes()); // program number
        body.push(0xC1);
        body.push(0);
        body.push(0);
        body.push(0xE0 | ((pcr_pid >> 8) as u8 & 0x1F));
        body.push(pcr_pid as u8);
        body.push(0xF0); // program info length
        body.push(0x00);
        for track in &self.tracks {
            body.push(stream_type(&track.format));
            body.push(0xE0 | ((track.pid >> 8) as u8 & 0x1F));
            body.push(track.pid as u8);
            body.push(0xF0); // ES info length
            body.push(0x00);
        }
        let crc = crc32_mpeg(&body);
        body.extend_from_slice(&crc.to_be_bytes());
        body
    }

    fn open_segment(&mut self, start_pts: i64, ntp: Option<DateTime<Utc>>) -> Result<()> {
        let start = ntp.unwrap_or_else(Utc::now);
        let base = path_format::encode(&self.params.path_format, &self.params.path_name, start);
        let final_path = PathBuf::from(format!("{}.ts", base));
        let tmp_path = PathBuf::from(format!("{}.ts.tmp", base));

        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir)?;
        }

        // announced before any byte exists on disk
        tracing::debug!(path = %final_path.display(), "creating segment");
        self.params.segment_created(&final_path);

        let file = fs::File::create(&tmp_path)?;

        let mut buf = BytesMut::new();
        let pat = self.pat_section();
        let pmt = self.pmt_section();
        Self::write_section(&mut buf, 0, &mut self.pat_continuity, &pat);
        Self::write_section(&mut buf, PMT_PID, &mut self.pmt_continuity, &pmt);

        self.current = Some(OpenSegment {
            file,
            tmp_path,
            final_path,
            start_pts,
            part_start_pts: start_pts,
            buf,
        });
        Ok(())
    }

    fn flush_buf(&mut self) -> Result<()> {
        if let Some(seg) = &mut self.current {
            if !seg.buf.is_empty() {
                seg.file.write_all(&seg.buf)?;
                seg.buf.clear();
            }
        }
        Ok(())
    }

    fn close_segment(&mut self) -> Result<()> {
        self.flush_buf()?;
        if let Some(mut seg) = self.current.take() {
            seg.file.flush()?;
            drop(seg.file);
            fs::rename(&seg.tmp_path, &seg.final_path)?;
            tracing::debug!(path = %seg.final_path.display(), "closing segment");
            self.params.segment_completed(&seg.final_path);
        }
        Ok(())
    }

    fn es_payload(format: &Format, payload: &Payload) -> Bytes {
        match (payload, format) {
            (Payload::VideoAccessUnit(nalus), _) => {
                let mut out = BytesMut::new();
                for n in nalus {
                    out.put_slice(&[0, 0, 0, 1]);
                    out.put_slice(n);
                }
                out.freeze()
            }
            (Payload::AudioAccessUnits(aus), Format::Mpeg4Audio { config, .. }) => {
                let mut out = BytesMut::new();
                for au in aus {
                    out.put_slice(&adts_header(config, au.len()));
                    out.put_slice(au);
                }
                out.freeze()
            }
            (Payload::AudioAccessUnits(aus), _) => {
                let mut out = BytesMut::new();
                for au in aus {
                    out.put_slice(au);
                }
                out.freeze()
            }
            (Payload::Samples(s), _) => s.clone(),
        }
    }

    fn write_pes(&mut self, track_idx: usize, pts: i64, es: &[u8], with_pcr: bool) {
        let stream_id = pes_stream_id(&self.tracks[track_idx].format);
        let pid = self.tracks[track_idx].pid;
        let ts = pts_90khz(pts);

        let mut pes = BytesMut::with_capacity(es.len() + 14);
        pes.put_slice(&[0x00, 0x00, 0x01, stream_id]);
        let body_len = 3 + 5 + es.len();
        if body_len <= u16::MAX as usize && stream_id != 0xE0 {
            pes.put_u16(body_len as u16);
        } else {
            pes.put_u16(0);
        }
        pes.put_u8(0x80);
        pes.put_u8(0x80); // PTS only
        pes.put_u8(5);
        pes.put_u8(0x21 | (((ts >> 29) as u8) & 0x0E));
        pes.put_u16((((ts >> 14) as u16) & 0xFFFE) | 1);
        pes.put_u16((((ts << 1) as u16) & 0xFFFE) | 1);
        pes.put_slice(es);

        let Some(seg) = &mut self.current else { return };

        let mut remaining = &pes[..];
        let mut first = true;
        while !remaining.is_empty() {
            let continuity = self.tracks[track_idx].continuity;
            self.tracks[track_idx].continuity = continuity.wrapping_add(1);

            let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
            packet.put_u8(0x47);
            packet.put_u8(if first { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F));
            packet.put_u8(pid as u8);

            let pcr_here = first && with_pcr;
            let mut payload_space = TS_PACKET_SIZE - 4;
            if pcr_here {
                payload_space -= 8;
            }

            if remaining.len() >= payload_space && !pcr_here {
                packet.put_u8(0x10 | (continuity & 0x0F));
                packet.put_slice(&remaining[..payload_space]);
                remaining = &remaining[payload_space..];
            } else {
                // adaptation field for PCR and/or stuffing
                packet.put_u8(0x30 | (continuity & 0x0F));
                let chunk = remaining.len().min(payload_space);
                let af_len = TS_PACKET_SIZE - 4 - 1 - chunk;
                packet.put_u8(af_len as u8);
                if af_len > 0 {
                    let mut af = BytesMut::with_capacity(af_len);
                    af.put_u8(if pcr_here { 0x10 } else { 0x00 });
                    if pcr_here {
                        let pcr_base = ts;
                        af.put_u8((pcr_base >> 25) as u8);
                        af.put_u8((pcr_base >> 17) as u8);
                        af.put_u8((pcr_base >> 9) as u8);
                        af.put_u8((pcr_base >> 1) as u8);
                        af.put_u8((((pcr_base & 1) as u8) << 7) | 0x7E);
                        af.put_u8(0);
                    }
                    af.resize(af_len, 0xFF);
                    packet.put_slice(&af);
                }
                packet.put_slice(&remaining[..chunk]);
                remaining = &remaining[chunk..];
            }

            debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
            seg.buf.put_slice(&packet);
            first = false;
        }
    }
}

impl Segmenter for MpegtsSegmenter {
    fn write_unit(&mut self, track_idx: usize, unit: &Unit) -> Result<()> {
        if track_idx >= self.tracks.len() {
            return Ok(());
        }

        if let Some(last) = self.tracks[track_idx].last_pts {
            if unit.pts < last {
                return Err(Error::Write(format!(
                    "PTS of track {} is moving backwards",
                    track_idx + 1
                )));
            }
        }
        self.tracks[track_idx].last_pts = Some(unit.pts);

        let random_access = unit.is_random_access(&self.tracks[track_idx].format);

        if track_idx == self.leading && random_access {
            let elapsed = self.current.as_ref().map(|seg| unit.pts - seg.start_pts);
            match elapsed {
                None => self.open_segment(unit.pts, unit.ntp)?,
                Some(elapsed) if elapsed >= self.params.segment_duration_ns() => {
                    self.close_segment()?;
                    self.open_segment(unit.pts, unit.ntp)?;
                }
                Some(_) => {}
            }
        }

        if self.current.is_none() {
            return Ok(());
        }

        let es = Self::es_payload(&self.tracks[track_idx].format, &unit.payload);
        let with_pcr = track_idx == self.leading;
        self.write_pes(track_idx, unit.pts, &es, with_pcr);

        let part_elapsed = self
            .current
            .as_ref()
            .is_some_and(|seg| unit.pts - seg.part_start_pts >= self.params.part_duration_ns());
        if part_elapsed {
            self.flush_buf()?;
            if let Some(seg) = &mut self.current {
                seg.part_start_pts = unit.pts;
            }
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.close_segment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_mpeg_known_value() {
        // CRC-32/MPEG-2 of "123456789"
        assert_eq!(crc32_mpeg(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_stream_types() {
        assert_eq!(stream_type(&Format::h264(96)), 0x1B);
        assert_eq!(stream_type(&Format::h265(96)), 0x24);
        assert_eq!(
            stream_type(&Format::G711 {
                mulaw: true,
                sample_rate: 8000,
                channel_count: 1
            }),
            0x06
        );
    }

    #[test]
    fn test_adts_header_len_field() {
        let config = crate::media::AacConfig {
            object_type: 2,
            sample_rate: 44100,
            channel_count: 2,
        };
        let hdr = adts_header(&config, 100);
        assert_eq!(hdr[0], 0xFF);
        // frame length = 107 spread over bytes 3..6
        let len = ((u16::from(hdr[3] & 0x03)) << 11)
            | (u16::from(hdr[4]) << 3)
            | (u16::from(hdr[5]) >> 5);
        assert_eq!(len, 107);
    }

    #[test]
    fn test_pts_90khz() {
        assert_eq!(pts_90khz(NANOS_PER_SEC), 90_000);
        assert_eq!(pts_90khz(-5), 0);
    }
}
