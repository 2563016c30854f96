//! Recording
//!
//! The agent subscribes to every format of a stream through one async
//! writer and feeds a format-specific segmenter that emits segmented files.
//! A write error tears the segmenter down; after a pause the agent builds a
//! fresh one and resubscribes, finalizing the interrupted segment first.

mod cleaner;
mod fmp4;
mod format_fmp4;
mod mpegts;
mod path_format;

pub use cleaner::Cleaner;
pub use fmp4::{Codec, Init, InitTrack, Part, PartSample, PartTrack};
pub use path_format::encode as encode_path;

use std::path::Path as FsPath;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::asyncwriter::AsyncWriter;
use crate::conf::RecordFormat;
use crate::error::Result;
use crate::media::{Format, Unit};
use crate::stream::Stream;

use format_fmp4::Fmp4Segmenter;
use mpegts::MpegtsSegmenter;

static NEXT_RECORDER_ID: AtomicU64 = AtomicU64::new(1 << 33);

/// Called with the segment's final file name.
pub type SegmentHook = Arc<dyn Fn(&str) + Send + Sync>;

/// One recorded track, flattened from the stream description.
pub(crate) struct TrackDesc {
    pub media_idx: usize,
    pub format_idx: usize,
    pub format: Format,
}

/// Shared knobs of both segmenters.
pub(crate) struct SegmenterParams {
    pub path_format: String,
    pub path_name: String,
    pub part_duration: Duration,
    pub segment_duration: Duration,
    pub on_segment_create: Option<SegmentHook>,
    pub on_segment_complete: Option<SegmentHook>,
}

impl SegmenterParams {
    fn part_duration_ns(&self) -> i64 {
        self.part_duration.as_nanos().min(i64::MAX as u128) as i64
    }

    fn segment_duration_ns(&self) -> i64 {
        self.segment_duration.as_nanos().min(i64::MAX as u128) as i64
    }

    fn segment_created(&self, path: &FsPath) {
        if let Some(hook) = &self.on_segment_create {
            hook(&path.to_string_lossy());
        }
    }

    fn segment_completed(&self, path: &FsPath) {
        if let Some(hook) = &self.on_segment_complete {
            hook(&path.to_string_lossy());
        }
    }
}

/// Format-specific segment writer, driven from the async writer's worker.
pub(crate) trait Segmenter: Send {
    fn write_unit(&mut self, track_idx: usize, unit: &Unit) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Recorder configuration.
#[derive(Clone)]
pub struct AgentConfig {
    pub path_format: String,
    pub format: RecordFormat,
    pub part_duration: Duration,
    pub segment_duration: Duration,
    pub path_name: String,
    pub write_queue_size: usize,
    pub restart_pause: Duration,
    pub on_segment_create: Option<SegmentHook>,
    pub on_segment_complete: Option<SegmentHook>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            path_format: "./recordings/%path/%Y-%m-%d_%H-%M-%S-%f".into(),
            format: RecordFormat::Fmp4,
            part_duration: Duration::from_secs(1),
            segment_duration: Duration::from_secs(3600),
            path_name: String::new(),
            write_queue_size: 1024,
            restart_pause: Duration::from_secs(2),
            on_segment_create: None,
            on_segment_complete: None,
        }
    }
}

/// Recorder agent: one per recorded path while it is ready.
pub struct Agent {
    token: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Subscribe to the stream and start recording. The subscription is in
    /// place when this returns; units written afterwards are captured.
    pub fn spawn(config: AgentConfig, stream: Arc<Stream>) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();

        let reader_id = NEXT_RECORDER_ID.fetch_add(1, Ordering::Relaxed);
        let (segmenter, writer) = subscribe(&config, &stream, reader_id);

        let join = tokio::spawn(async move {
            run(config, stream, task_token, reader_id, segmenter, writer).await;
        });

        Self {
            token,
            join: Mutex::new(Some(join)),
        }
    }

    /// Stop recording; the open segment is finalized in the background.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Stop recording and wait until the open segment has been finalized.
    pub async fn close_and_wait(self) {
        self.token.cancel();
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

fn build_segmenter(config: &AgentConfig, descs: &[TrackDesc]) -> Box<dyn Segmenter> {
    let params = SegmenterParams {
        path_format: config.path_format.clone(),
        path_name: config.path_name.clone(),
        part_duration: config.part_duration,
        segment_duration: config.segment_duration,
        on_segment_create: config.on_segment_create.clone(),
        on_segment_complete: config.on_segment_complete.clone(),
    };

    match config.format {
        RecordFormat::Fmp4 => Box::new(Fmp4Segmenter::new(params, descs)),
        RecordFormat::MpegTs => Box::new(MpegtsSegmenter::new(params, descs)),
    }
}

/// Build a segmenter for the stream's current formats and register the
/// recorder as a reader of every one of them.
fn subscribe(
    config: &AgentConfig,
    stream: &Arc<Stream>,
    reader_id: u64,
) -> (Arc<Mutex<Box<dyn Segmenter>>>, AsyncWriter) {
    let descs: Vec<TrackDesc> = stream
        .formats()
        .map(|((media_idx, format_idx), sf)| TrackDesc {
            media_idx,
            format_idx,
            format: sf.format().clone(),
        })
        .collect();

    let segmenter: Arc<Mutex<Box<dyn Segmenter>>> =
        Arc::new(Mutex::new(build_segmenter(config, &descs)));

    let mut writer = AsyncWriter::new(config.write_queue_size);
    let handle = writer.handle();

    for (track_idx, desc) in descs.iter().enumerate() {
        let segmenter = Arc::clone(&segmenter);
        let handle = handle.clone();
        stream.add_reader(
            reader_id,
            desc.media_idx,
            desc.format_idx,
            Arc::new(move |unit: Arc<Unit>| {
                let segmenter = Arc::clone(&segmenter);
                handle.push(Box::new(move || {
                    segmenter.lock().unwrap().write_unit(track_idx, &unit)
                }));
            }),
        );
    }

    writer.start();
    (segmenter, writer)
}

async fn run(
    config: AgentConfig,
    stream: Arc<Stream>,
    token: CancellationToken,
    reader_id: u64,
    mut segmenter: Arc<Mutex<Box<dyn Segmenter>>>,
    mut writer: AsyncWriter,
) {
    tracing::info!(path = %config.path_name, "recording started");

    loop {
        let err = tokio::select! {
            _ = token.cancelled() => None,
            err = writer.error() => Some(err),
        };

        stream.remove_reader(reader_id);
        writer.stop().await;

        if let Err(close_err) = segmenter.lock().unwrap().close() {
            tracing::warn!(error = %close_err, "error while finalizing segment");
        }

        match err {
            None => break,
            Some(err) => {
                tracing::warn!(error = %err, "recording error, restarting");
                tokio::select! {
                    _ = tokio::time::sleep(config.restart_pause) => {}
                    _ = token.cancelled() => break,
                }
                (segmenter, writer) = subscribe(&config, &stream, reader_id);
            }
        }
    }

    tracing::info!(path = %config.path_name, "recording stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AacConfig, Description, Media, MediaType, Payload};
    use bytes::Bytes;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    const NANOS_PER_SEC: i64 = 1_000_000_000;

    const SPS: &[u8] = &[
        0x67, 0x64, 0x00, 0x2A, 0xAC, 0x2B, 0x40, 0x3C, 0x01, 0x13, 0xF2, 0xCD,
    ];
    const PPS: &[u8] = &[0x68, 0xEE, 0x3C, 0xB0];
    const VPS: &[u8] = &[0x40, 0x01, 0x0C, 0x01, 0xFF, 0xFF, 0x01, 0x60];
    const H265_SPS: &[u8] = &[0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03];
    const H265_PPS: &[u8] = &[0x44, 0x01, 0xC1, 0x72, 0xB4, 0x62, 0x40];

    fn five_track_description() -> Description {
        Description::new(vec![
            Media::new(
                MediaType::Video,
                vec![Format::H264 {
                    payload_type: 96,
                    sps: Some(Bytes::from_static(SPS)),
                    pps: Some(Bytes::from_static(PPS)),
                }],
            ),
            Media::new(
                MediaType::Video,
                vec![Format::H265 {
                    payload_type: 96,
                    vps: Some(Bytes::from_static(VPS)),
                    sps: Some(Bytes::from_static(H265_SPS)),
                    pps: Some(Bytes::from_static(H265_PPS)),
                }],
            ),
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
            Media::new(
                MediaType::Audio,
                vec![Format::G711 {
                    mulaw: false,
                    sample_rate: 8000,
                    channel_count: 1,
                }],
            ),
            Media::new(
                MediaType::Audio,
                vec![Format::Lpcm {
                    payload_type: 96,
                    bit_depth: 16,
                    sample_rate: 44100,
                    channel_count: 2,
                }],
            ),
        ])
    }

    fn write_batch(stream: &Stream, ntp: DateTime<Utc>) {
        for i in 0..3i64 {
            let pts = (50 + i) * NANOS_PER_SEC;

            stream.write_unit(
                0,
                0,
                Unit::new(
                    pts,
                    Some(ntp + chrono::Duration::seconds(i * 60)),
                    Payload::VideoAccessUnit(vec![
                        Bytes::from_static(SPS),
                        Bytes::from_static(PPS),
                        Bytes::from_static(&[0x65, 0x88]),
                    ]),
                ),
            );

            stream.write_unit(
                1,
                0,
                Unit::new(
                    pts,
                    None,
                    Payload::VideoAccessUnit(vec![
                        Bytes::from_static(VPS),
                        Bytes::from_static(H265_SPS),
                        Bytes::from_static(H265_PPS),
                        // CRA_NUT
                        Bytes::from_static(&[21 << 1, 0x00]),
                    ]),
                ),
            );

            stream.write_unit(
                2,
                0,
                Unit::new(
                    pts,
                    None,
                    Payload::AudioAccessUnits(vec![Bytes::from_static(&[1, 2, 3, 4])]),
                ),
            );

            stream.write_unit(
                3,
                0,
                Unit::new(pts, None, Payload::Samples(Bytes::from_static(&[1, 2, 3, 4]))),
            );

            stream.write_unit(
                4,
                0,
                Unit::new(pts, None, Payload::Samples(Bytes::from_static(&[1, 2, 3, 4]))),
            );
        }
    }

    async fn wait_for(counter: &AtomicUsize, at_least: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < at_least {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for segments");
    }

    async fn run_agent_test(format: RecordFormat) {
        let stream = Stream::new(1460, five_track_description(), true).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ext = format.extension();

        let created = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let created2 = Arc::clone(&created);
        let completed2 = Arc::clone(&completed);

        let agent = Agent::spawn(
            AgentConfig {
                path_format: format!(
                    "{}/%path/%Y-%m-%d_%H-%M-%S-%f",
                    dir.path().display()
                ),
                format,
                part_duration: Duration::from_millis(100),
                segment_duration: Duration::from_secs(1),
                path_name: "mypath".into(),
                write_queue_size: 1024,
                restart_pause: Duration::from_millis(1),
                on_segment_create: Some(Arc::new(move |_| {
                    created2.fetch_add(1, Ordering::SeqCst);
                })),
                on_segment_complete: Some(Arc::new(move |_| {
                    completed2.fetch_add(1, Ordering::SeqCst);
                })),
            },
            Arc::clone(&stream),
        );

        write_batch(&stream, Utc.with_ymd_and_hms(2008, 5, 20, 22, 15, 25).unwrap());

        // PTS moving backwards triggers a write error and a restart
        stream.write_unit(
            0,
            0,
            Unit::new(
                0,
                None,
                Payload::VideoAccessUnit(vec![Bytes::from_static(&[0x65, 0x88])]),
            ),
        );

        wait_for(&created, 2).await;
        wait_for(&completed, 2).await;

        let first = dir
            .path()
            .join("mypath")
            .join(format!("2008-05-20_22-15-25-000000.{}", ext));
        let second = dir
            .path()
            .join("mypath")
            .join(format!("2008-05-20_22-16-25-000000.{}", ext));
        assert!(first.exists(), "missing {}", first.display());
        assert!(second.exists(), "missing {}", second.display());

        if format == RecordFormat::Fmp4 {
            let data = std::fs::read(&first).unwrap();
            let tracks = fmp4::testparse::init_tracks(&data);
            assert_eq!(
                tracks,
                vec![
                    (1, 90_000, "avc1".to_string()),
                    (2, 90_000, "hvc1".to_string()),
                    (3, 44_100, "mp4a".to_string()),
                    (4, 8_000, "ipcm".to_string()),
                    (5, 44_100, "ipcm".to_string()),
                ]
            );
        }

        // let the restart happen, then record a second session
        tokio::time::sleep(Duration::from_millis(50)).await;
        write_batch(&stream, Utc.with_ymd_and_hms(2010, 5, 20, 22, 15, 25).unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        agent.close_and_wait().await;

        for name in [
            format!("2010-05-20_22-15-25-000000.{}", ext),
            format!("2010-05-20_22-16-25-000000.{}", ext),
        ] {
            let path = dir.path().join("mypath").join(&name);
            assert!(path.exists(), "missing {}", path.display());
        }

        // no temporary file may survive under the final tree
        for entry in std::fs::read_dir(dir.path().join("mypath")).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().ends_with(".tmp"),
                "stale temp file {:?}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_agent_fmp4() {
        run_agent_test(RecordFormat::Fmp4).await;
    }

    #[tokio::test]
    async fn test_agent_mpegts() {
        run_agent_test(RecordFormat::MpegTs).await;
    }

    #[tokio::test]
    async fn test_agent_fmp4_negative_dts() {
        let desc = Description::new(vec![
            Media::new(
                MediaType::Video,
                vec![Format::H264 {
                    payload_type: 96,
                    sps: Some(Bytes::from_static(SPS)),
                    pps: Some(Bytes::from_static(PPS)),
                }],
            ),
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

        let stream = Stream::new(1460, desc, true).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let agent = Agent::spawn(
            AgentConfig {
                path_format: format!(
                    "{}/%path/%Y-%m-%d_%H-%M-%S-%f",
                    dir.path().display()
                ),
                format: RecordFormat::Fmp4,
                part_duration: Duration::from_millis(100),
                segment_duration: Duration::from_secs(1),
                path_name: "mypath".into(),
                write_queue_size: 1024,
                restart_pause: Duration::from_millis(1),
                on_segment_create: None,
                on_segment_complete: None,
            },
            Arc::clone(&stream),
        );

        let ntp = Utc.with_ymd_and_hms(2008, 5, 20, 22, 15, 25).unwrap();
        for i in 0..3i64 {
            stream.write_unit(
                0,
                0,
                Unit::new(
                    -50_000_000 + i * 200_000_000,
                    Some(ntp),
                    Payload::VideoAccessUnit(vec![
                        Bytes::from_static(SPS),
                        Bytes::from_static(PPS),
                        Bytes::from_static(&[0x65, 0x88]),
                    ]),
                ),
            );
            stream.write_unit(
                1,
                0,
                Unit::new(
                    -100_000_000 + i * 200_000_000,
                    None,
                    Payload::AudioAccessUnits(vec![Bytes::from_static(&[1, 2, 3, 4])]),
                ),
            );
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.close_and_wait().await;

        let path = dir
            .path()
            .join("mypath")
            .join("2008-05-20_22-15-25-000000.mp4");
        let data = std::fs::read(&path).unwrap();

        // the audio track's decode times must prove the negative window was
        // shifted out, not wrapped
        let audio_bases: Vec<u64> = fmp4::testparse::part_base_times(&data)
            .into_iter()
            .filter(|(id, _)| *id == 2)
            .map(|(_, base)| base)
            .collect();
        assert!(!audio_bases.is_empty());
        assert!(audio_bases.iter().all(|&b| b < 90_000));
    }
}
