//! SRT-style session
//!
//! Lifecycle of one SRT-like connection: stream-ID handshake, access
//! control through the path manager, passphrase verification against the
//! path configuration, then the publish or read loop. Wire-level SRT
//! framing is an external collaborator: publishers hand in a `UnitSource`,
//! readers a `UnitSink`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::{AccessRequest, AuthProtocol};
use crate::error::{Error, Result};
use crate::media::{Description, Format, Unit};
use crate::path::{PathHandle, PathManager, SessionHandle, SessionKind};
use crate::stats::ConnStats;

use super::{Hooks, SessionMode, SessionPhase};

/// Direction encoded in the stream ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamIdMode {
    Publish,
    Read,
}

/// Parsed SRT stream ID: `publish|read:path[:user[:pass]]`, with an
/// optional `?query` suffix on the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId {
    pub mode: StreamIdMode,
    pub path: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub query: Option<String>,
}

impl StreamId {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(4, ':');

        let mode = match parts.next() {
            Some("publish") => StreamIdMode::Publish,
            Some("read") => StreamIdMode::Read,
            _ => {
                return Err(Error::InvalidStream(format!(
                    "invalid stream ID '{}': must begin with 'publish:' or 'read:'",
                    raw
                )))
            }
        };

        let raw_path = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| {
            Error::InvalidStream(format!("invalid stream ID '{}': missing path", raw))
        })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (raw_path.to_string(), None),
        };

        let user = parts.next().map(String::from).filter(|s| !s.is_empty());
        let pass = parts.next().map(String::from).filter(|s| !s.is_empty());

        Ok(Self {
            mode,
            path,
            user,
            pass,
            query,
        })
    }
}

/// Mirror of the SRT listener's passphrase rule: an unencrypted connection
/// is rejected as soon as the path requires a passphrase.
fn check_passphrase(conn_passphrase: Option<&str>, conf_passphrase: Option<&str>) -> Result<()> {
    let Some(expected) = conf_passphrase.filter(|p| !p.is_empty()) else {
        return Ok(());
    };

    match conn_passphrase {
        None => Err(Error::Authentication(
            "connection is not encrypted, but a passphrase is configured".into(),
        )),
        Some(got) if got == expected => Ok(()),
        Some(_) => Err(Error::Authentication("invalid passphrase".into())),
    }
}

/// Supplies published media: first the description, then units.
#[async_trait]
pub trait UnitSource: Send {
    async fn read_description(&mut self) -> Result<Description>;
    /// Next unit as `(media_idx, format_idx, unit)`; `Err` on end of stream.
    async fn read_unit(&mut self) -> Result<(usize, usize, Unit)>;
}

/// Receives units on behalf of a reader. Runs on the reader's async-writer
/// worker and must not block on anything but its own output.
pub trait UnitSink: Send + Sync {
    fn write_unit(&self, format: &Format, unit: &Unit) -> Result<()>;
}

/// Parameters shared by both session directions.
pub struct SrtConnParams {
    pub manager: Arc<PathManager>,
    /// Raw stream ID presented in the handshake.
    pub stream_id: String,
    pub ip: IpAddr,
    /// Passphrase the connection is encrypted with, if any.
    pub passphrase: Option<String>,
    /// A publishing connection that stays silent longer than this is closed.
    pub read_timeout: Duration,
    pub token: CancellationToken,
    pub hooks: Arc<Hooks>,
}

/// Publishing side of an SRT-style connection.
pub struct SrtPublishConn<S: UnitSource> {
    params: SrtConnParams,
    source: S,
    phase: SessionPhase,
    stats: Arc<std::sync::RwLock<ConnStats>>,
}

impl<S: UnitSource> SrtPublishConn<S> {
    pub fn new(params: SrtConnParams, source: S) -> Self {
        Self {
            params,
            source,
            phase: SessionPhase::Accepted,
            stats: Arc::new(std::sync::RwLock::new(ConnStats::default())),
        }
    }

    pub fn stats(&self) -> Arc<std::sync::RwLock<ConnStats>> {
        Arc::clone(&self.stats)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Run the connection to completion. `Terminated` is reported as a
    /// clean exit.
    pub async fn run(mut self) -> Result<()> {
        self.phase = SessionPhase::Handshaking;
        let stream_id = StreamId::parse(&self.params.stream_id)?;
        if stream_id.mode != StreamIdMode::Publish {
            return Err(Error::InvalidStream(
                "read stream ID on a publishing connection".into(),
            ));
        }

        self.params.hooks.connect(&stream_id.path);

        self.phase = SessionPhase::Authenticating;
        let session_id = self.params.manager.next_session_id();
        let (handle, mut kick_rx) = SessionHandle::new(session_id, SessionKind::SrtConn);

        let access = AccessRequest {
            name: stream_id.path.clone(),
            ip: self.params.ip,
            user: stream_id.user.clone(),
            pass: stream_id.pass.clone(),
            proto: AuthProtocol::Srt,
            query: stream_id.query.clone(),
            publish: true,
            session_id,
        };

        let result = match self.params.manager.add_publisher(access, handle).await {
            Ok(path) => {
                let result = self
                    .run_publish(&path, &stream_id, session_id, &mut kick_rx)
                    .await;
                path.remove_publisher(session_id).await;
                result
            }
            Err(err) => Err(err),
        };

        self.phase = SessionPhase::Closing;
        self.params.hooks.disconnect(&stream_id.path);

        match &result {
            Err(Error::Terminated) => {
                tracing::info!(path = %stream_id.path, "closed: terminated");
                Ok(())
            }
            _ => result,
        }
    }

    async fn run_publish(
        &mut self,
        path: &PathHandle,
        stream_id: &StreamId,
        session_id: u64,
        kick_rx: &mut mpsc::Receiver<Error>,
    ) -> Result<()> {
        check_passphrase(
            self.params.passphrase.as_deref(),
            path.conf().srt_publish_passphrase.as_deref(),
        )?;

        // derive the description from the ingested media
        let description = tokio::select! {
            desc = self.source.read_description() => desc?,
            _ = tokio::time::sleep(self.params.read_timeout) => {
                return Err(Error::Upstream("read timed out".into()))
            }
            _ = self.params.token.cancelled() => return Err(Error::Terminated),
            err = kick_rx.recv() => return Err(err.unwrap_or(Error::Terminated)),
        };

        let stream = path.start_publisher(session_id, description).await?;

        self.phase = SessionPhase::Running;
        tracing::info!(
            path = %path.name(),
            mode = ?SessionMode::Publish,
            tracks = %stream.description().formats_info(),
            "is publishing"
        );

        loop {
            tokio::select! {
                next = self.source.read_unit() => {
                    let (media_idx, format_idx, unit) = next?;
                    {
                        let mut stats = self.stats.write().unwrap();
                        stats.units_received += 1;
                        stats.bytes_received += unit.payload.byte_len() as u64;
                    }
                    stream.write_unit(media_idx, format_idx, unit);
                }
                _ = tokio::time::sleep(self.params.read_timeout) => {
                    return Err(Error::Upstream("read timed out".into()))
                }
                _ = self.params.token.cancelled() => return Err(Error::Terminated),
                err = kick_rx.recv() => return Err(err.unwrap_or(Error::Terminated)),
            }
        }
    }
}

/// Reading side of an SRT-style connection.
pub struct SrtReadConn {
    params: SrtConnParams,
    sink: Arc<dyn UnitSink>,
    /// Queue size of the async writer, configured at admission.
    write_queue_size: usize,
    /// Replay the per-format unit rings before live units, for late joiners.
    replay_recent: bool,
    phase: SessionPhase,
    stats: Arc<std::sync::RwLock<ConnStats>>,
}

impl SrtReadConn {
    pub fn new(params: SrtConnParams, sink: Arc<dyn UnitSink>, write_queue_size: usize) -> Self {
        Self {
            params,
            sink,
            write_queue_size,
            replay_recent: false,
            phase: SessionPhase::Accepted,
            stats: Arc::new(std::sync::RwLock::new(ConnStats::default())),
        }
    }

    pub fn replay_recent(mut self) -> Self {
        self.replay_recent = true;
        self
    }

    pub fn stats(&self) -> Arc<std::sync::RwLock<ConnStats>> {
        Arc::clone(&self.stats)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub async fn run(mut self) -> Result<()> {
        self.phase = SessionPhase::Handshaking;
        let stream_id = StreamId::parse(&self.params.stream_id)?;
        if stream_id.mode != StreamIdMode::Read {
            return Err(Error::InvalidStream(
                "publish stream ID on a reading connection".into(),
            ));
        }

        self.params.hooks.connect(&stream_id.path);

        self.phase = SessionPhase::Authenticating;
        let session_id = self.params.manager.next_session_id();
        let (handle, mut kick_rx) = SessionHandle::new(session_id, SessionKind::SrtConn);

        let access = AccessRequest {
            name: stream_id.path.clone(),
            ip: self.params.ip,
            user: stream_id.user.clone(),
            pass: stream_id.pass.clone(),
            proto: AuthProtocol::Srt,
            query: stream_id.query.clone(),
            publish: false,
            session_id,
        };

        let result = match self.params.manager.add_reader(access, handle).await {
            Ok((path, stream)) => {
                let result = self
                    .run_read(&path, &stream, session_id, &mut kick_rx)
                    .await;
                stream.remove_reader(session_id);
                path.remove_reader(session_id).await;
                result
            }
            Err(err) => Err(err),
        };

        self.phase = SessionPhase::Closing;
        self.params.hooks.disconnect(&stream_id.path);

        match &result {
            Err(Error::Terminated) => {
                tracing::info!(path = %stream_id.path, "closed: terminated");
                Ok(())
            }
            _ => result,
        }
    }

    async fn run_read(
        &mut self,
        path: &PathHandle,
        stream: &Arc<crate::stream::Stream>,
        session_id: u64,
        kick_rx: &mut mpsc::Receiver<Error>,
    ) -> Result<()> {
        check_passphrase(
            self.params.passphrase.as_deref(),
            path.conf().srt_read_passphrase.as_deref(),
        )?;

        let mut writer = crate::asyncwriter::AsyncWriter::new(self.write_queue_size);
        let handle = writer.handle();

        for ((media_idx, format_idx), sf) in stream.formats() {
            let format = sf.format().clone();
            let sink = Arc::clone(&self.sink);
            let stats = Arc::clone(&self.stats);

            if self.replay_recent {
                for unit in sf.recent_units() {
                    let format = format.clone();
                    let sink = Arc::clone(&sink);
                    handle.push(Box::new(move || sink.write_unit(&format, &unit)));
                }
            }

            let handle = handle.clone();
            stream.add_reader(
                session_id,
                media_idx,
                format_idx,
                Arc::new(move |unit: Arc<Unit>| {
                    let format = format.clone();
                    let sink = Arc::clone(&sink);
                    {
                        let mut stats = stats.write().unwrap();
                        stats.units_sent += 1;
                        stats.bytes_sent += unit.payload.byte_len() as u64;
                    }
                    handle.push(Box::new(move || sink.write_unit(&format, &unit)));
                }),
            );
        }

        self.phase = SessionPhase::Running;
        tracing::info!(
            path = %path.name(),
            mode = ?SessionMode::Read,
            tracks = %stream.description().formats_info(),
            "is reading"
        );
        self.params.hooks.read(path.name());

        writer.start();

        let result = tokio::select! {
            _ = self.params.token.cancelled() => Err(Error::Terminated),
            err = kick_rx.recv() => Err(err.unwrap_or(Error::Terminated)),
            err = writer.error() => Err(err),
        };

        writer.stop().await;
        self.params.hooks.unread(path.name());
        result
    }
}
