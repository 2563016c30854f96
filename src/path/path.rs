//! Path state machine
//!
//! One event loop per named path serializes every mutating operation:
//! publisher admission, reader admission, readiness transitions, teardown.
//! The loop owns the publisher slot, the reader set and the stream; nothing
//! else mutates them.
//!
//! States: initial -> notReady <-> ready -> closed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::conf::PathConf;
use crate::error::{Error, Result};
use crate::media::Description;
use crate::record::{Agent, AgentConfig};
use crate::session::Hooks;
use crate::source::{StaticSource, Supervisor};
use crate::stream::Stream;

use super::messages::{DescribeAnswer, PathEvent, PathRequest, PathSnapshot, SessionHandle};

/// Reader/describe requests parked while the path is not ready.
const MAX_PARKED_REQUESTS: usize = 16;

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Handle to a path, returned from admission.
///
/// Sessions hold strong references to the path through this handle; the path
/// holds only session identities. When the path's loop has ended, operations
/// fail with `Terminated`.
#[derive(Clone, Debug)]
pub struct PathHandle {
    name: Arc<str>,
    conf: Arc<PathConf>,
    tx: mpsc::Sender<PathRequest>,
}

impl PathHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration snapshot taken at admission time.
    pub fn conf(&self) -> &Arc<PathConf> {
        &self.conf
    }

    /// Whether the path's event loop has ended.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Install the stream description and flip the path to ready.
    pub async fn start_publisher(
        &self,
        session_id: u64,
        description: Description,
    ) -> Result<Arc<Stream>> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(PathRequest::StartPublisher {
                session_id,
                description,
                res: res_tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        res_rx.await.map_err(|_| Error::Terminated)?
    }

    /// Idempotent; ignored when the path is already gone.
    pub async fn remove_publisher(&self, session_id: u64) {
        let _ = self
            .tx
            .send(PathRequest::RemovePublisher { session_id })
            .await;
    }

    /// Idempotent; ignored when the path is already gone.
    pub async fn remove_reader(&self, session_id: u64) {
        let _ = self.tx.send(PathRequest::RemoveReader { session_id }).await;
    }

    pub async fn api_get(&self) -> Result<PathSnapshot> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(PathRequest::ApiGet { res: res_tx })
            .await
            .map_err(|_| Error::Terminated)?;
        res_rx.await.map_err(|_| Error::Terminated)
    }

    pub(crate) async fn describe(&self) -> Result<DescribeAnswer> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(PathRequest::Describe { res: res_tx })
            .await
            .map_err(|_| Error::Terminated)?;
        res_rx.await.map_err(|_| Error::Terminated)?
    }

    pub(crate) async fn add_publisher(&self, session: SessionHandle) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(PathRequest::AddPublisher {
                session,
                res: res_tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        res_rx.await.map_err(|_| Error::Terminated)?
    }

    pub(crate) async fn add_reader(&self, session: SessionHandle) -> Result<Arc<Stream>> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(PathRequest::AddReader {
                session,
                res: res_tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        res_rx.await.map_err(|_| Error::Terminated)?
    }

    pub(crate) async fn reload_conf(&self, conf: Arc<PathConf>) {
        let _ = self.tx.send(PathRequest::ReloadConf { conf }).await;
    }
}

/// Everything a path needs at spawn time.
pub(crate) struct PathParams {
    pub name: String,
    pub conf_name: String,
    pub conf: Arc<PathConf>,
    pub always_on: bool,
    pub udp_max_payload_size: usize,
    pub write_queue_size: usize,
    pub manager_tx: mpsc::Sender<PathEvent>,
    pub token: CancellationToken,
    pub static_source: Option<Arc<dyn StaticSource>>,
    pub hooks: Arc<Hooks>,
}

pub(crate) struct Path {
    name: String,
    conf_name: String,
    conf: Arc<PathConf>,
    always_on: bool,
    udp_max_payload_size: usize,
    write_queue_size: usize,
    manager_tx: mpsc::Sender<PathEvent>,
    token: CancellationToken,
    static_source: Option<Arc<dyn StaticSource>>,
    hooks: Arc<Hooks>,

    self_tx: mpsc::Sender<PathRequest>,
    rx: mpsc::Receiver<PathRequest>,

    publisher: Option<SessionHandle>,
    ready: bool,
    ready_time: Option<DateTime<Utc>>,
    stream: Option<Arc<Stream>>,
    readers: HashMap<u64, SessionHandle>,
    parked_readers: Vec<(SessionHandle, oneshot::Sender<Result<Arc<Stream>>>)>,
    parked_describes: Vec<oneshot::Sender<Result<DescribeAnswer>>>,
    recorder: Option<Agent>,
    source_supervisor: Option<Supervisor>,
}

impl Path {
    /// Spawn the path's event loop; returns the handle used to reach it.
    pub(crate) fn spawn(params: PathParams) -> PathHandle {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        let handle = PathHandle {
            name: Arc::from(params.name.as_str()),
            conf: Arc::clone(&params.conf),
            tx: tx.clone(),
        };

        let mut path = Path {
            name: params.name,
            conf_name: params.conf_name,
            conf: params.conf,
            always_on: params.always_on,
            udp_max_payload_size: params.udp_max_payload_size,
            write_queue_size: params.write_queue_size,
            manager_tx: params.manager_tx,
            token: params.token,
            static_source: params.static_source,
            hooks: params.hooks,
            self_tx: tx,
            rx,
            publisher: None,
            ready: false,
            ready_time: None,
            stream: None,
            readers: HashMap::new(),
            parked_readers: Vec::new(),
            parked_describes: Vec::new(),
            recorder: None,
            source_supervisor: None,
        };

        tokio::spawn(async move {
            path.run().await;
        });

        handle
    }

    fn handle(&self) -> PathHandle {
        PathHandle {
            name: Arc::from(self.name.as_str()),
            conf: Arc::clone(&self.conf),
            tx: self.self_tx.clone(),
        }
    }

    async fn run(&mut self) {
        tracing::debug!(path = %self.name, "created");

        // a static source that is not on demand starts with the path
        if self.conf.source.is_some() && !self.conf.source_on_demand {
            self.start_static_source();
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                req = self.rx.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => break,
                },
            }

            if self.should_close() {
                break;
            }
        }

        self.shutdown();
    }

    fn handle_request(&mut self, req: PathRequest) {
        match req {
            PathRequest::Describe { res } => {
                let _ = match self.describe() {
                    Ok(Some(answer)) => res.send(Ok(answer)),
                    Ok(None) => {
                        self.park_describe(res);
                        Ok(())
                    }
                    Err(err) => res.send(Err(err)),
                };
            }
            PathRequest::AddPublisher { session, res } => {
                let _ = res.send(self.add_publisher(session));
            }
            PathRequest::RemovePublisher { session_id } => {
                self.remove_publisher(session_id);
            }
            PathRequest::StartPublisher {
                session_id,
                description,
                res,
            } => {
                let _ = res.send(self.start_publisher(session_id, description));
            }
            PathRequest::AddReader { session, res } => {
                let parked = self.add_reader(session, res);
                if parked {
                    self.start_static_source();
                }
            }
            PathRequest::RemoveReader { session_id } => {
                self.remove_reader(session_id);
            }
            PathRequest::ApiGet { res } => {
                let _ = res.send(self.snapshot());
            }
            PathRequest::ReloadConf { conf } => {
                tracing::debug!(path = %self.name, "configuration updated");
                self.conf = conf;
            }
        }
    }

    /// `Ok(None)` means the request should be parked.
    fn describe(&mut self) -> Result<Option<DescribeAnswer>> {
        if let Some(stream) = &self.stream {
            return Ok(Some(DescribeAnswer::Stream(Arc::clone(stream))));
        }
        if let Some(fallback) = &self.conf.fallback {
            return Ok(Some(DescribeAnswer::Redirect(fallback.clone())));
        }
        if self.conf.source_on_demand && self.parked_describes.len() < MAX_PARKED_REQUESTS {
            return Ok(None);
        }
        Err(Error::PathNotReady(self.name.clone()))
    }

    fn park_describe(&mut self, res: oneshot::Sender<Result<DescribeAnswer>>) {
        self.parked_describes.push(res);
        self.start_static_source();
    }

    fn add_publisher(&mut self, session: SessionHandle) -> Result<()> {
        if let Some(existing) = self.publisher.take() {
            if !self.conf.override_publisher {
                self.publisher = Some(existing);
                return Err(Error::AlreadyPublishing(self.name.clone()));
            }
            tracing::info!(path = %self.name, evicted = existing.id, "publisher superseded");
            existing.kick(Error::Superseded(self.name.clone()));
            self.set_not_ready();
        }

        tracing::debug!(path = %self.name, session = session.id, "publisher added");
        self.publisher = Some(session);
        Ok(())
    }

    fn remove_publisher(&mut self, session_id: u64) {
        if self
            .publisher
            .as_ref()
            .is_some_and(|p| p.id == session_id)
        {
            tracing::debug!(path = %self.name, session = session_id, "publisher removed");
            self.publisher = None;
            self.set_not_ready();
        }
    }

    fn start_publisher(
        &mut self,
        session_id: u64,
        description: Description,
    ) -> Result<Arc<Stream>> {
        let publisher = self
            .publisher
            .as_ref()
            .ok_or_else(|| Error::Superseded(self.name.clone()))?;
        if publisher.id != session_id {
            return Err(Error::Superseded(self.name.clone()));
        }
        if self.ready {
            return Err(Error::AlreadyPublishing(self.name.clone()));
        }

        let stream = Stream::new(self.udp_max_payload_size, description, true)?;
        self.set_ready(stream)
    }

    fn set_ready(&mut self, stream: Arc<Stream>) -> Result<Arc<Stream>> {
        self.ready = true;
        self.ready_time = Some(Utc::now());
        self.stream = Some(Arc::clone(&stream));

        tracing::info!(
            path = %self.name,
            tracks = %stream.description().formats_info(),
            "is ready"
        );

        if self.conf.record {
            self.recorder = Some(Agent::spawn(
                AgentConfig {
                    path_format: self.conf.record_path.clone(),
                    format: self.conf.record_format,
                    part_duration: self.conf.record_part_duration,
                    segment_duration: self.conf.record_segment_duration,
                    path_name: self.name.clone(),
                    write_queue_size: self.write_queue_size,
                    ..Default::default()
                },
                Arc::clone(&stream),
            ));
        }

        // release parked requests, oldest first
        let max_readers = self.conf.max_readers;
        for (session, res) in self.parked_readers.drain(..) {
            if max_readers != 0 && self.readers.len() >= max_readers {
                let _ = res.send(Err(Error::TooManyReaders(self.name.clone())));
                continue;
            }
            self.readers.insert(session.id, session);
            let _ = res.send(Ok(Arc::clone(&stream)));
        }
        for res in self.parked_describes.drain(..) {
            let _ = res.send(Ok(DescribeAnswer::Stream(Arc::clone(&stream))));
        }

        self.hooks.ready(&self.name);
        self.send_event(PathEvent::Ready {
            name: self.name.clone(),
        });

        Ok(stream)
    }

    fn set_not_ready(&mut self) {
        if !self.ready {
            return;
        }
        self.ready = false;
        self.ready_time = None;

        tracing::info!(path = %self.name, "is not ready");

        if let Some(recorder) = self.recorder.take() {
            recorder.close();
        }

        if let Some(stream) = self.stream.take() {
            stream.close();
        }

        // attached readers receive a terminal notification
        for (_, reader) in self.readers.drain() {
            reader.kick(Error::PathNotReady(self.name.clone()));
        }

        self.hooks.not_ready(&self.name);
        self.send_event(PathEvent::NotReady {
            name: self.name.clone(),
        });
    }

    /// Returns true when the request was parked until readiness.
    fn add_reader(
        &mut self,
        session: SessionHandle,
        res: oneshot::Sender<Result<Arc<Stream>>>,
    ) -> bool {
        if let Some(stream) = &self.stream {
            if self.conf.max_readers != 0 && self.readers.len() >= self.conf.max_readers {
                let _ = res.send(Err(Error::TooManyReaders(self.name.clone())));
                return false;
            }
            tracing::debug!(path = %self.name, session = session.id, "reader added");
            self.readers.insert(session.id, session);
            let _ = res.send(Ok(Arc::clone(stream)));
            return false;
        }

        if self.conf.can_wait_ready() && self.parked_readers.len() < MAX_PARKED_REQUESTS {
            self.parked_readers.push((session, res));
            return true;
        }

        let _ = res.send(Err(Error::PathNotReady(self.name.clone())));
        false
    }

    fn remove_reader(&mut self, session_id: u64) {
        if self.readers.remove(&session_id).is_some() {
            tracing::debug!(path = %self.name, session = session_id, "reader removed");
        }

        // an on-demand source has no reason to keep running
        if self.conf.source_on_demand
            && self.readers.is_empty()
            && self.parked_readers.is_empty()
            && self.parked_describes.is_empty()
        {
            self.stop_static_source();
        }
    }

    fn start_static_source(&mut self) {
        if self.source_supervisor.is_some() {
            return;
        }
        let (Some(url), Some(source)) = (self.conf.source.clone(), self.static_source.clone())
        else {
            return;
        };

        self.source_supervisor = Some(Supervisor::spawn(
            url,
            self.handle(),
            source,
            self.conf.source_retry_pause,
            self.token.child_token(),
        ));
    }

    fn stop_static_source(&mut self) {
        if let Some(supervisor) = self.source_supervisor.take() {
            supervisor.close();
        }
    }

    fn should_close(&self) -> bool {
        !self.always_on
            && self.publisher.is_none()
            && self.readers.is_empty()
            && self.parked_readers.is_empty()
            && self.parked_describes.is_empty()
    }

    fn shutdown(&mut self) {
        self.set_not_ready();
        self.stop_static_source();

        if let Some(publisher) = self.publisher.take() {
            publisher.kick(Error::Terminated);
        }
        for (session, res) in self.parked_readers.drain(..) {
            session.kick(Error::Terminated);
            let _ = res.send(Err(Error::PathNotReady(self.name.clone())));
        }
        for res in self.parked_describes.drain(..) {
            let _ = res.send(Err(Error::PathNotReady(self.name.clone())));
        }

        tracing::debug!(path = %self.name, "destroyed");
        self.send_event(PathEvent::Closed {
            name: self.name.clone(),
        });
    }

    fn send_event(&self, event: PathEvent) {
        // sent from a spawned task so two loops can never block on each other
        let tx = self.manager_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }

    fn snapshot(&self) -> PathSnapshot {
        PathSnapshot {
            name: self.name.clone(),
            conf_name: self.conf_name.clone(),
            ready: self.ready,
            ready_time: self.ready_time,
            tracks: self
                .stream
                .as_ref()
                .map(|s| {
                    s.description()
                        .medias
                        .iter()
                        .flat_map(|m| m.formats.iter().map(|f| f.codec_name().to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            source: self.publisher.as_ref().map(|p| (p.kind, p.id)),
            readers: self.readers.values().map(|r| (r.kind, r.id)).collect(),
            bytes_received: self.stream.as_ref().map(|s| s.bytes_received()).unwrap_or(0),
        }
    }
}

/// Channel paths use to notify their manager.
pub(crate) fn manager_event_channel() -> (mpsc::Sender<PathEvent>, mpsc::Receiver<PathEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}
