//! Path manager
//!
//! Owns the path registry. A single event loop resolves configuration
//! entries, performs access control and creates paths; the typed admission
//! request itself is then forwarded to the path by the requesting session's
//! task, so a parked request never stalls the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::{AccessRequest, AllowAll, SharedAuthenticator, PAUSE_AFTER_AUTH_ERROR};
use crate::conf::Conf;
use crate::error::{Error, Result};
use crate::record::Cleaner;
use crate::session::Hooks;
use crate::source::StaticSource;
use crate::stream::Stream;

use super::messages::{DescribeAnswer, PathEvent, PathSnapshot, SessionHandle};
use super::path::{manager_event_channel, Path, PathHandle, PathParams};

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Collaborators injected into the manager.
pub struct ManagerOptions {
    pub authenticator: SharedAuthenticator,
    pub static_source: Option<Arc<dyn StaticSource>>,
    pub hooks: Arc<Hooks>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            authenticator: Arc::new(AllowAll),
            static_source: None,
            hooks: Arc::new(Hooks::default()),
        }
    }
}

enum ManagerRequest {
    Resolve {
        access: AccessRequest,
        res: oneshot::Sender<Result<PathHandle>>,
    },
    ApiPathsList {
        res: oneshot::Sender<Vec<(String, PathHandle)>>,
    },
    ApiPathsGet {
        name: String,
        res: oneshot::Sender<Option<PathHandle>>,
    },
    ReloadConf {
        conf: Conf,
        res: oneshot::Sender<()>,
    },
}

/// Entry point of the core: routes admissions, owns every path.
pub struct PathManager {
    tx: mpsc::Sender<ManagerRequest>,
    token: CancellationToken,
    next_session_id: AtomicU64,
}

impl PathManager {
    pub fn new(conf: Conf) -> Self {
        Self::with_options(conf, ManagerOptions::default())
    }

    pub fn with_options(conf: Conf, options: ManagerOptions) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let token = CancellationToken::new();
        let (event_tx, event_rx) = manager_event_channel();

        let mut inner = ManagerInner {
            conf,
            authenticator: options.authenticator,
            static_source: options.static_source,
            hooks: options.hooks,
            token: token.clone(),
            event_tx,
            paths: HashMap::new(),
            cleaner: None,
        };

        tokio::spawn(async move {
            inner.run(rx, event_rx).await;
        });

        Self {
            tx,
            token,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Allocate an identity for a new session.
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stop every path and the registry loop.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Admit a publisher. On success the returned handle carries the
    /// admitted path; the caller must pair it with `remove_publisher`.
    pub async fn add_publisher(
        &self,
        access: AccessRequest,
        session: SessionHandle,
    ) -> Result<PathHandle> {
        let handle = self.resolve(access).await?;
        handle.add_publisher(session).await?;
        Ok(handle)
    }

    /// Admit a reader; may wait while the path becomes ready on demand.
    pub async fn add_reader(
        &self,
        access: AccessRequest,
        session: SessionHandle,
    ) -> Result<(PathHandle, Arc<Stream>)> {
        let handle = self.resolve(access).await?;
        let stream = handle.add_reader(session).await?;
        Ok((handle, stream))
    }

    /// Resolve a path for playback metadata: current stream or redirect.
    pub async fn describe(&self, access: AccessRequest) -> Result<DescribeAnswer> {
        let handle = self.resolve(access).await?;
        handle.describe().await
    }

    pub async fn api_paths_list(&self) -> Result<Vec<PathSnapshot>> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::ApiPathsList { res: res_tx })
            .await
            .map_err(|_| Error::Terminated)?;
        let handles = res_rx.await.map_err(|_| Error::Terminated)?;

        let mut out = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            if let Ok(snapshot) = handle.api_get().await {
                out.push(snapshot);
            }
        }
        Ok(out)
    }

    pub async fn api_paths_get(&self, name: &str) -> Result<Option<PathSnapshot>> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::ApiPathsGet {
                name: name.to_string(),
                res: res_tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;

        match res_rx.await.map_err(|_| Error::Terminated)? {
            Some(handle) => Ok(handle.api_get().await.ok()),
            None => Ok(None),
        }
    }

    /// Swap the configuration. After this returns, every subsequent
    /// admission sees the new one.
    pub async fn reload_conf(&self, conf: Conf) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::ReloadConf { conf, res: res_tx })
            .await
            .map_err(|_| Error::Terminated)?;
        res_rx.await.map_err(|_| Error::Terminated)
    }

    async fn resolve(&self, access: AccessRequest) -> Result<PathHandle> {
        let (res_tx, res_rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::Resolve {
                access,
                res: res_tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;

        let res = res_rx.await.map_err(|_| Error::Terminated)?;

        if let Err(Error::Authentication(_)) = &res {
            // mitigate brute force attacks
            tokio::time::sleep(PAUSE_AFTER_AUTH_ERROR).await;
        }
        res
    }
}

struct PathEntry {
    handle: PathHandle,
    token: CancellationToken,
    always_on: bool,
    source: Option<String>,
}

struct ManagerInner {
    conf: Conf,
    authenticator: SharedAuthenticator,
    static_source: Option<Arc<dyn StaticSource>>,
    hooks: Arc<Hooks>,
    token: CancellationToken,
    event_tx: mpsc::Sender<PathEvent>,
    paths: HashMap<String, PathEntry>,
    cleaner: Option<Cleaner>,
}

impl ManagerInner {
    async fn run(
        &mut self,
        mut rx: mpsc::Receiver<ManagerRequest>,
        mut event_rx: mpsc::Receiver<PathEvent>,
    ) {
        self.create_always_on_paths();
        self.restart_cleaner();

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                req = rx.recv() => match req {
                    Some(req) => self.handle_request(req).await,
                    None => break,
                },
            }
        }

        if let Some(cleaner) = self.cleaner.take() {
            cleaner.close();
        }
    }

    async fn handle_request(&mut self, req: ManagerRequest) {
        match req {
            ManagerRequest::Resolve { access, res } => {
                let _ = res.send(self.resolve(access).await);
            }
            ManagerRequest::ApiPathsList { res } => {
                let mut handles: Vec<(String, PathHandle)> = self
                    .paths
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.handle.clone()))
                    .collect();
                handles.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = res.send(handles);
            }
            ManagerRequest::ApiPathsGet { name, res } => {
                let _ = res.send(self.paths.get(&name).map(|e| e.handle.clone()));
            }
            ManagerRequest::ReloadConf { conf, res } => {
                self.apply_conf(conf).await;
                let _ = res.send(());
            }
        }
    }

    fn handle_event(&mut self, event: PathEvent) {
        match event {
            PathEvent::Ready { name } => {
                tracing::debug!(path = %name, "manager: path ready");
            }
            PathEvent::NotReady { name } => {
                tracing::debug!(path = %name, "manager: path not ready");
            }
            PathEvent::Closed { name } => {
                // a newer path may have reused the name already
                let stale = self
                    .paths
                    .get(&name)
                    .is_some_and(|e| e.token.is_cancelled() || e.handle.is_closed());
                if stale {
                    self.paths.remove(&name);
                }
            }
        }
    }

    async fn resolve(&mut self, access: AccessRequest) -> Result<PathHandle> {
        let entry = self.conf.find_entry(&access.name)?;
        let conf = Arc::clone(&entry.conf);
        let conf_name = entry.name.clone();
        let always_on = entry.is_always_on();

        self.authenticator.authenticate(&access, &conf).await?;

        if let Some(existing) = self.paths.get(&access.name) {
            return Ok(existing.handle.clone());
        }

        Ok(self.create_path(access.name, conf_name, conf, always_on))
    }

    fn create_path(
        &mut self,
        name: String,
        conf_name: String,
        conf: Arc<crate::conf::PathConf>,
        always_on: bool,
    ) -> PathHandle {
        let token = self.token.child_token();
        let source = conf.source.clone();
        let handle = Path::spawn(PathParams {
            name: name.clone(),
            conf_name,
            conf,
            always_on,
            udp_max_payload_size: self.conf.udp_max_payload_size,
            write_queue_size: self.conf.write_queue_size,
            manager_tx: self.event_tx.clone(),
            token: token.clone(),
            static_source: self.static_source.clone(),
            hooks: Arc::clone(&self.hooks),
        });

        self.paths.insert(
            name,
            PathEntry {
                handle: handle.clone(),
                token,
                always_on,
                source,
            },
        );
        handle
    }

    fn create_always_on_paths(&mut self) {
        let entries: Vec<_> = self
            .conf
            .entries
            .iter()
            .filter(|e| e.is_always_on())
            .map(|e| (e.name.clone(), Arc::clone(&e.conf)))
            .collect();

        for (name, conf) in entries {
            if !self.paths.contains_key(&name) {
                self.create_path(name.clone(), name, conf, true);
            }
        }
    }

    async fn apply_conf(&mut self, new_conf: Conf) {
        enum Action {
            Close,
            Update(PathHandle, Arc<crate::conf::PathConf>),
        }

        let mut actions = Vec::new();
        for (name, entry) in &self.paths {
            let action = match new_conf.find_entry(name) {
                Ok(new_entry) => {
                    let incompatible = new_entry.conf.source != entry.source
                        || new_entry.is_always_on() != entry.always_on;
                    if incompatible {
                        Action::Close
                    } else {
                        Action::Update(entry.handle.clone(), Arc::clone(&new_entry.conf))
                    }
                }
                Err(_) => Action::Close,
            };
            actions.push((name.clone(), action));
        }

        for (name, action) in actions {
            match action {
                Action::Close => self.close_path(&name),
                Action::Update(handle, conf) => handle.reload_conf(conf).await,
            }
        }

        self.conf = new_conf;
        self.create_always_on_paths();
        self.restart_cleaner();

        tracing::info!(paths = self.conf.entries.len(), "configuration reloaded");
    }

    fn close_path(&mut self, name: &str) {
        if let Some(entry) = self.paths.remove(name) {
            tracing::info!(path = %name, "closing path removed from configuration");
            entry.token.cancel();
        }
    }

    fn restart_cleaner(&mut self) {
        if let Some(cleaner) = self.cleaner.take() {
            cleaner.close();
        }
        self.cleaner = Cleaner::spawn(&self.conf, self.token.child_token());
    }
}
