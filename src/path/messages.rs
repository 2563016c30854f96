//! Typed messages exchanged with path and manager event loops
//!
//! Every mutating operation is a message answered over a oneshot channel,
//! which is what linearizes path state. Sessions are represented inside the
//! loops by a small handle carrying identity and a kick channel; the kick is
//! how the longer-lived side (the path) tells the shorter-lived side (a
//! session) to go away.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::media::Description;
use crate::stream::Stream;

/// What kind of component sits behind a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    SrtConn,
    StaticSource,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::SrtConn => write!(f, "srtConn"),
            SessionKind::StaticSource => write!(f, "staticSource"),
        }
    }
}

/// Identity of a publisher or reader as held by a path.
///
/// The path keeps only this handle; the session owns the receiving end of
/// the kick channel and tears itself down when an error arrives on it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub kind: SessionKind,
    kick_tx: mpsc::Sender<Error>,
}

impl SessionHandle {
    /// Create the handle plus the kick receiver kept by the session.
    pub fn new(id: u64, kind: SessionKind) -> (Self, mpsc::Receiver<Error>) {
        let (kick_tx, kick_rx) = mpsc::channel(1);
        (Self { id, kind, kick_tx }, kick_rx)
    }

    /// Ask the owning session to terminate with `err`. Best-effort.
    pub(crate) fn kick(&self, err: Error) {
        let _ = self.kick_tx.try_send(err);
    }
}

/// Answer to a describe request.
#[derive(Clone)]
pub enum DescribeAnswer {
    Stream(Arc<Stream>),
    Redirect(String),
}

impl std::fmt::Debug for DescribeAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescribeAnswer::Stream(_) => write!(f, "Stream"),
            DescribeAnswer::Redirect(url) => write!(f, "Redirect({})", url),
        }
    }
}

/// Requests handled by a path's event loop.
pub(crate) enum PathRequest {
    Describe {
        res: oneshot::Sender<Result<DescribeAnswer>>,
    },
    AddPublisher {
        session: SessionHandle,
        res: oneshot::Sender<Result<()>>,
    },
    RemovePublisher {
        session_id: u64,
    },
    StartPublisher {
        session_id: u64,
        description: Description,
        res: oneshot::Sender<Result<Arc<Stream>>>,
    },
    AddReader {
        session: SessionHandle,
        res: oneshot::Sender<Result<Arc<Stream>>>,
    },
    RemoveReader {
        session_id: u64,
    },
    ApiGet {
        res: oneshot::Sender<PathSnapshot>,
    },
    ReloadConf {
        conf: Arc<crate::conf::PathConf>,
    },
}

/// Notifications a path sends to its manager.
#[derive(Debug)]
pub(crate) enum PathEvent {
    Ready { name: String },
    NotReady { name: String },
    Closed { name: String },
}

/// Read-only snapshot of a path, for the API surface.
#[derive(Debug, Clone)]
pub struct PathSnapshot {
    pub name: String,
    pub conf_name: String,
    pub ready: bool,
    pub ready_time: Option<DateTime<Utc>>,
    pub tracks: Vec<String>,
    pub source: Option<(SessionKind, u64)>,
    pub readers: Vec<(SessionKind, u64)>,
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kick_delivers_error() {
        let (handle, mut rx) = SessionHandle::new(3, SessionKind::SrtConn);
        handle.kick(Error::Superseded("cam1".into()));

        let err = rx.recv().await.unwrap();
        assert!(matches!(err, Error::Superseded(_)));
    }

    #[test]
    fn test_session_kind_display() {
        assert_eq!(SessionKind::SrtConn.to_string(), "srtConn");
        assert_eq!(SessionKind::StaticSource.to_string(), "staticSource");
    }
}
