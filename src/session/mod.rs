//! Session lifecycle
//!
//! A session is one network-level association carrying a single publisher or
//! reader. The protocol-agnostic pieces live here: the phase machine, the
//! capability traits paths use to talk back to sessions, and the external
//! hooks fired at lifecycle edges.

mod srt;

pub use srt::{
    SrtConnParams, SrtPublishConn, SrtReadConn, StreamId, StreamIdMode, UnitSink, UnitSource,
};

use std::sync::Arc;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Association established, no protocol handshake yet.
    Accepted,
    /// Reading and validating handshake bytes.
    Handshaking,
    /// Credentials extracted, path manager consulted.
    Authenticating,
    /// The data path is live.
    Running,
    /// Graceful shutdown in progress.
    Closing,
}

/// Direction a running session settled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Publish,
    Read,
}

/// Best-effort callback fired at a lifecycle edge.
pub type Hook = Arc<dyn Fn(&str) -> crate::error::Result<()> + Send + Sync>;

/// External hooks invoked at lifecycle edges. Failures are logged and never
/// abort the session or the path.
#[derive(Default, Clone)]
pub struct Hooks {
    pub on_connect: Option<Hook>,
    pub on_disconnect: Option<Hook>,
    pub on_read: Option<Hook>,
    pub on_unread: Option<Hook>,
    pub on_ready: Option<Hook>,
    pub on_not_ready: Option<Hook>,
}

impl Hooks {
    fn fire(hook: &Option<Hook>, edge: &'static str, arg: &str) {
        if let Some(hook) = hook {
            if let Err(err) = hook(arg) {
                tracing::warn!(edge, arg, error = %err, "hook failed");
            }
        }
    }

    pub fn connect(&self, arg: &str) {
        Self::fire(&self.on_connect, "connect", arg);
    }

    pub fn disconnect(&self, arg: &str) {
        Self::fire(&self.on_disconnect, "disconnect", arg);
    }

    pub fn read(&self, arg: &str) {
        Self::fire(&self.on_read, "read", arg);
    }

    pub fn unread(&self, arg: &str) {
        Self::fire(&self.on_unread, "unread", arg);
    }

    pub fn ready(&self, arg: &str) {
        Self::fire(&self.on_ready, "ready", arg);
    }

    pub fn not_ready(&self, arg: &str) {
        Self::fire(&self.on_not_ready, "notReady", arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hooks_fire() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);

        let hooks = Hooks {
            on_ready: Some(Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            ..Default::default()
        };

        hooks.ready("cam1");
        hooks.not_ready("cam1"); // unset, no-op
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_failure_is_swallowed() {
        let hooks = Hooks {
            on_connect: Some(Arc::new(|_| {
                Err(crate::error::Error::Upstream("exec failed".into()))
            })),
            ..Default::default()
        };

        // must not panic or propagate
        hooks.connect("cam1");
    }
}
