//! Access control
//!
//! The path manager consults an injected `Authenticator` before admitting a
//! publisher or reader. A failed authentication is reported to the session
//! only after a fixed penalty sleep, applied by the manager.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::conf::PathConf;
use crate::error::{Error, Result};

/// Penalty slept before surfacing an authentication failure.
pub const PAUSE_AFTER_AUTH_ERROR: Duration = Duration::from_secs(2);

/// Protocol the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Srt,
    Rtsp,
    Rtmp,
    Hls,
    WebRtc,
}

impl std::fmt::Display for AuthProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthProtocol::Srt => write!(f, "srt"),
            AuthProtocol::Rtsp => write!(f, "rtsp"),
            AuthProtocol::Rtmp => write!(f, "rtmp"),
            AuthProtocol::Hls => write!(f, "hls"),
            AuthProtocol::WebRtc => write!(f, "webrtc"),
        }
    }
}

/// Everything an authenticator may consider.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub name: String,
    pub ip: IpAddr,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub proto: AuthProtocol,
    pub query: Option<String>,
    pub publish: bool,
    /// Session identity, for audit logs.
    pub session_id: u64,
}

/// External access-control collaborator.
///
/// Returns `Error::Authentication` to reject the credentials and
/// `Error::AuthenticationInternal` when the backend itself failed.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, req: &AccessRequest, conf: &PathConf) -> Result<()>;
}

/// Admits everything. The default when the host installs no backend.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _req: &AccessRequest, _conf: &PathConf) -> Result<()> {
        Ok(())
    }
}

/// Checks credentials against the per-path configuration.
pub struct ConfCredentials;

impl ConfCredentials {
    fn check(
        expected_user: &Option<String>,
        expected_pass: &Option<String>,
        req: &AccessRequest,
    ) -> Result<()> {
        if expected_user.is_none() && expected_pass.is_none() {
            return Ok(());
        }
        if expected_user == &req.user && expected_pass == &req.pass {
            return Ok(());
        }
        Err(Error::Authentication(format!(
            "invalid credentials for path '{}'",
            req.name
        )))
    }
}

#[async_trait]
impl Authenticator for ConfCredentials {
    async fn authenticate(&self, req: &AccessRequest, conf: &PathConf) -> Result<()> {
        if req.publish {
            Self::check(&conf.publish_user, &conf.publish_pass, req)
        } else {
            Self::check(&conf.read_user, &conf.read_pass, req)
        }
    }
}

/// Shared trait-object alias used by the manager.
pub type SharedAuthenticator = Arc<dyn Authenticator>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request(user: Option<&str>, pass: Option<&str>, publish: bool) -> AccessRequest {
        AccessRequest {
            name: "cam1".into(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            user: user.map(String::from),
            pass: pass.map(String::from),
            proto: AuthProtocol::Srt,
            query: None,
            publish,
            session_id: 1,
        }
    }

    #[tokio::test]
    async fn test_allow_all() {
        let auth = AllowAll;
        let conf = PathConf::default();
        assert!(auth.authenticate(&request(None, None, true), &conf).await.is_ok());
    }

    #[tokio::test]
    async fn test_conf_credentials_publish() {
        let auth = ConfCredentials;
        let conf = PathConf {
            publish_user: Some("user".into()),
            publish_pass: Some("pw".into()),
            ..Default::default()
        };

        assert!(auth
            .authenticate(&request(Some("user"), Some("pw"), true), &conf)
            .await
            .is_ok());

        let err = auth
            .authenticate(&request(Some("user"), Some("wrong"), true), &conf)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_read_credentials_do_not_gate_publish() {
        let auth = ConfCredentials;
        let conf = PathConf {
            read_user: Some("viewer".into()),
            read_pass: Some("pw".into()),
            ..Default::default()
        };

        // publishing without read credentials is fine
        assert!(auth.authenticate(&request(None, None, true), &conf).await.is_ok());
        // reading without them is not
        assert!(auth.authenticate(&request(None, None, false), &conf).await.is_err());
    }
}
