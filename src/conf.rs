//! Configuration snapshot
//!
//! The core receives configuration as an immutable snapshot; parsing it from
//! YAML or CLI flags is the host's concern. Entries are matched literally
//! first, then against `~`-prefixed regular expressions, longest pattern
//! winning.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, Result};

/// Recording container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
    #[default]
    Fmp4,
    MpegTs,
}

impl RecordFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RecordFormat::Fmp4 => "mp4",
            RecordFormat::MpegTs => "ts",
        }
    }
}

/// Configuration of one path entry.
#[derive(Debug, Clone)]
pub struct PathConf {
    pub record: bool,
    pub record_path: String,
    pub record_format: RecordFormat,
    pub record_part_duration: Duration,
    pub record_segment_duration: Duration,
    /// Zero disables deletion of old segments.
    pub record_delete_after: Duration,

    /// URL of a static source the server itself pulls from.
    pub source: Option<String>,
    /// Start the static source only while readers are present.
    pub source_on_demand: bool,
    pub source_retry_pause: Duration,

    /// Redirect readers here while the path is not ready.
    pub fallback: Option<String>,

    /// Zero means unlimited.
    pub max_readers: usize,
    /// A newer publisher evicts the current one instead of being rejected.
    pub override_publisher: bool,

    pub read_user: Option<String>,
    pub read_pass: Option<String>,
    pub publish_user: Option<String>,
    pub publish_pass: Option<String>,

    pub srt_publish_passphrase: Option<String>,
    pub srt_read_passphrase: Option<String>,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            record: false,
            record_path: "./recordings/%path/%Y-%m-%d_%H-%M-%S-%f".into(),
            record_format: RecordFormat::default(),
            record_part_duration: Duration::from_secs(1),
            record_segment_duration: Duration::from_secs(3600),
            record_delete_after: Duration::ZERO,
            source: None,
            source_on_demand: false,
            source_retry_pause: Duration::from_secs(5),
            fallback: None,
            max_readers: 0,
            override_publisher: false,
            read_user: None,
            read_pass: None,
            publish_user: None,
            publish_pass: None,
            srt_publish_passphrase: None,
            srt_read_passphrase: None,
        }
    }
}

impl PathConf {
    /// Whether a reader arriving while the path is not ready may be parked
    /// until the path becomes ready, instead of failing immediately.
    pub fn can_wait_ready(&self) -> bool {
        self.source_on_demand || self.fallback.is_some()
    }
}

/// One configuration entry: a literal path name or a `~`-prefixed regex.
#[derive(Debug, Clone)]
pub struct ConfEntry {
    pub name: String,
    pub conf: Arc<PathConf>,
    regex: Option<Regex>,
}

impl ConfEntry {
    pub fn new(name: impl Into<String>, conf: PathConf) -> Result<Self> {
        let name = name.into();

        let regex = if let Some(pattern) = name.strip_prefix('~') {
            Some(Regex::new(pattern).map_err(|e| {
                Error::InvalidPathName(name.clone(), format!("invalid regex: {}", e))
            })?)
        } else {
            validate_path_name(&name)?;
            None
        };

        Ok(Self {
            name,
            conf: Arc::new(conf),
            regex,
        })
    }

    pub fn is_regex(&self) -> bool {
        self.regex.is_some()
    }

    /// Literal entries are created at (re)load and survive publisher and
    /// reader loss.
    pub fn is_always_on(&self) -> bool {
        !self.is_regex()
    }
}

/// Full configuration snapshot.
#[derive(Debug, Clone)]
pub struct Conf {
    pub entries: Vec<ConfEntry>,
    /// Maximum UDP payload used to bound generated RTP packets.
    pub udp_max_payload_size: usize,
    /// Queue size handed to reader sessions and recorders.
    pub write_queue_size: usize,
}

impl Default for Conf {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Conf {
    pub fn new(entries: Vec<ConfEntry>) -> Self {
        Self {
            entries,
            udp_max_payload_size: 1472,
            write_queue_size: 512,
        }
    }

    /// Resolve the entry governing `name`: exact literal match first, then
    /// the longest matching regex.
    pub fn find_entry(&self, name: &str) -> Result<&ConfEntry> {
        validate_path_name(name)?;

        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| !e.is_regex() && e.name == name)
        {
            return Ok(entry);
        }

        self.entries
            .iter()
            .filter(|e| {
                e.regex
                    .as_ref()
                    .is_some_and(|re| re.is_match(name))
            })
            .max_by_key(|e| e.name.len())
            .ok_or_else(|| Error::PathNotFound(name.to_string()))
    }
}

/// Path names are UTF-8, slash-separated, with no empty segments.
pub fn validate_path_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidPathName(name.into(), "empty name".into()));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidPathName(
            name.into(),
            "cannot begin or end with a slash".into(),
        ));
    }
    if name.split('/').any(|seg| seg.is_empty()) {
        return Err(Error::InvalidPathName(
            name.into(),
            "empty path segment".into(),
        ));
    }
    Ok(())
}
