//! mediahub
//!
//! Core of a multi-protocol media-streaming server: publishers are admitted
//! onto named paths, each path carries at most one live stream, and any
//! number of readers receive that stream through bounded per-reader queues.
//! Streams can be recorded to fragmented MP4 or MPEG-TS segments.
//!
//! The crate deliberately contains no wire-protocol parsing: protocol
//! adapters feed media in and out through the `session` and `source`
//! contracts, while this core owns admission, fan-out, lifecycle and
//! recording.
//!
//! # Overview
//!
//! - [`path::PathManager`]: entry point; owns the path registry, performs
//!   access control, routes admissions.
//! - [`stream::Stream`]: in-memory fan-out from one publisher to many
//!   readers.
//! - [`asyncwriter::AsyncWriter`]: the bounded queue that keeps slow
//!   readers from ever blocking a publisher.
//! - [`session`]: per-connection lifecycle, illustrated by the SRT-style
//!   session.
//! - [`record::Agent`]: consumes a stream and emits segmented files.
//! - [`source`]: server-originated publishers with retry.

pub mod asyncwriter;
pub mod auth;
pub mod conf;
pub mod error;
pub mod media;
pub mod path;
pub mod record;
pub mod session;
pub mod source;
pub mod stats;
pub mod stream;

pub use error::{Error, Result};
