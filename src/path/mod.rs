//! Paths
//!
//! The namespace of the server: the manager owns a registry of paths, each
//! path runs its own event loop coordinating one publisher, any number of
//! readers, an optional recorder and an optional static source.

mod manager;
mod messages;
#[allow(clippy::module_inception)]
mod path;

pub use manager::{ManagerOptions, PathManager};
pub use messages::{DescribeAnswer, PathSnapshot, SessionHandle, SessionKind};
pub use path::PathHandle;
