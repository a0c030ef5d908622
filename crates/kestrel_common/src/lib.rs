//! Shared types, configuration, and the error taxonomy used by every
//! Kestrel crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ExecutionConfig, KestrelConfig};
pub use error::{ErrorContext, ErrorKind, KestrelError, KestrelResult};
pub use types::{CollectionId, RangeId, Rid};
