//! Aggregated error re-exports for the vaultenc-core crate.
//!
//! Each subsystem defines its own `thiserror` enum close to its implementation;
//! this module only re-exports them so callers can `use vaultenc_core::error::*`.

pub use crate::audit::AuditError;
pub use crate::config::ConfigError;
pub use crate::envelope::{EnvelopeError, HeaderError};
pub use crate::kms::KmsError;
pub use crate::processor::ProcessError;
pub use crate::queue::QueueError;
pub use crate::rewrap::RewrapError;
pub use crate::secure_buffer::SecureBufferError;
pub use crate::supervisor::SupervisorError;
pub use crate::watcher::WatchError;
