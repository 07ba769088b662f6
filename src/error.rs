//! Internal error kinds.
//!
//! None of these are returned to the host as `Result`s: per the propagation
//! policy, every fallible creation operation returns a null handle (or a
//! `bool` for submission), and logs exactly one line through [`log`]. This
//! enum exists so that the reason for the failure can be threaded from the
//! point of detection to that single log call without building a string
//! along the way.

use thiserror::Error;

/// Reasons a core operation can fail, kept internal to this crate.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("allocation failed for a resource of {size} bytes")]
    AllocationFailed { size: u64 },

    #[error("unsupported format: {0:?}")]
    UnsupportedFormat(crate::format::Format),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("device lost")]
    DeviceLost,
}

impl DeviceError {
    /// Logs the error at the appropriate level and returns it, so call sites
    /// can write `return log_and_return(DeviceError::AllocationFailed { .. });`.
    pub(crate) fn log(self) -> Self {
        match &self {
            DeviceError::DeviceLost => log::error!("{self}"),
            _ => log::error!("{self}"),
        }
        self
    }
}
