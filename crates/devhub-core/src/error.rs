//! Error taxonomy shared by the core and the plugin boundary

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DevhubError {
    #[error("null handle passed to {0}")]
    NullHandle(&'static str),
    #[error("wrong capability: expected a {expected} device, got a {actual} device")]
    WrongCapability {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("already registered: {0}")]
    DuplicateRegistration(String),
    #[error("no connection attached to the registration context")]
    UnavailableConnection,
    #[error("allocation failed: {0}")]
    AllocationFailure(String),
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("update re-entered on device {0}")]
    ReentrantUpdate(String),
    #[error("device callback failed: {0}")]
    CallbackFailed(String),
    #[error("plugin context {0} is closed")]
    ContextClosed(String),
    #[error("failed to spawn wait loop thread: {0}")]
    ThreadSpawn(String),
}

pub type Result<T> = std::result::Result<T, DevhubError>;

/// Render a caught panic payload as text
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
