//! Error taxonomy for the composition engine.
//!
//! Four kinds of failure cross the public surface:
//!
//! - `Protocol` - unrecoverable misuse of the component execution
//!   protocol (double props pull, a finalized generator yielding again,
//!   tag mismatch during an in-place update). These abort the operation.
//! - `Component` - an error raised by a component body during its own
//!   step. If the body declares the catch capability it gets the error
//!   injected back; otherwise it propagates to the update/refresh caller.
//! - `Listener` - an error returned by an event listener. Reported to
//!   the diagnostic channel, never interrupts dispatch.
//! - `Adapter` - a host adapter operation failed.

use thiserror::Error;

/// Errors produced by the renderer, controllers, and dispatch.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Unrecoverable violation of the component execution protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An error raised by a component body during a step.
    #[error("component error: {0}")]
    Component(String),

    /// An error returned by an event listener callback.
    #[error("listener error: {0}")]
    Listener(String),

    /// A host/control tag combination the renderer cannot handle.
    #[error("unknown tag: {0}")]
    UnknownTag(String),

    /// A host adapter operation failed.
    #[error("adapter error: {0}")]
    Adapter(String),
}

impl RenderError {
    /// True for faults that must abort the operation outright.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::Protocol(_) | RenderError::UnknownTag(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = RenderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RenderError::Protocol("x".into()).is_fatal());
        assert!(RenderError::UnknownTag("x".into()).is_fatal());
        assert!(!RenderError::Component("x".into()).is_fatal());
        assert!(!RenderError::Listener("x".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = RenderError::Protocol("zombie iterator".into());
        assert_eq!(err.to_string(), "protocol violation: zombie iterator");
    }
}
