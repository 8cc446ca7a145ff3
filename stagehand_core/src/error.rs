//! Error types for the remote-automation capability.
//!
//! The probe and actions interfaces are supplied by the calling application,
//! so every failure they can raise is funnelled through [`AutomationError`].

/// Coarse category of an [`AutomationError`].
///
/// Failure classifiers branch on the kind rather than on message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Element could not be located (possibly not rendered yet)
    ElementNotFound,
    /// Remote application did not answer in time
    Timeout,
    /// Element is covered by something else
    InteractionBlocked,
    /// Navigation did not land where expected
    Navigation,
    /// Transport-level failure
    Network,
    /// Credentials rejected or session unrecoverable
    Authentication,
    /// Capability does not implement the requested operation
    Unsupported,
    /// Anything else
    Other,
}

/// Errors raised by the injected probe/actions capability.
#[derive(thiserror::Error, Debug)]
pub enum AutomationError {
    /// Element could not be located.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Remote operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Interaction was intercepted by another element.
    #[error("Interaction blocked: {0}")]
    InteractionBlocked(String),

    /// Navigation failed.
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// Network failure while talking to the remote application.
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The capability does not support this operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Error from the underlying driver.
    #[error("Automation error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AutomationError {
    /// Returns the coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AutomationError::ElementNotFound(_) => ErrorKind::ElementNotFound,
            AutomationError::Timeout(_) => ErrorKind::Timeout,
            AutomationError::InteractionBlocked(_) => ErrorKind::InteractionBlocked,
            AutomationError::Navigation(_) => ErrorKind::Navigation,
            AutomationError::Network(_) => ErrorKind::Network,
            AutomationError::AuthenticationFailed(_) => ErrorKind::Authentication,
            AutomationError::Unsupported(_) => ErrorKind::Unsupported,
            AutomationError::Other(_) => ErrorKind::Other,
        }
    }

    /// Returns true for failures that are expected to clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ElementNotFound
                | ErrorKind::Timeout
                | ErrorKind::InteractionBlocked
                | ErrorKind::Navigation
                | ErrorKind::Network
        )
    }
}

/// Type alias for Result with AutomationError.
pub type Result<T> = std::result::Result<T, AutomationError>;
