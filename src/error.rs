use thiserror::Error;

/// Errors raised while selecting, injecting and monitoring faults.
///
/// Most variants are local to one iteration and end up as an outcome in the
/// result record. Only the variants reported by [`Error::is_fatal_for_worker`]
/// leave the fault injector and stop a worker.
#[derive(Error, Debug)]
pub enum Error {
    /// The debugger transport could not be opened.
    #[error("Debugger link unavailable: {0}")]
    LinkUnavailable(String),

    /// An expected response was not seen or a known error message was found.
    #[error("{label}: {detail}")]
    Protocol { label: String, detail: String },

    /// Read-back after writing an injected value did not match.
    #[error("Injection not applied to {location}: wrote {expected:#x}, read back {actual:#x}")]
    Verification {
        location: String,
        expected: u64,
        actual: u64,
    },

    /// Weight computation or target index filter is inconsistent.
    #[error("Selection error: {0}")]
    Selection(String),

    /// An allow-list names a target or register the catalog does not have.
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    /// File send/get failed after all attempts.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// A blocking read exceeded its bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Catalog or campaign configuration is malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operator cancelled the run.
    #[error("Interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Builds a protocol error with the label of the failed command.
    pub fn protocol(label: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Protocol {
            label: label.into(),
            detail: detail.into(),
        }
    }

    /// Errors that must not be absorbed into an iteration outcome.
    pub fn is_fatal_for_worker(&self) -> bool {
        matches!(
            self,
            Error::LinkUnavailable(_)
                | Error::Interrupted
                | Error::Selection(_)
                | Error::InvalidSelection(_)
                | Error::Config(_)
        )
    }

    /// Short outcome text stored in the result record.
    pub fn outcome(&self) -> String {
        match self {
            Error::Protocol { label, .. } => label.clone(),
            Error::Verification { .. } => "Error injecting fault".to_string(),
            Error::Timeout(_) => "Timeout".to_string(),
            Error::Transfer(_) => "Retrieval error".to_string(),
            Error::Interrupted => "Interrupted".to_string(),
            other => other.to_string(),
        }
    }
}
