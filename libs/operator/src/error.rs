use thiserror::Error;

/// Top-level error type for the reverse-GitOps pipeline.
///
/// Each module with its own failure modes (sanitization, destination
/// resolution, the commit worker, encryption, admission decoding) owns a
/// narrower `Error` enum; this one composes them at the crate boundary via
/// `#[from]`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes reported error: {0}")]
    Kube(#[from] kube::Error),

    #[error("sanitization failed: {0}")]
    Sanitize(#[from] crate::sanitize::Error),

    #[error("destination resolution failed: {0}")]
    Destination(#[from] crate::destination::Error),

    #[error("commit worker failed: {0}")]
    Worker(#[from] crate::worker::Error),

    #[error("encryption failed: {0}")]
    Encryption(#[from] crate::encryption::Error),

    #[error("admission review failed: {0}")]
    Admission(#[from] crate::admission::Error),

    #[error("invalid user input: {0}")]
    UserInput(String),
}

impl Error {
    /// Stable label used in the `{error}` metrics dimension; avoids leaking
    /// free-form error text (which may contain resource names) into a
    /// metrics label's cardinality.
    pub fn metric_label(&self) -> String {
        match self {
            Error::Kube(_) => "kube".to_owned(),
            Error::Sanitize(_) => "sanitize".to_owned(),
            Error::Destination(_) => "destination".to_owned(),
            Error::Worker(_) => "worker".to_owned(),
            Error::Encryption(_) => "encryption".to_owned(),
            Error::Admission(_) => "admission".to_owned(),
            Error::UserInput(_) => "user_input".to_owned(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
