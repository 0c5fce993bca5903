use thiserror::Error;

use crate::classify::OutputMode;
use crate::dataset::DatasetKind;
use crate::grid::GeographicBounds;

/// Failure of a single remote fetch, after any retries.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Timeout, refused connection, reset, or another transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a non-success HTTP status.
    #[error("server returned HTTP {status}: {message}")]
    Server { status: u16, message: String },

    /// The payload was not a raster of the requested shape and sample type.
    #[error("could not decode service response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, HTTP 5xx and HTTP 429 are transient. Decode
    /// failures and other HTTP statuses point at a contract violation and
    /// are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Server { status, .. } => *status >= 500 || *status == 429,
            FetchError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FetchError::Server {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None if err.is_decode() => FetchError::Decode(err.to_string()),
            None => FetchError::Network(err.to_string()),
        }
    }
}

impl From<tiff::TiffError> for FetchError {
    fn from(err: tiff::TiffError) -> Self {
        FetchError::Decode(err.to_string())
    }
}

/// Precondition failures that stop a download before any network I/O.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("invalid bounds {bounds}: {reason}")]
    InvalidBounds {
        bounds: GeographicBounds,
        reason: &'static str,
    },

    #[error("no output mode requested")]
    NoModes,

    #[error("output mode {mode} is not available for dataset {dataset}")]
    UnsupportedMode {
        dataset: DatasetKind,
        mode: OutputMode,
    },

    #[error(
        "selected area is {width} x {height} pixels, larger than the {max} x {max} single-request \
         limit; enable tiled download or select a smaller area"
    )]
    WindowTooLarge { width: usize, height: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not start tile fetch workers: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
