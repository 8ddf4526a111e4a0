use thiserror::Error;

/// The reason a [`Fetcher`](super::Fetcher) could not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The source responded, but the payload could not be turned into a value.
    ///
    /// The attached string contains details about the payload.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// The payload was recognized, but failed to parse.
    #[error("parse error: {0}")]
    ParseError(String),
    /// The source does not have the requested object.
    #[error("source not found")]
    NotFound,
}

/// An error that happens when looking up, fetching or deriving a cached value.
///
/// Every variant is cheap to clone, as a single result is fanned out to all the callers that
/// were coalesced onto the same operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// No cached value exists, and there is no way to produce one.
    #[error("not found")]
    NotFound,
    /// A value could not be converted from or into its persisted bytes.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// Reading or writing the disk tier failed.
    #[error("i/o error: {0}")]
    Io(String),
    /// The [`Fetcher`](super::Fetcher) failed.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    /// A [`Processor`](super::Processor) in the chain failed.
    #[error("processing failed: {0}")]
    Processing(String),
    /// The operation was canceled before it completed.
    #[error("canceled")]
    Canceled,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound;
        }
        let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
        tracing::debug!(error = dynerr, "cache i/o failure");
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl CacheError {
    /// Creates a [`CacheError::Processing`] from anything printable.
    pub fn processing(details: impl std::fmt::Display) -> Self {
        Self::Processing(details.to_string())
    }

    /// Whether this error means the value is simply absent.
    ///
    /// The orchestrator treats these as a miss and continues down the fallback chain.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::NotFound | Self::Serialization(_))
    }

    /// A short tag used for metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Fetch(_) => "fetch",
            Self::Processing(_) => "processing",
            Self::Canceled => "canceled",
        }
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the reason why a
/// value could not be produced.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
