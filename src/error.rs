use thiserror::Error;

/// Network failure or non-2xx status while fetching a document or calling a webhook.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("{0} is already being fetched")]
    InFlight(String),
}

impl FetchError {
    pub fn network(url: &str, err: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Raised internally by the DOM extraction path. Never escapes `extract`.
#[derive(Debug, Error)]
#[error("extraction failed: {0}")]
pub struct ExtractionError(pub String);

#[derive(Debug, Error)]
pub enum RelayDeliveryError {
    #[error("no context registered as {0}")]
    Unreachable(String),
    #[error("delivery to {target} dropped after {attempts} attempts")]
    Exhausted { target: String, attempts: u32 },
}

/// The analysis service answered with something that is not an analysis.
#[derive(Debug, Error)]
pub enum MalformedResponseError {
    #[error("response is not JSON: {0}")]
    NotJson(String),
    #[error("expected an object or a single-element array, got {0}")]
    UnexpectedShape(&'static str),
    #[error("response has no numeric score")]
    MissingScore,
    #[error("response has no items or itemList")]
    MissingItems,
    #[error("analysis item {index} is invalid: {message}")]
    InvalidItem { index: usize, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{0} is not configured")]
    Missing(&'static str),
    #[error("{key} must be an absolute http(s) url, got {value:?}")]
    InvalidUrl { key: String, value: String },
    #[error("unknown setting {0}")]
    UnknownKey(String),
    #[error("settings store: {0}")]
    Store(String),
}

/// Crate-level error for callers that drive the whole pipeline.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Relay(#[from] RelayDeliveryError),
    #[error(transparent)]
    Malformed(#[from] MalformedResponseError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;
