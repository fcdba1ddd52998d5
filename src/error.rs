use std::time::Duration;

/// Why a single request or render did not produce a document.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("browser: {0}")]
    Browser(String),

    #[error("script: {0}")]
    Script(String),
}

impl FetchError {
    /// Whether another attempt at the same page can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Status(404 | 410))
    }
}

impl From<chromiumoxide::error::CdpError> for FetchError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        FetchError::Browser(e.to_string())
    }
}

/// Failures that prevent a run from starting at all.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("render backend unavailable: {0}")]
    RenderUnavailable(String),

    #[error("http client could not be built: {0}")]
    ClientBuild(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("csv buffer: {0}")]
    Buffer(String),

    #[error("csv output is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
