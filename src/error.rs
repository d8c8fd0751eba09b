use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the detection pipeline.
///
/// `NonHtmlContent` is a control signal rather than a fault: the pipeline
/// converts it into a definitive clean verdict. Everything else is an
/// infrastructure failure and must never be written to the cache or corpus.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("unprocessable domain name: {0}")]
    InvalidDomain(String),
    #[error("non-HTML content")]
    NonHtmlContent,
    #[error("page fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("corpus query failed: {0}")]
    Corpus(#[from] sqlx::Error),
}

/// Failures from the render-to-image collaborator.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to launch renderer: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("renderer exited abnormally: {0}")]
    Failed(String),
    #[error("render timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures from the certificate issuance collaborator. Aborts only the
/// affected TLS handshake, never the listener.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::RcgenError),
    #[error("generated key rejected by TLS backend")]
    BadKey,
    #[error("CA material unreadable: {0}")]
    Io(#[from] std::io::Error),
}

/// A single fingerprint computation failed. Recovered locally: the hash is
/// recorded as an empty string and excluded from matching.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("empty input")]
    EmptyInput,
    #[error("header complexity too low to be accurate ({0:.3})")]
    LowComplexity(f64),
}

/// Connection-scoped proxy failures. Converted into an error response or a
/// silent drop at the connection boundary.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request head")]
    BadRequest,
    #[error("client timed out")]
    Timeout,
    #[error("upstream dial failed: {0}")]
    Upstream(String),
    #[error("tls handshake failed: {0}")]
    Tls(String),
}
