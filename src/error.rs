//! Error types and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading, validating or persisting the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist or could not be stat'ed
    #[error("configuration file '{}' not found: {source}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The payload is not valid JSON for the configuration format
    #[error("configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// The payload parsed but its content was rejected
    #[error("invalid configuration: {0}")]
    Validation(String),
    /// Reading or writing the configuration file failed
    #[error("configuration I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        ConfigError::Validation(message.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors building a forwarding pipeline. These indicate a broken host
/// mapping, never a client mistake.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("target '{0}' has no host")]
    MissingTarget(String),
    #[error("target '{0}' uses unsupported scheme '{1}'")]
    UnsupportedScheme(String, String),
    #[error("backend TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// Errors while talking to a backend
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Error codes for per-request failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No mapping exists for the requested host
    UnknownHost,
    /// The mapping exists but a pipeline could not be built for it
    PipelineBuildFailed,
    /// The backend could not be reached or failed mid-request
    BadGateway,
    /// The client exceeded its request budget for the current window
    RateLimited,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::PipelineBuildFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::PipelineBuildFailed => "PIPELINE_BUILD_FAILED",
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
            ProxyErrorCode::RateLimited => "RATE_LIMITED",
        }
    }
}

/// Body type used for every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a plain-text error response carrying an X-Proxy-Error header
pub fn text_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut body = message.into();
    body.push('\n');

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(hyper::header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
