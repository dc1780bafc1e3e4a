//!
//! src/errors.rs  Andrew Belles  Oct 4th, 2025
//!
//! Defines enums and methods of error conversion
//! for errors the etl pipeline uses. Variants are grouped by how
//! the pipeline reacts to them: transient (retried), upstream-permanent
//! (typed outcome, never retried), and fatal (aborts the run)
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("upstream {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("data integrity violated: {0}")]
    DataIntegrity(String),
    #[error("stage {stage} failure rate {failed}/{total} over threshold")]
    FailureRate { stage: String, failed: usize, total: usize },
    #[error("run cancelled")]
    Cancelled,
    #[error("worker task failed: {0}")]
    Join(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl EtlError {
    /// Failures worth another attempt within the same run
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::Http(_) | EtlError::Timeout(_) | EtlError::RateLimited(_) => true,
            EtlError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, EtlError::QuotaExceeded(_) | EtlError::RateLimited(_))
    }

    /// Errors that must abort the run and block retirement of the previous one
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EtlError::DataIntegrity(_) | EtlError::FailureRate { .. } | EtlError::Cancelled
        )
    }
}

impl From<reqwest::Error> for EtlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return EtlError::Timeout(e.to_string());
        }
        if let Some(status) = e.status() {
            return EtlError::Upstream { status: status.as_u16(), message: e.to_string() };
        }
        EtlError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for EtlError {
    fn from(e: serde_json::Error) -> Self { EtlError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for EtlError {
    fn from(e: sqlx::Error) -> Self { EtlError::Db(e.to_string()) }
}

impl From<url::ParseError> for EtlError {
    fn from(e: url::ParseError) -> Self { EtlError::Config(format!("url: {e}")) }
}

impl From<cron::error::Error> for EtlError {
    fn from(e: cron::error::Error) -> Self { EtlError::Config(format!("cron: {e}")) }
}
