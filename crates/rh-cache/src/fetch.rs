//! Single download attempts.
//!
//! A [`Fetcher`] performs exactly one attempt and classifies its failure; the
//! retry loop lives in [`crate::DataCache`].

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Stall limit used by [`HttpFetcher::with_default_timeout`].
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

pub trait Fetcher: Send + Sync {
    /// Download `url` into `destination`, truncating whatever is there.
    /// Returns the number of bytes written.
    fn fetch(&self, url: &str, destination: &Path) -> Result<u64, FetchAttemptError>;
}

#[derive(Debug)]
pub enum FetchAttemptError {
    /// Connection, timeout or body-read failure.
    Transport(String),
    /// The server answered with a non-success status.
    Status(u16),
    /// The local destination could not be written.
    Io(std::io::Error),
}

impl FetchAttemptError {
    /// Every remote failure, whatever the status, gets another attempt.
    /// Only a local write failure is final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

impl std::fmt::Display for FetchAttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::Status(code) => write!(f, "server responded with status {code}"),
            Self::Io(err) => write!(f, "local write failed: {err}"),
        }
    }
}

impl std::error::Error for FetchAttemptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Blocking HTTP(S) fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// `stall_timeout` bounds connecting, waiting for response headers and
    /// each individual body read. A large dataset that keeps arriving is
    /// never cut off however long the whole transfer takes.
    pub fn new(stall_timeout: Duration) -> Result<Self, FetchAttemptError> {
        // The blocking client applies `timeout` per read of the response
        // body, not to the transfer as a whole.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(stall_timeout)
            .timeout(stall_timeout)
            .build()
            .map_err(|err| FetchAttemptError::Transport(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_default_timeout() -> Result<Self, FetchAttemptError> {
        Self::new(DEFAULT_ATTEMPT_TIMEOUT)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<u64, FetchAttemptError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchAttemptError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchAttemptError::Status(status.as_u16()));
        }

        let mut file = File::create(destination).map_err(FetchAttemptError::Io)?;
        // Body read and file write failures both surface here; treated as transport.
        let written = std::io::copy(&mut response, &mut file)
            .map_err(|err| FetchAttemptError::Transport(err.to_string()))?;
        file.flush().map_err(FetchAttemptError::Io)?;
        file.sync_all().map_err(FetchAttemptError::Io)?;
        Ok(written)
    }
}
