use std::io;
use thiserror::Error;

/// Errors which stop the collector before it starts listening.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to load the configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Failed to fetch {url}: {source}")]
    UpstreamFetch { url: String, source: reqwest::Error },

    #[error("Failed to fetch {url}: server answered {status}")]
    UpstreamStatus { url: String, status: reqwest::StatusCode },

    #[error("Failed to read the range file: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to bind udp socket to {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
