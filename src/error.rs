//! Crate-wide error type and result alias.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("email address error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("email message error: {0}")]
    Email(#[from] lettre::error::Error),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unknown channel: {0}")]
    ChannelNotFound(String),

    #[error("secret {namespace}/{name} has no key {key}")]
    MissingSecretKey {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("{0}")]
    Delivery(String),
}

impl Error {
    /// Whether this error came from a backend that refused to accept more
    /// traffic right now, as opposed to a delivery or configuration failure.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }
}
