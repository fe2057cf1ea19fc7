//! Error types for stream-dns.

use thiserror::Error;

/// Errors that can occur in the DNS server and its ingestion path.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Record store error
    #[error("Store error: {0}")]
    Store(#[from] redb::Error),

    /// Record payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Stream source error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to parse address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A store write kept failing until the retry budget ran out.
    #[error("Write of key {key:?} failed after {attempts} attempts")]
    WriteExhausted {
        /// Key of the dropped entry.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The upstream resolver did not answer in time
    #[error("Upstream {0} timed out")]
    UpstreamTimeout(std::net::SocketAddr),

    /// A blocking task panicked or was cancelled
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<::config::ConfigError> for DnsError {
    fn from(err: ::config::ConfigError) -> Self {
        DnsError::Config(err.to_string())
    }
}

macro_rules! store_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for DnsError {
                fn from(err: $ty) -> Self {
                    DnsError::Store(err.into())
                }
            }
        )*
    };
}

store_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

#[cfg(feature = "kafka")]
impl From<rskafka::client::error::Error> for DnsError {
    fn from(err: rskafka::client::error::Error) -> Self {
        DnsError::Stream(err.to_string())
    }
}
