//! Common error types for storage operations

/// A common error type for configuration storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No configuration has been written for this client id.
    #[error("no configuration stored for client {0}")]
    NotFound(String),
    /// Reading from the backing store failed.
    #[error("read failed: {0}")]
    ReadError(#[source] std::io::Error),
    /// Writing to the backing store failed. The previous value is still intact.
    #[error("write failed: {0}")]
    WriteError(#[source] std::io::Error),
    /// The stored bytes do not match their checksum.
    #[error("stored configuration for {client_id} is corrupt (crc {expected:08x} != {actual:08x})")]
    Corrupt {
        client_id: String,
        expected: u32,
        actual: u32,
    },
    /// The configuration could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The client id cannot be used as a storage key.
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}
