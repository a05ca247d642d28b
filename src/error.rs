//! Main Crate Error

use crate::common::ID_SIZE;

#[derive(thiserror::Error, Debug)]
/// overlay-dht crate error enum.
pub enum Error {
    /// Id bytes of the wrong length.
    #[error("Invalid Id size, expected {ID_SIZE}, got {0}")]
    InvalidIdSize(usize),

    /// Id string that is not hex of the right length.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    /// Rpc methods could not be registered.
    Rpc(#[from] crate::rpc::RpcError),

    #[error(transparent)]
    /// The actor thread stopped before answering.
    Shutdown(#[from] crate::dht::DhtWasShutdown),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// A decoded message violates the envelope rules.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// An enum tag received over the wire that this node does not know.
    #[error("Unknown {0} variant: {1}")]
    UnknownVariant(&'static str, u8),
}

/// Alias for `Result<T, Error>`.
pub type Result<T, E = Error> = core::result::Result<T, E>;
