use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::wire::frame::FrameError;
use crate::wire::proto::{ProtoDecodeError, ProtoEncodeError};

/// Crate-level convenience error.
///
/// Thin wrapper over the subsystem errors; the replica itself swallows
/// peer-side failures and only surfaces fatal startup problems through this.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),

    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("registry registration failed: {0}")]
    Registration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
