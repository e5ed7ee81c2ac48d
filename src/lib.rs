#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod record;
pub mod registry;
pub mod server;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod wire;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types the binaries and tests reach for most often.
pub use crate::clock::LamportClock;
pub use crate::config::Config;
pub use crate::record::{ChannelRecord, LoginRecord, MessageRecord, StateSnapshot};
pub use crate::store::{DataStore, Kind};
pub use crate::wire::proto::{
    ClientRequest, ElectionRequest, Meta, PeerInfo, PeerRequest, Publication, RegistryRequest,
    Reply, ReplyBody, Status,
};
