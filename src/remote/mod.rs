//! Remote Cache Protocol
//!
//! Binary master/slave exchange over TCP. A master process serves values it
//! has already computed (possibly still compressed); a slave process fetches
//! from the master on cache miss instead of running its own loader, falling
//! back to local compute when the master is unreachable, on a different
//! protocol version, or answering with a status the slave does not know.

mod client;
mod header;
mod server;

pub use client::{RemoteClient, RemoteClientConfig, RemoteLoader};
pub use header::{RemoteCacheHeader, Status, HEADER_SIZE, PROTOCOL_VERSION};
pub use server::MasterServer;

use serde::{Deserialize, Serialize};

/// Master address, as named caches configure it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Request body: which cache, whose data universe, and the serialized key.
///
/// `database_id` names the backing-store identity the slave was configured
/// against; a master serving a different universe answers NotFound rather
/// than handing over values from the wrong one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub data_type: String,
    pub database_id: String,
    pub key: Vec<u8>,
}
