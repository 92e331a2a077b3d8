//! Slave-Side Remote Client
//!
//! Blocking TCP client used from inside a cache's single-flight load, plus
//! the [`RemoteLoader`] decorator that turns any local loader into a
//! remote-first one. Every transport or protocol problem degrades to the
//! wrapped local loader; the business caller never sees the remote layer
//! fail.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::remote::header::{RemoteCacheHeader, Status, HEADER_SIZE, PROTOCOL_VERSION};
use crate::remote::{FetchRequest, RemoteEndpoint};
use crate::store::Loader;
use crate::value::{decode_records, RecordSet};

/// Upper bound on a response body; larger claims are protocol errors
const MAX_PAYLOAD: u64 = 256 * 1024 * 1024;

/// Transport timeouts for one master exchange
#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// One-exchange-per-call blocking client. Connections are not pooled; a
/// miss is already a slow path and the master holds no per-client state.
pub struct RemoteClient {
    endpoint: RemoteEndpoint,
    config: RemoteClientConfig,
}

impl RemoteClient {
    pub fn new(endpoint: RemoteEndpoint, config: RemoteClientConfig) -> Self {
        Self { endpoint, config }
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> Error {
        Error::RemoteUnavailable {
            endpoint: self.endpoint.addr(),
            reason: reason.to_string(),
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = self
            .endpoint
            .addr()
            .to_socket_addrs()
            .map_err(|e| self.unavailable(e))?
            .next()
            .ok_or_else(|| self.unavailable("address resolved to nothing"))?;
        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            .map_err(|e| self.unavailable(e))?;
        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|e| self.unavailable(e))?;
        stream
            .set_write_timeout(Some(self.config.write_timeout))
            .map_err(|e| self.unavailable(e))?;
        Ok(stream)
    }

    /// Send one request frame and read back the response frame.
    pub fn fetch(&self, request: &FetchRequest) -> Result<(RemoteCacheHeader, Vec<u8>)> {
        let body = rmp_serde::to_vec(request).map_err(|e| Error::Codec(e.to_string()))?;
        let header = RemoteCacheHeader::new(Status::None, body.len() as u64, body.len() as u64);

        let mut stream = self.connect()?;
        stream
            .write_all(&header.encode())
            .map_err(|e| self.unavailable(e))?;
        stream.write_all(&body).map_err(|e| self.unavailable(e))?;
        stream.flush().map_err(|e| self.unavailable(e))?;

        let mut header_buf = [0u8; HEADER_SIZE];
        stream
            .read_exact(&mut header_buf)
            .map_err(|e| self.unavailable(e))?;
        let response = RemoteCacheHeader::decode(&header_buf)?;
        if response.payload_size > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "response claims {} payload bytes",
                response.payload_size
            )));
        }

        let mut payload = vec![0u8; response.payload_size as usize];
        stream
            .read_exact(&mut payload)
            .map_err(|e| self.unavailable(e))?;
        Ok((response, payload))
    }
}

/// Loader decorator: try the master first, compute locally when it cannot
/// serve. One retry on transport failure, then local compute; only loader
/// failures themselves surface to the caller.
pub struct RemoteLoader<K, R> {
    data_type: String,
    database_id: String,
    client: RemoteClient,
    local: Arc<dyn Loader<K, R>>,
    _records: PhantomData<fn(&K) -> R>,
}

impl<K, R> RemoteLoader<K, R>
where
    K: Serialize + Send + Sync,
    R: DeserializeOwned + Send + Sync,
{
    pub fn new(
        data_type: impl Into<String>,
        database_id: impl Into<String>,
        client: RemoteClient,
        local: Arc<dyn Loader<K, R>>,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            database_id: database_id.into(),
            client,
            local,
            _records: PhantomData,
        }
    }

    fn fetch_remote(&self, key: &K) -> Result<RecordSet<R>> {
        let request = FetchRequest {
            data_type: self.data_type.clone(),
            database_id: self.database_id.clone(),
            key: rmp_serde::to_vec(key).map_err(|e| Error::Codec(e.to_string()))?,
        };

        let (header, payload) = match self.client.fetch(&request) {
            Ok(frame) => frame,
            // One retry covers a stale connection or a master mid-restart
            Err(Error::RemoteUnavailable { .. }) => self.client.fetch(&request)?,
            Err(e) => return Err(e),
        };

        if header.protocol_version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "master speaks protocol {}, expected {}",
                header.protocol_version, PROTOCOL_VERSION
            )));
        }
        if header.payload_size != payload.len() as u64 {
            return Err(Error::Protocol(format!(
                "header claims {} payload bytes, read {}",
                header.payload_size,
                payload.len()
            )));
        }

        match header.status() {
            Some(Status::SimpleValue) => {
                decode_records(&payload).map_err(|e| Error::Protocol(e.to_string()))
            }
            Some(Status::CompressedValue) => {
                // Peer-controlled length; reject before the i32 narrowing
                // lz4 requires
                if header.inflated_size > MAX_PAYLOAD {
                    return Err(Error::Protocol(format!(
                        "response claims {} inflated bytes",
                        header.inflated_size
                    )));
                }
                let plain = lz4::block::decompress(&payload, Some(header.inflated_size as i32))
                    .map_err(|e| Error::Protocol(format!("inflate failed: {}", e)))?;
                if plain.len() as u64 != header.inflated_size {
                    return Err(Error::Protocol(format!(
                        "inflated to {} bytes, header claims {}",
                        plain.len(),
                        header.inflated_size
                    )));
                }
                decode_records(&plain).map_err(|e| Error::Protocol(e.to_string()))
            }
            Some(Status::NotFound) | Some(Status::None) | None => Err(Error::RemoteStatus {
                endpoint: self.client.endpoint().addr(),
                status: header.status,
            }),
        }
    }
}

impl<K, R> Loader<K, R> for RemoteLoader<K, R>
where
    K: Serialize + Send + Sync,
    R: DeserializeOwned + Send + Sync,
{
    fn create(&self, key: &K) -> Result<RecordSet<R>> {
        match self.fetch_remote(key) {
            Ok(value) => {
                debug!(data_type = %self.data_type, "served from remote master");
                Ok(value)
            }
            Err(e) if e.is_remote_recoverable() => {
                warn!(
                    data_type = %self.data_type,
                    endpoint = %self.client.endpoint().addr(),
                    error = %e,
                    "remote fetch failed, computing locally"
                );
                self.local.create(key)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct LocalLoader(AtomicUsize);

    impl Loader<String, u32> for LocalLoader {
        fn create(&self, _key: &String) -> Result<RecordSet<u32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(RecordSet::new(vec![42]))
        }
    }

    #[test]
    fn test_dead_endpoint_falls_back_to_local() {
        // Reserved port on localhost, nothing listens
        let endpoint = RemoteEndpoint::new("127.0.0.1", 1);
        let config = RemoteClientConfig {
            connect_timeout: Duration::from_millis(200),
            ..RemoteClientConfig::default()
        };
        let local = Arc::new(LocalLoader(AtomicUsize::new(0)));
        let loader = RemoteLoader::new(
            "FareRule",
            "prod",
            RemoteClient::new(endpoint, config),
            local.clone() as Arc<dyn Loader<String, u32>>,
        );

        let value = loader.create(&"PG".to_string()).unwrap();
        assert_eq!(value.records(), &[42]);
        assert_eq!(local.0.load(Ordering::SeqCst), 1);
    }
}
