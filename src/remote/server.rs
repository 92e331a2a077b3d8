//! Master-Side Cache Server
//!
//! Accepts slave connections and serves values out of the process-wide
//! registry. The network side runs on the async runtime; cache lookups go
//! through `spawn_blocking` because a cold key runs the synchronous loader.
//!
//! A connection carries any number of request frames. Malformed frames
//! close the connection; servable misses (unknown cache, wrong identity,
//! loader failure) answer with a status the slave turns into local compute.

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::registry::CacheRegistry;
use crate::remote::header::{RemoteCacheHeader, Status, HEADER_SIZE, PROTOCOL_VERSION};
use crate::remote::FetchRequest;

/// Request bodies larger than this close the connection
const MAX_REQUEST: u64 = 16 * 1024 * 1024;

pub struct MasterServer {
    registry: Arc<CacheRegistry>,
}

impl MasterServer {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self { registry }
    }

    /// Accept loop; runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "remote cache master listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!(%peer, error = %e, "connection closed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        loop {
            let mut header_buf = [0u8; HEADER_SIZE];
            match stream.read_exact(&mut header_buf).await {
                Ok(_) => {}
                // Clean end of the request stream
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
            let header = RemoteCacheHeader::decode(&header_buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if header.payload_size > MAX_REQUEST {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("request claims {} payload bytes", header.payload_size),
                ));
            }

            let mut body = vec![0u8; header.payload_size as usize];
            stream.read_exact(&mut body).await?;

            let (response, payload) = if header.protocol_version != PROTOCOL_VERSION {
                // Answer with our version; the slave detects the drift
                (RemoteCacheHeader::new(Status::None, 0, 0), Bytes::new())
            } else {
                match rmp_serde::from_slice::<FetchRequest>(&body) {
                    Ok(request) => self.dispatch(request).await,
                    Err(e) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("bad request frame: {}", e),
                        ))
                    }
                }
            };

            stream.write_all(&response.encode()).await?;
            stream.write_all(&payload).await?;
            stream.flush().await?;
        }
    }

    /// Resolve one request against the registry on the blocking pool.
    async fn dispatch(&self, request: FetchRequest) -> (RemoteCacheHeader, Bytes) {
        if request.database_id != self.registry.database_id() {
            debug!(
                data_type = %request.data_type,
                theirs = %request.database_id,
                ours = %self.registry.database_id(),
                "identity mismatch"
            );
            return (RemoteCacheHeader::new(Status::NotFound, 0, 0), Bytes::new());
        }

        let registry = Arc::clone(&self.registry);
        let data_type = request.data_type.clone();
        let result = tokio::task::spawn_blocking(move || {
            registry.fetch_payload(&request.data_type, &request.key)
        })
        .await;

        match result {
            Ok(Ok(payload)) => {
                let status = if payload.compressed {
                    Status::CompressedValue
                } else {
                    Status::SimpleValue
                };
                let header = RemoteCacheHeader::new(
                    status,
                    payload.bytes.len() as u64,
                    payload.inflated_len,
                );
                (header, payload.bytes)
            }
            Ok(Err(Error::Config(reason))) => {
                debug!(data_type = %data_type, %reason, "cache not served here");
                (RemoteCacheHeader::new(Status::NotFound, 0, 0), Bytes::new())
            }
            Ok(Err(e)) => {
                warn!(data_type = %data_type, error = %e, "failed to serve value");
                (RemoteCacheHeader::new(Status::None, 0, 0), Bytes::new())
            }
            Err(join_error) => {
                warn!(data_type = %data_type, error = %join_error, "lookup task panicked");
                (RemoteCacheHeader::new(Status::None, 0, 0), Bytes::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(listener_registry: Arc<CacheRegistry>, request: FetchRequest) -> (RemoteCacheHeader, Vec<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(MasterServer::new(listener_registry));
        tokio::spawn(server.serve(listener));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let body = rmp_serde::to_vec(&request).unwrap();
        let header = RemoteCacheHeader::new(Status::None, body.len() as u64, body.len() as u64);
        stream.write_all(&header.encode()).await.unwrap();
        stream.write_all(&body).await.unwrap();

        let mut header_buf = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header_buf).await.unwrap();
        let response = RemoteCacheHeader::decode(&header_buf).unwrap();
        let mut payload = vec![0u8; response.payload_size as usize];
        stream.read_exact(&mut payload).await.unwrap();
        (response, payload)
    }

    #[tokio::test]
    async fn test_unknown_cache_answers_not_found() {
        let registry = Arc::new(CacheRegistry::new("prod"));
        let (response, payload) = exchange(
            registry,
            FetchRequest {
                data_type: "Nowhere".into(),
                database_id: "prod".into(),
                key: vec![],
            },
        )
        .await;
        assert_eq!(response.status(), Some(Status::NotFound));
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_identity_mismatch_answers_not_found() {
        let registry = Arc::new(CacheRegistry::new("prod"));
        let (response, _) = exchange(
            registry,
            FetchRequest {
                data_type: "Nowhere".into(),
                database_id: "staging".into(),
                key: vec![],
            },
        )
        .await;
        assert_eq!(response.status(), Some(Status::NotFound));
    }
}
