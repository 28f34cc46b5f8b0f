//! Request/response transport shared by the adapters.
//!
//! Frames are a little-endian `u32` length followed by the payload, in both
//! directions. Each round trip opens its own connection so that concurrent
//! requests never interleave on one stream.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::FetchError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: u32 },
}

impl TransportError {
    /// Connection and I/O failures are transient; an oversized frame means
    /// the peer is not speaking the protocol we expect.
    pub fn into_fetch_error(self, backend: &str) -> FetchError {
        match self {
            TransportError::FrameTooLarge { .. } => FetchError::protocol(backend, self),
            other => FetchError::unavailable(backend, other),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request frame and return the response frame.
    async fn round_trip(&self, request: Bytes) -> Result<Bytes, TransportError>;
}

/// Length-prefixed frames over TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    endpoint: String,
    max_frame_bytes: u32,
}

impl TcpTransport {
    pub fn new(endpoint: impl Into<String>, max_frame_bytes: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_frame_bytes,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn round_trip(&self, request: Bytes) -> Result<Bytes, TransportError> {
        let mut stream =
            TcpStream::connect(&self.endpoint)
                .await
                .map_err(|source| TransportError::Connect {
                    endpoint: self.endpoint.clone(),
                    source,
                })?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, &request, self.max_frame_bytes).await?;
        read_frame(&mut stream, self.max_frame_bytes).await
    }
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: u32) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max as usize {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max,
        });
    }
    let len = (payload.len() as u32).to_le_bytes();
    writer.write_all(&len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R, max: u32) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > max {
        return Err(TransportError::FrameTooLarge {
            len: len as usize,
            max,
        });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&[u8]) -> Result<Bytes, TransportError> + Send + Sync>;

    /// In-process transport answering with a closure and recording requests.
    pub(crate) struct FnTransport {
        handler: Handler,
        pub(crate) requests: Mutex<Vec<Bytes>>,
        pub(crate) calls: AtomicUsize,
    }

    impl FnTransport {
        pub(crate) fn new<F>(handler: F) -> Self
        where
            F: Fn(&[u8]) -> Result<Bytes, TransportError> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn last_request(&self) -> Option<Bytes> {
            self.requests.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl Transport for FnTransport {
        async fn round_trip(&self, request: Bytes) -> Result<Bytes, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            (self.handler)(&request)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello", 64).await.unwrap();
        let frame = read_frame(&mut server, 64).await.unwrap();
        assert_eq!(&frame[..], b"hello");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[7u8; 32], 64).await.unwrap();
        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len: 32, max: 16 }));
        assert!(matches!(
            err.into_fetch_error("legacy"),
            FetchError::Protocol { .. }
        ));
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let req = read_frame(&mut sock, 1024).await.unwrap();
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&req);
            write_frame(&mut sock, &reply, 1024).await.unwrap();
        });

        let transport = TcpTransport::new(addr.to_string(), 1024);
        let resp = transport.round_trip(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&resp[..], b"echo:ping");
    }

    #[tokio::test]
    async fn test_connect_failure_is_unavailable() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let transport = TcpTransport::new(addr.to_string(), 1024);
        let err = transport.round_trip(Bytes::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(err.into_fetch_error("recas").is_retryable());
    }
}
