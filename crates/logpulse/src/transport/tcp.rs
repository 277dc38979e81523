// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::constants::{CONNECT_TIMEOUT, WRITE_TIMEOUT};
use crate::errors::TransportError;
use crate::transport::Transport;

/// Persistent socket writer. Connects on the first write and after every
/// failure; a failed write drops the connection and propagates the error.
#[derive(Debug)]
pub struct TcpTransport {
    address: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    #[must_use]
    pub fn new(host: String, port: u16) -> Self {
        TcpTransport {
            address: format!("{host}:{port}"),
            stream: None,
        }
    }

    async fn connect(&mut self) -> Result<&mut TcpStream, TransportError> {
        if self.stream.is_none() {
            let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
                .await
                .map_err(|_| TransportError::Timeout(self.address.clone(), CONNECT_TIMEOUT))?
                .map_err(|e| TransportError::Connect(self.address.clone(), e))?;
            let _ = stream.set_nodelay(true);
            debug!("Connected to collector at {}", self.address);
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| TransportError::Closed(self.address.clone()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let address = self.address.clone();
        let stream = self.connect().await?;
        let result = match timeout(WRITE_TIMEOUT, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(bytes.len()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout(address, WRITE_TIMEOUT)),
        };
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_lazy_connect_and_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut transport = TcpTransport::new("127.0.0.1".to_string(), port);
        assert!(!transport.is_open());

        let written = transport.write(b"series e:E\n").await.unwrap();
        assert_eq!(written, 11);
        assert!(transport.is_open());

        let (mut socket, _) = listener.accept().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());

        let mut received = String::new();
        socket.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "series e:E\n");
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_and_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpTransport::new("127.0.0.1".to_string(), port);
        let err = transport.write(b"line\n").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(..)), "{err}");
        assert!(!transport.is_open());

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert_eq!(transport.write(b"line\n").await.unwrap(), 5);
        let (mut socket, _) = listener.accept().await.unwrap();
        transport.close().await.unwrap();
        let mut received = String::new();
        socket.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "line\n");
    }
}
