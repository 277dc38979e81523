// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chunked streaming HTTP(S) writer.
//!
//! One POST is opened lazily and kept open across writes; its body is fed
//! through a channel in fixed-size chunks. A write fails when the request
//! cannot be established or has already failed. Otherwise the response status
//! is only observed on `close`, which also ends the request so the next write
//! opens a new one.

use std::io;

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{future, stream, SinkExt, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client, Response, Url};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::constants::{CONNECT_TIMEOUT, HTTP_CHUNK_SIZE, WRITE_TIMEOUT};
use crate::errors::{ConfigError, TransportError};
use crate::transport::{Credentials, Transport};

type Chunk = Result<Vec<u8>, io::Error>;

struct OpenRequest {
    body: mpsc::Sender<Chunk>,
    response: JoinHandle<Result<Response, reqwest::Error>>,
}

pub struct HttpTransport {
    client: Client,
    url: Url,
    credentials: Option<Credentials>,
    request: Option<OpenRequest>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url.as_str())
            .field("credentials", &self.credentials)
            .field("open", &self.request.is_some())
            .finish()
    }
}

impl HttpTransport {
    /// `ignore_ssl_errors` accepts any certificate and any hostname.
    pub fn new(
        url: Url,
        credentials: Option<Credentials>,
        ignore_ssl_errors: bool,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(ignore_ssl_errors)
            .danger_accept_invalid_hostnames(ignore_ssl_errors)
            .build()
            .map_err(ConfigError::HttpClient)?;
        Ok(HttpTransport {
            client,
            url,
            credentials,
            request: None,
        })
    }

    /// Starts a streaming request and waits until the client pulls its body,
    /// which only happens once the connection is up and the head is sent.
    async fn open(&self) -> Result<OpenRequest, TransportError> {
        let (body, chunks) = mpsc::channel::<Chunk>(16);
        let (pulled, first_pull) = oneshot::channel::<()>();
        let stream = stream::once(future::lazy(move |_| {
            let _ = pulled.send(());
        }))
        .filter_map(|()| future::ready(None::<Chunk>))
        .chain(chunks);

        let mut builder = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::wrap_stream(stream));
        if let Some(credentials) = &self.credentials {
            builder = builder.basic_auth(&credentials.username, credentials.password.as_ref());
        }
        debug!("Opening streaming request to {}", self.url);
        let request = OpenRequest {
            body,
            response: tokio::spawn(builder.send()),
        };

        match timeout(CONNECT_TIMEOUT, first_pull).await {
            Ok(Ok(())) => Ok(request),
            // The request ended before reading any of its body.
            Ok(Err(_)) => Err(self
                .finish(request)
                .await
                .err()
                .unwrap_or_else(|| TransportError::Closed(self.url.to_string()))),
            Err(_) => {
                request.response.abort();
                Err(TransportError::Timeout(
                    self.url.to_string(),
                    CONNECT_TIMEOUT,
                ))
            }
        }
    }

    /// Ends the body and waits for the collector's verdict.
    async fn finish(&self, request: OpenRequest) -> Result<(), TransportError> {
        let OpenRequest { body, response } = request;
        drop(body);
        let response = timeout(WRITE_TIMEOUT, response)
            .await
            .map_err(|_| TransportError::Timeout(self.url.to_string(), WRITE_TIMEOUT))?
            .map_err(|_| TransportError::Closed(self.url.to_string()))??;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(status))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        // The collector may have answered already. A failed request fails
        // this write; a successful one is replaced.
        let answered = self
            .request
            .as_ref()
            .is_some_and(|request| request.response.is_finished());
        if answered {
            if let Some(request) = self.request.take() {
                self.finish(request).await?;
                debug!("Streaming request to {} ended early, reopening", self.url);
            }
        }

        let url = self.url.to_string();
        if self.request.is_none() {
            self.request = Some(self.open().await?);
        }
        let Some(request) = self.request.as_mut() else {
            return Err(TransportError::Closed(url));
        };
        let sent = timeout(WRITE_TIMEOUT, async {
            for chunk in bytes.chunks(HTTP_CHUNK_SIZE) {
                request.body.send(Ok(chunk.to_vec())).await?;
            }
            Ok::<_, mpsc::SendError>(())
        })
        .await;

        match sent {
            Ok(Ok(())) => Ok(bytes.len()),
            Ok(Err(_)) => {
                // The request task dropped the body, report why.
                let error = match self.request.take() {
                    Some(request) => self.finish(request).await.err(),
                    None => None,
                };
                Err(error.unwrap_or(TransportError::Closed(url)))
            }
            Err(_) => {
                if let Some(request) = self.request.take() {
                    request.response.abort();
                }
                Err(TransportError::Timeout(url, WRITE_TIMEOUT))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.request.is_some()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.request.take() {
            Some(request) => self.finish(request).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn transport(server: &mockito::ServerGuard, path: &str) -> HttpTransport {
        let url = Url::parse(&format!("{}{path}", server.url())).unwrap();
        HttpTransport::new(url, None, false).unwrap()
    }

    #[tokio::test]
    async fn test_body_is_streamed_until_close() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/command")
            .match_body("series a\nseries b\n")
            .with_status(200)
            .create_async()
            .await;

        let mut transport = transport(&server, "/api/v1/command");
        assert_eq!(transport.write(b"series a\n").await.unwrap(), 9);
        assert!(transport.is_open());
        assert_eq!(transport.write(b"series b\n").await.unwrap(), 9);
        transport.close().await.unwrap();
        assert!(!transport.is_open());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_is_checked_on_close() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/ingest")
            .with_status(503)
            .create_async()
            .await;

        let mut transport = transport(&server, "/ingest");
        transport.write(b"series a\n").await.unwrap();
        let err = transport.close().await.unwrap_err();
        assert!(
            matches!(err, TransportError::Status(status) if status.as_u16() == 503),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_refused_connection_fails_each_write() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{port}/api/v1/command")).unwrap();
        let mut transport = HttpTransport::new(url, None, false).unwrap();

        let err = transport.write(b"series a\n").await.unwrap_err();
        assert!(matches!(err, TransportError::Http(_)), "{err}");
        assert!(!transport.is_open());
        assert!(transport.write(b"series b\n").await.is_err());
        assert!(!transport.is_open());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_batch_is_chunked() {
        let payload = "x".repeat(HTTP_CHUNK_SIZE * 3 + 17);
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/command")
            .match_body(payload.as_str())
            .with_status(200)
            .create_async()
            .await;

        let mut transport = transport(&server, "/api/v1/command");
        assert_eq!(
            transport.write(payload.as_bytes()).await.unwrap(),
            payload.len()
        );
        transport.close().await.unwrap();
        mock.assert_async().await;
    }
}
