// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tracing::warn;

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::errors::TransportError;
use crate::transport::Transport;

/// Splits a batch into datagrams at line boundaries. A line longer than `max`
/// travels alone.
#[must_use]
pub fn datagrams(bytes: &[u8], max: usize) -> Vec<&[u8]> {
    let mut packets = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for line in bytes.split_inclusive(|b| *b == b'\n') {
        if end > start && end - start + line.len() > max {
            packets.push(&bytes[start..end]);
            start = end;
        }
        end += line.len();
    }
    if end > start {
        packets.push(&bytes[start..end]);
    }
    packets
}

/// Connectionless writer. Failures are logged and reported as zero bytes sent.
#[derive(Debug)]
pub struct UdpTransport {
    address: String,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    #[must_use]
    pub fn new(host: String, port: u16) -> Self {
        UdpTransport {
            address: format!("{host}:{port}"),
            socket: None,
        }
    }

    async fn socket_for(&mut self, target: &SocketAddr) -> std::io::Result<&UdpSocket> {
        let matches_family = self
            .socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .is_some_and(|local| local.is_ipv4() == target.is_ipv4());
        if !matches_family {
            let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            self.socket = Some(UdpSocket::bind(bind).await?);
        }
        self.socket
            .as_ref()
            .ok_or_else(|| std::io::Error::other("socket unavailable"))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let target = match lookup_host(&self.address).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                warn!("Failed to resolve collector address {}: {}", self.address, e);
                return Ok(0);
            }
        };
        let Some(target) = target else {
            warn!("Collector address {} did not resolve", self.address);
            return Ok(0);
        };

        let address = self.address.clone();
        let socket = match self.socket_for(&target).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Failed to bind UDP socket for {}: {}", address, e);
                return Ok(0);
            }
        };

        let mut sent = 0;
        for packet in datagrams(bytes, MAX_DATAGRAM_SIZE) {
            match socket.send_to(packet, target).await {
                Ok(n) => sent += n,
                Err(e) => {
                    warn!("Failed to send datagram to {}: {}", address, e);
                    break;
                }
            }
        }
        Ok(sent)
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.socket = None;
        Ok(())
    }
}
