//! SIP transport layer - UDP endpoint owned by the event loop

use super::message::SipError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 65535;

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind the preferred address, falling back to an ephemeral port on the
    /// same interface when it is taken.
    pub async fn bind_with_fallback(bind_addr: SocketAddr) -> Result<Self, SipError> {
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) if bind_addr.port() != 0 => {
                warn!(
                    "Failed to bind UDP {}: {}, trying an ephemeral port",
                    bind_addr, e
                );
                let fallback = SocketAddr::new(bind_addr.ip(), 0);
                UdpSocket::bind(fallback).await.map_err(|e| {
                    SipError::TransportError(format!("Failed to bind UDP socket: {}", e))
                })?
            }
            Err(e) => {
                return Err(SipError::TransportError(format!(
                    "Failed to bind UDP socket: {}",
                    e
                )))
            }
        };

        info!("UDP transport listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait up to `timeout` for one datagram. `Ok(None)` on timeout.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(Bytes, SocketAddr)>, SipError> {
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut self.buf)).await {
            Err(_) => Ok(None),
            Ok(Ok((size, source))) => {
                debug!("Received {} bytes from {} via UDP", size, source);
                Ok(Some((Bytes::copy_from_slice(&self.buf[..size]), source)))
            }
            Ok(Err(e)) => Err(SipError::TransportError(format!(
                "Failed to receive UDP packet: {}",
                e
            ))),
        }
    }

    pub async fn send(&self, message: &OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }
}
