//! Client side of the UDP relay.

use super::{decode_packet, encode_packet, MAX_DATAGRAM};
use crate::common::net::{listen_addr, resolve, Address};
use crate::config::Endpoint;
use crate::crypto::{new_cipher, ConnCipher};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Factory for encrypted packet sockets talking to one proxy.
pub struct PacketClient {
    proxy_address: String,
    cipher: Arc<dyn ConnCipher>,
}

impl PacketClient {
    pub fn new(proxy_address: impl Into<String>, method: &str, password: &str) -> Result<Self> {
        let cipher = new_cipher(method, password)?;
        if !cipher.supports_packet() {
            return Err(Error::unsupported(format!(
                "{} cannot carry datagrams",
                method
            )));
        }
        Ok(PacketClient {
            proxy_address: proxy_address.into(),
            cipher,
        })
    }

    /// Build a client from an `ss://` endpoint URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let endpoint = Endpoint::parse(url)?;
        PacketClient::new(endpoint.address, &endpoint.method, &endpoint.password)
    }

    /// Bind a local socket whose traffic is tunneled via the proxy.
    pub async fn bind(&self, local: &str) -> Result<PacketConn> {
        let socket = UdpSocket::bind(listen_addr(local)).await?;
        let peer = tokio::net::lookup_host(&self.proxy_address)
            .await?
            .next()
            .ok_or_else(|| {
                Error::bad_address(format!("no addresses for {}", self.proxy_address))
            })?;
        Ok(PacketConn {
            socket,
            cipher: self.cipher.clone(),
            peer,
        })
    }
}

/// An encrypted packet socket. The proxy is the transport peer; the
/// addresses the application sees are the tunnel endpoints.
pub struct PacketConn {
    socket: UdpSocket,
    cipher: Arc<dyn ConnCipher>,
    peer: SocketAddr,
}

impl PacketConn {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send `payload` to `target` (`host:port`) through the proxy.
    pub async fn send_to(&self, payload: &[u8], target: &str) -> Result<usize> {
        let (addr, port) = Address::parse(target)?;
        let wire = encode_packet(&*self.cipher, &addr, port, payload)?;
        self.socket.send_to(&wire, self.peer).await?;
        Ok(payload.len())
    }

    /// Receive one datagram; the returned address is the origin carried
    /// inside the tunnel, not the proxy.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut wire = vec![0u8; MAX_DATAGRAM];
        let (n, _proxy) = self.socket.recv_from(&mut wire).await?;
        let (addr, port, payload) = decode_packet(&*self.cipher, &wire[..n])?;
        let origin = resolve(&addr, port).await?;
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, origin))
    }
}
