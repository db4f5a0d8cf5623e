//! Server side of the TCP relay.
//!
//! Per connection: wrap the accepted socket with the cipher, read the
//! target address inside the tunnel, dial the target under a deadline,
//! then splice bytes both ways until either side closes.

use super::DEFAULT_DIAL_TIMEOUT;
use crate::common::error::is_closed_conn;
use crate::common::net::{configure_tcp_stream, listen_addr, pipe, Address};
use crate::config::Endpoint;
use crate::crypto::{new_cipher, BoxedStream, ConnCipher};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Shadowsocks TCP relay server.
pub struct Server {
    method: String,
    password: String,
    cipher: Arc<dyn ConnCipher>,
    dial_timeout: Duration,
}

impl Server {
    pub fn new(method: &str, password: &str) -> Result<Self> {
        Ok(Server {
            cipher: new_cipher(method, password)?,
            method: method.to_lowercase(),
            password: password.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        })
    }

    /// Build a server from an `ss://` endpoint URL. Returns the server
    /// and the listen address the URL names.
    pub fn from_url(url: &str) -> Result<(Self, String)> {
        let endpoint = Endpoint::parse(url)?;
        let server = Server::new(&endpoint.method, &endpoint.password)?;
        Ok((server, endpoint.address))
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = if timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// The `ss://` URL a client would use to reach this server.
    pub fn proxy_url(&self, addr: SocketAddr) -> String {
        Endpoint {
            address: addr.to_string(),
            method: self.method.clone(),
            password: self.password.clone(),
        }
        .to_url()
    }

    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(listen_addr(addr)).await?;
        info!("TCP relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop. Runs until the listener fails; individual relay
    /// failures are logged and dropped.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            configure_tcp_stream(&stream);
            let cipher = self.cipher.clone();
            let dial_timeout = self.dial_timeout;
            tokio::spawn(async move {
                if let Err(e) = handle_conn(cipher, stream, dial_timeout).await {
                    match &e {
                        Error::Io(io) if is_closed_conn(io) => {}
                        _ => debug!("relay from {} ended: {}", peer, e),
                    }
                }
            });
        }
    }
}

async fn handle_conn(
    cipher: Arc<dyn ConnCipher>,
    stream: TcpStream,
    dial_timeout: Duration,
) -> Result<()> {
    let mut conn = cipher.wrap_stream(Box::new(stream));

    let (addr, port) = Address::read_from(&mut conn).await?;
    let target = tokio::time::timeout(dial_timeout, dial_target(&addr, port)).await??;
    configure_tcp_stream(&target);

    debug!("relaying to {}", addr.to_string_with_port(port));
    let mut target: BoxedStream = Box::new(target);
    pipe(&mut conn, &mut target).await?;
    Ok(())
}

async fn dial_target(addr: &Address, port: u16) -> Result<TcpStream> {
    let stream = match addr {
        Address::Ipv4(ip) => TcpStream::connect((*ip, port)).await?,
        Address::Ipv6(ip) => TcpStream::connect((*ip, port)).await?,
        Address::Domain(name) => TcpStream::connect((name.as_str(), port)).await?,
    };
    Ok(stream)
}
