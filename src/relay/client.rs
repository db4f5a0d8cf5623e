//! Client side of the TCP relay: dial the proxy, wrap with the cipher,
//! send the target address through the tunnel and hand the stream back.

use super::DEFAULT_DIAL_TIMEOUT;
use crate::common::net::{configure_tcp_stream, resolve, Address};
use crate::config::Endpoint;
use crate::crypto::{new_cipher, BoxedStream, ConnCipher};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Shadowsocks dialer.
pub struct Dialer {
    proxy_address: String,
    cipher: Arc<dyn ConnCipher>,
    resolve_locally: bool,
    timeout: Duration,
}

impl Dialer {
    pub fn new(proxy_address: impl Into<String>, method: &str, password: &str) -> Result<Self> {
        Ok(Dialer {
            proxy_address: proxy_address.into(),
            cipher: new_cipher(method, password)?,
            resolve_locally: false,
            timeout: DEFAULT_DIAL_TIMEOUT,
        })
    }

    /// Build a dialer from an `ss://` endpoint URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let endpoint = Endpoint::parse(url)?;
        Dialer::new(endpoint.address, &endpoint.method, &endpoint.password)
    }

    /// Resolve domain targets locally instead of letting the proxy do it.
    pub fn with_resolve_locally(mut self, resolve_locally: bool) -> Self {
        self.resolve_locally = resolve_locally;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Open an encrypted stream to `target` (`host:port`) through the
    /// proxy. Reads and writes on the returned stream flow through the
    /// cipher; the proxy connects onward to the target.
    pub async fn dial(&self, target: &str) -> Result<BoxedStream> {
        let (mut addr, port) = Address::parse(target)?;
        if self.resolve_locally {
            if let Address::Domain(_) = &addr {
                let resolved = resolve(&addr, port).await?;
                addr = Address::from(resolved.ip());
            }
        }

        let stream =
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.proxy_address)).await??;
        configure_tcp_stream(&stream);
        debug!("dialed proxy {} for {}", self.proxy_address, target);

        let mut conn = self.cipher.wrap_stream(Box::new(stream));
        addr.write_to(&mut conn, port).await?;
        conn.flush().await?;
        Ok(conn)
    }
}
