//! Server side of the UDP relay: a session table keyed by
//! `"{client}|{target}"`, one outbound socket and reply-reader task per
//! session, and a periodic sweep of idle sessions.

use super::{decode_packet, encode_packet, MAX_DATAGRAM};
use crate::common::net::{listen_addr, resolve, Address};
use crate::crypto::{new_cipher, ConnCipher};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Idle timeout applied when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct UdpSession {
    socket: Arc<UdpSocket>,
    last: Mutex<Instant>,
    reader: AbortHandle,
}

/// Shadowsocks UDP relay server.
pub struct PacketServer {
    cipher: Arc<dyn ConnCipher>,
    idle_timeout: Duration,
    sessions: Arc<Mutex<HashMap<String, Arc<UdpSession>>>>,
}

impl PacketServer {
    pub fn new(method: &str, password: &str) -> Result<Self> {
        let cipher = new_cipher(method, password)?;
        if !cipher.supports_packet() {
            return Err(Error::unsupported(format!(
                "{} cannot carry datagrams",
                method
            )));
        }
        Ok(PacketServer {
            cipher,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Zero falls back to the default so a missing configuration value
    /// cannot turn the sweep into reap-everything.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = if timeout.is_zero() {
            DEFAULT_IDLE_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        let socket = UdpSocket::bind(listen_addr(addr)).await?;
        info!("UDP relay listening on {}", socket.local_addr()?);
        self.serve(socket).await
    }

    /// Serve until the listening socket fails. Sessions and the GC task
    /// are torn down on every exit path.
    pub async fn serve(&self, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let gc = self.spawn_gc();
        let result = self.recv_loop(&socket).await;
        gc.abort();
        self.shutdown_sessions();
        result
    }

    async fn recv_loop(&self, socket: &Arc<UdpSocket>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = socket.recv_from(&mut buf).await?;
            let (addr, port, payload) = match decode_packet(&*self.cipher, &buf[..n]) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("dropping datagram from {}: {}", src, e);
                    continue;
                }
            };
            let target = match resolve(&addr, port).await {
                Ok(target) => target,
                Err(e) => {
                    warn!(
                        "dropping datagram from {} for {}: {}",
                        src,
                        addr.to_string_with_port(port),
                        e
                    );
                    continue;
                }
            };
            let session = match self.session(socket, src, &addr, port, target).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("no session for {} -> {}: {}", src, target, e);
                    continue;
                }
            };
            if let Err(e) = session.socket.send_to(&payload, target).await {
                warn!("forward to {} failed: {}", target, e);
            }
        }
    }

    /// Look up or create the session for one (client, target) pair. The
    /// table lock is never held across I/O.
    async fn session(
        &self,
        listen: &Arc<UdpSocket>,
        src: SocketAddr,
        addr: &Address,
        port: u16,
        target: SocketAddr,
    ) -> Result<Arc<UdpSession>> {
        let key = format!("{}|{}", src, target);
        {
            let table = self.sessions.lock();
            if let Some(session) = table.get(&key) {
                *session.last.lock() = Instant::now();
                return Ok(session.clone());
            }
        }

        let outbound = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        debug!(
            "new session {} via {}",
            key,
            outbound.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        let reader = tokio::spawn(reply_loop(
            outbound.clone(),
            listen.clone(),
            self.cipher.clone(),
            addr.clone(),
            port,
            target,
            src,
        ));
        let session = Arc::new(UdpSession {
            socket: outbound,
            last: Mutex::new(Instant::now()),
            reader: reader.abort_handle(),
        });
        self.sessions.lock().insert(key, session.clone());
        Ok(session)
    }

    fn spawn_gc(&self) -> AbortHandle {
        let sessions = self.sessions.clone();
        let timeout = self.idle_timeout;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(timeout);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // the immediate first tick
            loop {
                tick.tick().await;
                let now = Instant::now();
                sessions.lock().retain(|key, session| {
                    let keep = now.duration_since(*session.last.lock()) < timeout;
                    if !keep {
                        debug!("expiring idle session {}", key);
                        session.reader.abort();
                    }
                    keep
                });
            }
        })
        .abort_handle()
    }

    fn shutdown_sessions(&self) {
        for (_, session) in self.sessions.lock().drain() {
            session.reader.abort();
        }
    }
}

/// Pump replies from one session's outbound socket back to the client.
/// Datagrams from anything but the session's target are dropped.
async fn reply_loop(
    outbound: Arc<UdpSocket>,
    listen: Arc<UdpSocket>,
    cipher: Arc<dyn ConnCipher>,
    addr: Address,
    port: u16,
    target: SocketAddr,
    client: SocketAddr,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match outbound.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("session for {} closed: {}", client, e);
                return;
            }
        };
        if from != target {
            continue;
        }
        let wire = match encode_packet(&*cipher, &addr, port, &buf[..n]) {
            Ok(wire) => wire,
            Err(e) => {
                debug!("encoding reply for {} failed: {}", client, e);
                continue;
            }
        };
        if let Err(e) = listen.send_to(&wire, client).await {
            debug!("reply to {} failed: {}", client, e);
            return;
        }
    }
}
