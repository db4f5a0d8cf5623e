//! End-to-end relay tests: every registered cipher carries a TCP
//! exchange through the proxy, URL-configured endpoints interoperate,
//! and the UDP session multiplexer echoes datagrams in order.

use ss_gateway::{cipher_list, Dialer, PacketClient, PacketServer, Server};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

/// A TCP server that answers `<line>` with `ok: <line>`, once per line,
/// until the client closes.
async fn spawn_tcp_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let mut reply = b"ok: ".to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

async fn spawn_proxy(method: &str, password: &str) -> SocketAddr {
    let server = Server::new(method, password).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn exchange_twice(dialer: &Dialer, upstream: SocketAddr) {
    // Two sequential request/response round trips over one tunnel.
    let mut conn = dialer.dial(&upstream.to_string()).await.unwrap();
    for request in [&b"first"[..], &b"second"[..]] {
        conn.write_all(request).await.unwrap();
        conn.flush().await.unwrap();
        let mut reply = vec![0u8; 4 + request.len()];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], b"ok: ");
        assert_eq!(&reply[4..], request);
    }
}

#[tokio::test]
async fn tcp_relay_all_ciphers() {
    let upstream = spawn_tcp_upstream().await;
    for method in cipher_list() {
        let proxy = spawn_proxy(method, "pwd").await;
        let dialer = Dialer::new(proxy.to_string(), method, "pwd").unwrap();
        exchange_twice(&dialer, upstream).await;
    }
}

#[tokio::test]
async fn tcp_relay_via_proxy_url() {
    let upstream = spawn_tcp_upstream().await;
    for method in ["aes-128-cfb", "aes-256-gcm"] {
        let server = Server::new(method, "pwd").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = server.proxy_url(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let dialer = Dialer::from_url(&url).unwrap();
        exchange_twice(&dialer, upstream).await;
    }
}

#[tokio::test]
async fn tcp_relay_via_base64_userinfo_url() {
    let upstream = spawn_tcp_upstream().await;
    // Decodes to aes-128-cfb:123456
    let proxy = spawn_proxy("aes-128-cfb", "123456").await;
    let url = format!("ss://YWVzLTEyOC1jZmI6MTIzNDU2Cg==@{}", proxy);
    let dialer = Dialer::from_url(&url).unwrap();
    exchange_twice(&dialer, upstream).await;
}

#[tokio::test]
async fn tcp_relay_resolves_domain_locally() {
    let upstream = spawn_tcp_upstream().await;
    let proxy = spawn_proxy("chacha20-ietf", "pwd").await;
    let dialer = Dialer::new(proxy.to_string(), "chacha20-ietf", "pwd")
        .unwrap()
        .with_resolve_locally(true);

    let mut conn = dialer
        .dial(&format!("localhost:{}", upstream.port()))
        .await
        .unwrap();
    conn.write_all(b"ping").await.unwrap();
    conn.flush().await.unwrap();
    let mut reply = [0u8; 8];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ok: ping");
}

#[tokio::test]
async fn tcp_relay_wrong_password_gets_nothing() {
    let upstream = spawn_tcp_upstream().await;
    let proxy = spawn_proxy("aes-256-gcm", "right").await;
    let dialer = Dialer::new(proxy.to_string(), "aes-256-gcm", "wrong").unwrap();

    // The server cannot open the address record and drops the
    // connection; the client sees EOF or a reset, never a reply.
    let mut conn = dialer.dial(&upstream.to_string()).await.unwrap();
    let _ = conn.write_all(b"first").await;
    let _ = conn.flush().await;
    let mut reply = [0u8; 9];
    assert!(conn.read_exact(&mut reply).await.is_err());
}

/// A UDP server answering every datagram with `echo ` prepended.
async fn spawn_udp_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => return,
            };
            let mut reply = b"echo ".to_vec();
            reply.extend_from_slice(&buf[..n]);
            if socket.send_to(&reply, peer).await.is_err() {
                return;
            }
        }
    });
    addr
}

#[tokio::test]
async fn udp_relay_echoes_in_order() {
    let upstream = spawn_udp_upstream().await;

    let server = PacketServer::new("aes-128-cfb", "pwd").unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let proxy = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(socket).await;
    });

    let client = PacketClient::new(proxy.to_string(), "aes-128-cfb", "pwd").unwrap();
    let conn = client.bind("127.0.0.1:0").await.unwrap();

    let target = upstream.to_string();
    for i in 0..10 {
        let message = format!("hello {}", i);
        conn.send_to(message.as_bytes(), &target).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, origin) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(origin, upstream);
        assert_eq!(&buf[..n], format!("echo hello {}", i).as_bytes());
    }
}

#[tokio::test]
async fn udp_relay_refuses_aead_methods() {
    assert!(PacketClient::new("127.0.0.1:8379", "chacha20-ietf-poly1305", "pwd").is_err());
    assert!(PacketServer::new("aes-256-gcm", "pwd").is_err());
    assert!(PacketServer::new("dummy", "pwd").is_ok());
}
