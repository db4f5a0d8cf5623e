//! Network utilities: the SOCKS5-style address codec used inside the
//! tunnel, plus stream tuning and the bidirectional pump.

use crate::common::error::is_closed_conn;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use socket2::SockRef;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    let _ = sock.set_reuse_address(true);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let _ = sock.set_reuse_port(true);
}

/// Normalize a Go-style listen address (`":8379"`) into something
/// `bind` accepts.
pub fn listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    }
}

/// Destination address as carried on the wire: one-octet type, the
/// address body, then a big-endian port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Parse from the wire format
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok((addr, port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| Error::bad_address(format!("invalid domain: {}", e)))?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok((Address::Domain(domain), port))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok((addr, port))
            }
            t => Err(Error::bad_address(format!("unknown address type: {}", t))),
        }
    }

    /// Write in the wire format
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, port: u16) -> Result<()> {
        let mut buf = BytesMut::with_capacity(self.len());
        self.encode(&mut buf, port)?;
        writer.write_all(&buf).await?;
        Ok(())
    }

    /// Synchronous encode, used by the datagram codec
    pub fn encode(&self, buf: &mut BytesMut, port: u16) -> Result<()> {
        match self {
            Address::Ipv4(ip) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                if domain.len() > 255 {
                    return Err(Error::AddressTooLong);
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(port);
        Ok(())
    }

    /// Synchronous decode; returns the address, the port and how many
    /// bytes of `buf` the header occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, u16, usize)> {
        let atyp = *buf
            .first()
            .ok_or_else(|| Error::bad_address("empty address"))?;
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(Error::bad_address("truncated IPv4 address"));
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::Ipv4(Ipv4Addr::from(ip)), port, 7))
            }
            ATYP_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(Error::bad_address("truncated IPv6 address"));
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Address::Ipv6(Ipv6Addr::from(ip)), port, 19))
            }
            ATYP_DOMAIN => {
                let len = *buf
                    .get(1)
                    .ok_or_else(|| Error::bad_address("truncated domain length"))?
                    as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(Error::bad_address("truncated domain address"));
                }
                let domain = String::from_utf8(buf[2..2 + len].to_vec())
                    .map_err(|e| Error::bad_address(format!("invalid domain: {}", e)))?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Address::Domain(domain), port, 2 + len + 2))
            }
            t => Err(Error::bad_address(format!("unknown address type: {}", t))),
        }
    }

    /// Parse a `host:port` string from the application. Bare IP literals
    /// (including bracketed IPv6) produce the IP forms.
    pub fn parse(s: &str) -> Result<(Self, u16)> {
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok((Address::from(sa.ip()), sa.port()));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::bad_address(format!("missing port in {:?}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::bad_address(format!("invalid port in {:?}", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::bad_address(format!("empty host in {:?}", s)));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok((Address::from(ip), port));
        }
        if host.len() > 255 {
            return Err(Error::AddressTooLong);
        }
        Ok((Address::Domain(host.to_string()), port))
    }

    /// Get bytes length
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,             // atyp + ip + port
            Address::Ipv6(_) => 1 + 16 + 2,            // atyp + ip + port
            Address::Domain(d) => 1 + 1 + d.len() + 2, // atyp + len + domain + port
        }
    }

    /// Convert to string representation
    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }

    /// Get as IP if resolved
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    /// Get as domain string
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::Ipv4(ip)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::Ipv6(ip)
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<String> for Address {
    fn from(domain: String) -> Self {
        // Try to parse as IP first
        if let Ok(ip) = domain.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        if let Ok(ip) = domain.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(domain)
    }
}

/// Resolve an address to something a socket can talk to. Domain names go
/// through the system resolver; the first answer wins.
pub async fn resolve(addr: &Address, port: u16) -> Result<SocketAddr> {
    match addr {
        Address::Ipv4(ip) => Ok(SocketAddr::new(IpAddr::V4(*ip), port)),
        Address::Ipv6(ip) => Ok(SocketAddr::new(IpAddr::V6(*ip), port)),
        Address::Domain(name) => tokio::net::lookup_host((name.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| Error::bad_address(format!("no addresses for {}", name))),
    }
}

/// Copy data between two streams bidirectionally until both directions
/// reach EOF. A socket closed from the far side mid-transfer counts as a
/// normal end of the relay, not an error.
pub async fn pipe<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(a, b).await {
        Ok(n) => Ok(n),
        Err(e) if is_closed_conn(&e) => Ok((0, 0)),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_domain() {
        let addr = Address::Domain("example.com".to_string());
        let mut buf = BytesMut::new();
        addr.encode(&mut buf, 443).unwrap();
        assert_eq!(
            &buf[..],
            &[
                0x03, 0x0B, 0x65, 0x78, 0x61, 0x6D, 0x70, 0x6C, 0x65, 0x2E, 0x63, 0x6F, 0x6D,
                0x01, 0xBB
            ]
        );
    }

    #[test]
    fn test_decode_domain() {
        let wire = [
            0x03, 0x0B, 0x65, 0x78, 0x61, 0x6D, 0x70, 0x6C, 0x65, 0x2E, 0x63, 0x6F, 0x6D, 0x01,
            0xBB,
        ];
        let (addr, port, consumed) = Address::decode(&wire).unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string()));
        assert_eq!(port, 443);
        assert_eq!(consumed, wire.len());
    }

    #[tokio::test]
    async fn test_round_trip_all_forms() {
        let cases = [
            (Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1)), 80),
            (Address::Ipv6(Ipv6Addr::LOCALHOST), 8080),
            (Address::Domain("proxy.test".to_string()), 65535),
        ];
        for (addr, port) in cases {
            let mut buf = BytesMut::new();
            addr.encode(&mut buf, port).unwrap();
            let (decoded, dport, consumed) = Address::decode(&buf).unwrap();
            assert_eq!(decoded, addr);
            assert_eq!(dport, port);
            assert_eq!(consumed, buf.len());

            let (read, rport) = Address::read_from(&mut &buf[..]).await.unwrap();
            assert_eq!(read, addr);
            assert_eq!(rport, port);
        }
    }

    #[test]
    fn test_encode_long_domain_fails() {
        let addr = Address::Domain("x".repeat(256));
        let mut buf = BytesMut::new();
        assert!(matches!(
            addr.encode(&mut buf, 80),
            Err(Error::AddressTooLong)
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        assert!(matches!(
            Address::decode(&[0x05, 0, 0, 0, 0, 0, 0]),
            Err(Error::BadAddress(_))
        ));
    }

    #[test]
    fn test_parse_host_port() {
        let (addr, port) = Address::parse("1.2.3.4:443").unwrap();
        assert_eq!(addr, Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(port, 443);

        let (addr, port) = Address::parse("[::1]:53").unwrap();
        assert_eq!(addr, Address::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(port, 53);

        let (addr, port) = Address::parse("example.com:80").unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string()));
        assert_eq!(port, 80);

        assert!(Address::parse("noport").is_err());
        assert!(matches!(
            Address::parse(&format!("{}:80", "x".repeat(256))),
            Err(Error::AddressTooLong)
        ));
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr(":8379"), "0.0.0.0:8379");
        assert_eq!(listen_addr("127.0.0.1:1080"), "127.0.0.1:1080");
    }
}
