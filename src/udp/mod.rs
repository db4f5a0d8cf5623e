//! UDP relay: per-datagram codec, client packet socket and the
//! server-side session multiplexer.
//!
//! Datagram plaintext is `Address || payload`; on the wire that becomes
//! `IV || xor(Address || payload)` for stream ciphers (AEAD methods have
//! no packet form and are refused at construction).

mod client;
mod server;

pub use client::{PacketClient, PacketConn};
pub use server::PacketServer;

use crate::common::net::Address;
use crate::crypto::ConnCipher;
use crate::Result;
use bytes::BytesMut;

/// Largest datagram we are prepared to carry.
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;

/// Build and encrypt one datagram: `Address || payload`.
pub(crate) fn encode_packet(
    cipher: &dyn ConnCipher,
    addr: &Address,
    port: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut plain = BytesMut::with_capacity(addr.len() + payload.len());
    addr.encode(&mut plain, port)?;
    plain.extend_from_slice(payload);
    cipher.encrypt_packet(&plain)
}

/// Decrypt one datagram and split it into the leading address and the
/// carried payload.
pub(crate) fn decode_packet(
    cipher: &dyn ConnCipher,
    datagram: &[u8],
) -> Result<(Address, u16, Vec<u8>)> {
    let plain = cipher.decrypt_packet(datagram)?;
    let (addr, port, consumed) = Address::decode(&plain)?;
    Ok((addr, port, plain[consumed..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::new_cipher;
    use std::net::Ipv4Addr;

    #[test]
    fn test_packet_codec_round_trip() {
        let cipher = new_cipher("aes-128-cfb", "pwd").unwrap();
        let addr = Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1));
        let wire = encode_packet(&*cipher, &addr, 53, b"query").unwrap();
        let (got_addr, got_port, payload) = decode_packet(&*cipher, &wire).unwrap();
        assert_eq!(got_addr, addr);
        assert_eq!(got_port, 53);
        assert_eq!(payload, b"query");
    }

    #[test]
    fn test_packet_codec_rejects_garbage() {
        let cipher = new_cipher("aes-128-cfb", "pwd").unwrap();
        // Decrypts to noise; the address type octet is junk.
        assert!(decode_packet(&*cipher, &[0u8; 40]).is_err());
    }
}
