//! Stream-cipher framing.
//!
//! TCP: a cleartext IV prefix in each direction, then the XOR keystream
//! of the application bytes. UDP: one-shot `IV || xor(payload)` per
//! datagram.

use crate::crypto::kdf::kdf;
use crate::crypto::{poll_drain, BoxedStream, ConnCipher};
use crate::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use bytes::BytesMut;
use cast5::Cast5;
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, ChaCha20Legacy};
use cipher::consts::U16;
use cipher::{BlockCipher, BlockEncryptMut, InnerIvInit, InvalidLength, KeyInit, KeyIvInit};
use ctr::Ctr128BE;
use des::Des;
use md5::{Digest, Md5};
use rand::RngCore;
use rc4::Rc4;
use salsa20::Salsa20;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Registered stream-cipher methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    BfCfb,
    Cast5Cfb,
    Chacha20,
    Chacha20Ietf,
    DesCfb,
    Rc4Md5,
    Rc4Md56,
    Salsa20,
}

impl StreamKind {
    pub const ALL: &'static [StreamKind] = &[
        StreamKind::Aes128Cfb,
        StreamKind::Aes192Cfb,
        StreamKind::Aes256Cfb,
        StreamKind::Aes128Ctr,
        StreamKind::Aes192Ctr,
        StreamKind::Aes256Ctr,
        StreamKind::BfCfb,
        StreamKind::Cast5Cfb,
        StreamKind::Chacha20,
        StreamKind::Chacha20Ietf,
        StreamKind::DesCfb,
        StreamKind::Rc4Md5,
        StreamKind::Rc4Md56,
        StreamKind::Salsa20,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Aes128Cfb => "aes-128-cfb",
            StreamKind::Aes192Cfb => "aes-192-cfb",
            StreamKind::Aes256Cfb => "aes-256-cfb",
            StreamKind::Aes128Ctr => "aes-128-ctr",
            StreamKind::Aes192Ctr => "aes-192-ctr",
            StreamKind::Aes256Ctr => "aes-256-ctr",
            StreamKind::BfCfb => "bf-cfb",
            StreamKind::Cast5Cfb => "cast5-cfb",
            StreamKind::Chacha20 => "chacha20",
            StreamKind::Chacha20Ietf => "chacha20-ietf",
            StreamKind::DesCfb => "des-cfb",
            StreamKind::Rc4Md5 => "rc4-md5",
            StreamKind::Rc4Md56 => "rc4-md5-6",
            StreamKind::Salsa20 => "salsa20",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            StreamKind::Aes128Cfb | StreamKind::Aes128Ctr => 16,
            StreamKind::Aes192Cfb | StreamKind::Aes192Ctr => 24,
            StreamKind::Aes256Cfb | StreamKind::Aes256Ctr => 32,
            StreamKind::BfCfb | StreamKind::Cast5Cfb => 16,
            StreamKind::Chacha20 | StreamKind::Chacha20Ietf | StreamKind::Salsa20 => 32,
            StreamKind::DesCfb => 8,
            StreamKind::Rc4Md5 | StreamKind::Rc4Md56 => 16,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            StreamKind::Aes128Cfb
            | StreamKind::Aes192Cfb
            | StreamKind::Aes256Cfb
            | StreamKind::Aes128Ctr
            | StreamKind::Aes192Ctr
            | StreamKind::Aes256Ctr
            | StreamKind::Rc4Md5 => 16,
            StreamKind::Chacha20Ietf => 12,
            StreamKind::BfCfb
            | StreamKind::Cast5Cfb
            | StreamKind::Chacha20
            | StreamKind::DesCfb
            | StreamKind::Salsa20 => 8,
            StreamKind::Rc4Md56 => 6,
        }
    }

    /// Seed a keystream generator for one direction. CFB modes are the
    /// only asymmetric ones; everything else is a plain XOR stream.
    fn keystream(&self, key: &[u8], iv: &[u8], encrypt: bool) -> Result<Box<dyn Keystream>> {
        match self {
            StreamKind::Aes128Cfb => cfb::<Aes128>(key, iv, encrypt),
            StreamKind::Aes192Cfb => cfb::<Aes192>(key, iv, encrypt),
            StreamKind::Aes256Cfb => cfb::<Aes256>(key, iv, encrypt),
            StreamKind::BfCfb => cfb::<Blowfish>(key, iv, encrypt),
            StreamKind::Cast5Cfb => cfb::<Cast5>(key, iv, encrypt),
            StreamKind::DesCfb => cfb::<Des>(key, iv, encrypt),
            StreamKind::Aes128Ctr => xor(Ctr128BE::<Aes128>::new_from_slices(key, iv)),
            StreamKind::Aes192Ctr => xor(Ctr128BE::<Aes192>::new_from_slices(key, iv)),
            StreamKind::Aes256Ctr => xor(Ctr128BE::<Aes256>::new_from_slices(key, iv)),
            StreamKind::Chacha20 => xor(ChaCha20Legacy::new_from_slices(key, iv)),
            StreamKind::Chacha20Ietf => xor(ChaCha20::new_from_slices(key, iv)),
            StreamKind::Salsa20 => xor(Salsa20::new_from_slices(key, iv)),
            StreamKind::Rc4Md5 | StreamKind::Rc4Md56 => {
                // RC4 is keyed with MD5(key || IV); the IV itself never
                // touches the keystream after that.
                let mut hasher = Md5::new();
                hasher.update(key);
                hasher.update(iv);
                let rc4_key = hasher.finalize();
                xor(Rc4::<U16>::new_from_slice(&rc4_key))
            }
        }
    }
}

/// Per-direction keystream state.
trait Keystream: Send {
    fn apply(&mut self, data: &mut [u8]);
}

struct CfbEnc<C: BlockEncryptMut + BlockCipher>(BufEncryptor<C>);

impl<C: BlockEncryptMut + BlockCipher + Send> Keystream for CfbEnc<C> {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.encrypt(data);
    }
}

struct CfbDec<C: BlockEncryptMut + BlockCipher>(BufDecryptor<C>);

impl<C: BlockEncryptMut + BlockCipher + Send> Keystream for CfbDec<C> {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.decrypt(data);
    }
}

struct Xor<C: cipher::StreamCipher>(C);

impl<C: cipher::StreamCipher + Send> Keystream for Xor<C> {
    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

fn init_err(_: InvalidLength) -> Error {
    Error::config("cipher initialization failed")
}

fn cfb<C>(key: &[u8], iv: &[u8], encrypt: bool) -> Result<Box<dyn Keystream>>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Send + 'static,
{
    let block = C::new_from_slice(key).map_err(init_err)?;
    if encrypt {
        let enc = BufEncryptor::<C>::inner_iv_slice_init(block, iv).map_err(init_err)?;
        Ok(Box::new(CfbEnc(enc)))
    } else {
        let dec = BufDecryptor::<C>::inner_iv_slice_init(block, iv).map_err(init_err)?;
        Ok(Box::new(CfbDec(dec)))
    }
}

fn xor<C>(cipher: core::result::Result<C, InvalidLength>) -> Result<Box<dyn Keystream>>
where
    C: cipher::StreamCipher + Send + 'static,
{
    Ok(Box::new(Xor(cipher.map_err(init_err)?)))
}

/// A stream-cipher method bound to a password.
pub struct StreamCipher {
    kind: StreamKind,
    key: Vec<u8>,
}

impl StreamCipher {
    pub(crate) fn new(kind: StreamKind, password: &str) -> Self {
        StreamCipher {
            key: kdf(password, kind.key_len()),
            kind,
        }
    }
}

impl ConnCipher for StreamCipher {
    fn wrap_stream(&self, stream: BoxedStream) -> BoxedStream {
        Box::new(StreamConn::new(stream, self.kind, self.key.clone()))
    }

    fn supports_packet(&self) -> bool {
        true
    }

    fn encrypt_packet(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let iv_len = self.kind.iv_len();
        let mut out = vec![0u8; iv_len + payload.len()];
        rand::thread_rng().fill_bytes(&mut out[..iv_len]);
        let mut keystream = self.kind.keystream(&self.key, &out[..iv_len], true)?;
        out[iv_len..].copy_from_slice(payload);
        keystream.apply(&mut out[iv_len..]);
        Ok(out)
    }

    fn decrypt_packet(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let iv_len = self.kind.iv_len();
        if payload.len() <= iv_len {
            return Err(Error::ShortBuffer);
        }
        let (iv, data) = payload.split_at(iv_len);
        let mut keystream = self.kind.keystream(&self.key, iv, false)?;
        let mut out = data.to_vec();
        keystream.apply(&mut out);
        Ok(out)
    }
}

/// An encrypted stream. Each direction lazily seeds its keystream on the
/// first byte that flows: writes emit a fresh IV in cleartext, reads
/// consume the peer's.
pub struct StreamConn<S> {
    inner: S,
    kind: StreamKind,
    key: Vec<u8>,
    enc: Option<Box<dyn Keystream>>,
    dec: Option<Box<dyn Keystream>>,
    // Inbound IV bytes collected so far
    handshake: BytesMut,
    // Ciphertext the transport has not accepted yet
    write_buf: BytesMut,
}

impl<S> StreamConn<S> {
    pub(crate) fn new(inner: S, kind: StreamKind, key: Vec<u8>) -> Self {
        StreamConn {
            inner,
            kind,
            key,
            enc: None,
            dec: None,
            handshake: BytesMut::new(),
            write_buf: BytesMut::new(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for StreamConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.dec.is_none() {
            let iv_len = this.kind.iv_len();
            while this.handshake.len() < iv_len {
                let mut tmp = [0u8; 16];
                let want = iv_len - this.handshake.len();
                let mut read_buf = ReadBuf::new(&mut tmp[..want]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        if read_buf.filled().is_empty() {
                            if this.handshake.is_empty() {
                                // EOF before any data: a clean close.
                                return Poll::Ready(Ok(()));
                            }
                            return Poll::Ready(Err(io::Error::from(
                                io::ErrorKind::UnexpectedEof,
                            )));
                        }
                        this.handshake.extend_from_slice(read_buf.filled());
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            let iv = this.handshake.split_to(iv_len);
            let keystream = match this.kind.keystream(&this.key, &iv, false) {
                Ok(k) => k,
                Err(e) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidInput, e)))
                }
            };
            this.dec = Some(keystream);
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let Some(dec) = this.dec.as_mut() {
                    dec.apply(&mut buf.filled_mut()[before..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for StreamConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Ciphertext from an earlier write must leave first.
        match poll_drain(&mut this.inner, &mut this.write_buf, cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.enc.is_none() {
            let mut iv = vec![0u8; this.kind.iv_len()];
            rand::thread_rng().fill_bytes(&mut iv);
            let keystream = match this.kind.keystream(&this.key, &iv, true) {
                Ok(k) => k,
                Err(e) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidInput, e)))
                }
            };
            this.write_buf.extend_from_slice(&iv);
            this.enc = Some(keystream);
        }

        let start = this.write_buf.len();
        this.write_buf.extend_from_slice(buf);
        if let Some(enc) = this.enc.as_mut() {
            enc.apply(&mut this.write_buf[start..]);
        }

        // Best effort; whatever stays buffered goes out on the next
        // write or flush.
        if let Poll::Ready(Err(e)) = poll_drain(&mut this.inner, &mut this.write_buf, cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match poll_drain(&mut this.inner, &mut this.write_buf, cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match poll_drain(&mut this.inner, &mut this.write_buf, cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::new_cipher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_packet_round_trip_all_methods() {
        for kind in StreamKind::ALL {
            let cipher = new_cipher(kind.name(), "pwd").unwrap();
            for len in [1usize, 2, 64, 999, 4096] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let wire = cipher.encrypt_packet(&payload).unwrap();
                assert_eq!(wire.len(), kind.iv_len() + len, "{}", kind.name());
                let plain = cipher.decrypt_packet(&wire).unwrap();
                assert_eq!(plain, payload, "{}", kind.name());
            }
        }
    }

    #[test]
    fn test_packet_short_buffer() {
        let cipher = new_cipher("aes-128-cfb", "pwd").unwrap();
        let wire = cipher.encrypt_packet(&[]).unwrap();
        assert_eq!(wire.len(), 16);
        assert!(matches!(
            cipher.decrypt_packet(&wire),
            Err(Error::ShortBuffer)
        ));
        assert!(matches!(
            cipher.decrypt_packet(&wire[..4]),
            Err(Error::ShortBuffer)
        ));
    }

    #[test]
    fn test_packet_iv_is_fresh() {
        let cipher = new_cipher("chacha20", "pwd").unwrap();
        let a = cipher.encrypt_packet(b"same payload").unwrap();
        let b = cipher.encrypt_packet(b"same payload").unwrap();
        assert_ne!(a[..8], b[..8]);
    }

    async fn exchange(method: &str) {
        let kind = *StreamKind::ALL
            .iter()
            .find(|k| k.name() == method)
            .unwrap();
        let key = kdf("pwd", kind.key_len());
        let (a, b) = tokio::io::duplex(1024);
        let mut client = StreamConn::new(a, kind, key.clone());
        let mut server = StreamConn::new(b, kind, key);

        let payload: Vec<u8> = (0..4096).map(|i| (i % 241) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            // Uneven write sizes so IV and data straddle transport reads.
            for chunk in payload.chunks(777) {
                client.write_all(chunk).await.unwrap();
            }
            client.flush().await.unwrap();
            client
        });

        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        // And the reverse direction over the same connection.
        let mut client = writer.await.unwrap();
        server.write_all(b"reply").await.unwrap();
        server.flush().await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");
    }

    #[tokio::test]
    async fn test_conn_round_trip() {
        for method in ["aes-256-cfb", "aes-128-ctr", "chacha20-ietf", "rc4-md5-6"] {
            exchange(method).await;
        }
    }
}
