//! AEAD framing.
//!
//! Each direction starts with a cleartext salt; a sub-key is derived via
//! HKDF-SHA1 and the stream becomes a sequence of records, each a sealed
//! 2-byte length followed by the sealed payload. The nonce is a
//! little-endian counter shared by both seals of a record, incremented
//! once per AEAD operation.

use crate::crypto::kdf::kdf;
use crate::crypto::{poll_drain, BoxedStream, ConnCipher};
use crate::{Error, Result};
use aes::Aes192;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use bytes::BytesMut;
use cipher::consts::U12;
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha1::Sha1;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Maximum payload carried by one record (14-bit size field).
pub(crate) const MAX_PAYLOAD: usize = 0x3FFF;

const TAG_LEN: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Registered AEAD methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    Chacha20IetfPoly1305,
    XChacha20Poly1305,
}

impl AeadKind {
    pub const ALL: &'static [AeadKind] = &[
        AeadKind::Aes128Gcm,
        AeadKind::Aes192Gcm,
        AeadKind::Aes256Gcm,
        AeadKind::Chacha20IetfPoly1305,
        AeadKind::XChacha20Poly1305,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AeadKind::Aes128Gcm => "aes-128-gcm",
            AeadKind::Aes192Gcm => "aes-192-gcm",
            AeadKind::Aes256Gcm => "aes-256-gcm",
            AeadKind::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            AeadKind::XChacha20Poly1305 => "xchacha20-poly1305",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            AeadKind::Aes128Gcm => 16,
            AeadKind::Aes192Gcm => 24,
            AeadKind::Aes256Gcm
            | AeadKind::Chacha20IetfPoly1305
            | AeadKind::XChacha20Poly1305 => 32,
        }
    }

    pub fn salt_len(&self) -> usize {
        self.key_len().max(16)
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            AeadKind::XChacha20Poly1305 => 24,
            _ => 12,
        }
    }

    fn sealer(&self, subkey: &[u8]) -> Result<AeadImpl> {
        let invalid = |_| Error::config("AEAD initialization failed");
        Ok(match self {
            AeadKind::Aes128Gcm => {
                AeadImpl::Aes128(Aes128Gcm::new_from_slice(subkey).map_err(invalid)?)
            }
            AeadKind::Aes192Gcm => {
                AeadImpl::Aes192(Aes192Gcm::new_from_slice(subkey).map_err(invalid)?)
            }
            AeadKind::Aes256Gcm => {
                AeadImpl::Aes256(Aes256Gcm::new_from_slice(subkey).map_err(invalid)?)
            }
            AeadKind::Chacha20IetfPoly1305 => {
                AeadImpl::Chacha(ChaCha20Poly1305::new_from_slice(subkey).map_err(invalid)?)
            }
            AeadKind::XChacha20Poly1305 => {
                AeadImpl::XChacha(XChaCha20Poly1305::new_from_slice(subkey).map_err(invalid)?)
            }
        })
    }
}

enum AeadImpl {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
    Chacha(ChaCha20Poly1305),
    XChacha(XChaCha20Poly1305),
}

impl AeadImpl {
    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            AeadImpl::Aes128(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext),
            AeadImpl::Aes192(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext),
            AeadImpl::Aes256(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext),
            AeadImpl::Chacha(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext),
            AeadImpl::XChacha(c) => c.encrypt(XNonce::from_slice(nonce), plaintext),
        }
        .map_err(|_| Error::AeadOpen)
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self {
            AeadImpl::Aes128(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
            AeadImpl::Aes192(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
            AeadImpl::Aes256(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
            AeadImpl::Chacha(c) => {
                c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            }
            AeadImpl::XChacha(c) => c.decrypt(XNonce::from_slice(nonce), ciphertext),
        }
        .map_err(|_| Error::AeadOpen)
    }
}

/// Derive the per-connection sub-key from the master key and salt.
fn derive_subkey(key: &[u8], salt: &[u8]) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key.len()];
    hk.expand(b"ss-subkey", &mut subkey)
        .expect("subkey shorter than HKDF limit");
    subkey
}

/// Increment a little-endian counter, carrying on overflow.
fn increment(nonce: &mut [u8]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// An AEAD method bound to a password.
pub struct AeadCipher {
    kind: AeadKind,
    key: Vec<u8>,
}

impl AeadCipher {
    pub(crate) fn new(kind: AeadKind, password: &str) -> Self {
        AeadCipher {
            key: kdf(password, kind.key_len()),
            kind,
        }
    }
}

impl ConnCipher for AeadCipher {
    fn wrap_stream(&self, stream: BoxedStream) -> BoxedStream {
        Box::new(AeadConn::new(stream, self.kind, self.key.clone()))
    }
}

enum ReadState {
    Salt,
    Length,
    Payload(usize),
}

/// An AEAD-framed stream.
pub struct AeadConn<S> {
    inner: S,
    kind: AeadKind,
    key: Vec<u8>,
    seal: Option<AeadImpl>,
    write_nonce: Vec<u8>,
    open: Option<AeadImpl>,
    read_nonce: Vec<u8>,
    state: ReadState,
    // Wire bytes collected toward the block the read state needs
    read_buf: BytesMut,
    // Decrypted plaintext not yet delivered to the caller
    leftover: BytesMut,
    // Ciphertext the transport has not accepted yet
    write_buf: BytesMut,
}

impl<S> AeadConn<S> {
    pub(crate) fn new(inner: S, kind: AeadKind, key: Vec<u8>) -> Self {
        let nonce_len = kind.nonce_len();
        AeadConn {
            inner,
            kind,
            key,
            seal: None,
            write_nonce: vec![0u8; nonce_len],
            open: None,
            read_nonce: vec![0u8; nonce_len],
            state: ReadState::Salt,
            read_buf: BytesMut::new(),
            leftover: BytesMut::new(),
            write_buf: BytesMut::new(),
        }
    }
}

fn open_failed() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, Error::AeadOpen)
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for AeadConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            // At most one record's worth of plaintext per call.
            if !this.leftover.is_empty() {
                let n = buf.remaining().min(this.leftover.len());
                buf.put_slice(&this.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let needed = match this.state {
                ReadState::Salt => this.kind.salt_len(),
                ReadState::Length => 2 + TAG_LEN,
                ReadState::Payload(size) => size + TAG_LEN,
            };

            while this.read_buf.len() < needed {
                let mut tmp = [0u8; 4096];
                let want = (needed - this.read_buf.len()).min(tmp.len());
                let mut read_buf = ReadBuf::new(&mut tmp[..want]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        if read_buf.filled().is_empty() {
                            // EOF is only clean on a record boundary (or
                            // before the salt ever arrived).
                            let clean = this.read_buf.is_empty()
                                && matches!(this.state, ReadState::Salt | ReadState::Length);
                            if clean {
                                return Poll::Ready(Ok(()));
                            }
                            return Poll::Ready(Err(io::Error::from(
                                io::ErrorKind::UnexpectedEof,
                            )));
                        }
                        this.read_buf.extend_from_slice(read_buf.filled());
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            match this.state {
                ReadState::Salt => {
                    let salt = this.read_buf.split_to(needed);
                    let subkey = derive_subkey(&this.key, &salt);
                    let opener = match this.kind.sealer(&subkey) {
                        Ok(o) => o,
                        Err(e) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                e,
                            )))
                        }
                    };
                    this.open = Some(opener);
                    this.state = ReadState::Length;
                }
                ReadState::Length => {
                    let block = this.read_buf.split_to(needed);
                    let open = match this.open.as_ref() {
                        Some(o) => o,
                        None => return Poll::Ready(Err(open_failed())),
                    };
                    let plain = match open.open(&this.read_nonce, &block) {
                        Ok(p) => p,
                        Err(_) => return Poll::Ready(Err(open_failed())),
                    };
                    increment(&mut this.read_nonce);
                    let size = u16::from_be_bytes([plain[0], plain[1]]);
                    if size & 0xC000 != 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "reserved length bits set",
                        )));
                    }
                    this.state = ReadState::Payload(size as usize);
                }
                ReadState::Payload(_) => {
                    let block = this.read_buf.split_to(needed);
                    let open = match this.open.as_ref() {
                        Some(o) => o,
                        None => return Poll::Ready(Err(open_failed())),
                    };
                    let plain = match open.open(&this.read_nonce, &block) {
                        Ok(p) => p,
                        Err(_) => return Poll::Ready(Err(open_failed())),
                    };
                    increment(&mut this.read_nonce);
                    this.leftover.extend_from_slice(&plain);
                    this.state = ReadState::Length;
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for AeadConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match poll_drain(&mut this.inner, &mut this.write_buf, cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.seal.is_none() {
            let mut salt = vec![0u8; this.kind.salt_len()];
            rand::thread_rng().fill_bytes(&mut salt);
            let subkey = derive_subkey(&this.key, &salt);
            let sealer = match this.kind.sealer(&subkey) {
                Ok(s) => s,
                Err(e) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidInput, e)))
                }
            };
            this.write_buf.extend_from_slice(&salt);
            this.seal = Some(sealer);
        }

        for chunk in buf.chunks(MAX_PAYLOAD) {
            let seal = match this.seal.as_ref() {
                Some(s) => s,
                None => return Poll::Ready(Err(open_failed())),
            };
            let length = (chunk.len() as u16).to_be_bytes();
            let sealed_length = match seal.seal(&this.write_nonce, &length) {
                Ok(s) => s,
                Err(_) => return Poll::Ready(Err(open_failed())),
            };
            increment(&mut this.write_nonce);
            let seal = match this.seal.as_ref() {
                Some(s) => s,
                None => return Poll::Ready(Err(open_failed())),
            };
            let sealed_payload = match seal.seal(&this.write_nonce, chunk) {
                Ok(s) => s,
                Err(_) => return Poll::Ready(Err(open_failed())),
            };
            increment(&mut this.write_nonce);
            this.write_buf.extend_from_slice(&sealed_length);
            this.write_buf.extend_from_slice(&sealed_payload);
        }

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
