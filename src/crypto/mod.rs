//! Cipher registry and the capability surface shared by every method.
//!
//! The registry is a read-only table built on first use; the server and
//! client both go through [`new_cipher`] so there is no observable
//! registration order.

pub mod aead;
pub mod dummy;
pub mod kdf;
pub mod stream;

use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

use aead::AeadKind;
use dummy::DummyCipher;
use stream::StreamKind;

/// Object-safe alias for the byte streams the ciphers wrap.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Capability surface of a configured cipher.
///
/// Every method can wrap a TCP stream. Stream ciphers (and `dummy`)
/// additionally support the one-shot packet transforms the UDP relay
/// needs; AEAD methods do not, and the packet client/server refuse them
/// at construction.
pub trait ConnCipher: Send + Sync {
    /// Wrap a raw stream; all further reads and writes flow through the
    /// cipher.
    fn wrap_stream(&self, stream: BoxedStream) -> BoxedStream;

    /// Whether the one-shot packet transforms are available.
    fn supports_packet(&self) -> bool {
        false
    }

    /// Encrypt a whole datagram payload.
    fn encrypt_packet(&self, _payload: &[u8]) -> Result<Vec<u8>> {
        Err(Error::unsupported("one-shot packet encryption"))
    }

    /// Decrypt a whole datagram payload.
    fn decrypt_packet(&self, _payload: &[u8]) -> Result<Vec<u8>> {
        Err(Error::unsupported("one-shot packet decryption"))
    }
}

#[derive(Clone, Copy)]
enum Method {
    Stream(StreamKind),
    Aead(AeadKind),
    Dummy,
}

static REGISTRY: Lazy<HashMap<&'static str, Method>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for kind in StreamKind::ALL {
        table.insert(kind.name(), Method::Stream(*kind));
    }
    for kind in AeadKind::ALL {
        table.insert(kind.name(), Method::Aead(*kind));
    }
    table.insert("dummy", Method::Dummy);
    table
});

/// All registered method names, sorted.
pub fn cipher_list() -> Vec<&'static str> {
    let mut list: Vec<_> = REGISTRY.keys().copied().collect();
    list.sort_unstable();
    list
}

/// Whether `method` names a registered cipher.
pub fn is_cipher(method: &str) -> bool {
    REGISTRY.contains_key(method.to_lowercase().as_str())
}

/// Bind a method name and password to a ready-to-use cipher.
pub fn new_cipher(method: &str, password: &str) -> Result<Arc<dyn ConnCipher>> {
    if password.is_empty() {
        return Err(Error::EmptyPassword);
    }
    let method = method.to_lowercase();
    match REGISTRY.get(method.as_str()) {
        Some(Method::Stream(kind)) => Ok(Arc::new(stream::StreamCipher::new(*kind, password))),
        Some(Method::Aead(kind)) => Ok(Arc::new(aead::AeadCipher::new(*kind, password))),
        Some(Method::Dummy) => Ok(Arc::new(DummyCipher)),
        None => Err(Error::UnknownCipher(method)),
    }
}

/// Push as much of `pending` into `inner` as the transport accepts right
/// now. Ready(Ok) means the buffer is empty.
pub(crate) fn poll_drain<S: AsyncWrite + Unpin>(
    inner: &mut S,
    pending: &mut BytesMut,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while !pending.is_empty() {
        match Pin::new(&mut *inner).poll_write(cx, pending) {
            Poll::Ready(Ok(0)) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write zero",
                )))
            }
            Poll::Ready(Ok(n)) => pending.advance(n),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
    }
    Poll::Ready(Ok(()))
}
