//! Passthrough method for debugging and plumbing tests.

use crate::crypto::{BoxedStream, ConnCipher};
use crate::Result;

pub struct DummyCipher;

impl ConnCipher for DummyCipher {
    fn wrap_stream(&self, stream: BoxedStream) -> BoxedStream {
        stream
    }

    fn supports_packet(&self) -> bool {
        true
    }

    fn encrypt_packet(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn decrypt_packet(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}
