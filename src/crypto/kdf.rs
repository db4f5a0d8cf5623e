//! Password-to-key derivation

use md5::{Digest, Md5};

/// Derive a key from a password using EVP_BytesToKey(md5, no salt, one
/// iteration), the derivation the original Shadowsocks protocol uses.
pub fn kdf(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}
