//! Shadowsocks tunnel core.
//!
//! Transports TCP streams and UDP datagrams between a local client and a
//! remote server across an untrusted network, framed by a shared-password
//! cipher suite.
//!
//! # Architecture
//!
//! ```text
//! +-----------+      +--------------------+      +-----------+
//! |  relay/   |      |      crypto/       |      |   udp/    |
//! | (TCP srv  +----->+ registry, stream,  +<-----+ (codec,   |
//! |  + dialer)|      |  AEAD framing, KDF |      |  sessions)|
//! +-----+-----+      +--------------------+      +-----+-----+
//!       |                                              |
//!       +---------------------+------------------------+
//!                             |
//!                      +------v------+
//!                      |   common/   |
//!                      | (addresses, |
//!                      |   errors)   |
//!                      +-------------+
//! ```
//!
//! `config/` turns `ss://` URLs into endpoints for either side.

pub mod common;
pub mod config;
pub mod crypto;
pub mod relay;
pub mod udp;

pub use common::error::{Error, Result};
pub use common::net::Address;
pub use config::Endpoint;
pub use crypto::{cipher_list, is_cipher, new_cipher, BoxedStream, ConnCipher};
pub use relay::{Dialer, Server};
pub use udp::{PacketClient, PacketConn, PacketServer};
