//! TCP relay: server side and client dialer

mod client;
mod server;

pub use client::Dialer;
pub use server::Server;

use std::time::Duration;

/// Dial timeout applied when none is configured.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);
