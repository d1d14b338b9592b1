//! # nx-proxy
//!
//! A centrally-managed, multi-tenant forwarding proxy node. The node pulls
//! its configuration from a backend over REST, reconciles it into a set of
//! running listener slots, and serves end-user traffic through SOCKS5 and
//! HTTP proxy protocols.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Driver                          │
//! │     (config pull / status push / signal handling)    │
//! ├─────────────────────────────────────────────────────┤
//! │                    Service hub                       │
//! │      (bind-address-keyed slot reconciliation)        │
//! ├─────────────────────────────────────────────────────┤
//! │                      Slots                           │
//! │   (SOCKS5 / HTTP listeners, peer auth, rate limits)  │
//! ├─────────────────────────────────────────────────────┤
//! │                 Peers & connections                  │
//! │  (connection caps, bandwidth shares, byte deltas)    │
//! ├─────────────────────────────────────────────────────┤
//! │                      Bridge                          │
//! │        (rate-paced, byte-accounted TCP relay)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod hub;
pub mod http;
pub mod io;
#[cfg(unix)]
pub mod lock;
pub mod net;
pub mod peer;
pub mod ratelimit;
pub mod rest;
pub mod slot;
pub mod socks5;
pub mod token;

pub use hub::ServiceHub;
pub use token::ServerToken;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Token error: {0}")]
    Token(#[from] token::TokenError),

    #[error("Network error: {0}")]
    Net(#[from] net::NetError),

    #[error("Peer error: {0}")]
    Peer(#[from] peer::PeerError),

    #[error("Auth error: {0}")]
    Auth(#[from] slot::AuthError),

    #[error("Slot error: {0}")]
    Slot(#[from] slot::SlotError),

    #[error("API error: {0}")]
    Rest(#[from] rest::RestError),
}
