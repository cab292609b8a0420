//! Minimal Tor client core.
//!
//! Establishes an onion-routed connection to a directory authority and
//! opens directory streams through a one-hop cryptographic circuit:
//!
//! - byte-accurate cell framing on the TLS-wrapped link, with the
//!   VERSIONS / CERTS / AUTH_CHALLENGE / NETINFO handshake;
//! - ntor (Curve25519 + HMAC-SHA256 + HKDF) and legacy CREATE_FAST circuit
//!   handshakes, AES-128-CTR relay encryption and rolling SHA-1 digests in
//!   both directions;
//! - multiplexed streams with SENDME flow control at circuit and stream
//!   granularity.
//!
//! Scheduling is single-threaded and cooperative: a poll-shaped readiness
//! reactor drives the link, and everything that would block suspends until
//! the next readiness event. See [`coordinator::ProxyCoordinator`] for the
//! public surface.

pub mod authorities;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod reactor;
pub mod transport;

pub use authorities::{Authority, AUTHORITIES};
pub use config::{ClientConfig, HandshakeKind};
pub use coordinator::{ProxyCoordinator, RequestId, StreamEvents};
pub use error::{ErrorScope, Result, TorError};
pub use transport::{Connector, TlsConnector, TlsTransport, Transport};
