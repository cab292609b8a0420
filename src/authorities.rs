//! Directory authority records.
//!
//! Compiled-in list of the directory authorities. The directory-stream path
//! always targets the first entry; the rest are kept for completeness and
//! rotation by hand.
//!
//! The identity is the base64-encoded SHA-1 fingerprint of the relay's RSA
//! identity key (20 bytes, unpadded). The ntor onion key is the relay's
//! long-term Curve25519 public key (32 bytes, unpadded base64).

use crate::error::{Result, TorError};
use base64::{engine::general_purpose, Engine as _};
use std::net::{IpAddr, SocketAddr};

/// A directory authority we can open an OR connection to.
#[derive(Debug, Clone)]
pub struct Authority {
    /// Authority nickname
    pub name: &'static str,

    /// IPv4/IPv6 address, as text
    pub ip: &'static str,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// Identity fingerprint (base64, 20 bytes decoded)
    pub identity: &'static str,

    /// ntor onion key (base64, 32 bytes decoded)
    pub ntor_onion_key: &'static str,
}

impl Authority {
    /// Socket address for the OR connection.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| TorError::Internal(format!("bad authority address: {}", self.ip)))?;
        Ok(SocketAddr::new(ip, self.or_port))
    }

    /// Decoded 20-byte identity fingerprint.
    pub fn identity_fingerprint(&self) -> Result<[u8; 20]> {
        let bytes = decode_unpadded(self.identity)?;
        bytes
            .try_into()
            .map_err(|_| TorError::Internal(format!("identity of {} is not 20 bytes", self.name)))
    }

    /// Decoded 32-byte ntor onion key.
    pub fn ntor_key(&self) -> Result<[u8; 32]> {
        let bytes = decode_unpadded(self.ntor_onion_key)?;
        bytes
            .try_into()
            .map_err(|_| TorError::Internal(format!("ntor key of {} is not 32 bytes", self.name)))
    }
}

/// Base64 decode tolerating the unpadded form directory documents use.
fn decode_unpadded(s: &str) -> Result<Vec<u8>> {
    let mut padded = s.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    general_purpose::STANDARD
        .decode(&padded)
        .map_err(|e| TorError::Internal(format!("bad base64: {}", e)))
}

/// Hardcoded directory authorities.
///
/// Addresses and identities are from the Tor source
/// (src/app/config/auth_dirs.inc). ntor onion keys rotate with the
/// authorities' descriptors and must be refreshed when they do.
pub const AUTHORITIES: &[Authority] = &[
    Authority {
        name: "moria1",
        ip: "128.31.0.39",
        or_port: 9101,
        identity: "lpXfw1/+uGEym58asExGOXAgzjE",
        ntor_onion_key: "kM0bmaq1pV9VBw+Gx0DpORTvGUSZ9/rlPqRZNf34OAY",
    },
    Authority {
        name: "tor26",
        ip: "86.59.21.38",
        or_port: 443,
        identity: "hHsfhQNE14dkkaVIkvkEk05OuF0",
        ntor_onion_key: "Tdcws0nLgW5ORs6VC/1JiLDKy2esTzarVU/D/kXthps",
    },
    Authority {
        name: "dizum",
        ip: "45.66.33.45",
        or_port: 443,
        identity: "fqbq1v2DCDxTj0QDi7+gd1h911U",
        ntor_onion_key: "kZEHY5wxEVTbjWKgspYlzmTIW+XUEsrDfmKr4vv+a2A",
    },
    Authority {
        name: "gabelmoo",
        ip: "131.188.40.189",
        or_port: 443,
        identity: "8gREE9rC4C49a89HNaGbyh3pcoE",
        ntor_onion_key: "x/gvNmmLTnixbzj59JYsIXr6ZrysW/9txXXOcMoNNSY",
    },
    Authority {
        name: "dannenberg",
        ip: "193.23.244.244",
        or_port: 443,
        identity: "e+aD5l1IFBMhxe2S8HXFU2SscSM",
        ntor_onion_key: "EZCwHPG7QvIi7M5SMGixmvm1CD9V/yzQuHrZbGhc3Fg",
    },
    Authority {
        name: "maatuska",
        ip: "171.25.193.9",
        or_port: 80,
        identity: "vWqCklXLCOZvvn03SDY1huRrOBA",
        ntor_onion_key: "zADLtP7MP2yF0Up59o9fTWwcK95yxCDsx1TKn61GJhc",
    },
    Authority {
        name: "longclaw",
        ip: "199.58.81.140",
        or_port: 443,
        identity: "dKkQZGvO77zS6HT8HcmXQw+WgUU",
        ntor_onion_key: "CSU+htjne/d/AfOs2YFNFOxx1fyngv6jUi5nwqlbEn4",
    },
    Authority {
        name: "bastet",
        ip: "204.13.164.118",
        or_port: 443,
        identity: "JOLxORIdQ5TFS1vMNos7QRhXxBM",
        ntor_onion_key: "vNq99UsJYEUPrjYxOrcw1n+bxjM9YH0xjiVqhjUlc4c",
    },
    Authority {
        name: "Faravahar",
        ip: "154.35.175.225",
        or_port: 443,
        identity: "z20Kr7OFvnG44RH8XP9LR5I3M7w",
        ntor_onion_key: "F4ajwvSOgzC/sOWaYHWcietlQ635qBaDAg18Hx47A7k",
    },
];
