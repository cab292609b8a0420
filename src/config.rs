//! Client configuration.

use serde::{Deserialize, Serialize};

/// Which circuit handshake to run against the first hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeKind {
    /// CREATE2 with the ntor (Curve25519) handshake. Default.
    Ntor,
    /// CREATE_FAST, the legacy SHA-1 handshake. Only acceptable against a
    /// first hop, which is all this client builds.
    Fast,
}

/// Tunables for the client core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Circuit handshake to use when opening circuits.
    pub handshake: HandshakeKind,

    /// Link protocol versions advertised in our VERSIONS cell.
    pub link_versions: Vec<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeKind::Ntor,
            link_versions: vec![3, 4, 5],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_advertises_3_4_5() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.link_versions, vec![3, 4, 5]);
        assert_eq!(cfg.handshake, HandshakeKind::Ntor);
    }
}
