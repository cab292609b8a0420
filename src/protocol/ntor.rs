//! ntor handshake implementation
//!
//! Implements the ntor (ntor1) key exchange used for circuit creation,
//! based on X25519 Diffie-Hellman with HMAC-SHA256 key extraction.
//!
//! Security: AUTH verification uses constant-time comparison to prevent
//! timing attacks.

use crate::error::{Result, TorError};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

/// Protocol identifier, exactly as it appears in the key-derivation inputs.
pub const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
/// HKDF info string for expanding KEY_SEED into circuit key material.
pub const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Handshake type code for CREATE2 (ntor).
pub const HTYPE_NTOR: u16 = 2;

/// Client side of an in-flight ntor handshake.
///
/// The ephemeral secret is zeroized on drop by x25519-dalek.
pub struct NtorHandshake {
    /// Client's ephemeral secret key
    client_secret: StaticSecret,

    /// Client's ephemeral public key
    client_public: PublicKey,

    /// Relay identity fingerprint (ID)
    relay_id: [u8; 20],

    /// Relay long-term ntor onion key (B)
    relay_onion_key: PublicKey,
}

impl NtorHandshake {
    /// Start a handshake against the given relay.
    pub fn new(relay_id: [u8; 20], relay_onion_key: [u8; 32]) -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);

        Self {
            client_secret,
            client_public,
            relay_id,
            relay_onion_key: PublicKey::from(relay_onion_key),
        }
    }

    /// Client's ephemeral public key (X).
    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public
    }

    /// CREATE2 cell payload: HTYPE | HLEN | ID (20) | B (32) | X (32).
    pub fn create2_payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 84);
        data.extend_from_slice(&HTYPE_NTOR.to_be_bytes());
        data.extend_from_slice(&84u16.to_be_bytes());
        data.extend_from_slice(&self.relay_id);
        data.extend_from_slice(self.relay_onion_key.as_bytes());
        data.extend_from_slice(self.client_public.as_bytes());
        data
    }

    /// Complete the handshake with the relay's Y and AUTH.
    ///
    /// Returns KEY_SEED on success. Fails when the computed AUTH differs
    /// from the one the relay sent; the circuit is torn down in that case.
    ///
    /// secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
    pub fn complete(self, server_public: &[u8; 32], server_auth: &[u8; 32]) -> Result<[u8; 32]> {
        let server_public = PublicKey::from(*server_public);

        let shared_yx = self.client_secret.diffie_hellman(&server_public);
        let shared_bx = self.client_secret.diffie_hellman(&self.relay_onion_key);

        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.relay_id);
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_sha256(T_KEY, &secret_input);
        let verify = hmac_sha256(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 + 20 + 32 * 3 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.relay_id);
        auth_input.extend_from_slice(self.relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hmac_sha256(T_MAC, &auth_input);

        let auth_valid: bool = computed_auth.ct_eq(server_auth).into();
        if !auth_valid {
            log::warn!("ntor AUTH verification failed");
            return Err(TorError::Handshake("ntor AUTH mismatch".into()));
        }

        log::debug!("ntor AUTH verified");
        Ok(key_seed)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Parse a CREATED2 cell payload: HLEN (2) | Y (32) | AUTH (32).
pub fn parse_created2(payload: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if payload.len() < 2 {
        return Err(TorError::Handshake("CREATED2 payload too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if hlen < 64 || payload.len() < 2 + hlen {
        return Err(TorError::Handshake(format!(
            "CREATED2 handshake data too short: {}",
            hlen
        )));
    }

    let mut server_public = [0u8; 32];
    server_public.copy_from_slice(&payload[2..34]);
    let mut server_auth = [0u8; 32];
    server_auth.copy_from_slice(&payload[34..66]);

    Ok((server_public, server_auth))
}
