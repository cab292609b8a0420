//! Circuit cryptography
//!
//! Key derivation for both circuit handshakes and the per-direction relay
//! crypto: AES-128-CTR stream ciphers and rolling SHA-1 digests applied to
//! every relay cell.
//!
//! Security: key material is zeroized on drop.

use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, RelayCell};
use crate::protocol::ntor::M_EXPAND;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type. The 16-byte counter block starts at zero and is
/// never reset for the life of the circuit.
type Aes128Ctr = Ctr128BE<Aes128>;

/// Key material for one circuit hop.
///
/// Derived by either handshake and sliced Df | Db | Kf | Kb. The digests
/// seed the rolling SHA-1 states; the keys drive the stream ciphers.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Forward digest seed (client → relay)
    pub forward_digest: [u8; 20],

    /// Backward digest seed (relay → client)
    pub backward_digest: [u8; 20],

    /// Forward encryption key (AES-128)
    pub forward_key: [u8; 16],

    /// Backward encryption key (AES-128)
    pub backward_key: [u8; 16],
}

impl KeyMaterial {
    /// Expand an ntor KEY_SEED into key material.
    ///
    /// KEY_SEED is already the output of HMAC-SHA256, so it is used directly
    /// as the HKDF pseudorandom key and only the Expand step runs, with the
    /// key_expand info string:
    ///
    /// ```text
    /// K = HKDF-SHA256-Expand(KEY_SEED, m_expand, 72)
    /// K = Df (20) | Db (20) | Kf (16) | Kb (16)
    /// ```
    pub fn from_ntor_seed(key_seed: &[u8; 32]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::Handshake("invalid HKDF PRK length".into()))?;

        let mut okm = [0u8; 72];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| TorError::Handshake("HKDF expansion failed".into()))?;

        let km = Self::from_slices(&okm[0..20], &okm[20..40], &okm[40..56], &okm[56..72]);
        okm.zeroize();
        Ok(km)
    }

    /// Relay-side view of the same material: directions swapped.
    ///
    /// Used by loopback harnesses that play the part of the relay.
    pub fn reversed(&self) -> Self {
        Self {
            forward_digest: self.backward_digest,
            backward_digest: self.forward_digest,
            forward_key: self.backward_key,
            backward_key: self.forward_key,
        }
    }

    fn from_slices(df: &[u8], db: &[u8], kf: &[u8], kb: &[u8]) -> Self {
        let mut km = Self {
            forward_digest: [0; 20],
            backward_digest: [0; 20],
            forward_key: [0; 16],
            backward_key: [0; 16],
        };
        km.forward_digest.copy_from_slice(df);
        km.backward_digest.copy_from_slice(db);
        km.forward_key.copy_from_slice(kf);
        km.backward_key.copy_from_slice(kb);
        km
    }
}

/// Output of the legacy TAP key derivation: KH plus the key material.
pub struct TapKeys {
    /// Derivative-key hash the relay proves knowledge of.
    pub kh: [u8; 20],
    /// Circuit key material.
    pub material: KeyMaterial,
}

/// The KDF used by CREATE_FAST (tor-spec section 5.2.1):
///
/// ```text
/// K = SHA1(k0 | [00]) | SHA1(k0 | [01]) | ... , k0 = X | Y
/// KH = K[0:20], Df = K[20:40], Db = K[40:60], Kf = K[60:76], Kb = K[76:92]
/// ```
pub fn kdf_tor(x: &[u8; 20], y: &[u8; 20]) -> TapKeys {
    const NEEDED: usize = 20 + 2 * 20 + 2 * 16;

    let mut k = Vec::with_capacity(NEEDED + 20);
    let mut i = 0u8;
    while k.len() < NEEDED {
        let mut h = Sha1::new();
        h.update(x);
        h.update(y);
        h.update([i]);
        k.extend_from_slice(&h.finalize());
        i += 1;
    }

    let mut kh = [0u8; 20];
    kh.copy_from_slice(&k[0..20]);
    let material = KeyMaterial::from_slices(&k[20..40], &k[40..60], &k[60..76], &k[76..92]);
    k.zeroize();

    TapKeys { kh, material }
}

/// Client side of an in-flight CREATE_FAST handshake.
pub struct TapHandshake {
    /// Our 20 random bytes (X)
    x: [u8; 20],
}

impl TapHandshake {
    /// Start a handshake with fresh random key material.
    pub fn new() -> Self {
        let mut x = [0u8; 20];
        OsRng.fill_bytes(&mut x);
        Self { x }
    }

    /// CREATE_FAST cell payload.
    pub fn payload(&self) -> Vec<u8> {
        self.x.to_vec()
    }

    /// Complete with the relay's CREATED_FAST payload: Y (20) | KH (20).
    ///
    /// Fails when the relay's KH does not match ours, which means it
    /// derived different keys.
    pub fn complete(self, payload: &[u8]) -> Result<KeyMaterial> {
        if payload.len() < 40 {
            return Err(TorError::Handshake("CREATED_FAST payload too short".into()));
        }
        let mut y = [0u8; 20];
        y.copy_from_slice(&payload[0..20]);

        let keys = kdf_tor(&self.x, &y);
        let kh_valid: bool = keys.kh.ct_eq(&payload[20..40]).into();
        if !kh_valid {
            log::warn!("CREATED_FAST derivative key hash mismatch");
            return Err(TorError::Handshake("CREATED_FAST KH mismatch".into()));
        }

        Ok(keys.material)
    }
}

impl Default for TapHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TapHandshake {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}

/// One direction of relay crypto: a persistent CTR cipher and a rolling
/// SHA-1 digest. Both are cumulative over every cell in that direction.
struct DirectionCrypto {
    cipher: Aes128Ctr,
    digest: Sha1,
}

impl DirectionCrypto {
    fn new(key: &[u8; 16], digest_seed: &[u8; 20]) -> Self {
        // IV starts at zero; the cipher counter then runs for the life of
        // the circuit.
        let iv = [0u8; 16];
        let mut digest = Sha1::new();
        digest.update(digest_seed);
        Self {
            cipher: Aes128Ctr::new(key.into(), (&iv).into()),
            digest,
        }
    }

    /// Feed the digest and snapshot its current 4-byte prefix without
    /// resetting the rolling state.
    fn digest_snapshot(&mut self, payload: &[u8]) -> [u8; 4] {
        self.digest.update(payload);
        let out = self.digest.clone().finalize();
        [out[0], out[1], out[2], out[3]]
    }
}

/// Per-circuit relay crypto: forward and backward direction state.
pub struct CryptoState {
    forward: DirectionCrypto,
    backward: DirectionCrypto,
}

impl CryptoState {
    /// Initialize both directions from freshly derived key material.
    pub fn new(material: &KeyMaterial) -> Self {
        Self {
            forward: DirectionCrypto::new(&material.forward_key, &material.forward_digest),
            backward: DirectionCrypto::new(&material.backward_key, &material.backward_digest),
        }
    }

    /// Seal an outbound relay cell: serialize with a zeroed digest field,
    /// fold the plaintext into the forward digest, embed the 4-byte
    /// snapshot, then encrypt the whole 509-byte payload.
    pub fn seal(&mut self, relay: &RelayCell) -> Result<Vec<u8>> {
        let mut payload = relay.to_payload()?;
        payload[5..9].copy_from_slice(&[0, 0, 0, 0]);

        let digest = self.forward.digest_snapshot(&payload);
        payload[5..9].copy_from_slice(&digest);

        self.forward.cipher.apply_keystream(&mut payload);
        Ok(payload.to_vec())
    }

    /// Open an inbound relay payload: decrypt with the backward cipher,
    /// check the recognized field, verify the rolling digest, then parse.
    ///
    /// A nonzero recognized field means the cell was meant for a further
    /// hop; on a one-hop circuit that is a digest failure and tears the
    /// circuit down, as does a digest mismatch.
    pub fn open(&mut self, payload: &[u8]) -> Result<RelayCell> {
        if payload.len() != Cell::PAYLOAD_SIZE {
            return Err(TorError::Cell(format!(
                "relay payload is {} bytes, want {}",
                payload.len(),
                Cell::PAYLOAD_SIZE
            )));
        }

        let mut plain = payload.to_vec();
        self.backward.cipher.apply_keystream(&mut plain);

        if plain[1] != 0 || plain[2] != 0 {
            log::warn!("relay cell not recognized (meant for a further hop?)");
            return Err(TorError::Digest);
        }

        let received = [plain[5], plain[6], plain[7], plain[8]];
        plain[5..9].copy_from_slice(&[0, 0, 0, 0]);

        let expected = self.backward.digest_snapshot(&plain);
        let digest_valid: bool = expected.ct_eq(&received).into();
        if !digest_valid {
            log::warn!(
                "relay digest mismatch: received {:02x?} expected {:02x?}",
                received,
                expected
            );
            return Err(TorError::Digest);
        }

        let mut relay = RelayCell::from_payload(&plain)?;
        relay.digest = received;
        Ok(relay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::RelayCommand;

    fn test_material() -> KeyMaterial {
        KeyMaterial {
            forward_digest: [5u8; 20],
            backward_digest: [6u8; 20],
            forward_key: [1u8; 16],
            backward_key: [2u8; 16],
        }
    }

    #[test]
    fn kdf_tor_reference_vector() {
        // X all zeros, Y all 0x01.
        let x = [0u8; 20];
        let y = [1u8; 20];
        let keys = kdf_tor(&x, &y);

        assert_eq!(
            hex::encode(keys.kh),
            "1ceade95c113e99f1ef16bb99bd540071f9f2c3b"
        );
        assert_eq!(
            hex::encode(keys.material.forward_digest),
            "9aa5b5a4fa6b475c3fa74aeb9b70cd93b1cb0be7"
        );
        assert_eq!(
            hex::encode(keys.material.backward_digest),
            "d294f2cc7b94a97615c8b89c79fb42297de88be5"
        );
        assert_eq!(
            hex::encode(keys.material.forward_key),
            "785de53d70210031c8d2db4e00dd8140"
        );
        assert_eq!(
            hex::encode(keys.material.backward_key),
            "228e5a205b0ebf15b371bcfc1170f7ca"
        );
    }

    #[test]
    fn ntor_seed_expansion_is_deterministic() {
        let seed = [42u8; 32];
        let a = KeyMaterial::from_ntor_seed(&seed).unwrap();
        let b = KeyMaterial::from_ntor_seed(&seed).unwrap();
        assert_eq!(a.forward_key, b.forward_key);
        assert_eq!(a.backward_digest, b.backward_digest);
        assert_ne!(a.forward_key, a.backward_key);
    }

    #[test]
    fn tap_handshake_rejects_bad_kh() {
        let hs = TapHandshake::new();
        let x_payload = hs.payload();
        assert_eq!(x_payload.len(), 20);

        let mut created = vec![1u8; 20];
        created.extend_from_slice(&[0u8; 20]); // wrong KH
        assert!(matches!(
            hs.complete(&created),
            Err(TorError::Handshake(_))
        ));
    }

    #[test]
    fn tap_handshake_accepts_matching_kh() {
        let hs = TapHandshake::new();
        let mut x = [0u8; 20];
        x.copy_from_slice(&hs.payload());
        let y = [7u8; 20];

        let mut created = y.to_vec();
        created.extend_from_slice(&kdf_tor(&x, &y).kh);
        let material = hs.complete(&created).unwrap();
        assert_eq!(material.forward_key, kdf_tor(&x, &y).material.forward_key);
    }

    #[test]
    fn seal_then_open_through_mirrored_peer() {
        let material = test_material();
        let mut client = CryptoState::new(&material);
        let mut relay_side = CryptoState::new(&material.reversed());

        for i in 0..5u8 {
            let cell = RelayCell::new(RelayCommand::Data, 3, vec![i; 100]);
            // Client's forward track is the relay's backward track.
            let wire = client.seal(&cell).unwrap();
            let opened = relay_side.open(&wire).unwrap();
            assert_eq!(opened.command, RelayCommand::Data);
            assert_eq!(opened.stream_id, 3);
            assert_eq!(opened.data, vec![i; 100]);
        }
    }

    #[test]
    fn digests_are_cumulative() {
        let material = test_material();
        let mut a = CryptoState::new(&material);
        let mut b = CryptoState::new(&material);

        let cell = RelayCell::new(RelayCommand::Data, 1, vec![9; 10]);
        let w1 = a.seal(&cell).unwrap();
        let w2 = a.seal(&cell).unwrap();
        // Same plaintext, different digest and keystream position.
        assert_ne!(w1, w2);

        let v1 = b.seal(&cell).unwrap();
        assert_eq!(w1, v1);
    }

    #[test]
    fn open_rejects_tampered_payload() {
        let material = test_material();
        let mut client = CryptoState::new(&material);
        let mut peer = CryptoState::new(&material.reversed());

        let cell = RelayCell::new(RelayCommand::Data, 1, b"hello".to_vec());
        let mut wire = peer.seal(&cell).unwrap();
        wire[100] ^= 0xff;
        assert!(matches!(client.open(&wire), Err(TorError::Digest)));
    }
}
