//! Keyed primitives shared by the control and data planes: HMAC-SHA-256
//! with truncated ICVs, X25519 key agreement, the HKDF key schedule, and
//! the BEX puzzle.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::identity::Hit;

/// ICV length on the wire: HMAC-SHA-256 truncated to 128 bits (RFC 4868
/// style), a multiple of 4 octets as AH requires.
pub const ICV_LEN: usize = 16;

/// SA authentication keys are full-width SHA-256 HMAC keys.
pub const HMAC_KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Truncated tag used as the AH ICV.
pub fn icv(key: &[u8], data: &[u8]) -> [u8; ICV_LEN] {
    let tag = hmac_sha256(key, data);
    let mut out = [0u8; ICV_LEN];
    out.copy_from_slice(&tag[..ICV_LEN]);
    out
}

/// Constant-time ICV comparison.
pub fn icv_verify(key: &[u8], data: &[u8], received: &[u8]) -> bool {
    if received.len() != ICV_LEN {
        return false;
    }
    let expected = icv(key, data);
    expected[..].ct_eq(received).unwrap_u8() == 1
}

/// Constant-time check for the full-width control-packet HMAC.
pub fn hmac_verify(key: &[u8], data: &[u8], received: &[u8]) -> bool {
    if received.len() != 32 {
        return false;
    }
    let expected = hmac_sha256(key, data);
    expected[..].ct_eq(received).unwrap_u8() == 1
}

/// X25519 keypair for the DIFFIE_HELLMAN parameter.
pub struct DhKeyPair {
    pub secret: [u8; 32],
    pub public: [u8; 32],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        // Clamp for X25519
        secret[0] &= 248;
        secret[31] &= 127;
        secret[31] |= 64;
        let public = x25519_dalek::x25519(secret, x25519_dalek::X25519_BASEPOINT_BYTES);
        Self { secret, public }
    }

    pub fn derive(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        x25519_dalek::x25519(self.secret, *peer_public)
    }
}

/// The two per-direction SA keys drawn from one DH secret. The key labelled
/// for a role authenticates that role's outbound traffic and control HMACs.
pub struct SaKeys {
    pub initiator: [u8; HMAC_KEY_LEN],
    pub responder: [u8; HMAC_KEY_LEN],
}

/// HKDF-SHA-256 key schedule: salt binds both HITs in initiator-first
/// order so the two ends derive identical keys, the info label splits the
/// directions.
pub fn derive_sa_keys(shared: &[u8; 32], initiator_hit: Hit, responder_hit: Hit) -> SaKeys {
    let mut salt = [0u8; 32];
    salt[..16].copy_from_slice(&initiator_hit.0);
    salt[16..].copy_from_slice(&responder_hit.0);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);

    let mut initiator = [0u8; HMAC_KEY_LEN];
    let mut responder = [0u8; HMAC_KEY_LEN];
    hk.expand(b"hip-vpls ah initiator", &mut initiator)
        .expect("okm length fits sha256 expand");
    hk.expand(b"hip-vpls ah responder", &mut responder)
        .expect("okm length fits sha256 expand");
    SaKeys {
        initiator,
        responder,
    }
}

fn puzzle_digest(random_i: &[u8; 8], hit_i: Hit, hit_r: Hit, solution_j: &[u8; 8]) -> [u8; 32] {
    let mut buf = [0u8; 8 + 16 + 16 + 8];
    buf[..8].copy_from_slice(random_i);
    buf[8..24].copy_from_slice(&hit_i.0);
    buf[24..40].copy_from_slice(&hit_r.0);
    buf[40..].copy_from_slice(solution_j);
    sha256(&buf)
}

/// True when the low `k` bits of the digest are zero.
fn difficulty_met(digest: &[u8; 32], k: u8) -> bool {
    let mut bits = k as usize;
    for byte in digest.iter().rev() {
        if bits == 0 {
            return true;
        }
        if bits >= 8 {
            if *byte != 0 {
                return false;
            }
            bits -= 8;
        } else {
            return byte & ((1u8 << bits) - 1) == 0;
        }
    }
    bits == 0
}

/// Brute-force a solution J for the puzzle (I, K). The caller bounds K; the
/// expected cost is 2^K digests.
pub fn puzzle_solve(random_i: &[u8; 8], k: u8, hit_i: Hit, hit_r: Hit) -> [u8; 8] {
    let mut counter = OsRng.next_u64();
    loop {
        let candidate = counter.to_be_bytes();
        if difficulty_met(&puzzle_digest(random_i, hit_i, hit_r, &candidate), k) {
            return candidate;
        }
        counter = counter.wrapping_add(1);
    }
}

pub fn puzzle_verify(
    random_i: &[u8; 8],
    solution_j: &[u8; 8],
    k: u8,
    hit_i: Hit,
    hit_r: Hit,
) -> bool {
    difficulty_met(&puzzle_digest(random_i, hit_i, hit_r, solution_j), k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(fill: u8) -> Hit {
        Hit([fill; 16])
    }

    #[test]
    fn test_dh_agreement() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        assert_eq!(a.derive(&b.public), b.derive(&a.public));
        assert_ne!(a.derive(&b.public), [0u8; 32]);
    }

    #[test]
    fn test_icv_roundtrip_and_tamper() {
        let key = [7u8; 32];
        let data = b"covered bytes";
        let tag = icv(&key, data);
        assert!(icv_verify(&key, data, &tag));
        let mut bad = tag;
        bad[ICV_LEN - 1] ^= 1;
        assert!(!icv_verify(&key, data, &bad));
        assert!(!icv_verify(&key, b"other bytes", &tag));
    }

    #[test]
    fn test_sa_keys_direction_split() {
        let shared = [9u8; 32];
        let keys = derive_sa_keys(&shared, hit(0xAA), hit(0xBB));
        assert_ne!(keys.initiator, keys.responder);

        // Both ends must agree when they name the same initiator.
        let again = derive_sa_keys(&shared, hit(0xAA), hit(0xBB));
        assert_eq!(keys.initiator, again.initiator);
        assert_eq!(keys.responder, again.responder);

        // Swapping roles yields a different schedule.
        let swapped = derive_sa_keys(&shared, hit(0xBB), hit(0xAA));
        assert_ne!(keys.initiator, swapped.initiator);
    }

    #[test]
    fn test_puzzle_solve_verify() {
        let random_i = [3u8; 8];
        let j = puzzle_solve(&random_i, 8, hit(1), hit(2));
        assert!(puzzle_verify(&random_i, &j, 8, hit(1), hit(2)));
    }

    #[test]
    fn test_puzzle_bit_flip_rejected() {
        let random_i = [0x51u8; 8];
        let j = puzzle_solve(&random_i, 16, hit(0x11), hit(0x22));
        let mut flipped = j;
        flipped[7] ^= 0x01;
        assert!(!puzzle_verify(&random_i, &flipped, 16, hit(0x11), hit(0x22)));
    }

    #[test]
    fn test_difficulty_zero_accepts_all() {
        assert!(puzzle_verify(&[0u8; 8], &[0xFFu8; 8], 0, hit(4), hit(5)));
    }
}
