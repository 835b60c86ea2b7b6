//! Local host identity: an Ed25519 keypair and the 128-bit Host Identity
//! Tag derived from its public key.

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::info;
use rand::rngs::OsRng;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::crypto::sha256;

/// ORCHID context identifier mixed into the HIT hash input.
const ORCHID_CONTEXT: [u8; 16] = [
    0xF0, 0xEF, 0xF0, 0x2F, 0xBF, 0xF4, 0x3D, 0x0F, 0xE7, 0x93, 0x0C, 0x3C, 0x6E, 0x61, 0x74, 0xEA,
];

/// Hash-and-encoding identifier occupying the OGA nibble.
const ORCHID_OGA_ID: u8 = 0x03;

/// 128-bit Host Identity Tag: the stable peer identifier, independent of
/// the peer's locator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hit(pub [u8; 16]);

impl Hit {
    /// ORCHID-style derivation: 28-bit prefix 2001:20::/28, 4-bit OGA ID,
    /// then the leading 96 bits of SHA-256 over context and public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut input = [0u8; 16 + 32];
        input[..16].copy_from_slice(&ORCHID_CONTEXT);
        input[16..].copy_from_slice(public_key);
        let digest = sha256(&input);

        let mut hit = [0u8; 16];
        hit[0] = 0x20;
        hit[1] = 0x01;
        hit[2] = 0x00;
        hit[3] = 0x20 | ORCHID_OGA_ID;
        hit[4..].copy_from_slice(&digest[..12]);
        Hit(hit)
    }
}

impl fmt::Display for Hit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hit({})", hex::encode(self.0))
    }
}

/// The local router's host identity.
pub struct Identity {
    signing: SigningKey,
    hit: Hit,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// Deterministic construction from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let hit = Hit::from_public_key(signing.verifying_key().as_bytes());
        Self { signing, hit }
    }

    /// Load from disk: 64 bytes, seed followed by public key, with a
    /// keypair consistency check.
    pub fn load(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).context(format!("failed to read identity from {:?}", path))?;
        if data.len() != 64 {
            anyhow::bail!(
                "invalid identity file {:?}: expected 64 bytes, got {}",
                path,
                data.len()
            );
        }
        let seed: [u8; 32] = data[..32].try_into().unwrap();
        let stored_public: [u8; 32] = data[32..].try_into().unwrap();

        let identity = Self::from_seed(seed);
        if identity.public_key_bytes() != stored_public {
            anyhow::bail!(
                "invalid identity file {:?}: public key does not match private key",
                path
            );
        }

        info!("loaded host identity from {:?}, hit {}", path, identity.hit);
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("failed to create identity directory")?;
            }
        }

        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&self.signing.to_bytes());
        data.extend_from_slice(&self.public_key_bytes());
        fs::write(path, &data).context(format!("failed to write identity to {:?}", path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        info!("saved host identity to {:?}", path);
        Ok(())
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("generating new host identity...");
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn hit(&self) -> Hit {
        self.hit
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature against a raw 32-byte public key. A key
/// that fails to decode verifies nothing.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key
            .verify(message, &Signature::from_bytes(signature))
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_is_deterministic_and_prefixed() {
        let id = Identity::from_seed([7u8; 32]);
        let again = Hit::from_public_key(&id.public_key_bytes());
        assert_eq!(id.hit(), again);
        assert_eq!(id.hit().0[0], 0x20);
        assert_eq!(id.hit().0[1], 0x01);
        assert_eq!(id.hit().0[3] & 0xF0, 0x20);
    }

    #[test]
    fn test_distinct_keys_distinct_hits() {
        let a = Identity::from_seed([1u8; 32]);
        let b = Identity::from_seed([2u8; 32]);
        assert_ne!(a.hit(), b.hit());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::from_seed([9u8; 32]);
        let sig = id.sign(b"covered");
        assert!(verify_signature(&id.public_key_bytes(), b"covered", &sig));
        assert!(!verify_signature(&id.public_key_bytes(), b"altered", &sig));

        let other = Identity::from_seed([10u8; 32]);
        assert!(!verify_signature(&other.public_key_bytes(), b"covered", &sig));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = std::env::temp_dir().join("hipvpls-identity-test");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("identity.key");

        let id = Identity::generate();
        id.save(&path).unwrap();
        let loaded = Identity::load(&path).unwrap();
        assert_eq!(loaded.hit(), id.hit());
        assert_eq!(loaded.public_key_bytes(), id.public_key_bytes());

        let _ = fs::remove_dir_all(&dir);
    }
}
