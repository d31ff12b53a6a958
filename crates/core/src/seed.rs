//! Randomization seeds.
//!
//! Every layout permutation flows through one `StdRng` derived from a 256-bit
//! seed, so a recorded seed reproduces a code variant byte-for-byte. A fresh
//! seed is drawn from OS entropy once per process at attach time.

use crate::result::Error;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// A 256-bit randomization seed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    inner: [u8; 32],
}

impl Seed {
    /// Draws a new seed from OS entropy.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self { inner: seed }
    }

    /// Creates a seed from a hex string (with or without a `0x` prefix).
    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        if hex_str.len() != 64 {
            return Err(Error::InvalidSeedLength(hex_str.len()));
        }
        let bytes = hex::decode(hex_str).map_err(|_| Error::InvalidSeedHex)?;
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        Ok(Self { inner: seed })
    }

    /// Hex rendering with a `0x` prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.inner))
    }

    /// Derives the deterministic RNG driving layout permutations.
    ///
    /// The derivation is domain-separated so the same seed bytes used
    /// elsewhere never correlate with cache layouts.
    pub fn layout_rng(&self) -> StdRng {
        let mut hasher = Sha3_256::new();
        hasher.update(b"RONDEL_VARIANT_LAYOUT");
        hasher.update(self.inner);
        let digest = hasher.finalize();

        let mut rng_seed = [0u8; 8];
        rng_seed.copy_from_slice(&digest[..8]);
        StdRng::seed_from_u64(u64::from_le_bytes(rng_seed))
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Seed({})", self.to_hex())
    }
}
