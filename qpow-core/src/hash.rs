//! Quantum-resistant hash primitive
//!
//! The construction is a heuristic hardening of SHA3-512, not a lattice scheme:
//!
//! 1. `H0 = SHA3-512(x)`
//! 2. `H1 = HMAC-SHA3-512(P, H0)` where `P` is the personalization key
//! 3. `H2` = 16 rounds of rotate / masked XOR / non-linear byte diffusion over `H1`
//! 4. output `SHA3-512(H2)`
//!
//! The Tribus variant chains three instances under `P-1`, `P-2`, `P-3` and
//! finishes with `SHA3-512(C3(C2(C1(x))) || P)`.

use hmac::{Hmac, Mac};
use sha3::{Digest, Sha3_512};
use std::fmt;
use std::sync::OnceLock;

/// Digest size in bytes
pub const DIGEST_LEN: usize = 64;

/// A 512-bit digest
pub type Digest512 = [u8; DIGEST_LEN];

/// Personalization used by the consensus hash
pub const DEFAULT_PERSONALIZATION: &[u8] = b"qPoW-v1";

/// Rounds of the lattice-stiffening permutation
pub const STIFFENING_ROUNDS: usize = 16;

/// Personalization keys are zero-padded to at least this many bytes
const MIN_KEY_LEN: usize = 8;

type HmacSha3 = Hmac<Sha3_512>;

/// Capability shared by every qPoW hash variant
pub trait QuantumHasher: Send + Sync {
    /// Hash arbitrary bytes to a 64-byte digest
    fn digest(&self, data: &[u8]) -> Digest512;
}

/// Single-stage quantum-resistant hash
#[derive(Clone)]
pub struct QrHash {
    key: Vec<u8>,
    masks: Vec<[u8; DIGEST_LEN]>,
    mac: HmacSha3,
}

impl QrHash {
    /// Create a hasher for the given personalization
    pub fn new(personalization: &[u8]) -> Self {
        let mut key = personalization.to_vec();
        if key.len() < MIN_KEY_LEN {
            key.resize(MIN_KEY_LEN, 0);
        }

        let masks = (0..STIFFENING_ROUNDS)
            .map(|round| round_mask(&key, round))
            .collect();

        // HMAC is defined for keys of any length
        let mac = <HmacSha3 as Mac>::new_from_slice(&key)
            .expect("HMAC accepts keys of any length");

        Self { key, masks, mac }
    }

    /// Padded personalization key
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    fn stiffen(&self, input: &Digest512) -> Digest512 {
        let mut state = *input;

        for (round, mask) in self.masks.iter().enumerate() {
            state.rotate_left((7 * round + 5) % DIGEST_LEN);

            for (byte, m) in state.iter_mut().zip(mask.iter()) {
                *byte ^= m;
            }

            let previous = state;
            for i in 0..DIGEST_LEN {
                let product = previous[i].wrapping_mul(previous[(i + 1) % DIGEST_LEN]);
                state[i] = product.wrapping_add(previous[(i + 7) % DIGEST_LEN]);
            }
        }

        state
    }
}

impl Default for QrHash {
    fn default() -> Self {
        Self::new(DEFAULT_PERSONALIZATION)
    }
}

impl fmt::Debug for QrHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QrHash")
            .field("personalization", &String::from_utf8_lossy(&self.key))
            .field("rounds", &self.masks.len())
            .finish()
    }
}

impl QuantumHasher for QrHash {
    fn digest(&self, data: &[u8]) -> Digest512 {
        let h0 = sha3_512(&[data]);

        let mut mac = self.mac.clone();
        mac.update(&h0);
        let mut h1 = [0u8; DIGEST_LEN];
        h1.copy_from_slice(&mac.finalize().into_bytes());

        let h2 = self.stiffen(&h1);
        sha3_512(&[&h2[..]])
    }
}

/// Three-stage Tribus cascade of [`QrHash`]
#[derive(Clone, Debug)]
pub struct TribusHash {
    stages: [QrHash; 3],
    personalization: Vec<u8>,
}

impl TribusHash {
    /// Build the cascade from a base personalization
    pub fn new(personalization: &[u8]) -> Self {
        let stage = |suffix: &[u8]| {
            let mut key = personalization.to_vec();
            key.extend_from_slice(suffix);
            QrHash::new(&key)
        };

        Self {
            stages: [stage(b"-1"), stage(b"-2"), stage(b"-3")],
            personalization: QrHash::new(personalization).key().to_vec(),
        }
    }
}

impl Default for TribusHash {
    fn default() -> Self {
        Self::new(DEFAULT_PERSONALIZATION)
    }
}

impl QuantumHasher for TribusHash {
    fn digest(&self, data: &[u8]) -> Digest512 {
        let first = self.stages[0].digest(data);
        let second = self.stages[1].digest(&first);
        let third = self.stages[2].digest(&second);
        sha3_512(&[&third[..], &self.personalization[..]])
    }
}

/// Hash with the default consensus personalization
pub fn qhash(data: &[u8]) -> Digest512 {
    static DEFAULT: OnceLock<QrHash> = OnceLock::new();
    DEFAULT.get_or_init(QrHash::default).digest(data)
}

/// Tribus hash with the default consensus personalization
pub fn tribus(data: &[u8]) -> Digest512 {
    static DEFAULT: OnceLock<TribusHash> = OnceLock::new();
    DEFAULT.get_or_init(TribusHash::default).digest(data)
}

fn sha3_512(parts: &[&[u8]]) -> Digest512 {
    let mut hasher = Sha3_512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Personalization cycled to 64 bytes, mixed with the round index
fn round_mask(key: &[u8], round: usize) -> [u8; DIGEST_LEN] {
    let mut mask = [0u8; DIGEST_LEN];
    let r = round as u8;
    for (i, byte) in mask.iter_mut().enumerate() {
        let salt = r.wrapping_mul(0x9d).wrapping_add((i as u8).rotate_left(u32::from(r % 8)));
        *byte = key[i % key.len()] ^ salt;
    }
    mask
}
