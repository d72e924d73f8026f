//! 256-bit difficulty targets and the compact `bits` encoding
//!
//! The compact form packs an exponent `e` in the top byte and a coefficient
//! `c` in the low 24 bits, exactly as Bitcoin's `nBits`: the target is
//! `c << 8*(e-3)` for `e > 3`, otherwise `c >> 8*(3-e)`.

use crate::hash::Digest512;
use crate::{CoreError, Result};
use primitive_types::{U256, U512};
use std::fmt;

/// Width of an expanded target
pub const TARGET_LEN: usize = 32;

const COEFFICIENT_MASK: u32 = 0x00ff_ffff;
const SIGN_BIT: u32 = 0x0080_0000;

/// An expanded 256-bit target; a hash meets it when strictly below
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target(U256);

impl Target {
    /// Largest representable target
    pub fn max() -> Self {
        Self(U256::MAX)
    }

    /// Target with `zeros` leading zero bits (`2^(256 - zeros) - 1`)
    pub fn from_leading_zero_bits(zeros: u32) -> Self {
        if zeros >= 256 {
            return Self(U256::zero());
        }
        Self(U256::MAX >> zeros as usize)
    }

    /// Expand a compact `bits` value
    pub fn from_compact(bits: u32) -> Result<Self> {
        let exponent = bits >> 24;
        let coefficient = U256::from(bits & COEFFICIENT_MASK);

        if exponent <= 3 {
            return Ok(Self(coefficient >> (8 * (3 - exponent) as usize)));
        }

        let shift = 8 * (exponent - 3) as usize;
        if !coefficient.is_zero() && coefficient.bits() + shift > 256 {
            return Err(CoreError::TargetOverflow { bits });
        }
        Ok(Self(coefficient << shift))
    }

    /// Canonical compact encoding, rounding the target down
    pub fn to_compact(&self) -> u32 {
        let mut size = (self.0.bits() + 7) / 8;
        let mut compact = if size <= 3 {
            (self.0.low_u64() << (8 * (3 - size))) as u32
        } else {
            (self.0 >> (8 * (size - 3))).low_u32()
        };

        // The coefficient is kept below the sign bit, as Bitcoin does
        if compact & SIGN_BIT != 0 {
            compact >>= 8;
            size += 1;
        }

        compact | ((size as u32) << 24)
    }

    /// Smallest compact encoding whose expansion is at least this target
    pub fn to_compact_rounded_up(&self) -> u32 {
        let floor = self.to_compact();
        match Self::from_compact(floor) {
            Ok(expanded) if expanded >= *self => floor,
            _ => next_compact(floor),
        }
    }

    /// Parse a 32-byte big-endian integer
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != TARGET_LEN {
            return Err(CoreError::InvalidLength {
                expected: TARGET_LEN,
                got: bytes.len(),
            });
        }
        Ok(Self(U256::from_big_endian(bytes)))
    }

    /// Big-endian, zero-padded to 32 bytes
    pub fn to_be_bytes(&self) -> [u8; TARGET_LEN] {
        let mut out = [0u8; TARGET_LEN];
        self.0.to_big_endian(&mut out);
        out
    }

    /// Underlying integer
    pub fn as_u256(&self) -> U256 {
        self.0
    }

    /// High-order 64 bits
    pub fn high_u64(&self) -> u64 {
        (self.0 >> 192).low_u64()
    }

    /// Whether a digest (high 32 bytes, big-endian) is strictly below this target
    pub fn is_met_by(&self, digest: &Digest512) -> bool {
        U256::from_big_endian(&digest[..TARGET_LEN]) < self.0
    }

    /// Target made `bits` bits easier, saturating at the maximum
    pub fn eased_by(&self, bits: u32) -> Self {
        if self.0.is_zero() || bits == 0 {
            return *self;
        }
        let headroom = 256 - self.0.bits();
        if bits as usize > headroom {
            return Self::max();
        }
        Self(self.0 << bits as usize)
    }

    /// `self * numerator / denominator`, saturating at the maximum
    pub fn scale(&self, numerator: u64, denominator: u64, round_up: bool) -> Self {
        let denominator = U512::from(denominator.max(1));
        let mut wide = self.0.full_mul(U256::from(numerator));
        if round_up {
            wide = wide + denominator - U512::one();
        }
        let quotient = wide / denominator;
        Self(U256::try_from(quotient).unwrap_or(U256::MAX))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target(0x{:064x})", self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:064x}", self.0)
    }
}

impl From<U256> for Target {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

/// `meets_target(hash, target)`: compare the high 32 bytes of the digest
pub fn meets_target(digest: &Digest512, target: &Target) -> bool {
    target.is_met_by(digest)
}

/// High-order 64 bits of a digest, as used by the proximity score
pub fn digest_high_u64(digest: &Digest512) -> u64 {
    let mut high = [0u8; 8];
    high.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(high)
}

/// Next larger compact value after `bits`
fn next_compact(bits: u32) -> u32 {
    let exponent = bits >> 24;
    let coefficient = (bits & COEFFICIENT_MASK) + 1;
    if coefficient & SIGN_BIT != 0 {
        (coefficient >> 8) | ((exponent + 1) << 24)
    } else {
        coefficient | (exponent << 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitcoin_genesis_bits() {
        let target = Target::from_compact(0x1d00ffff).unwrap();
        let bytes = target.to_be_bytes();
        assert_eq!(&bytes[..6], &[0, 0, 0, 0, 0xff, 0xff]);
        assert!(bytes[6..].iter().all(|b| *b == 0));
        assert_eq!(target.to_compact(), 0x1d00ffff);
    }

    #[test]
    fn test_small_exponent_shifts_right() {
        let target = Target::from_compact(0x0212_3456).unwrap();
        assert_eq!(target.as_u256(), U256::from(0x1234u64));
        let target = Target::from_compact(0x0312_3456).unwrap();
        assert_eq!(target.as_u256(), U256::from(0x12_3456u64));
    }

    #[test]
    fn test_overflowing_compact_rejected() {
        assert_eq!(
            Target::from_compact(0x2201_0000),
            Err(CoreError::TargetOverflow { bits: 0x2201_0000 })
        );
        assert!(Target::from_compact(0x2000_ffff).is_ok());
    }

    #[test]
    fn test_sign_bit_normalization() {
        // 0x800000 needs the exponent bumped to stay below the sign bit
        let target = Target::from(U256::from(0x80_0000u64));
        assert_eq!(target.to_compact(), 0x0400_8000);
        assert_eq!(Target::from_compact(0x0400_8000).unwrap(), target);
    }

    #[test]
    fn test_meets_target_is_strict() {
        let target = Target::from_be_bytes(&[0x10; 32]).unwrap();
        let mut digest = [0u8; 64];
        digest[..32].copy_from_slice(&[0x10; 32]);
        assert!(!meets_target(&digest, &target));
        digest[31] = 0x0f;
        assert!(meets_target(&digest, &target));
        // Only the high 32 bytes take part in the comparison
        digest[40] = 0xff;
        assert!(meets_target(&digest, &target));
    }

    #[test]
    fn test_eased_by_shifts_left_and_saturates() {
        let target = Target::from_leading_zero_bits(24);
        assert_eq!(target.eased_by(4).as_u256(), (U256::MAX >> 24usize) << 4usize);
        assert_eq!(target.eased_by(0), target);
        assert_eq!(Target::from_leading_zero_bits(2).eased_by(8), Target::max());
    }

    #[test]
    fn test_scale_rounding() {
        let target = Target::from(U256::from(10u64));
        assert_eq!(target.scale(1, 4, false).as_u256(), U256::from(2u64));
        assert_eq!(target.scale(1, 4, true).as_u256(), U256::from(3u64));
        assert_eq!(Target::max().scale(4, 1, false), Target::max());
    }

    #[test]
    fn test_rounded_up_compact_covers_target() {
        let target = Target::from(U256::from(0x1234_5678u64));
        let floor = Target::from_compact(target.to_compact()).unwrap();
        let ceil = Target::from_compact(target.to_compact_rounded_up()).unwrap();
        assert!(floor <= target);
        assert!(ceil >= target);
    }

    #[test]
    fn test_high_u64() {
        let target = Target::from_compact(0x2000_ffff).unwrap();
        assert_eq!(target.high_u64(), 0x00ff_ff00_0000_0000);
        let mut digest = [0u8; 64];
        digest[1] = 0xff;
        assert_eq!(digest_high_u64(&digest), 0x00ff_0000_0000_0000);
    }
}
