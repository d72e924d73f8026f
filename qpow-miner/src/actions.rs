//! Nonce moves available to the tree search

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Largest multiplier drawn for step and jump moves
pub const MAX_MULTIPLIER: u32 = 10;

/// One edge of the search tree: a transformation of the nonce
///
/// Every sampled quantity is stored in the move, so replaying a catalogue
/// reproduces the same children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonceMove {
    /// Add `k * step`, wrapping
    Increment { k: u32, step: u32 },

    /// Subtract `k * step`, saturating at zero
    Decrement { k: u32, step: u32 },

    /// Move by `2^(4 * level) * k` in either direction, wrapping
    QuantumJump { level: u32, k: u32, up: bool },

    /// Replace the nonce with this value
    Random(u32),
}

impl NonceMove {
    /// Nonce of the child reached from `nonce`
    pub fn apply(self, nonce: u32) -> u32 {
        match self {
            Self::Increment { k, step } => nonce.wrapping_add(k.wrapping_mul(step)),
            Self::Decrement { k, step } => nonce.saturating_sub(k.saturating_mul(step)),
            Self::QuantumJump { level, k, up } => {
                let magnitude = 1u32.checked_shl(4 * level).unwrap_or(0).wrapping_mul(k);
                if up {
                    nonce.wrapping_add(magnitude)
                } else {
                    nonce.wrapping_sub(magnitude)
                }
            }
            Self::Random(value) => value,
        }
    }
}

/// Parameters of the per-node move catalogue
#[derive(Debug, Clone, Copy)]
pub struct CatalogueSpec {
    /// Unit of increment and decrement moves
    pub step: u32,
    /// Moves of each class per catalogue
    pub actions_per_class: usize,
    /// Inclusive range of quantum-jump levels
    pub jump_levels: (u32, u32),
    /// Width of the window a random nonce is drawn from
    pub random_window: u32,
}

/// Draw a shuffled catalogue with `actions_per_class` moves of each class
///
/// Step and jump multipliers are drawn from `1..=MAX_MULTIPLIER`. A random
/// move first places a window of `random_window` nonces somewhere in the
/// 32-bit space, then picks a value inside it.
pub fn catalogue(spec: &CatalogueSpec, rng: &mut StdRng) -> Vec<NonceMove> {
    let per_class = spec.actions_per_class.max(1);
    let step = spec.step.max(1);
    let (low, high) = (spec.jump_levels.0.min(spec.jump_levels.1), spec.jump_levels.0.max(spec.jump_levels.1));
    let window = spec.random_window.max(1);

    let mut moves = Vec::with_capacity(per_class * 4);
    for _ in 0..per_class {
        moves.push(NonceMove::Increment {
            k: rng.gen_range(1..=MAX_MULTIPLIER),
            step,
        });
        moves.push(NonceMove::Decrement {
            k: rng.gen_range(1..=MAX_MULTIPLIER),
            step,
        });
        moves.push(NonceMove::QuantumJump {
            level: rng.gen_range(low..=high),
            k: rng.gen_range(1..=MAX_MULTIPLIER),
            up: rng.gen_bool(0.5),
        });
        let window_start = rng.gen_range(0..=u32::MAX - (window - 1));
        moves.push(NonceMove::Random(window_start + rng.gen_range(0..window)));
    }
    moves.shuffle(rng);
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn spec() -> CatalogueSpec {
        CatalogueSpec {
            step: 16,
            actions_per_class: 50,
            jump_levels: (1, 4),
            random_window: 1 << 20,
        }
    }

    #[test]
    fn test_increment_wraps() {
        assert_eq!(NonceMove::Increment { k: 3, step: 1 }.apply(u32::MAX), 2);
        assert_eq!(NonceMove::Increment { k: 2, step: 16 }.apply(100), 132);
    }

    #[test]
    fn test_decrement_saturates() {
        assert_eq!(NonceMove::Decrement { k: 10, step: 1 }.apply(4), 0);
        assert_eq!(NonceMove::Decrement { k: 1, step: 1 }.apply(4), 3);
        assert_eq!(NonceMove::Decrement { k: 10, step: u32::MAX }.apply(u32::MAX), 0);
    }

    #[test]
    fn test_quantum_jump_magnitudes() {
        assert_eq!(NonceMove::QuantumJump { level: 1, k: 1, up: true }.apply(0), 16);
        assert_eq!(NonceMove::QuantumJump { level: 2, k: 3, up: true }.apply(0), 768);
        assert_eq!(NonceMove::QuantumJump { level: 1, k: 1, up: false }.apply(0), u32::MAX - 15);
        assert_eq!(NonceMove::QuantumJump { level: 4, k: 10, up: true }.apply(0), 655_360);
    }

    #[test]
    fn test_random_replaces_nonce() {
        assert_eq!(NonceMove::Random(7).apply(123_456), 7);
    }

    #[test]
    fn test_step_moves_use_multiples_of_step() {
        let moves = catalogue(&spec(), &mut StdRng::seed_from_u64(1));
        let mut seen_k = std::collections::HashSet::new();
        for m in &moves {
            match *m {
                NonceMove::Increment { k, step } | NonceMove::Decrement { k, step } => {
                    assert_eq!(step, 16);
                    assert!((1..=MAX_MULTIPLIER).contains(&k));
                    seen_k.insert(k);
                }
                _ => {}
            }
        }
        // 100 draws cover more than one multiplier
        assert!(seen_k.len() > 1);

        let up = NonceMove::Increment { k: 4, step: 16 }.apply(1_000);
        assert_eq!(up - 1_000, 64);
    }

    #[test]
    fn test_jump_levels_and_multipliers_in_range() {
        let moves = catalogue(&spec(), &mut StdRng::seed_from_u64(2));
        let jumps: Vec<_> = moves
            .iter()
            .filter_map(|m| match *m {
                NonceMove::QuantumJump { level, k, up } => Some((level, k, up)),
                _ => None,
            })
            .collect();
        assert_eq!(jumps.len(), 50);
        for (level, k, _) in &jumps {
            assert!((1..=4).contains(level));
            assert!((1..=MAX_MULTIPLIER).contains(k));
        }
        assert!(jumps.iter().any(|(_, _, up)| *up));
        assert!(jumps.iter().any(|(_, _, up)| !*up));
    }

    #[test]
    fn test_random_values_are_absolute_and_spread() {
        let moves = catalogue(&spec(), &mut StdRng::seed_from_u64(3));
        let values: Vec<u32> = moves
            .iter()
            .filter_map(|m| match *m {
                NonceMove::Random(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(values.len(), 50);
        // Windows land across the whole space, not around one parent nonce
        let spread = values.iter().max().unwrap() - values.iter().min().unwrap();
        assert!(spread > 1 << 24);
    }

    #[test]
    fn test_full_window_covers_space() {
        let wide = CatalogueSpec {
            random_window: u32::MAX,
            ..spec()
        };
        // Must not overflow when the window spans the whole space
        assert_eq!(catalogue(&wide, &mut StdRng::seed_from_u64(4)).len(), 200);
    }

    #[test]
    fn test_catalogue_is_seeded() {
        let small = CatalogueSpec {
            actions_per_class: 2,
            ..spec()
        };
        let a = catalogue(&small, &mut StdRng::seed_from_u64(5));
        let b = catalogue(&small, &mut StdRng::seed_from_u64(5));
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert_eq!(a.iter().filter(|m| matches!(m, NonceMove::Decrement { .. })).count(), 2);
    }
}
