//! Stylometric authorship checks
//!
//! A fingerprint summarizes the textual style of a block's pretty-printed
//! classical view. Nodes that render blocks through their own tooling leave
//! a recognisable style, so a block claiming an author can be compared with
//! that author's expected fingerprint. The check is advisory: it can only
//! reject blocks that are already consensus-valid.

use crate::block::Block;
use crate::Result;
use qpow_core::qhash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Default similarity a block must reach
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

const W_LINE_LENGTH: f64 = 0.10;
const W_WHITESPACE: f64 = 0.10;
const W_INDENT: f64 = 0.10;
const W_COMMENTS: f64 = 0.05;
const W_NAMING: f64 = 0.15;
const W_BIGRAMS: f64 = 0.20;
const W_TRIGRAMS: f64 = 0.20;
const W_MARKERS: f64 = 0.10;

/// How lines are indented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndentStyle {
    None,
    Tabs,
    Spaces(u8),
    Mixed,
}

/// Style summary of a text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub avg_line_length: f64,
    pub whitespace_ratio: f64,
    pub indent: IndentStyle,
    pub comment_ratio: f64,
    pub naming: BTreeMap<String, u32>,
    pub bigrams: BTreeMap<String, u32>,
    pub trigrams: BTreeMap<String, u32>,
    pub markers: BTreeMap<String, u32>,
}

impl Fingerprint {
    /// Fingerprint of arbitrary text
    pub fn of_text(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let line_count = lines.len().max(1) as f64;
        let char_count = text.chars().count();

        let avg_line_length = lines.iter().map(|l| l.chars().count()).sum::<usize>() as f64 / line_count;
        let whitespace_ratio = if char_count == 0 {
            0.0
        } else {
            text.chars().filter(|c| c.is_whitespace()).count() as f64 / char_count as f64
        };
        let comment_ratio = lines
            .iter()
            .filter(|l| {
                let t = l.trim_start();
                t.starts_with("//") || t.starts_with('#')
            })
            .count() as f64
            / line_count;

        Self {
            avg_line_length,
            whitespace_ratio,
            indent: indent_style(&lines),
            comment_ratio,
            naming: naming_histogram(text),
            bigrams: ngrams(text, 2),
            trigrams: ngrams(text, 3),
            markers: markers(&lines, text),
        }
    }

    /// Fingerprint of a block's pretty-printed classical view
    pub fn of_block(block: &Block) -> Result<Self> {
        let text = serde_json::to_string_pretty(&block.to_classic_view()?)?;
        Ok(Self::of_text(&text))
    }

    /// Hex digest identifying this fingerprint
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(&qhash(&bytes)[..32]))
    }

    /// Weighted similarity in `[0, 1]`
    pub fn similarity(&self, other: &Self) -> f64 {
        let indent = if self.indent == other.indent { 1.0 } else { 0.0 };
        let score = W_LINE_LENGTH * closeness(self.avg_line_length, other.avg_line_length)
            + W_WHITESPACE * closeness(self.whitespace_ratio, other.whitespace_ratio)
            + W_INDENT * indent
            + W_COMMENTS * closeness(self.comment_ratio, other.comment_ratio)
            + W_NAMING * cosine(&self.naming, &other.naming)
            + W_BIGRAMS * cosine(&self.bigrams, &other.bigrams)
            + W_TRIGRAMS * cosine(&self.trigrams, &other.trigrams)
            + W_MARKERS * cosine(&self.markers, &other.markers);
        score.clamp(0.0, 1.0)
    }
}

/// Settings of the authorship layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StylometryConfig {
    pub enabled: bool,
    pub threshold: f64,
}

impl Default for StylometryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// Per-author expected fingerprints plus a trusted set
#[derive(Debug, Clone, Default)]
pub struct StylometricValidator {
    config: StylometryConfig,
    profiles: HashMap<String, Fingerprint>,
    trusted: HashSet<String>,
}

impl StylometricValidator {
    /// Create a validator
    pub fn new(config: StylometryConfig) -> Self {
        Self {
            config,
            profiles: HashMap::new(),
            trusted: HashSet::new(),
        }
    }

    /// Settings in use
    pub fn config(&self) -> &StylometryConfig {
        &self.config
    }

    /// Set the expected fingerprint of an author
    pub fn register_author(&mut self, author: impl Into<String>, fingerprint: Fingerprint) {
        self.profiles.insert(author.into(), fingerprint);
    }

    /// Learn an author's expected fingerprint from one of their blocks
    pub fn learn_from_block(&mut self, author: impl Into<String>, block: &Block) -> Result<()> {
        let fingerprint = Fingerprint::of_block(block)?;
        self.register_author(author, fingerprint);
        Ok(())
    }

    /// Accept any block whose fingerprint has this digest
    pub fn trust(&mut self, digest: impl Into<String>) {
        self.trusted.insert(digest.into());
    }

    /// Whether `block` plausibly comes from `author`
    pub fn verify(&self, author: &str, block: &Block) -> Result<bool> {
        if !self.config.enabled {
            return Ok(true);
        }

        let fingerprint = Fingerprint::of_block(block)?;
        if self.trusted.contains(&fingerprint.digest()?) {
            return Ok(true);
        }

        let Some(expected) = self.profiles.get(author) else {
            debug!(author, "No stylometric profile for author");
            return Ok(false);
        };

        let similarity = expected.similarity(&fingerprint);
        debug!(author, similarity, threshold = self.config.threshold, "Stylometric check");
        Ok(similarity >= self.config.threshold)
    }
}

/// `1 - |a - b| / max(|a|, |b|)`, with two zeros fully close
fn closeness(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return 1.0;
    }
    (1.0 - (a - b).abs() / scale).clamp(0.0, 1.0)
}

fn cosine(a: &BTreeMap<String, u32>, b: &BTreeMap<String, u32>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let dot: f64 = a
        .iter()
        .filter_map(|(k, x)| b.get(k).map(|y| f64::from(*x) * f64::from(*y)))
        .sum();
    let norm = |m: &BTreeMap<String, u32>| m.values().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt();
    let denominator = norm(a) * norm(b);
    if denominator == 0.0 {
        0.0
    } else {
        (dot / denominator).clamp(0.0, 1.0)
    }
}

fn indent_style(lines: &[&str]) -> IndentStyle {
    let mut tabs = 0;
    let mut widths: Vec<usize> = Vec::new();
    for line in lines {
        if line.starts_with('\t') {
            tabs += 1;
        } else if line.starts_with(' ') {
            widths.push(line.len() - line.trim_start_matches(' ').len());
        }
    }

    match (tabs, widths.is_empty()) {
        (0, true) => IndentStyle::None,
        (_, true) => IndentStyle::Tabs,
        (0, false) => {
            let unit = widths.iter().copied().fold(0, gcd).clamp(1, usize::from(u8::MAX));
            IndentStyle::Spaces(u8::try_from(unit).unwrap_or(u8::MAX))
        }
        _ => IndentStyle::Mixed,
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn naming_histogram(text: &str) -> BTreeMap<String, u32> {
    let mut histogram = BTreeMap::new();
    let identifiers = text
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| w.chars().next().is_some_and(|c| c.is_ascii_alphabetic()));

    for word in identifiers {
        let has_lower = word.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = word.chars().any(|c| c.is_ascii_uppercase());
        let starts_upper = word.starts_with(|c: char| c.is_ascii_uppercase());
        let class = if word.contains('_') && !has_upper {
            "snake_case"
        } else if word.contains('_') && !has_lower {
            "screaming_snake"
        } else if starts_upper && has_lower {
            "pascal_case"
        } else if has_upper && has_lower {
            "camel_case"
        } else if !has_upper {
            "lowercase"
        } else {
            "uppercase"
        };
        *histogram.entry(class.to_string()).or_insert(0) += 1;
    }
    histogram
}

fn ngrams(text: &str, n: usize) -> BTreeMap<String, u32> {
    let chars: Vec<char> = text.chars().collect();
    let mut counts = BTreeMap::new();
    for window in chars.windows(n) {
        *counts.entry(window.iter().collect::<String>()).or_insert(0) += 1;
    }
    counts
}

fn markers(lines: &[&str], text: &str) -> BTreeMap<String, u32> {
    let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
    let mut markers = BTreeMap::new();
    markers.insert(
        "trailing_whitespace".to_string(),
        count(lines.iter().filter(|l| l.ends_with(' ') || l.ends_with('\t')).count()),
    );
    markers.insert(
        "blank_lines".to_string(),
        count(lines.iter().filter(|l| l.trim().is_empty()).count()),
    );
    markers.insert("double_spaces".to_string(), count(text.matches("  ").count()));
    markers.insert("semicolons".to_string(), count(text.matches(';').count()));
    markers.insert("ellipses".to_string(), count(text.matches("...").count()));
    markers.insert(
        "non_ascii".to_string(),
        count(text.chars().filter(|c| !c.is_ascii()).count()),
    );
    markers.insert("space_after_colon".to_string(), count(text.matches(": ").count()));
    markers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TRIVIAL_BITS;
    use crate::transaction::Transaction;

    fn block(recipient: &str, amount: f64) -> Block {
        let txs = vec![
            Transaction::coinbase(recipient, amount, 1).with_timestamp(10),
            Transaction::new("alice", recipient, 1.0, vec![4; 8]).with_timestamp(11),
        ];
        Block::with_timestamp([2u8; 32], txs, TRIVIAL_BITS, 12).unwrap()
    }

    #[test]
    fn test_identical_text_is_fully_similar() {
        let fp = Fingerprint::of_text("fn main() {\n    let x_y = 1;\n}\n");
        assert!((fp.similarity(&fp) - 1.0).abs() < 1e-9);
        assert_eq!(fp.indent, IndentStyle::Spaces(4));
    }

    #[test]
    fn test_different_styles_score_lower() {
        let a = Fingerprint::of_text("fn main() {\n    let snake_case = 1;\n}\n");
        let b = Fingerprint::of_text("FUNCTION Main\n\tDim CamelCase As Integer\nEND\n");
        let s = a.similarity(&b);
        assert!((0.0..1.0).contains(&s), "similarity {s}");
        assert!(s < a.similarity(&a));
        assert_eq!(b.indent, IndentStyle::Tabs);
    }

    #[test]
    fn test_similarity_is_symmetric_and_bounded() {
        let a = Fingerprint::of_text("a b c\n# note\n");
        let b = Fingerprint::of_text("");
        let ab = a.similarity(&b);
        assert!((ab - b.similarity(&a)).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&ab));
    }

    #[test]
    fn test_naming_classes() {
        let hist = naming_histogram("snake_case camelCase PascalCase UPPER_CASE word X");
        assert_eq!(hist.get("snake_case"), Some(&1));
        assert_eq!(hist.get("camel_case"), Some(&1));
        assert_eq!(hist.get("pascal_case"), Some(&1));
        assert_eq!(hist.get("screaming_snake"), Some(&1));
        assert_eq!(hist.get("lowercase"), Some(&1));
        assert_eq!(hist.get("uppercase"), Some(&1));
    }

    #[test]
    fn test_comment_ratio() {
        let fp = Fingerprint::of_text("// one\ncode\n# two\ncode\n");
        assert!((fp.comment_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_block_fingerprints_from_same_renderer_match() {
        let a = Fingerprint::of_block(&block("miner-a", 50.0)).unwrap();
        let b = Fingerprint::of_block(&block("miner-b", 25.0)).unwrap();
        assert!(a.similarity(&b) >= DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(a.indent, IndentStyle::Spaces(2));
    }

    #[test]
    fn test_disabled_accepts_everything() {
        let validator = StylometricValidator::default();
        assert!(validator.verify("nobody", &block("m", 1.0)).unwrap());
    }

    #[test]
    fn test_unknown_author_rejected_when_enabled() {
        let validator = StylometricValidator::new(StylometryConfig {
            enabled: true,
            ..StylometryConfig::default()
        });
        assert!(!validator.verify("nobody", &block("m", 1.0)).unwrap());
    }

    #[test]
    fn test_profile_and_trusted_paths() {
        let mut validator = StylometricValidator::new(StylometryConfig {
            enabled: true,
            threshold: 0.7,
        });
        validator.learn_from_block("node-a", &block("miner-a", 50.0)).unwrap();
        assert!(validator.verify("node-a", &block("miner-a", 51.0)).unwrap());

        let mut strict = StylometricValidator::new(StylometryConfig {
            enabled: true,
            threshold: 1.1,
        });
        let b = block("miner-b", 5.0);
        assert!(!strict.verify("node-b", &b).unwrap());
        strict.trust(Fingerprint::of_block(&b).unwrap().digest().unwrap());
        assert!(strict.verify("node-b", &b).unwrap());
    }
}
