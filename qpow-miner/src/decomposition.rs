//! Splitting block production into sub-problems
//!
//! Only the nonce search is solved today. Transaction selection and
//! timestamp tuning are reserved hooks and are always reported as skipped.

use qpow_consensus::Block;
use serde::{Deserialize, Serialize};

/// A part of the block-production problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProblem {
    NonceSearch,
    TransactionSelection,
    TimestampTuning,
}

/// What happened to a sub-problem during one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProblemStatus {
    Solved,
    Unsolved,
    Skipped,
}

/// Status of one sub-problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubProblemReport {
    pub problem: SubProblem,
    pub status: SubProblemStatus,
}

/// Sub-problems of a candidate, in solving order
pub fn decompose(_candidate: &Block) -> Vec<SubProblem> {
    vec![
        SubProblem::NonceSearch,
        SubProblem::TransactionSelection,
        SubProblem::TimestampTuning,
    ]
}

/// Reports for `problems` given the nonce-search outcome
pub fn report(problems: &[SubProblem], nonce_found: bool) -> Vec<SubProblemReport> {
    problems
        .iter()
        .map(|&problem| SubProblemReport {
            problem,
            status: match problem {
                SubProblem::NonceSearch if nonce_found => SubProblemStatus::Solved,
                SubProblem::NonceSearch => SubProblemStatus::Unsolved,
                _ => SubProblemStatus::Skipped,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qpow_consensus::Transaction;

    #[test]
    fn test_decompose_orders_nonce_first() {
        let txs = vec![
            Transaction::coinbase("m", 1.0, 0),
            Transaction::new("a", "b", 1.0, vec![1]),
        ];
        let block = Block::genesis(txs, 0x207f_ffff, 0).unwrap();
        let problems = decompose(&block);
        assert_eq!(problems[0], SubProblem::NonceSearch);
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn test_reserved_problems_are_skipped() {
        let problems = [
            SubProblem::NonceSearch,
            SubProblem::TransactionSelection,
            SubProblem::TimestampTuning,
        ];
        let reports = report(&problems, true);
        assert_eq!(reports[0].status, SubProblemStatus::Solved);
        assert!(reports[1..].iter().all(|r| r.status == SubProblemStatus::Skipped));
        assert_eq!(report(&problems, false)[0].status, SubProblemStatus::Unsolved);
    }
}
