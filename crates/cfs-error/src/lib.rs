#![forbid(unsafe_code)]
//! Error types for the cinderfs accounting engine.
//!
//! Two layers, kept deliberately separate:
//!
//! - [`CfsError`]: operational failures returned to callers. These either
//!   abort the surrounding transaction ([`CfsError::NoMem`]) or instruct the
//!   caller to take a recovery action and retry
//!   ([`CfsError::NeedsReplicasMark`]).
//! - [`Inconsistency`]: named, fsck-checkable findings about on-disk or
//!   in-memory state. These are *reported*, not raised: scan paths log the
//!   finding, skip the offending key, and keep going. Repair tooling keys
//!   off the variant name.
//!
//! This crate must not depend on the other workspace crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named consistency finding.
///
/// Every variant corresponds to one condition a consistency check can
/// detect and (where applicable) repair. Variants are stable identifiers:
/// tooling matches on them, so renames are format changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inconsistency {
    /// Persisted accounting key carries a zero version stamp.
    #[error("accounting key with version=0")]
    AccountingKeyVersionZero,

    /// Replicas-class key with an empty device list.
    #[error("accounting key replicas entry with nr_devs=0")]
    AccountingKeyNrDevsZero,

    /// Replicas-class key whose redundancy requirement is impossible.
    #[error("accounting key replicas entry with bad nr_required")]
    AccountingKeyNrRequiredBad,

    /// Replicas-class key whose device list is not sorted/deduplicated.
    #[error("accounting key replicas entry with unsorted devs")]
    AccountingKeyDevsUnsorted,

    /// Nonzero bytes past the variant's defined payload.
    #[error("junk at end of accounting key")]
    AccountingKeyJunkAtEnd,

    /// Key tag newer than this build understands.
    #[error("accounting key with unknown type")]
    AccountingKeyUnknownType,

    /// Field value out of the variant's defined range.
    #[error("accounting key with invalid field")]
    AccountingKeyBadField,

    /// Live counters disagree with independently recomputed ground truth.
    #[error("accounting mismatch")]
    AccountingMismatch,

    /// Replicas entry present but not marked in the superblock registry.
    #[error("accounting not marked in superblock replicas")]
    AccountingReplicasNotMarked,
}

/// Unified error type for accounting operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Counter storage or table growth could not be allocated; the
    /// triggering update was rolled back completely.
    #[error("allocation failure: {what}")]
    NoMem { what: &'static str },

    /// A replicas-class update cannot proceed until its configuration is
    /// marked in the superblock registry. Recoverable: mark, then retry
    /// the same update.
    #[error("replicas entry must be marked in superblock before use")]
    NeedsReplicasMark,

    /// A key failed validation and cannot be encoded or applied.
    #[error("invalid accounting key: {0}")]
    InvalidKey(Inconsistency),
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inconsistency_messages_are_stable() {
        assert_eq!(
            Inconsistency::AccountingKeyVersionZero.to_string(),
            "accounting key with version=0"
        );
        assert_eq!(
            Inconsistency::AccountingKeyDevsUnsorted.to_string(),
            "accounting key replicas entry with unsorted devs"
        );
        assert_eq!(
            Inconsistency::AccountingReplicasNotMarked.to_string(),
            "accounting not marked in superblock replicas"
        );
    }

    #[test]
    fn error_wraps_inconsistency() {
        let err = CfsError::InvalidKey(Inconsistency::AccountingKeyJunkAtEnd);
        assert_eq!(
            err.to_string(),
            "invalid accounting key: junk at end of accounting key"
        );
    }

    #[test]
    fn needs_mark_is_distinguishable() {
        let err = CfsError::NeedsReplicasMark;
        assert!(matches!(err, CfsError::NeedsReplicasMark));
    }

    #[test]
    fn inconsistency_serializes_as_snake_case() {
        let json = serde_json::to_string(&Inconsistency::AccountingMismatch).expect("serialize");
        assert_eq!(json, "\"accounting_mismatch\"");
    }
}
