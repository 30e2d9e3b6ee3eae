#![forbid(unsafe_code)]
//! Shared newtypes for the cinderfs accounting engine.
//!
//! Unit-carrying wrappers prevent mixing device indices, snapshot IDs,
//! journal sequences, and version stamps. Everything here is `Copy`,
//! ordered, and serde-serializable so higher layers can put these types
//! directly into exported reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of signed 64-bit counters an accounting value may carry.
pub const MAX_COUNTERS: usize = 3;

/// Maximum number of devices in a replicas configuration.
pub const MAX_REPLICAS_DEVS: usize = 16;

/// Width of the serialized, byte-comparable accounting key position.
pub const ACCOUNTING_POS_BYTES: usize = 32;

/// Index of a member device within the filesystem.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeviceIndex(pub u8);

/// Snapshot tree identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SnapshotId(pub u32);

/// Identifier of one btree within the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BtreeId(pub u32);

/// Monotonic journal sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct JournalSeq(pub u64);

// ── Version stamp ───────────────────────────────────────────────────────────

/// Bits of a [`Bversion`] reserved for the offset within one journal buffer.
pub const BVERSION_OFFSET_BITS: u32 = 20;

/// Version stamp assigned to an accounting update at transaction commit.
///
/// Packed from (journal sequence, offset within the journal buffer):
/// high 44 bits are the sequence, low 20 bits the offset. Comparing two
/// stamps therefore orders updates by commit position, which is what
/// journal replay uses to decide whether an entry has already been applied.
///
/// `Bversion::ZERO` never appears on a valid persisted key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Bversion(pub u64);

impl Bversion {
    pub const ZERO: Self = Self(0);

    /// Pack a stamp from a journal sequence and an offset within its buffer.
    #[must_use]
    pub fn from_parts(seq: JournalSeq, offset: u32) -> Self {
        debug_assert!(u64::from(offset) < (1 << BVERSION_OFFSET_BITS));
        Self((seq.0 << BVERSION_OFFSET_BITS) | (u64::from(offset) & ((1 << BVERSION_OFFSET_BITS) - 1)))
    }

    /// The journal sequence this stamp was assigned under.
    #[must_use]
    pub fn journal_seq(self) -> JournalSeq {
        JournalSeq(self.0 >> BVERSION_OFFSET_BITS)
    }

    /// Offset within the journal buffer.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // masked to 20 bits
    pub fn offset(self) -> u32 {
        (self.0 & ((1 << BVERSION_OFFSET_BITS) - 1)) as u32
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

// ── Byte-comparable key position ────────────────────────────────────────────

/// Serialized accounting key: a fixed-width, byte-comparable position.
///
/// Lexicographic byte order equals key order, so a `BTreeMap<Pos, _>`
/// iterates the ledger in key order for free. The codec in the accounting
/// crate owns the layout; this type is just the ordered container.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pos(pub [u8; ACCOUNTING_POS_BYTES]);

impl Pos {
    pub const MIN: Self = Self([0; ACCOUNTING_POS_BYTES]);

    /// The smallest position strictly greater than `self`.
    ///
    /// Saturates at the all-ones position.
    #[must_use]
    pub fn successor(self) -> Self {
        let mut bytes = self.0;
        for b in bytes.iter_mut().rev() {
            if *b == u8::MAX {
                *b = 0;
            } else {
                *b += 1;
                return Self(bytes);
            }
        }
        Self([u8::MAX; ACCOUNTING_POS_BYTES])
    }
}

impl fmt::Debug for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

// ── Data and compression categories ─────────────────────────────────────────

/// What a set of sectors is used for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DataType {
    Free = 0,
    Sb = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
    Parity = 6,
    Stripe = 7,
}

/// Number of [`DataType`] variants.
pub const NR_DATA_TYPES: usize = 8;

impl DataType {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// All variants, in tag order.
    pub const ALL: [Self; NR_DATA_TYPES] = [
        Self::Free,
        Self::Sb,
        Self::Journal,
        Self::Btree,
        Self::User,
        Self::Cached,
        Self::Parity,
        Self::Stripe,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Sb => "sb",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
            Self::Parity => "parity",
            Self::Stripe => "stripe",
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Self::ALL.get(v as usize).copied().ok_or(v)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extent compression algorithm.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Lz4 = 1,
    Gzip = 2,
    Zstd = 3,
    Incompressible = 4,
}

impl CompressionType {
    pub const ALL: [Self; 5] = [
        Self::None,
        Self::Lz4,
        Self::Gzip,
        Self::Zstd,
        Self::Incompressible,
    ];

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Incompressible => "incompressible",
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Self::ALL.get(v as usize).copied().ok_or(v)
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Counter value ───────────────────────────────────────────────────────────

/// An accounting value: an ordered sequence of 1..=[`MAX_COUNTERS`] signed
/// 64-bit counters. Fixed storage, no heap allocation on the apply path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    vals: [i64; MAX_COUNTERS],
    nr: u8,
}

impl Counters {
    /// All-zero value with `nr` live counters.
    ///
    /// # Panics
    ///
    /// Panics if `nr` is zero or exceeds [`MAX_COUNTERS`].
    #[must_use]
    pub fn zeroed(nr: usize) -> Self {
        assert!(nr >= 1 && nr <= MAX_COUNTERS);
        Self {
            vals: [0; MAX_COUNTERS],
            nr: nr as u8,
        }
    }

    /// Copy from a slice of 1..=[`MAX_COUNTERS`] deltas.
    ///
    /// # Panics
    ///
    /// Panics if the slice is empty or longer than [`MAX_COUNTERS`].
    #[must_use]
    pub fn from_slice(d: &[i64]) -> Self {
        let mut c = Self::zeroed(d.len());
        c.vals[..d.len()].copy_from_slice(d);
        c
    }

    #[must_use]
    pub fn nr(&self) -> usize {
        usize::from(self.nr)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[i64] {
        &self.vals[..self.nr()]
    }

    #[must_use]
    pub fn get(&self, i: usize) -> i64 {
        self.as_slice().get(i).copied().unwrap_or(0)
    }

    /// Add `other` counter-wise, widening to the larger counter count.
    pub fn accumulate(&mut self, other: &Self) {
        self.nr = self.nr.max(other.nr);
        for i in 0..usize::from(self.nr) {
            self.vals[i] = self.vals[i].wrapping_add(other.vals[i]);
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.as_slice().iter().all(|v| *v == 0)
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for v in self.as_slice() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{v}")?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
