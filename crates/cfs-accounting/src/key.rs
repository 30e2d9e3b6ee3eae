//! Accounting key codec.
//!
//! An [`AccountingKey`] names one counter category. Its serialized form is
//! a fixed-width, byte-comparable [`Pos`]: tag byte followed by the
//! variant's payload, with every byte past the payload required to be zero.
//! Lexicographic order of the encoded form is the ledger's key order.
//!
//! Normalization (sorting and deduplicating a replicas device list) must
//! happen before any encode or lookup so the persisted position is
//! canonical; [`AccountingKey::normalize`] is called by the mutator before
//! encoding, and [`AccountingKey::validate`] rejects keys that were
//! persisted unnormalized.

use cfs_error::Inconsistency;
use cfs_types::{
    ACCOUNTING_POS_BYTES, Bversion, BtreeId, CompressionType, DataType, DeviceIndex,
    MAX_REPLICAS_DEVS, Pos, SnapshotId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Category tags ───────────────────────────────────────────────────────────

/// The tag of one accounting key variant.
///
/// Tag values are the first byte of the encoded position and are stable
/// on-disk identifiers. Bit positions (`1 << tag`) form the filter mask
/// used by the typed usage dump.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AccountingType {
    NrInodes = 0,
    PersistentReserved = 1,
    Replicas = 2,
    DevDataType = 3,
    Compression = 4,
    Snapshot = 5,
    Btree = 6,
    RebalanceWork = 7,
}

/// Number of known accounting types.
pub const NR_ACCOUNTING_TYPES: usize = 8;

impl AccountingType {
    pub const ALL: [Self; NR_ACCOUNTING_TYPES] = [
        Self::NrInodes,
        Self::PersistentReserved,
        Self::Replicas,
        Self::DevDataType,
        Self::Compression,
        Self::Snapshot,
        Self::Btree,
        Self::RebalanceWork,
    ];

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::NrInodes => "nr_inodes",
            Self::PersistentReserved => "persistent_reserved",
            Self::Replicas => "replicas",
            Self::DevDataType => "dev_data_type",
            Self::Compression => "compression",
            Self::Snapshot => "snapshot",
            Self::Btree => "btree",
            Self::RebalanceWork => "rebalance_work",
        }
    }

    /// This type's bit in a [`TypeFilter`] mask.
    #[must_use]
    pub fn bit(self) -> u32 {
        1 << self.as_u8()
    }
}

impl TryFrom<u8> for AccountingType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Self::ALL.get(v as usize).copied().ok_or(v)
    }
}

impl fmt::Display for AccountingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bitmask of accounting types, for filtering the typed usage dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeFilter(pub u32);

impl TypeFilter {
    /// Every known type.
    #[must_use]
    pub fn all() -> Self {
        Self(AccountingType::ALL.iter().map(|t| t.bit()).sum())
    }

    /// Only the listed types.
    #[must_use]
    pub fn only(types: &[AccountingType]) -> Self {
        Self(types.iter().map(|t| t.bit()).fold(0, |a, b| a | b))
    }

    #[must_use]
    pub fn contains(self, t: AccountingType) -> bool {
        self.0 & t.bit() != 0
    }
}

// ── Replicas entries ────────────────────────────────────────────────────────

/// A replica configuration: which devices hold copies of one class of
/// data, and how many of those copies are required for durability.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReplicasEntry {
    pub data_type: DataType,
    pub nr_required: u8,
    pub devs: Vec<DeviceIndex>,
}

impl ReplicasEntry {
    /// The cached-replica entry for a single device.
    #[must_use]
    pub fn cached(dev: DeviceIndex) -> Self {
        Self {
            data_type: DataType::Cached,
            nr_required: 1,
            devs: vec![dev],
        }
    }

    #[must_use]
    pub fn nr_devs(&self) -> usize {
        self.devs.len()
    }

    /// Sort and deduplicate the device list.
    pub fn normalize(&mut self) {
        self.devs.sort_unstable();
        self.devs.dedup();
    }

    /// Check field bounds and the sorted-devs requirement.
    pub fn validate(&self) -> Result<(), Inconsistency> {
        if self.devs.is_empty() {
            return Err(Inconsistency::AccountingKeyNrDevsZero);
        }
        if self.devs.len() > MAX_REPLICAS_DEVS {
            return Err(Inconsistency::AccountingKeyBadField);
        }
        let nr_devs = self.devs.len();
        let nr_required = usize::from(self.nr_required);
        if nr_required == 0
            || nr_required > nr_devs
            || (nr_required > 1 && nr_required == nr_devs)
        {
            return Err(Inconsistency::AccountingKeyNrRequiredBad);
        }
        if !self.devs.windows(2).all(|w| w[0] < w[1]) {
            return Err(Inconsistency::AccountingKeyDevsUnsorted);
        }
        Ok(())
    }
}

impl fmt::Display for ReplicasEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} [",
            self.data_type,
            self.nr_required,
            self.nr_devs()
        )?;
        for (i, dev) in self.devs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{dev}")?;
        }
        f.write_str("]")
    }
}

// ── The key itself ──────────────────────────────────────────────────────────

/// Tagged identifier of one counter category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountingKey {
    /// Total inode count. One counter.
    NrInodes,
    /// Space reserved without being allocated, by replication factor.
    PersistentReserved { nr_replicas: u8 },
    /// Sectors held by one replica configuration.
    Replicas(ReplicasEntry),
    /// Per-device usage by data type: {buckets, sectors, fragmented}.
    DevDataType {
        dev: DeviceIndex,
        data_type: DataType,
    },
    /// Compression statistics: {nr_extents, uncompressed, compressed}.
    Compression { typ: CompressionType },
    /// Per-snapshot space usage.
    Snapshot { id: SnapshotId },
    /// Per-btree space consumption.
    Btree { id: BtreeId },
    /// Pending rebalance work, in sectors.
    RebalanceWork,
}

impl AccountingKey {
    #[must_use]
    pub fn accounting_type(&self) -> AccountingType {
        match self {
            Self::NrInodes => AccountingType::NrInodes,
            Self::PersistentReserved { .. } => AccountingType::PersistentReserved,
            Self::Replicas(_) => AccountingType::Replicas,
            Self::DevDataType { .. } => AccountingType::DevDataType,
            Self::Compression { .. } => AccountingType::Compression,
            Self::Snapshot { .. } => AccountingType::Snapshot,
            Self::Btree { .. } => AccountingType::Btree,
            Self::RebalanceWork => AccountingType::RebalanceWork,
        }
    }

    /// Normalize before encode or lookup. Only replicas keys carry state
    /// that needs it.
    pub fn normalize(&mut self) {
        if let Self::Replicas(e) = self {
            e.normalize();
        }
    }

    /// Per-variant field validation. Does not normalize: a replicas key
    /// with an unsorted device list fails here.
    pub fn validate(&self) -> Result<(), Inconsistency> {
        match self {
            Self::Replicas(e) => e.validate(),
            _ => Ok(()),
        }
    }

    /// Encode to the byte-comparable position.
    ///
    /// Callers must normalize and validate first; encoding an oversized
    /// device list would truncate, so it is debug-asserted.
    #[must_use]
    pub fn encode(&self) -> Pos {
        let mut b = [0_u8; ACCOUNTING_POS_BYTES];
        b[0] = self.accounting_type().as_u8();
        match self {
            Self::NrInodes | Self::RebalanceWork => {}
            Self::PersistentReserved { nr_replicas } => b[1] = *nr_replicas,
            Self::Replicas(e) => {
                debug_assert!(e.nr_devs() <= MAX_REPLICAS_DEVS);
                b[1] = e.data_type.as_u8();
                b[2] = e.nr_required;
                b[3] = u8::try_from(e.nr_devs()).unwrap_or(u8::MAX);
                for (i, dev) in e.devs.iter().take(MAX_REPLICAS_DEVS).enumerate() {
                    b[4 + i] = dev.0;
                }
            }
            Self::DevDataType { dev, data_type } => {
                b[1] = dev.0;
                b[2] = data_type.as_u8();
            }
            Self::Compression { typ } => b[1] = typ.as_u8(),
            Self::Snapshot { id } => b[1..5].copy_from_slice(&id.0.to_be_bytes()),
            Self::Btree { id } => b[1..5].copy_from_slice(&id.0.to_be_bytes()),
        }
        Pos(b)
    }

    /// Decode a position back to a key.
    ///
    /// Fails on an unknown tag, an out-of-range field, or nonzero bytes
    /// past the variant's payload. Does not check the sorted-devs
    /// requirement; that is [`validate`](Self::validate)'s job.
    pub fn decode(pos: Pos) -> Result<Self, Inconsistency> {
        let b = &pos.0;
        let tag =
            AccountingType::try_from(b[0]).map_err(|_| Inconsistency::AccountingKeyUnknownType)?;

        let (key, payload_end) = match tag {
            AccountingType::NrInodes => (Self::NrInodes, 1),
            AccountingType::PersistentReserved => {
                (Self::PersistentReserved { nr_replicas: b[1] }, 2)
            }
            AccountingType::Replicas => {
                let data_type = DataType::try_from(b[1])
                    .map_err(|_| Inconsistency::AccountingKeyBadField)?;
                let nr_devs = usize::from(b[3]);
                if nr_devs > MAX_REPLICAS_DEVS {
                    return Err(Inconsistency::AccountingKeyBadField);
                }
                let devs = b[4..4 + nr_devs].iter().map(|d| DeviceIndex(*d)).collect();
                (
                    Self::Replicas(ReplicasEntry {
                        data_type,
                        nr_required: b[2],
                        devs,
                    }),
                    4 + nr_devs,
                )
            }
            AccountingType::DevDataType => {
                let data_type = DataType::try_from(b[2])
                    .map_err(|_| Inconsistency::AccountingKeyBadField)?;
                (
                    Self::DevDataType {
                        dev: DeviceIndex(b[1]),
                        data_type,
                    },
                    3,
                )
            }
            AccountingType::Compression => {
                let typ = CompressionType::try_from(b[1])
                    .map_err(|_| Inconsistency::AccountingKeyBadField)?;
                (Self::Compression { typ }, 2)
            }
            AccountingType::Snapshot => {
                let id = u32::from_be_bytes([b[1], b[2], b[3], b[4]]);
                (Self::Snapshot { id: SnapshotId(id) }, 5)
            }
            AccountingType::Btree => {
                let id = u32::from_be_bytes([b[1], b[2], b[3], b[4]]);
                (Self::Btree { id: BtreeId(id) }, 5)
            }
            AccountingType::RebalanceWork => (Self::RebalanceWork, 1),
        };

        if b[payload_end..].iter().any(|x| *x != 0) {
            return Err(Inconsistency::AccountingKeyJunkAtEnd);
        }

        Ok(key)
    }

    /// Full validation of a persisted key: version stamp, decode, fields.
    ///
    /// This is the fsck entry point; every failure is a named, repairable
    /// inconsistency, never a hard error.
    pub fn validate_pos(pos: Pos, bversion: Bversion) -> Result<Self, Inconsistency> {
        if bversion.is_zero() {
            return Err(Inconsistency::AccountingKeyVersionZero);
        }
        let key = Self::decode(pos)?;
        key.validate()?;
        Ok(key)
    }

    /// The replicas entry named by this key, if it is replicas-class.
    #[must_use]
    pub fn to_replicas(&self) -> Option<&ReplicasEntry> {
        match self {
            Self::Replicas(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for AccountingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.accounting_type().name())?;
        match self {
            Self::NrInodes | Self::RebalanceWork => Ok(()),
            Self::PersistentReserved { nr_replicas } => write!(f, " replicas={nr_replicas}"),
            Self::Replicas(e) => write!(f, " {e}"),
            Self::DevDataType { dev, data_type } => {
                write!(f, " dev={dev} data_type={data_type}")
            }
            Self::Compression { typ } => write!(f, " {typ}"),
            Self::Snapshot { id } => write!(f, " id={id}"),
            Self::Btree { id } => write!(f, " btree={id}"),
        }
    }
}
