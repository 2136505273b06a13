#![forbid(unsafe_code)]
//! Value types shared by every bucket-accounting crate.
//!
//! Nothing in here touches shared state: these are the ids, the packed mark
//! word, the device geometry consumed from member info, and the key/pointer
//! shapes handed to us by the btree.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum number of replicas a key may carry.
pub const REPLICAS_MAX: usize = 4;

/// A bucket whose `gen - oldest_gen` reaches this distance may not be
/// invalidated again until gc has lowered its `oldest_gen`.
pub const BUCKET_GC_GEN_MAX: u8 = 96;

/// Sector counts are stored in 24-bit fields of the mark word.
pub const MAX_BUCKET_SECTORS: u32 = (1 << 24) - 1;

/// Number of [`DataType`] variants.
pub const DATA_TYPE_NR: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketIdx(pub u64);

impl fmt::Display for DeviceIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BucketIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Generations ─────────────────────────────────────────────────────────────

/// 8-bit bucket generation.
///
/// Generations wrap, so they are only ever compared through the signed
/// wrapping difference. Correctness requires that no bucket advances more
/// than 127 generations past a live pointer into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Generation(pub u8);

impl Generation {
    /// The generation after this one (wrapping).
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Signed wrapping difference `self - other`.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub fn wrapping_cmp(self, other: Self) -> i8 {
        self.0.wrapping_sub(other.0) as i8
    }

    /// How many generations `self` is ahead of `other`, or 0 if it is not.
    #[must_use]
    #[expect(clippy::cast_sign_loss)]
    pub fn distance_after(self, other: Self) -> u8 {
        let d = self.wrapping_cmp(other);
        if d > 0 { d as u8 } else { 0 }
    }

    /// Whether a pointer recorded at `ptr_gen` is stale against this bucket
    /// generation.
    #[must_use]
    pub fn makes_stale(self, ptr_gen: Self) -> bool {
        self.wrapping_cmp(ptr_gen) > 0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Data types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    None = 0,
    Superblock = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
    Parity = 6,
}

impl DataType {
    pub const ALL: [Self; DATA_TYPE_NR] = [
        Self::None,
        Self::Superblock,
        Self::Journal,
        Self::Btree,
        Self::User,
        Self::Cached,
        Self::Parity,
    ];

    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::ALL.get(usize::from(bits)).copied()
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Superblock and journal buckets sit at fixed positions and are never
    /// relocated, so their data type survives the sector counts reaching 0.
    #[must_use]
    pub fn is_fixed_metadata(self) -> bool {
        matches!(self, Self::Superblock | Self::Journal)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "free",
            Self::Superblock => "sb",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
            Self::Parity => "parity",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Packed mark word ────────────────────────────────────────────────────────

const GEN_SHIFT: u32 = 0;
const GEN_MASK: u64 = 0xff;
const DATA_TYPE_SHIFT: u32 = 8;
const DATA_TYPE_MASK: u64 = 0xf;
const OWNED_BIT: u64 = 1 << 12;
const STRIPE_BIT: u64 = 1 << 13;
const DIRTY_SHIFT: u32 = 16;
const CACHED_SHIFT: u32 = 40;
const SECTORS_MASK: u64 = MAX_BUCKET_SECTORS as u64;

/// Occupancy descriptor of one bucket, packed into a single `u64` so it can
/// be swapped with one compare-and-exchange.
///
/// | bits   | field              |
/// |--------|--------------------|
/// | 0..8   | gen                |
/// | 8..12  | data type          |
/// | 12     | owned by allocator |
/// | 13     | stripe             |
/// | 16..40 | dirty sectors      |
/// | 40..64 | cached sectors     |
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BucketMark(u64);

impl BucketMark {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn generation(self) -> Generation {
        Generation(((self.0 >> GEN_SHIFT) & GEN_MASK) as u8)
    }

    #[must_use]
    pub fn with_generation(self, generation: Generation) -> Self {
        Self((self.0 & !(GEN_MASK << GEN_SHIFT)) | (u64::from(generation.0) << GEN_SHIFT))
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn data_type(self) -> DataType {
        DataType::from_bits(((self.0 >> DATA_TYPE_SHIFT) & DATA_TYPE_MASK) as u8)
            .unwrap_or(DataType::None)
    }

    #[must_use]
    pub fn with_data_type(self, data_type: DataType) -> Self {
        Self(
            (self.0 & !(DATA_TYPE_MASK << DATA_TYPE_SHIFT))
                | ((data_type as u64) << DATA_TYPE_SHIFT),
        )
    }

    #[must_use]
    pub fn owned_by_allocator(self) -> bool {
        self.0 & OWNED_BIT != 0
    }

    #[must_use]
    pub fn with_owned_by_allocator(self, owned: bool) -> Self {
        if owned {
            Self(self.0 | OWNED_BIT)
        } else {
            Self(self.0 & !OWNED_BIT)
        }
    }

    #[must_use]
    pub fn stripe(self) -> bool {
        self.0 & STRIPE_BIT != 0
    }

    #[must_use]
    pub fn with_stripe(self, stripe: bool) -> Self {
        if stripe {
            Self(self.0 | STRIPE_BIT)
        } else {
            Self(self.0 & !STRIPE_BIT)
        }
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn dirty_sectors(self) -> u32 {
        ((self.0 >> DIRTY_SHIFT) & SECTORS_MASK) as u32
    }

    /// Replace the dirty sector count. Values above [`MAX_BUCKET_SECTORS`]
    /// are truncated; callers check against the bucket size first.
    #[must_use]
    pub fn with_dirty_sectors(self, sectors: u32) -> Self {
        debug_assert!(sectors <= MAX_BUCKET_SECTORS);
        Self(
            (self.0 & !(SECTORS_MASK << DIRTY_SHIFT))
                | ((u64::from(sectors) & SECTORS_MASK) << DIRTY_SHIFT),
        )
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn cached_sectors(self) -> u32 {
        ((self.0 >> CACHED_SHIFT) & SECTORS_MASK) as u32
    }

    #[must_use]
    pub fn with_cached_sectors(self, sectors: u32) -> Self {
        debug_assert!(sectors <= MAX_BUCKET_SECTORS);
        Self(
            (self.0 & !(SECTORS_MASK << CACHED_SHIFT))
                | ((u64::from(sectors) & SECTORS_MASK) << CACHED_SHIFT),
        )
    }

    #[must_use]
    pub fn total_sectors(self) -> u64 {
        u64::from(self.dirty_sectors()) + u64::from(self.cached_sectors())
    }

    /// No dirty data and not part of a stripe: the bucket may be reused.
    #[must_use]
    pub fn is_available(self) -> bool {
        self.dirty_sectors() == 0 && !self.stripe()
    }

    #[must_use]
    pub fn is_unavailable(self) -> bool {
        !self.is_available()
    }

    /// The type this bucket is counted under in the per-device histogram.
    #[must_use]
    pub fn bucket_type(self) -> DataType {
        if self.cached_sectors() != 0 && self.dirty_sectors() == 0 {
            DataType::Cached
        } else {
            self.data_type()
        }
    }

    /// `dirty + cached <= bucket_size`.
    #[must_use]
    pub fn fits(self, bucket_size: u32) -> bool {
        self.total_sectors() <= u64::from(bucket_size)
    }
}

impl fmt::Debug for BucketMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketMark")
            .field("gen", &self.generation().0)
            .field("data_type", &self.data_type())
            .field("dirty_sectors", &self.dirty_sectors())
            .field("cached_sectors", &self.cached_sectors())
            .field("stripe", &self.stripe())
            .field("owned_by_allocator", &self.owned_by_allocator())
            .finish()
    }
}

// ── Device geometry ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("bucket_size {0} outside 1..={max}", max = MAX_BUCKET_SECTORS)]
    BucketSize(u32),
    #[error("first_bucket {first_bucket} must be below nbuckets {nbuckets}")]
    FirstBucket { first_bucket: u64, nbuckets: u64 },
    #[error("{what} bucket {bucket} outside device ({nbuckets} buckets)")]
    LayoutOutOfRange {
        what: &'static str,
        bucket: u64,
        nbuckets: u64,
    },
    #[error("superblock_sectors {sectors} exceeds bucket_size {bucket_size}")]
    SuperblockTooLarge { sectors: u32, bucket_size: u32 },
}

/// Per-device geometry as read from the member info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    /// Bucket size in 512-byte sectors.
    pub bucket_size: u32,
    pub nbuckets: u64,
    /// Buckets below this index are never allocated (boot area, labels).
    pub first_bucket: u64,
}

impl DeviceGeometry {
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.bucket_size == 0 || self.bucket_size > MAX_BUCKET_SECTORS {
            return Err(GeometryError::BucketSize(self.bucket_size));
        }
        if self.first_bucket >= self.nbuckets {
            return Err(GeometryError::FirstBucket {
                first_bucket: self.first_bucket,
                nbuckets: self.nbuckets,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn usable_buckets(&self) -> u64 {
        self.nbuckets.saturating_sub(self.first_bucket)
    }

    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.usable_buckets()
            .saturating_mul(u64::from(self.bucket_size))
    }

    #[must_use]
    pub fn sector_to_bucket(&self, sector: u64) -> BucketIdx {
        BucketIdx(sector / u64::from(self.bucket_size))
    }

    #[must_use]
    pub fn bucket_to_sector(&self, bucket: BucketIdx) -> u64 {
        bucket.0.saturating_mul(u64::from(self.bucket_size))
    }

    #[must_use]
    pub fn contains(&self, bucket: BucketIdx) -> bool {
        bucket.0 >= self.first_bucket && bucket.0 < self.nbuckets
    }
}

/// Member info consumed from the superblock subsystem: geometry plus the
/// fixed metadata placement on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub geometry: DeviceGeometry,
    /// Sector offsets of each superblock copy.
    pub superblock_offsets: Vec<u64>,
    /// Sectors occupied by one superblock copy.
    pub superblock_sectors: u32,
    /// Buckets owned by the journal.
    pub journal_buckets: Vec<u64>,
}

impl MemberInfo {
    /// Geometry only, no superblock or journal placement.
    #[must_use]
    pub fn bare(bucket_size: u32, nbuckets: u64, first_bucket: u64) -> Self {
        Self {
            geometry: DeviceGeometry {
                bucket_size,
                nbuckets,
                first_bucket,
            },
            superblock_offsets: Vec::new(),
            superblock_sectors: 0,
            journal_buckets: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        let geo = &self.geometry;
        geo.validate()?;
        if self.superblock_sectors > geo.bucket_size {
            return Err(GeometryError::SuperblockTooLarge {
                sectors: self.superblock_sectors,
                bucket_size: geo.bucket_size,
            });
        }
        for &offset in &self.superblock_offsets {
            let bucket = geo.sector_to_bucket(offset);
            if bucket.0 >= geo.nbuckets {
                return Err(GeometryError::LayoutOutOfRange {
                    what: "superblock",
                    bucket: bucket.0,
                    nbuckets: geo.nbuckets,
                });
            }
        }
        for &bucket in &self.journal_buckets {
            if bucket >= geo.nbuckets {
                return Err(GeometryError::LayoutOutOfRange {
                    what: "journal",
                    bucket,
                    nbuckets: geo.nbuckets,
                });
            }
        }
        Ok(())
    }
}

// ── Keys and pointers ───────────────────────────────────────────────────────

/// A pointer from a key into a device bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub dev: DeviceIdx,
    /// Device sector the data starts at.
    pub offset: u64,
    /// Bucket generation at the time the pointer was written.
    pub generation: Generation,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyPos {
    pub inode: u64,
    pub offset: u64,
}

impl KeyPos {
    pub const MIN: Self = Self {
        inode: 0,
        offset: 0,
    };
    pub const MAX: Self = Self {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }

    /// The next position in key order, saturating at [`KeyPos::MAX`].
    #[must_use]
    pub fn successor(self) -> Self {
        match self.offset.checked_add(1) {
            Some(offset) => Self {
                inode: self.inode,
                offset,
            },
            None => match self.inode.checked_add(1) {
                Some(inode) => Self { inode, offset: 0 },
                None => Self::MAX,
            },
        }
    }
}

impl fmt::Display for KeyPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyValue {
    /// User data with one pointer per replica (cached copies included).
    Extent { ptrs: Vec<ExtentPtr> },
    /// Pointer to a btree node.
    BtreePtr { ptrs: Vec<ExtentPtr> },
    /// Space reserved on behalf of a file without backing buckets yet.
    Reservation { nr_replicas: u8 },
    Inode,
}

/// A btree key as seen by the marking engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub pos: KeyPos,
    /// Size in sectors.
    pub size: u32,
    pub value: KeyValue,
}

impl Key {
    #[must_use]
    pub fn extent(pos: KeyPos, size: u32, ptrs: Vec<ExtentPtr>) -> Self {
        Self {
            pos,
            size,
            value: KeyValue::Extent { ptrs },
        }
    }

    #[must_use]
    pub fn btree_ptr(pos: KeyPos, size: u32, ptrs: Vec<ExtentPtr>) -> Self {
        Self {
            pos,
            size,
            value: KeyValue::BtreePtr { ptrs },
        }
    }

    #[must_use]
    pub fn ptrs(&self) -> &[ExtentPtr] {
        match &self.value {
            KeyValue::Extent { ptrs } | KeyValue::BtreePtr { ptrs } => ptrs,
            KeyValue::Reservation { .. } | KeyValue::Inode => &[],
        }
    }

    /// Data type a pointer of this key contributes to its bucket.
    #[must_use]
    pub fn ptr_data_type(&self, ptr: &ExtentPtr) -> DataType {
        match self.value {
            KeyValue::BtreePtr { .. } => DataType::Btree,
            _ if ptr.cached => DataType::Cached,
            _ => DataType::User,
        }
    }
}

// ── Replicas entries ────────────────────────────────────────────────────────

/// A replication scheme with its own sector counter in filesystem usage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicasEntry {
    pub data_type: DataType,
    pub nr_required: u8,
    /// Sorted, deduplicated.
    pub devs: Vec<DeviceIdx>,
}

impl ReplicasEntry {
    #[must_use]
    pub fn new(data_type: DataType, nr_required: u8, mut devs: Vec<DeviceIdx>) -> Self {
        devs.sort_unstable();
        devs.dedup();
        Self {
            data_type,
            nr_required,
            devs,
        }
    }

    #[must_use]
    pub fn single(data_type: DataType, dev: DeviceIdx) -> Self {
        Self {
            data_type,
            nr_required: 1,
            devs: vec![dev],
        }
    }

    #[must_use]
    pub fn references(&self, dev: DeviceIdx) -> bool {
        self.devs.binary_search(&dev).is_ok()
    }
}

impl fmt::Display for ReplicasEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{} [", self.data_type, self.nr_required, self.devs.len())?;
        for (i, dev) in self.devs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{dev}")?;
        }
        f.write_str("]")
    }
}
