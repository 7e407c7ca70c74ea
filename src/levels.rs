//! Level geometry: how the 64-bit key is cut into per-level slices.
//!
//! The map is compiled once at construction. Level 0 is the root, level
//! `L - 1` the lowest; the root carries the highest-order bits. Every
//! descriptor stores the true bit-start of its slice, so extraction is
//! uniformly `(key >> offset) & ((1 << bits) - 1)` at every level.

use arrayvec::ArrayVec;

use crate::error::Error;

/// A 64-bit key can never be cut into more than 64 one-bit slices.
pub const MAX_LEVELS: usize = 64;

/// Widths above this cannot be backed by a dense slot array.
pub const MAX_LEVEL_BITS: u32 = 28;

/// One level of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelDesc {
    /// Width of this level's key slice.
    pub bits: u32,
    /// Slot count, `1 << bits`.
    pub size: usize,
    /// Bit position of the slice within the key; 0 for the lowest level.
    pub offset: u32,
}

/// The compiled level table, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelMap {
    levels: ArrayVec<LevelDesc, MAX_LEVELS>,
    key_bits: u32,
}

impl LevelMap {
    /// Distributes `key_bits` across `mid_levels + 2` levels.
    ///
    /// The root and lowest levels take their configured widths verbatim;
    /// the remaining bits must divide evenly across the mid levels.
    pub fn compile(
        key_bits: u32,
        root_bits: u32,
        low_bits: u32,
        mid_levels: u32,
    ) -> Result<Self, Error> {
        if key_bits == 0 || key_bits > 64 || root_bits == 0 || low_bits == 0 {
            return Err(Error::InvalidConfig);
        }
        let edge_bits = root_bits.checked_add(low_bits).ok_or(Error::InvalidConfig)?;
        let mid_total = key_bits.checked_sub(edge_bits).ok_or(Error::InvalidConfig)?;

        let mid_bits = if mid_levels == 0 {
            if mid_total != 0 {
                return Err(Error::InvalidConfig);
            }
            0
        } else {
            if mid_total % mid_levels != 0 {
                return Err(Error::InvalidConfig);
            }
            let each = mid_total / mid_levels;
            if each == 0 {
                return Err(Error::InvalidConfig);
            }
            each
        };

        let depth = mid_levels as usize + 2;
        if depth > MAX_LEVELS
            || root_bits > MAX_LEVEL_BITS
            || low_bits > MAX_LEVEL_BITS
            || mid_bits > MAX_LEVEL_BITS
        {
            return Err(Error::InvalidConfig);
        }

        let mut levels = ArrayVec::new();
        let mut offset = key_bits - root_bits;
        levels.push(LevelDesc {
            bits: root_bits,
            size: 1usize << root_bits,
            offset,
        });
        for _ in 0..mid_levels {
            offset -= mid_bits;
            levels.push(LevelDesc {
                bits: mid_bits,
                size: 1usize << mid_bits,
                offset,
            });
        }
        debug_assert_eq!(offset, low_bits);
        levels.push(LevelDesc {
            bits: low_bits,
            size: 1usize << low_bits,
            offset: 0,
        });

        Ok(LevelMap { levels, key_bits })
    }

    /// Total number of levels, root and lowest included.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Index of the lowest level.
    pub fn lowest_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    pub fn desc(&self, level: usize) -> &LevelDesc {
        &self.levels[level]
    }

    pub fn root(&self) -> &LevelDesc {
        &self.levels[0]
    }

    pub fn lowest(&self) -> &LevelDesc {
        &self.levels[self.levels.len() - 1]
    }

    /// The shared mid-level descriptor, absent when the map has no mid
    /// levels.
    pub fn mid(&self) -> Option<&LevelDesc> {
        if self.levels.len() > 2 {
            Some(&self.levels[1])
        } else {
            None
        }
    }

    /// Extracts the slice of `key` addressed by `level`, usable directly
    /// as a slot offset.
    pub fn slice(&self, key: u64, level: usize) -> usize {
        let desc = &self.levels[level];
        ((key >> desc.offset) & ((1u64 << desc.bits) - 1)) as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = &LevelDesc> + '_ {
        self.levels.iter()
    }
}
