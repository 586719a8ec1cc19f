//! The disconnected-chunk ("DLC") allocator: one big reserved range of address
//! space, carved into equal blocks that are committed when handed out and
//! decommitted when given back. Because every block is committed on its own,
//! freeing a block in the middle of the range really returns its memory to the
//! OS.
//!
//! Only one size is served. A request for anything other than exactly
//! `block_size` bytes gets `None`, and the caller is expected to go to the
//! general heap instead.

use std::{env, ptr::NonNull};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    os::mem::{ReservedRegion, PAGE_SIZE},
    serialize::serde_usize,
    util::{hint::cold, num::is_multiple_of},
};

use super::bitvec::BlockBitmap;

/// The one block size we serve: the interpreter's small-object arena size
pub const DLC_BLOCK_SIZE: usize = 256 * 1024;

/// How much address space gets reserved up front
pub const DLC_MAX_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DlcConfig {
    pub block_size: usize,
    pub max_size: usize,
}

impl Default for DlcConfig {
    fn default() -> Self {
        Self {
            block_size: DLC_BLOCK_SIZE,
            max_size: DLC_MAX_SIZE,
        }
    }
}

impl DlcConfig {
    /// The defaults, overridden by `DLC_BLOCK_SIZE` and `DLC_MAX_SIZE` from
    /// the environment if they are set
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let parse = |key: &'static str, default: usize| match lookup(key) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::InvalidConfig { key, value }),
        };
        Ok(Self {
            block_size: parse("DLC_BLOCK_SIZE", DLC_BLOCK_SIZE)?,
            max_size: parse("DLC_MAX_SIZE", DLC_MAX_SIZE)?,
        })
    }

    pub fn max_blocks(&self) -> usize {
        self.max_size / self.block_size
    }

    /// Blocks must be whole pages (so committing one never touches a
    /// neighbour) and must tile the region exactly.
    pub fn validate(&self) -> Result<()> {
        let page_size = *PAGE_SIZE;
        if is_multiple_of(self.block_size, page_size) && is_multiple_of(self.max_size, self.block_size)
        {
            Ok(())
        } else {
            Err(Error::InvalidGeometry {
                block_size: self.block_size,
                max_size: self.max_size,
                page_size,
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlcStats {
    pub allocated: usize,
    pub free: usize,
}

/// Everything needed to draw a picture of the region
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlcSnapshot {
    #[serde(with = "serde_usize")]
    pub base: *const u8,
    pub block_size: usize,
    pub max_size: usize,
    /// Indices of the in-use blocks, ascending
    pub allocated: Vec<usize>,
}

pub struct Dlc {
    region: ReservedRegion,
    bitmap: BlockBitmap,
    block_size: usize,
}

impl Dlc {
    /// Reserve the region (nothing is committed) and start with every block
    /// free.
    ///
    /// # Errors
    /// - [`Error::InvalidGeometry`] if `config` doesn't validate
    /// - [`Error::OutOfAddressSpace`] if the region can't be reserved
    pub fn init(config: DlcConfig) -> Result<Self> {
        config.validate()?;
        let region = ReservedRegion::reserve(config.max_size)?;
        debug!(
            "DLC init: {} blocks of {} bytes at {:p}",
            config.max_blocks(),
            config.block_size,
            region.base()
        );
        Ok(Self {
            region,
            bitmap: BlockBitmap::new(config.max_blocks()),
            block_size: config.block_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks in the region
    pub fn capacity(&self) -> usize {
        self.bitmap.len()
    }

    fn offset_of(&self, index: usize) -> usize {
        index * self.block_size
    }

    /// The block a pointer falls in, if it falls inside the region at all
    pub fn block_index(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.region.base() as usize)?;
        if offset >= self.capacity() * self.block_size {
            return None;
        }
        Some(offset / self.block_size)
    }

    /// Hand out the lowest free block. `None` if `size` isn't the block size,
    /// if every block is in use, or if the OS won't commit the pages; in all
    /// three cases the bitmap is left untouched.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size != self.block_size {
            return None;
        }
        let Some(index) = self.bitmap.first_free() else {
            return cold(|| {
                trace!("DLC exhausted ({} blocks in use)", self.capacity());
                None
            });
        };
        let offset = self.offset_of(index);
        self.region.commit(offset, self.block_size).ok()?;
        self.bitmap.set_low(index);
        trace!("DLC allocated block #{index}");
        // SAFETY: `offset` is inside the region, so this is in bounds of our
        // own (non-null) mapping
        NonNull::new(unsafe { self.region.base().add(offset) })
    }

    /// Give a block back. The memory behind it is decommitted immediately.
    ///
    /// # Panics
    /// - If `ptr` isn't inside the region
    /// - If its block is already free (a double free). Carrying on would mean
    ///   handing the block to two owners later.
    ///
    /// # Safety
    /// - Nothing may touch the block through `ptr` (or anything derived from
    ///   it) after this call
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(index) = self.block_index(ptr) else {
            panic!("DLC free of {ptr:p}, which is not in the block region");
        };
        if self.bitmap.is_free(index) {
            cold(|| panic!("DLCDoubleFree: block #{index} ({ptr:p}) is already free"));
        }
        self.region.decommit(self.offset_of(index), self.block_size);
        self.bitmap.set_high(index);
        trace!("DLC freed block #{index}");
    }

    /// `true` iff `ptr` is inside the region and its block is in use
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        self.block_index(ptr)
            .is_some_and(|index| !self.bitmap.is_free(index))
    }

    pub fn stats(&self) -> DlcStats {
        let allocated = self.bitmap.count_used();
        DlcStats {
            allocated,
            free: self.capacity() - allocated,
        }
    }

    pub fn snapshot(&self) -> DlcSnapshot {
        DlcSnapshot {
            base: self.region.base(),
            block_size: self.block_size,
            max_size: self.region.size(),
            allocated: self.bitmap.iter_used().collect(),
        }
    }

    /// Release the region. Same as dropping, but says so in the log.
    pub fn fini(self) {
        let stats = self.stats();
        if stats.allocated != 0 {
            let dump = serde_json::to_string(&self.snapshot()).unwrap_or_default();
            warn!("DLC fini with {} blocks still allocated: {dump}", stats.allocated);
        }
        debug!("DLC fini");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::{Dlc, DlcConfig, DlcSnapshot, DlcStats};
    use crate::{error::Error, os::mem::PAGE_SIZE};

    fn small_dlc(blocks: usize) -> Dlc {
        let block_size = *PAGE_SIZE;
        Dlc::init(DlcConfig {
            block_size,
            max_size: blocks * block_size,
        })
        .unwrap()
    }

    #[test]
    fn exhaustion_then_first_fit_reuse() {
        let mut dlc = small_dlc(3);
        let bs = dlc.block_size();
        let a = dlc.alloc(bs).unwrap();
        let b = dlc.alloc(bs).unwrap();
        let c = dlc.alloc(bs).unwrap();
        assert_eq!(HashSet::from([a, b, c]).len(), 3);
        assert_eq!(dlc.stats(), DlcStats { allocated: 3, free: 0 });

        assert!(dlc.alloc(bs).is_none());
        assert_eq!(dlc.stats(), DlcStats { allocated: 3, free: 0 });

        unsafe { dlc.free(b.as_ptr()) };
        assert_eq!(dlc.stats(), DlcStats { allocated: 2, free: 1 });
        assert_eq!(dlc.alloc(bs), Some(b));

        for p in [a, b, c] {
            unsafe { dlc.free(p.as_ptr()) };
        }
        dlc.fini();
    }

    #[test]
    fn wrong_size_is_rejected_without_touching_the_bitmap() {
        let mut dlc = small_dlc(2);
        let bs = dlc.block_size();
        for size in [0, 1, bs - 1, bs + 1, 2 * bs] {
            assert!(dlc.alloc(size).is_none());
        }
        assert_eq!(dlc.stats(), DlcStats { allocated: 0, free: 2 });
    }

    #[test]
    fn blocks_are_usable_memory() {
        let mut dlc = small_dlc(2);
        let bs = dlc.block_size();
        let p = dlc.alloc(bs).unwrap();
        let block = unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), bs) };
        assert!(block.iter().all(|b| *b == 0));
        block.fill(0x5a);
        assert!(dlc.is_allocated(unsafe { p.as_ptr().add(bs - 1) }));
        unsafe { dlc.free(p.as_ptr()) };
        assert!(!dlc.is_allocated(p.as_ptr()));
    }

    #[test]
    fn is_allocated_rejects_foreign_pointers() {
        let dlc = small_dlc(1);
        let on_stack = 0u8;
        assert!(!dlc.is_allocated(&on_stack));
        assert!(!dlc.is_allocated(std::ptr::null()));
    }

    #[test]
    #[should_panic(expected = "DLCDoubleFree")]
    fn double_free_is_fatal() {
        let mut dlc = small_dlc(2);
        let p = dlc.alloc(dlc.block_size()).unwrap();
        unsafe {
            dlc.free(p.as_ptr());
            dlc.free(p.as_ptr());
        }
    }

    #[test]
    #[should_panic(expected = "not in the block region")]
    fn freeing_a_foreign_pointer_is_fatal() {
        let mut dlc = small_dlc(1);
        let mut on_stack = 0u8;
        unsafe { dlc.free(&mut on_stack) };
    }

    #[test]
    fn random_alloc_free_never_hands_out_a_live_block() {
        let mut dlc = small_dlc(16);
        let bs = dlc.block_size();
        let mut rng = StdRng::seed_from_u64(0xd1c);
        let mut live = Vec::new();
        for _ in 0..2000 {
            if rng.gen_bool(0.55) {
                if let Some(p) = dlc.alloc(bs) {
                    assert!(!live.contains(&p), "{p:p} handed out twice");
                    live.push(p);
                } else {
                    assert_eq!(live.len(), dlc.capacity());
                }
            } else if !live.is_empty() {
                let p = live.swap_remove(rng.gen_range(0..live.len()));
                unsafe { dlc.free(p.as_ptr()) };
            }
            assert_eq!(dlc.stats().allocated, live.len());
        }
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut dlc = small_dlc(4);
        let bs = dlc.block_size();
        let a = dlc.alloc(bs).unwrap();
        let _b = dlc.alloc(bs).unwrap();
        unsafe { dlc.free(a.as_ptr()) };

        let snapshot = dlc.snapshot();
        assert_eq!(snapshot.allocated, vec![1]);
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: DlcSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn geometry_is_validated() {
        let page = *PAGE_SIZE;
        for (block_size, max_size) in [(0, page), (page / 2, page), (page, page + page / 2)] {
            let config = DlcConfig {
                block_size,
                max_size,
            };
            assert!(matches!(
                Dlc::init(config),
                Err(Error::InvalidGeometry { .. })
            ));
        }
    }

    #[test]
    fn config_reads_overrides() {
        let config = DlcConfig::from_lookup(|key| match key {
            "DLC_MAX_SIZE" => Some("1048576".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_size, 1024 * 1024);
        assert_eq!(config.block_size, super::DLC_BLOCK_SIZE);

        let err = DlcConfig::from_lookup(|_| Some("lots".to_string())).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig {
                key: "DLC_BLOCK_SIZE",
                ..
            }
        ));
    }
}
