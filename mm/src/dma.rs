//! DMA-coherent memory arena.
//!
//! The platform hands the driver one physically-contiguous, uncached,
//! device-visible carve-out at attach time. Every descriptor ring, header
//! ring, update buffer and data-ring block is carved from it with
//! [`dma_alloc_coherent`]; ring resize returns regions with
//! [`dma_free_coherent`].
//!
//! Allocation is first-fit over a fixed table of free ranges, protected by
//! an [`IrqMutex`]. Frees coalesce with both neighbours so repeated ring
//! resizes do not fragment the arena. All regions are page-aligned and
//! zeroed before they are handed out — the controllers rely on cleared
//! update buffers and `valid` bits.

use core::ptr;

use nfb_abi::{PAGE_SIZE, PhysAddr, VirtAddr};
use nfb_abi::error::{DriverError, DriverResult};
use nfb_lib::IrqMutex;
use nfb_lib::alignment::align_up_u64;

/// One DMA-coherent allocation: kernel-virtual view plus the bus address the
/// card must be programmed with.
#[derive(Clone, Copy, Debug)]
pub struct DmaRegion {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub size: u64,
}

impl DmaRegion {
    #[inline]
    pub const fn as_ptr(&self) -> *const u8 {
        self.virt.as_ptr()
    }

    #[inline]
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.virt.as_mut_ptr()
    }
}

/// Maximum number of disjoint free ranges tracked. Rings allocate a handful
/// of regions each; 64 leaves plenty of slack for pathological resize
/// sequences.
const MAX_FREE_RANGES: usize = 64;

#[derive(Clone, Copy)]
struct FreeRange {
    offset: u64,
    size: u64,
}

struct ArenaInner {
    virt_base: u64,
    phys_base: u64,
    size: u64,
    free: [FreeRange; MAX_FREE_RANGES],
    free_count: usize,
}

impl ArenaInner {
    const fn unconfigured() -> Self {
        Self {
            virt_base: 0,
            phys_base: 0,
            size: 0,
            free: [FreeRange { offset: 0, size: 0 }; MAX_FREE_RANGES],
            free_count: 0,
        }
    }

    fn alloc(&mut self, size: u64) -> Option<u64> {
        // First fit; split the winning range in place.
        for i in 0..self.free_count {
            if self.free[i].size >= size {
                let offset = self.free[i].offset;
                self.free[i].offset += size;
                self.free[i].size -= size;
                if self.free[i].size == 0 {
                    self.free[i] = self.free[self.free_count - 1];
                    self.free_count -= 1;
                }
                return Some(offset);
            }
        }
        None
    }

    fn free(&mut self, offset: u64, size: u64) {
        // Coalesce with any adjacent ranges before inserting.
        let mut offset = offset;
        let mut size = size;
        let mut i = 0;
        while i < self.free_count {
            let range = self.free[i];
            if range.offset + range.size == offset {
                offset = range.offset;
                size += range.size;
                self.free[i] = self.free[self.free_count - 1];
                self.free_count -= 1;
                i = 0;
                continue;
            }
            if offset + size == range.offset {
                size += range.size;
                self.free[i] = self.free[self.free_count - 1];
                self.free_count -= 1;
                i = 0;
                continue;
            }
            i += 1;
        }
        if self.free_count < MAX_FREE_RANGES {
            self.free[self.free_count] = FreeRange { offset, size };
            self.free_count += 1;
        }
        // A full table would leak the range; with coalescing this needs more
        // than MAX_FREE_RANGES interleaved holes, which the ring allocation
        // pattern cannot produce.
    }
}

static ARENA: IrqMutex<ArenaInner> = IrqMutex::new(ArenaInner::unconfigured());

/// Install the DMA carve-out. May be called again to replace an exhausted
/// arena during teardown/re-attach; outstanding regions from the previous
/// arena must have been freed.
pub fn dma_arena_init(virt_base: VirtAddr, phys_base: PhysAddr, size: u64) {
    let mut arena = ARENA.lock();
    arena.virt_base = virt_base.as_u64();
    arena.phys_base = phys_base.as_u64();
    arena.size = size;
    arena.free_count = 1;
    arena.free[0] = FreeRange { offset: 0, size };
}

/// Allocate a zeroed, page-aligned DMA-coherent region.
pub fn dma_alloc_coherent(size: u64) -> DriverResult<DmaRegion> {
    if size == 0 {
        return Err(DriverError::InvalidArgument);
    }
    let size = align_up_u64(size, PAGE_SIZE);

    let (virt, phys) = {
        let mut arena = ARENA.lock();
        if arena.size == 0 {
            return Err(DriverError::NoMemory);
        }
        let offset = arena.alloc(size).ok_or(DriverError::NoMemory)?;
        (arena.virt_base + offset, arena.phys_base + offset)
    };

    // SAFETY: the range [virt, virt+size) was just carved out of the arena
    // and is not aliased by any other live region.
    unsafe { ptr::write_bytes(virt as *mut u8, 0, size as usize) };

    Ok(DmaRegion {
        virt: VirtAddr::new(virt),
        phys: PhysAddr::new(phys),
        size,
    })
}

/// Return a region to the arena. The caller must guarantee the device no
/// longer accesses it (controller stopped, ring detached).
pub fn dma_free_coherent(region: DmaRegion) {
    let mut arena = ARENA.lock();
    if arena.size == 0 || region.size == 0 {
        return;
    }
    let offset = region.virt.as_u64().wrapping_sub(arena.virt_base);
    if offset + region.size > arena.size {
        return;
    }
    arena.free(offset, region.size);
}

/// Bytes currently available in the arena (diagnostic).
pub fn dma_arena_available() -> u64 {
    let arena = ARENA.lock();
    let mut total = 0;
    for i in 0..arena.free_count {
        total += arena.free[i].size;
    }
    total
}
