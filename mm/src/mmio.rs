//! Bounds-checked volatile MMIO window.
//!
//! An [`MmioRegion`] is a typed view of a device register window. Reads and
//! writes are volatile and sized exactly as requested; the MI fabric rejects
//! reordered or torn accesses, so no access is ever widened or split here.

use core::ptr::{read_volatile, write_volatile};

use nfb_abi::{PhysAddr, VirtAddr};

#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    virt_base: u64,
    phys_base: u64,
    size: usize,
}

impl MmioRegion {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            virt_base: 0,
            phys_base: 0,
            size: 0,
        }
    }

    /// Wrap an already-mapped window.
    ///
    /// The platform maps BARs before the driver attaches; this constructor
    /// only records the view. `virt` must be valid for `size` bytes of
    /// volatile access for the lifetime of the region.
    pub const fn from_raw(virt: VirtAddr, phys: PhysAddr, size: usize) -> Self {
        Self {
            virt_base: virt.as_u64(),
            phys_base: phys.as_u64(),
            size,
        }
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.virt_base != 0
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn virt_base(&self) -> u64 {
        self.virt_base
    }

    #[inline]
    pub fn phys_base(&self) -> PhysAddr {
        PhysAddr::new(self.phys_base)
    }

    /// True if `[offset, offset+len)` lies inside the window.
    #[inline]
    pub fn is_valid_offset(&self, offset: usize, len: usize) -> bool {
        match offset.checked_add(len) {
            Some(end) => end <= self.size,
            None => false,
        }
    }

    #[inline]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        let size = core::mem::size_of::<T>();
        debug_assert!(
            self.is_valid_offset(offset, size),
            "MMIO read out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );
        debug_assert!(
            offset % size == 0,
            "MMIO read misaligned: offset={}, align={}",
            offset,
            size
        );

        let ptr = (self.virt_base + offset as u64) as *const T;
        unsafe { read_volatile(ptr) }
    }

    #[inline]
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        let size = core::mem::size_of::<T>();
        debug_assert!(
            self.is_valid_offset(offset, size),
            "MMIO write out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );
        debug_assert!(
            offset % size == 0,
            "MMIO write misaligned: offset={}, align={}",
            offset,
            size
        );

        let ptr = (self.virt_base + offset as u64) as *mut T;
        unsafe { write_volatile(ptr, value) }
    }
}
