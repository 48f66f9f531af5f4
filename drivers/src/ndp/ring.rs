//! Channel ring buffer: equally sized DMA blocks forming one logical
//! power-of-two byte space.
//!
//! Userspace sees the ring through a `2S`-byte mmap window that maps the
//! blocks twice in sequence, so any range of at most `S` bytes is linear.
//! Kernel-side producers and consumers get the same guarantee from the
//! wrap-aware accessors below; the two views are byte-for-byte identical.

use alloc::vec::Vec;

use core::ptr;

use nfb_abi::{PAGE_SIZE, PhysAddr};
use nfb_abi::error::{DriverError, DriverResult};
use nfb_lib::alignment::ispow2_u64;
use nfb_mm::dma::{DmaRegion, dma_alloc_coherent, dma_free_coherent};

use crate::device::MmapSegment;

pub struct NdpRing {
    size: u64,
    block_size: u64,
    blocks: Vec<DmaRegion>,
    mmap_offset: u64,
}

impl NdpRing {
    /// An empty ring; channels start with one and gain storage on create.
    pub const fn empty() -> Self {
        Self {
            size: 0,
            block_size: 0,
            blocks: Vec::new(),
            mmap_offset: 0,
        }
    }

    /// Allocate `block_count` zeroed blocks of `block_size` bytes.
    ///
    /// `block_size` must be a page multiple and the total size a power of
    /// two. A zero `block_count` yields an empty ring.
    pub fn alloc(block_count: u64, block_size: u64) -> DriverResult<NdpRing> {
        if block_count == 0 {
            return Ok(Self::empty());
        }
        if block_size == 0 || block_size % PAGE_SIZE != 0 {
            return Err(DriverError::InvalidArgument);
        }
        let size = block_count * block_size;
        if !ispow2_u64(size) {
            return Err(DriverError::InvalidArgument);
        }

        let mut blocks = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            match dma_alloc_coherent(block_size) {
                Ok(region) => blocks.push(region),
                Err(err) => {
                    for block in blocks {
                        dma_free_coherent(block);
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            size,
            block_size,
            blocks,
            mmap_offset: 0,
        })
    }

    /// Release all blocks. The controller must be detached first — no
    /// descriptor may still reference these pages.
    pub fn free(&mut self) {
        for block in self.blocks.drain(..) {
            dma_free_coherent(block);
        }
        self.size = 0;
        self.block_size = 0;
        self.mmap_offset = 0;
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    #[inline]
    pub fn block(&self, index: usize) -> &DmaRegion {
        &self.blocks[index]
    }

    /// Size of the registered mmap window: the double map.
    #[inline]
    pub fn mmap_size(&self) -> u64 {
        2 * self.size
    }

    #[inline]
    pub fn mmap_offset(&self) -> u64 {
        self.mmap_offset
    }

    pub(crate) fn set_mmap_offset(&mut self, offset: u64) {
        self.mmap_offset = offset;
    }

    /// Bus address of the byte at logical `offset`.
    pub fn phys_of(&self, offset: u64) -> PhysAddr {
        debug_assert!(!self.is_empty());
        let offset = offset & (self.size - 1);
        let block = &self.blocks[(offset / self.block_size) as usize];
        block.phys.add(offset % self.block_size)
    }

    /// Segment list for the device mmap registry: every block twice, so the
    /// window is linear for any range of at most `size` bytes.
    pub fn mmap_segments(&self) -> Vec<MmapSegment> {
        let mut segments = Vec::with_capacity(self.blocks.len() * 2);
        for _ in 0..2 {
            for block in &self.blocks {
                segments.push(MmapSegment {
                    phys: block.phys,
                    len: block.size,
                });
            }
        }
        segments
    }

    /// Copy `src` into the ring at logical `offset`, wrapping at `size`.
    /// `src.len()` must not exceed the ring size.
    pub fn copy_in(&self, offset: u64, src: &[u8]) {
        debug_assert!(src.len() as u64 <= self.size);
        let mut offset = offset & (self.size - 1);
        let mut src = src;
        while !src.is_empty() {
            let block = &self.blocks[(offset / self.block_size) as usize];
            let within = offset % self.block_size;
            let chunk = src.len().min((self.block_size - within) as usize);
            // SAFETY: `within + chunk <= block.size`; the block is owned by
            // this ring and the caller serialises data-path access.
            unsafe {
                ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    block.as_mut_ptr().add(within as usize),
                    chunk,
                );
            }
            src = &src[chunk..];
            offset = (offset + chunk as u64) & (self.size - 1);
        }
    }

    /// Copy out of the ring at logical `offset` into `dst`, wrapping at
    /// `size`. `dst.len()` must not exceed the ring size.
    pub fn copy_out(&self, offset: u64, dst: &mut [u8]) {
        debug_assert!(dst.len() as u64 <= self.size);
        let mut offset = offset & (self.size - 1);
        let mut pos = 0;
        while pos < dst.len() {
            let block = &self.blocks[(offset / self.block_size) as usize];
            let within = offset % self.block_size;
            let chunk = (dst.len() - pos).min((self.block_size - within) as usize);
            // SAFETY: in-bounds read of a live DMA block; the caller has
            // observed the producer barrier for this range.
            unsafe {
                ptr::copy_nonoverlapping(
                    block.as_ptr().add(within as usize),
                    dst[pos..].as_mut_ptr(),
                    chunk,
                );
            }
            pos += chunk;
            offset = (offset + chunk as u64) & (self.size - 1);
        }
    }
}
