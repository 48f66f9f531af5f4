//! Buffer pools for the XDP adapter.
//!
//! [`PagePool`] is the driver-owned pool backing default operation: a DMA
//! region sliced into page frames with a lock-free freelist (Treiber stack
//! with a version-tagged head so concurrent alloc/release from poll and
//! completion contexts cannot ABA).
//!
//! [`XskPool`] models the AF_XDP user pool: a user-registered frame area
//! plus the fill, TX, RX and completion rings exchanged with the consumer.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};

use nfb_abi::{PAGE_SIZE, PhysAddr};
use nfb_abi::error::{DriverError, DriverResult};
use nfb_lib::IrqMutex;
use nfb_mm::dma::{DmaRegion, dma_alloc_coherent, dma_free_coherent};

/// Headroom reserved at the front of every page-pool frame.
pub const XDP_PACKET_HEADROOM: u32 = 256;

/// Usable payload bytes in one page-pool frame.
pub const PP_MAX_FRAME_LEN: u32 = PAGE_SIZE as u32 - XDP_PACKET_HEADROOM;

/// Sentinel: end of freelist.
const FREELIST_EMPTY: u16 = u16::MAX;

struct PagePoolInner {
    region: DmaRegion,
    count: u32,
    /// Tagged head pointer: `(version << 16) | index`.
    head: AtomicU32,
    /// Per-slot next-free pointer, forming the intrusive freelist.
    next: Vec<AtomicU16>,
    available: AtomicUsize,
}

impl Drop for PagePoolInner {
    fn drop(&mut self) {
        // Both queues are gone once the last handle drops; the frames are
        // no longer posted anywhere.
        dma_free_coherent(self.region);
    }
}

/// Driver-owned DMA frame pool, shared by a channel's RX and TX queues.
#[derive(Clone)]
pub struct PagePool(Arc<PagePoolInner>);

impl PagePool {
    /// Allocate a pool of `count` page frames (count < 65535).
    pub fn alloc(count: u32) -> DriverResult<PagePool> {
        if count == 0 || count >= FREELIST_EMPTY as u32 {
            return Err(DriverError::InvalidArgument);
        }
        let region = dma_alloc_coherent(count as u64 * PAGE_SIZE)?;

        let mut next = Vec::with_capacity(count as usize);
        for i in 0..count {
            let succ = if i + 1 < count {
                (i + 1) as u16
            } else {
                FREELIST_EMPTY
            };
            next.push(AtomicU16::new(succ));
        }

        Ok(PagePool(Arc::new(PagePoolInner {
            region,
            count,
            head: AtomicU32::new(0),
            next,
            available: AtomicUsize::new(count as usize),
        })))
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.0.count
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.0.available.load(Ordering::Relaxed)
    }

    /// Pop a frame slot. O(1), safe from any context.
    pub fn alloc_slot(&self) -> Option<u16> {
        let inner = &self.0;
        loop {
            let old = inner.head.load(Ordering::Acquire);
            let idx = (old & 0xFFFF) as u16;
            if idx == FREELIST_EMPTY {
                return None;
            }
            let ver = old >> 16;
            let next = inner.next[idx as usize].load(Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | next as u32;
            if inner
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                inner.available.fetch_sub(1, Ordering::Relaxed);
                return Some(idx);
            }
            core::hint::spin_loop();
        }
    }

    /// Push a frame slot back.
    pub fn release_slot(&self, slot: u16) {
        let inner = &self.0;
        debug_assert!((slot as u32) < inner.count);
        loop {
            let old = inner.head.load(Ordering::Acquire);
            let old_idx = (old & 0xFFFF) as u16;
            let ver = old >> 16;
            inner.next[slot as usize].store(old_idx, Ordering::Relaxed);
            let new = (ver.wrapping_add(1) << 16) | slot as u32;
            if inner
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                inner.available.fetch_add(1, Ordering::Relaxed);
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// DMA address of the payload area of `slot` (past the headroom).
    #[inline]
    pub fn dma_of(&self, slot: u16) -> PhysAddr {
        self.0
            .region
            .phys
            .add(slot as u64 * PAGE_SIZE + XDP_PACKET_HEADROOM as u64)
    }

    /// Payload pointer of `slot`, valid for [`PP_MAX_FRAME_LEN`] bytes.
    #[inline]
    pub fn frame_ptr(&self, slot: u16) -> *mut u8 {
        // SAFETY: in-bounds offset of a live region.
        unsafe {
            self.0
                .region
                .as_mut_ptr()
                .add(slot as usize * PAGE_SIZE as usize + XDP_PACKET_HEADROOM as usize)
        }
    }
}

// ---------------------------------------------------------------------------
// AF_XDP pool
// ---------------------------------------------------------------------------

/// One user TX descriptor: frame offset and length within the pool area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XskDesc {
    pub addr: u64,
    pub len: u32,
}

struct XskInner {
    region: DmaRegion,
    frame_size: u32,
    /// User → driver: frames available for RX.
    fill: IrqMutex<VecDeque<u64>>,
    /// Driver → user: received frames.
    rx: IrqMutex<VecDeque<XskDesc>>,
    /// User → driver: frames to transmit.
    tx: IrqMutex<VecDeque<XskDesc>>,
    /// Driver → user: transmitted frame addresses, submission order.
    completion: IrqMutex<VecDeque<u64>>,
}

/// User-provided frame pool with its four exchange rings.
#[derive(Clone)]
pub struct XskPool(Arc<XskInner>);

impl XskPool {
    /// `region` is the DMA-mapped user frame area, carved into
    /// `frame_size`-byte frames addressed by byte offset.
    pub fn new(region: DmaRegion, frame_size: u32) -> DriverResult<XskPool> {
        if frame_size == 0 || region.size < frame_size as u64 {
            return Err(DriverError::InvalidArgument);
        }
        Ok(XskPool(Arc::new(XskInner {
            region,
            frame_size,
            fill: IrqMutex::new(VecDeque::new()),
            rx: IrqMutex::new(VecDeque::new()),
            tx: IrqMutex::new(VecDeque::new()),
            completion: IrqMutex::new(VecDeque::new()),
        })))
    }

    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.0.frame_size
    }

    #[inline]
    pub fn phys_of(&self, addr: u64) -> PhysAddr {
        self.0.region.phys.add(addr)
    }

    /// Payload pointer of the frame at byte offset `addr`.
    #[inline]
    pub fn frame_ptr(&self, addr: u64) -> *mut u8 {
        // SAFETY: callers only pass addresses handed out through the rings,
        // which stay inside the registered area.
        unsafe { self.0.region.as_mut_ptr().add(addr as usize) }
    }

    #[inline]
    pub fn contains(&self, addr: u64, len: u32) -> bool {
        addr + len as u64 <= self.0.region.size
    }

    // -- user side ----------------------------------------------------------

    pub fn fill_enqueue(&self, addr: u64) {
        self.0.fill.lock().push_back(addr);
    }

    pub fn tx_enqueue(&self, desc: XskDesc) {
        self.0.tx.lock().push_back(desc);
    }

    pub fn rx_dequeue(&self) -> Option<XskDesc> {
        self.0.rx.lock().pop_front()
    }

    pub fn completion_dequeue(&self) -> Option<u64> {
        self.0.completion.lock().pop_front()
    }

    // -- driver side --------------------------------------------------------

    pub(crate) fn fill_dequeue(&self) -> Option<u64> {
        self.0.fill.lock().pop_front()
    }

    pub(crate) fn rx_push(&self, desc: XskDesc) {
        self.0.rx.lock().push_back(desc);
    }

    /// Peek up to `max` user TX descriptors, like the batched peek/release
    /// helpers of a kernel XSK pool.
    pub(crate) fn tx_peek_batch(&self, out: &mut Vec<XskDesc>, max: usize) -> usize {
        let mut tx = self.0.tx.lock();
        let take = tx.len().min(max);
        for _ in 0..take {
            if let Some(desc) = tx.pop_front() {
                out.push(desc);
            }
        }
        take
    }

    pub(crate) fn completion_push(&self, addr: u64) {
        self.0.completion.lock().push_back(addr);
    }
}
