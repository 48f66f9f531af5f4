//! Medusa (v2) DMA controller: host-side descriptor, header and offset
//! rings with a hardware-written update buffer.
//!
//! RX runs in one of three modes selected before start:
//!
//! - `PacketSimple` — descriptors and headers are 1:1, the ring is
//!   pre-partitioned into fixed `buffer_size` buffers and refilled in
//!   64-descriptor bursts.
//! - `Stream` — offsets are derived from rolling `frame_len` sums; present
//!   for pointer bookkeeping only, current firmware does not select it.
//! - `User` — userspace supplies offsets and headers; the driver converts
//!   them to descriptors lazily, rate-limiting pointer flushes to burst
//!   multiples unless the aging counter forces a short flush.

use alloc::string::String;

use nfb_abi::PAGE_SIZE;
use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::{
    CHANNEL_FLAG_USE_HEADER, CHANNEL_FLAG_USE_OFFSET, CHANNEL_FLAG_USERSPACE, ChannelDirection,
};
use nfb_lib::alignment::ispow2_u64;
use nfb_lib::clock::busy_wait_us;
use nfb_lib::{klog_error, klog_warn};
use nfb_mm::dma::{DmaRegion, dma_alloc_coherent, dma_free_coherent};

use crate::comp::Comp;
use crate::config;
use crate::device::{MmapSegment, NfbDevice};
use crate::ndp::binding::QueueBinding;
use crate::ndp::channel::{AttachCtx, ChannelCounters, DmaController};
use crate::ndp::ctrl::{
    CtrlGeneration, DmaRing, NEXT_SDP_AGE_MAX, NdpCtrl, NdpDesc, NdpHdr, RX_DESC_BURST,
    StartParams, UPDATE_BUFFER_SIZE, desc_upper_addr, start_with_recovery,
};
use crate::ndp::ring::NdpRing;
use crate::ndp::{CancelToken, dma_rmb, dma_wmb};

const DESC_SIZE: u64 = 8;
const HDR_SIZE: u64 = 4;
const OFFSET_SIZE: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum V2Mode {
    PacketSimple,
    Stream,
    User,
}

/// Ring-lifetime buffers; present between attach_ring and detach_ring.
struct V2Bufs {
    desc: DmaRing<NdpDesc>,
    offs: DmaRing<u64>,
    hdrs: DmaRing<NdpHdr>,
    update: DmaRegion,
    hdr_mmap_offset: u64,
    off_mmap_offset: u64,
}

pub(crate) struct V2Common {
    regs: NdpCtrl,
    name: String,
    mode: V2Mode,
    /// Pushed header pointer: user entries already converted to
    /// descriptors (USER mode).
    php: u32,
    free_desc: u32,
    mps_last_offset: u64,
    next_sdp: u32,
    next_sdp_age: u8,
    buffer_size: u32,
    bufs: Option<V2Bufs>,
    flags: u32,
    dirty: bool,
}

impl V2Common {
    fn new(comp: Comp, direction: ChannelDirection, name: String) -> Self {
        Self {
            regs: NdpCtrl::new(comp, CtrlGeneration::Medusa, direction),
            name,
            mode: V2Mode::PacketSimple,
            php: 0,
            free_desc: 0,
            mps_last_offset: 0,
            next_sdp: 0,
            next_sdp_age: 0,
            buffer_size: 0,
            bufs: None,
            flags: 0,
            dirty: false,
        }
    }

    pub(crate) fn select_mode(&mut self, mode: V2Mode) {
        self.mode = mode;
    }

    pub(crate) fn regs(&self) -> &NdpCtrl {
        &self.regs
    }

    pub(crate) fn desc_ring(&self) -> Option<&DmaRing<NdpDesc>> {
        self.bufs.as_ref().map(|b| &b.desc)
    }

    pub(crate) fn hdr_ring(&self) -> Option<&DmaRing<NdpHdr>> {
        self.bufs.as_ref().map(|b| &b.hdrs)
    }

    pub(crate) fn off_ring(&self) -> Option<&DmaRing<u64>> {
        self.bufs.as_ref().map(|b| &b.offs)
    }

    pub(crate) fn free_desc(&self) -> u32 {
        self.free_desc
    }

    pub(crate) fn update_virt(&self) -> Option<nfb_abi::VirtAddr> {
        self.bufs.as_ref().map(|b| b.update.virt)
    }

    // -- ring attachment ----------------------------------------------------

    fn attach_ring(&mut self, ctx: &AttachCtx<'_>, ring: &NdpRing) -> DriverResult<u64> {
        if ring.is_empty() {
            return Err(DriverError::InvalidArgument);
        }

        let buffer_size = config::params().ndp_ctrl_buffer_size;
        if buffer_size == 0 || !ispow2_u64(buffer_size as u64) {
            klog_error!(
                "ndp: queue {}: ndp_ctrl_buffer_size value must be power of two, but is {}",
                self.name,
                buffer_size
            );
            return Err(DriverError::InvalidArgument);
        }
        self.buffer_size = buffer_size;

        let desc_count = (ring.size() / buffer_size as u64) as u32;
        let min_buffer_items = (PAGE_SIZE / HDR_SIZE.min(DESC_SIZE)) as u32;
        if desc_count < min_buffer_items {
            klog_error!(
                "ndp: queue {}: descriptor buffer must be at least {} items, but is {}",
                self.name,
                min_buffer_items,
                desc_count
            );
            return Err(DriverError::InvalidArgument);
        }
        let hdr_count = desc_count;

        let update = dma_alloc_coherent(UPDATE_BUFFER_SIZE)?;

        let desc_region = match dma_alloc_coherent(desc_count as u64 * DESC_SIZE) {
            Ok(region) => region,
            Err(err) => {
                dma_free_coherent(update);
                return Err(err);
            }
        };
        let off_region = match dma_alloc_coherent(hdr_count as u64 * OFFSET_SIZE) {
            Ok(region) => region,
            Err(err) => {
                dma_free_coherent(desc_region);
                dma_free_coherent(update);
                return Err(err);
            }
        };
        let hdr_region = match dma_alloc_coherent(hdr_count as u64 * HDR_SIZE) {
            Ok(region) => region,
            Err(err) => {
                dma_free_coherent(off_region);
                dma_free_coherent(desc_region);
                dma_free_coherent(update);
                return Err(err);
            }
        };

        // RX maps are read-only; TX consumers write offsets and headers.
        let writable = self.regs.direction() == ChannelDirection::Tx;

        let off_window = off_region.size * 2;
        let off_mmap_offset = match ctx.device.register_mmap(
            off_window,
            writable,
            alloc::vec![
                MmapSegment { phys: off_region.phys, len: off_region.size },
                MmapSegment { phys: off_region.phys, len: off_region.size },
            ],
        ) {
            Ok(offset) => offset,
            Err(err) => {
                dma_free_coherent(hdr_region);
                dma_free_coherent(off_region);
                dma_free_coherent(desc_region);
                dma_free_coherent(update);
                return Err(err);
            }
        };

        let hdr_window = hdr_region.size * 2;
        let hdr_mmap_offset = match ctx.device.register_mmap(
            hdr_window,
            writable,
            alloc::vec![
                MmapSegment { phys: hdr_region.phys, len: hdr_region.size },
                MmapSegment { phys: hdr_region.phys, len: hdr_region.size },
            ],
        ) {
            Ok(offset) => offset,
            Err(err) => {
                ctx.device.unregister_mmap(off_mmap_offset);
                dma_free_coherent(hdr_region);
                dma_free_coherent(off_region);
                dma_free_coherent(desc_region);
                dma_free_coherent(update);
                return Err(err);
            }
        };

        {
            let path = ctx.queue_fdt_path(self.regs.direction());
            let mut fdt = ctx.device.fdt().write();
            if let Ok(node) = fdt.path_offset(&path) {
                let _ = fdt.setprop_u32(node, "protocol", 2);
                let _ = fdt.setprop_u64(node, "hdr_mmap_base", hdr_mmap_offset);
                let _ = fdt.setprop_u64(node, "hdr_mmap_size", hdr_window);
                let _ = fdt.setprop_u64(node, "off_mmap_base", off_mmap_offset);
                let _ = fdt.setprop_u64(node, "off_mmap_size", off_window);
                let _ = fdt.setprop_u32(node, "buffer_size", buffer_size);
            }
        }

        self.bufs = Some(V2Bufs {
            desc: DmaRing::new(desc_region, desc_count),
            offs: DmaRing::new(off_region, hdr_count),
            hdrs: DmaRing::new(hdr_region, hdr_count),
            update,
            hdr_mmap_offset,
            off_mmap_offset,
        });

        Ok((hdr_count - 1) as u64)
    }

    fn detach_ring(&mut self, device: &NfbDevice) {
        if let Some(bufs) = self.bufs.take() {
            device.unregister_mmap(bufs.hdr_mmap_offset);
            device.unregister_mmap(bufs.off_mmap_offset);
            dma_free_coherent(bufs.hdrs.into_region());
            dma_free_coherent(bufs.offs.into_region());
            dma_free_coherent(bufs.desc.into_region());
            dma_free_coherent(bufs.update);
        }
    }

    // -- start --------------------------------------------------------------

    fn start(&mut self, ring: &NdpRing) -> DriverResult<u64> {
        let bufs = self.bufs.as_ref().ok_or(DriverError::NotReady)?;

        let sp = StartParams {
            desc_buffer: bufs.desc.phys().as_u64(),
            hdr_buffer: bufs.hdrs.phys().as_u64(),
            update_buffer: bufs.update.phys.as_u64(),
            update_buffer_virt: Some(bufs.update.virt),
            nb_desc: bufs.desc.count(),
            nb_hdr: bufs.hdrs.count(),
            ..StartParams::default()
        };

        start_with_recovery(&mut self.regs, &sp, &self.name)?;
        self.dirty = false;

        self.mps_last_offset = 0;
        self.next_sdp = 0;
        self.next_sdp_age = 0;

        match self.mode {
            V2Mode::PacketSimple => {
                // Constant packet offsets in this mode.
                let bufs = self.bufs.as_ref().ok_or(DriverError::NotReady)?;
                for i in 0..bufs.desc.count() {
                    bufs.offs.set(i, i as u64 * self.buffer_size as u64);
                }
            }
            V2Mode::User => {
                if self.regs.direction() == ChannelDirection::Rx {
                    self.free_desc = self.regs.mhp;
                    self.php = 0;
                }
            }
            V2Mode::Stream => {}
        }

        match self.regs.direction() {
            ChannelDirection::Rx => {
                if self.mode == V2Mode::PacketSimple {
                    let prefill = self.regs.mdp + 1 - RX_DESC_BURST;
                    self.mps_fill_rx_descs(ring, prefill);
                    self.regs.sdp_flush();
                    self.free_desc = 0;
                }
            }
            ChannelDirection::Tx => {
                self.free_desc = self.regs.mdp;
            }
        }

        Ok(0)
    }

    // -- RX refill ----------------------------------------------------------

    /// Emit `count` data descriptors carving fixed-size buffers out of the
    /// ring, inserting a type-0 descriptor whenever the upper address
    /// changes. Returns the number of descriptor slots consumed.
    fn mps_fill_rx_descs(&mut self, ring: &NdpRing, count: u32) -> u32 {
        let Some(bufs) = self.bufs.as_ref() else {
            return 0;
        };
        let mut sdp = self.regs.sdp;
        let mut emitted = 0u32;

        for _ in 0..count {
            let addr = ring.phys_of(self.mps_last_offset).as_u64();
            if desc_upper_addr(addr) != self.regs.last_upper_addr {
                self.regs.last_upper_addr = desc_upper_addr(addr);
                bufs.desc.set(sdp, NdpDesc::rx_desc0(addr));
                sdp = sdp.wrapping_add(1);
                emitted += 1;
            }
            bufs.desc
                .set(sdp, NdpDesc::rx_desc2(addr, self.buffer_size as u16, false));
            sdp = sdp.wrapping_add(1);
            emitted += 1;

            self.mps_last_offset += self.buffer_size as u64;
            if self.mps_last_offset >= ring.size() {
                self.mps_last_offset = 0;
            }
        }

        self.regs.sdp = sdp & self.regs.mdp;
        emitted
    }

    /// Convert userspace-provided offset/header entries into descriptors
    /// (USER mode). Flushes SDP in burst multiples, or short after
    /// `NEXT_SDP_AGE_MAX` cycles without a full burst of movement.
    fn user_fill_rx_descs(&mut self) {
        let Some(bufs) = self.bufs.as_ref() else {
            return;
        };
        let mhp = self.regs.mhp;
        let mdp = self.regs.mdp;
        let sdp = self.regs.sdp;

        let count = self.regs.shp.wrapping_sub(self.php) & mhp;
        self.free_desc = self.regs.hdp.wrapping_sub(self.next_sdp).wrapping_sub(1) & mhp;

        let mut processed = 0u32;
        let mut emitted = 0u32;
        for i in 0..count {
            let addr = bufs.offs.get(self.php.wrapping_add(i));

            if desc_upper_addr(addr) != self.regs.last_upper_addr {
                if self.free_desc == 0 {
                    break;
                }
                self.regs.last_upper_addr = desc_upper_addr(addr);
                bufs.desc
                    .set(self.next_sdp.wrapping_add(emitted), NdpDesc::rx_desc0(addr));
                self.free_desc -= 1;
                emitted += 1;
            }

            if self.free_desc == 0 {
                break;
            }

            let frame_len = bufs.hdrs.get(self.php.wrapping_add(i)).frame_len();
            bufs.desc.set(
                self.next_sdp.wrapping_add(emitted),
                NdpDesc::rx_desc2(addr, frame_len, false),
            );
            self.free_desc -= 1;
            emitted += 1;
            processed += 1;
        }

        if processed == 0 {
            // No-progress cycle with descriptors still waiting to be
            // published: age the pending shift and eventually flush short
            // of a burst to avoid deadlock.
            let sdp_shift = self.next_sdp.wrapping_sub(sdp) & mdp;
            if sdp_shift != 0 {
                self.next_sdp_age += 1;
                if self.next_sdp_age >= NEXT_SDP_AGE_MAX {
                    self.regs.sdp = sdp.wrapping_add(sdp_shift) & mdp;
                    self.regs.sp_flush();
                    self.next_sdp_age = 0;
                }
            }
            return;
        }
        self.next_sdp_age = 0;

        dma_wmb();

        self.next_sdp = self.next_sdp.wrapping_add(emitted) & mdp;
        self.php = self.php.wrapping_add(processed) & mhp;

        let sdp_shift = self.next_sdp.wrapping_sub(sdp) & mdp;
        let sdp_shift = (sdp_shift / RX_DESC_BURST) * RX_DESC_BURST;
        if sdp_shift != 0 {
            self.regs.sdp = sdp.wrapping_add(sdp_shift) & mdp;
            self.regs.sp_flush();
        }
    }

    // -- RX pointer ops -----------------------------------------------------

    fn rx_set_swptr(&mut self, ring: &NdpRing, ptr: u64) {
        match self.mode {
            V2Mode::PacketSimple => {
                let shp = self.regs.shp;
                let count = (ptr as u32).wrapping_sub(shp) & self.regs.mhp;

                let mut released = 0u32;
                if let Some(bufs) = self.bufs.as_ref() {
                    for i in 0..count {
                        // Expecting only 1 or 2 released descriptors per
                        // header.
                        released += bufs.hdrs.get(shp.wrapping_add(i)).free_desc() as u32;
                    }
                }
                self.free_desc += released;
                self.regs.shp = ptr as u32;

                let mut flushed = false;
                while self.free_desc >= RX_DESC_BURST {
                    let consumed = self.mps_fill_rx_descs(ring, RX_DESC_BURST);
                    self.free_desc = self.free_desc.saturating_sub(consumed);
                    flushed = true;
                }
                if flushed {
                    self.regs.sp_flush();
                }
            }
            V2Mode::Stream => {
                // Offsets roll forward in get_hwptr; nothing to refill.
                self.regs.shp = ptr as u32;
            }
            V2Mode::User => {
                self.regs.shp = ptr as u32;
                self.regs.hdp_update();
                self.user_fill_rx_descs();
            }
        }
    }

    fn rx_get_hwptr(&mut self, ring: &NdpRing) -> u64 {
        let hhp = self.regs.hhp;
        self.regs.hhp_update();
        let hhp_new = self.regs.hhp;
        let count = hhp_new.wrapping_sub(hhp) & self.regs.mhp;

        match self.mode {
            V2Mode::PacketSimple => {
                // Constant packet offsets in this mode.
            }
            V2Mode::Stream => {
                if let Some(bufs) = self.bufs.as_ref() {
                    let mut offset = bufs.offs.get(hhp);
                    for i in 0..count {
                        let hdr = bufs.hdrs.get(hhp.wrapping_add(i));
                        offset += hdr.frame_len() as u64;
                        bufs.offs.set(hhp.wrapping_add(i + 1), offset);
                    }
                    // Keep the rolling sum within the ring's byte space.
                    bufs.offs
                        .set(hhp.wrapping_add(count), offset & (ring.size() - 1));
                }
            }
            V2Mode::User => {
                if count != 0 && self.php != self.regs.shp {
                    self.regs.hdp_update();
                    self.user_fill_rx_descs();
                }
            }
        }
        hhp_new as u64
    }

    // -- TX pointer ops -----------------------------------------------------

    /// Reclaim completed descriptors; every completed type-2 descriptor
    /// consumes one header.
    fn tx_get_hwptr(&mut self) -> u64 {
        dma_rmb();
        let hdp = self.regs.hdp;
        self.regs.hdp_update();
        let count = self.regs.hdp.wrapping_sub(hdp) & self.regs.mdp;
        self.free_desc += count;

        let mut free_hdrs = 0u32;
        if let Some(bufs) = self.bufs.as_ref() {
            for i in 0..count {
                if bufs.desc.get(hdp.wrapping_add(i)).is_data() {
                    free_hdrs += 1;
                }
            }
        }
        self.regs.hhp = self.regs.hhp.wrapping_add(free_hdrs) & self.regs.mhp;
        self.regs.hhp as u64
    }

    /// Wait for the hardware to release at least one descriptor slot,
    /// reclaiming as we go. False when the wait was cancelled.
    fn tx_wait_free_desc(&mut self, cancel: &CancelToken) -> bool {
        while self.free_desc == 0 {
            busy_wait_us(10);
            self.tx_get_hwptr();
            if cancel.is_cancelled() {
                return false;
            }
        }
        true
    }

    fn tx_entry(&self, index: u32) -> Option<(u64, NdpHdr)> {
        let bufs = self.bufs.as_ref()?;
        Some((bufs.offs.get(index), bufs.hdrs.get(index)))
    }

    fn desc_write(&self, index: u32, desc: NdpDesc) {
        if let Some(bufs) = self.bufs.as_ref() {
            bufs.desc.set(index, desc);
        }
    }

    fn tx_set_swptr(&mut self, ring: &NdpRing, ptr: u64, cancel: &CancelToken) {
        if self.bufs.is_none() {
            return;
        }
        dma_wmb();

        let shp = self.regs.shp;
        let count = (ptr as u32).wrapping_sub(shp) & self.regs.mhp;
        let mut sdp = self.regs.sdp;
        let mut dirty = false;

        for i in 0..count {
            let Some((off_entry, hdr)) = self.tx_entry(shp.wrapping_add(i)) else {
                break;
            };

            let addr = if self.mode == V2Mode::User {
                off_entry
            } else {
                ring.phys_of(off_entry).as_u64()
            };

            if desc_upper_addr(addr) != self.regs.last_upper_addr {
                self.regs.sdp = sdp & self.regs.mdp;
                if !self.tx_wait_free_desc(cancel) {
                    dirty = true;
                    break;
                }
                sdp = self.regs.sdp;
                self.regs.last_upper_addr = desc_upper_addr(addr);
                self.desc_write(sdp, NdpDesc::tx_desc0(addr));
                sdp = sdp.wrapping_add(1);
                self.free_desc -= 1;
            }

            self.regs.sdp = sdp & self.regs.mdp;
            if !self.tx_wait_free_desc(cancel) {
                dirty = true;
                break;
            }
            sdp = self.regs.sdp;

            self.desc_write(
                sdp,
                NdpDesc::tx_desc2(addr, hdr.frame_len(), hdr.meta() as u16, false),
            );
            sdp = sdp.wrapping_add(1);
            self.free_desc -= 1;
        }

        if dirty {
            self.dirty = true;
            klog_warn!(
                "ndp: queue {} failed to shift SDP due to HDP being stuck. Transfers aborted by user, queue might be in dirty state",
                self.name
            );
        }

        dma_wmb();
        self.regs.sdp = sdp & self.regs.mdp;
        self.regs.shp = ptr as u32;
        self.regs.sdp_flush();
    }

    // -- flags and counters -------------------------------------------------

    fn get_flags(&self) -> u32 {
        CHANNEL_FLAG_USE_HEADER | CHANNEL_FLAG_USE_OFFSET | self.flags
    }

    fn set_flags(&mut self, _flags: u32) -> u32 {
        // Medusa has no negotiable controller flags; the header and offset
        // rings are always advertised.
        self.get_flags()
    }

    fn counters(&self) -> ChannelCounters {
        ChannelCounters {
            processed: self.regs.cntr_processed(),
            discarded: self.regs.cntr_discarded(),
        }
    }
}

pub(crate) struct CtrlV2Rx(V2Common);

pub(crate) struct CtrlV2Tx(V2Common);

impl CtrlV2Rx {
    pub(crate) fn new(comp: Comp, _binding: &QueueBinding, name: String) -> Self {
        Self(V2Common::new(comp, ChannelDirection::Rx, name))
    }

    pub(crate) fn common_mut(&mut self) -> &mut V2Common {
        &mut self.0
    }
}

impl CtrlV2Tx {
    pub(crate) fn new(comp: Comp, _binding: &QueueBinding, name: String) -> Self {
        Self(V2Common::new(comp, ChannelDirection::Tx, name))
    }

    pub(crate) fn common_mut(&mut self) -> &mut V2Common {
        &mut self.0
    }
}

impl DmaController for CtrlV2Rx {
    fn attach_ring(&mut self, ctx: &AttachCtx<'_>, ring: &NdpRing) -> DriverResult<u64> {
        self.0.attach_ring(ctx, ring)
    }

    fn detach_ring(&mut self, device: &NfbDevice) {
        self.0.detach_ring(device)
    }

    fn start(&mut self, ring: &NdpRing) -> DriverResult<u64> {
        self.0.start(ring)
    }

    fn stop_attempt(&mut self) -> DriverResult<()> {
        self.0.regs.stop(false)
    }

    fn stop_force(&mut self) {
        let _ = self.0.regs.stop_force();
    }

    fn on_stopped(&mut self) {
        self.0.clear_userspace();
    }

    fn get_hwptr(&mut self, ring: &NdpRing) -> u64 {
        self.0.rx_get_hwptr(ring)
    }

    fn set_swptr(&mut self, ring: &NdpRing, ptr: u64, _cancel: &CancelToken) {
        self.0.rx_set_swptr(ring, ptr)
    }

    fn get_flags(&self) -> u32 {
        self.0.get_flags()
    }

    fn set_flags(&mut self, flags: u32) -> u32 {
        self.0.set_flags(flags)
    }

    fn counters(&self) -> ChannelCounters {
        self.0.counters()
    }
}

impl DmaController for CtrlV2Tx {
    fn attach_ring(&mut self, ctx: &AttachCtx<'_>, ring: &NdpRing) -> DriverResult<u64> {
        self.0.attach_ring(ctx, ring)
    }

    fn detach_ring(&mut self, device: &NfbDevice) {
        self.0.detach_ring(device)
    }

    fn start(&mut self, ring: &NdpRing) -> DriverResult<u64> {
        self.0.start(ring)
    }

    fn stop_attempt(&mut self) -> DriverResult<()> {
        self.0.regs.stop(false)
    }

    fn stop_force(&mut self) {
        let _ = self.0.regs.stop_force();
    }

    fn on_stopped(&mut self) {
        self.0.clear_userspace();
    }

    fn get_hwptr(&mut self, _ring: &NdpRing) -> u64 {
        self.0.tx_get_hwptr()
    }

    fn set_swptr(&mut self, ring: &NdpRing, ptr: u64, cancel: &CancelToken) {
        self.0.tx_set_swptr(ring, ptr, cancel)
    }

    fn get_flags(&self) -> u32 {
        self.0.get_flags()
    }

    fn set_flags(&mut self, flags: u32) -> u32 {
        self.0.set_flags(flags)
    }

    fn counters(&self) -> ChannelCounters {
        self.0.counters()
    }
}

// USERSPACE never sticks on Medusa, but clearing it is part of the common
// stop contract.
impl V2Common {
    fn clear_userspace(&mut self) {
        self.flags &= !CHANNEL_FLAG_USERSPACE;
    }
}

impl CtrlV2Rx {
    #[allow(dead_code)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.0.dirty
    }
}

impl CtrlV2Tx {
    #[allow(dead_code)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.0.dirty
    }
}
