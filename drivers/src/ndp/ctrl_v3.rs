//! Calypte (v3) DMA controller: no host-side descriptor or offset ring;
//! pointers are read directly from registers.
//!
//! RX delivers into fixed 128-byte slots of a single-block ring; frame
//! arrival is signalled by the `valid` bit of the header entry rather than
//! a pointer register. TX pushes bytes into on-card buffers whose geometry
//! the firmware publishes in the FDT; lengths are accounted in 32-byte
//! blocks against `free_bytes`.

use alloc::string::String;

use nfb_abi::PAGE_SIZE;
use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::{CHANNEL_FLAG_USERSPACE, ChannelDirection};
use nfb_mm::dma::{dma_alloc_coherent, dma_free_coherent};

use crate::comp::Comp;
use crate::device::{MmapSegment, NfbDevice};
use crate::ndp::binding::QueueBinding;
use crate::ndp::channel::{AttachCtx, ChannelCounters, DmaController};
use crate::ndp::ctrl::{
    CalypteHdr, CtrlGeneration, DmaRing, NdpCtrl, RX_CALYPTE_BLOCK_SIZE, StartParams,
    TX_CALYPTE_BLOCK_SIZE, start_with_recovery,
};
use crate::ndp::ring::NdpRing;
use crate::ndp::{CancelToken, dma_wmb};

const CALYPTE_HDR_SIZE: u64 = 8;

struct V3Bufs {
    hdrs: DmaRing<CalypteHdr>,
    hdr_mmap_offset: u64,
}

pub(crate) struct V3Common {
    regs: NdpCtrl,
    name: String,
    hdr_count: u32,
    /// TX byte-granular free space in the on-card data buffer.
    free_bytes: u64,
    /// TX on-card buffer geometry from the firmware FDT.
    data_buff_size: u32,
    hdr_buff_size: u32,
    bufs: Option<V3Bufs>,
    flags: u32,
}

impl V3Common {
    pub(crate) fn regs(&self) -> &NdpCtrl {
        &self.regs
    }

    pub(crate) fn hdr_ring(&self) -> Option<&DmaRing<CalypteHdr>> {
        self.bufs.as_ref().map(|b| &b.hdrs)
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    fn new(comp: Comp, direction: ChannelDirection, binding: &QueueBinding, name: String) -> Self {
        Self {
            regs: NdpCtrl::new(comp, CtrlGeneration::Calypte, direction),
            name,
            hdr_count: 0,
            free_bytes: 0,
            data_buff_size: binding.tx_data_buff_size.unwrap_or(0),
            hdr_buff_size: binding.tx_hdr_buff_size.unwrap_or(0),
            bufs: None,
            flags: 0,
        }
    }

    // -- ring attachment ----------------------------------------------------

    fn rx_attach_ring(&mut self, ctx: &AttachCtx<'_>, ring: &NdpRing) -> DriverResult<u64> {
        if ring.is_empty() {
            return Err(DriverError::InvalidArgument);
        }
        if ring.block_count() != 1 {
            return Err(DriverError::InvalidArgument);
        }

        let hdr_count = (ring.size() / RX_CALYPTE_BLOCK_SIZE as u64) as u32;
        let smaller = (RX_CALYPTE_BLOCK_SIZE as u64).min(CALYPTE_HDR_SIZE);
        if (hdr_count as u64) * smaller < PAGE_SIZE {
            // Too small for a page-granular double map of the header ring.
            return Err(DriverError::InvalidArgument);
        }
        self.hdr_count = hdr_count;

        let hdr_region = dma_alloc_coherent(hdr_count as u64 * CALYPTE_HDR_SIZE)?;

        // Calypte RX headers are read-write for userspace: the consumer
        // clears `valid` by overwrite.
        let hdr_window = hdr_region.size * 2;
        let hdr_mmap_offset = match ctx.device.register_mmap(
            hdr_window,
            true,
            alloc::vec![
                MmapSegment { phys: hdr_region.phys, len: hdr_region.size },
                MmapSegment { phys: hdr_region.phys, len: hdr_region.size },
            ],
        ) {
            Ok(offset) => offset,
            Err(err) => {
                dma_free_coherent(hdr_region);
                return Err(err);
            }
        };

        {
            let path = ctx.queue_fdt_path(ChannelDirection::Rx);
            let mut fdt = ctx.device.fdt().write();
            if let Ok(node) = fdt.path_offset(&path) {
                let _ = fdt.setprop_u32(node, "protocol", 3);
                let _ = fdt.setprop_u64(node, "hdr_mmap_base", hdr_mmap_offset);
                let _ = fdt.setprop_u64(node, "hdr_mmap_size", hdr_window);
            }
        }

        self.bufs = Some(V3Bufs {
            hdrs: DmaRing::new(hdr_region, hdr_count),
            hdr_mmap_offset,
        });

        Ok((hdr_count - 1) as u64)
    }

    fn tx_attach_ring(&mut self, ctx: &AttachCtx<'_>, _ring: &NdpRing) -> DriverResult<u64> {
        if self.data_buff_size == 0 || self.hdr_buff_size == 0 {
            return Err(DriverError::NotReady);
        }

        let hdr_region = dma_alloc_coherent(self.hdr_buff_size as u64)?;
        let hdr_count = (self.hdr_buff_size as u64 / CALYPTE_HDR_SIZE) as u32;

        let hdr_window = hdr_region.size * 2;
        let hdr_mmap_offset = match ctx.device.register_mmap(
            hdr_window,
            true,
            alloc::vec![
                MmapSegment { phys: hdr_region.phys, len: hdr_region.size },
                MmapSegment { phys: hdr_region.phys, len: hdr_region.size },
            ],
        ) {
            Ok(offset) => offset,
            Err(err) => {
                dma_free_coherent(hdr_region);
                return Err(err);
            }
        };

        // Masks derive from the on-card buffer geometry; the hardware
        // reports the same values in MDP/MHP at start.
        self.regs.mdp = (self.data_buff_size / 2).wrapping_sub(1) & 0x0000_FFFF;
        self.regs.mhp =
            ((self.hdr_buff_size / (2 * CALYPTE_HDR_SIZE as u32)).wrapping_sub(1)) & 0x0000_FFFF;
        self.hdr_count = hdr_count;

        {
            let path = ctx.queue_fdt_path(ChannelDirection::Tx);
            let mut fdt = ctx.device.fdt().write();
            if let Ok(node) = fdt.path_offset(&path) {
                let _ = fdt.setprop_u32(node, "protocol", 3);
                let _ = fdt.setprop_u32(node, "data_buff_size", self.data_buff_size);
                let _ = fdt.setprop_u32(node, "hdr_buff_size", self.hdr_buff_size);
                let _ = fdt.setprop_u64(node, "hdr_mmap_base", hdr_mmap_offset);
                let _ = fdt.setprop_u64(node, "hdr_mmap_size", hdr_window);
            }
        }

        self.bufs = Some(V3Bufs {
            hdrs: DmaRing::new(hdr_region, hdr_count),
            hdr_mmap_offset,
        });

        Ok(self.regs.mhp as u64)
    }

    fn detach_ring(&mut self, device: &NfbDevice) {
        if let Some(bufs) = self.bufs.take() {
            device.unregister_mmap(bufs.hdr_mmap_offset);
            dma_free_coherent(bufs.hdrs.into_region());
        }
    }

    // -- start --------------------------------------------------------------

    fn start(&mut self, ring: &NdpRing) -> DriverResult<u64> {
        let bufs = self.bufs.as_ref().ok_or(DriverError::NotReady)?;

        let data_buffer = if self.regs.direction() == ChannelDirection::Rx {
            // Single contiguous block; its base is the data buffer.
            ring.block(0).phys.as_u64()
        } else {
            0
        };

        let sp = StartParams {
            data_buffer,
            hdr_buffer: bufs.hdrs.phys().as_u64(),
            nb_data: self.hdr_count,
            nb_hdr: self.hdr_count,
            ..StartParams::default()
        };

        // The producer signals frames by setting `valid` in place; make
        // sure no stale bits survive a previous run.
        for i in 0..bufs.hdrs.count() {
            bufs.hdrs.set(i, CalypteHdr::default());
        }

        start_with_recovery(&mut self.regs, &sp, &self.name)?;

        self.free_bytes = self.regs.mdp as u64;
        Ok(0)
    }

    // -- RX pointer ops -----------------------------------------------------

    /// Frame readiness is detected by polling `valid`, not by a pointer
    /// register: scan forward from the last known header pointer.
    fn rx_get_hwptr(&mut self) -> u64 {
        let Some(bufs) = self.bufs.as_ref() else {
            return self.regs.hhp as u64;
        };
        let mask = bufs.hdrs.mask();
        let mut hwptr = self.regs.hhp;
        let mut scanned = 0u32;
        while scanned <= mask {
            if !bufs.hdrs.get(hwptr).valid() {
                break;
            }
            hwptr = hwptr.wrapping_add(1);
            scanned += 1;
        }
        self.regs.hhp = hwptr & mask;
        self.regs.hhp as u64
    }

    /// Each consumed frame releases as many 128-byte data slots as it
    /// occupied; consumed headers are cleared so the ring can wrap.
    fn rx_set_swptr(&mut self, ptr: u64) {
        let Some(bufs) = self.bufs.as_ref() else {
            return;
        };
        let shp = self.regs.shp;
        let count = (ptr as u32).wrapping_sub(shp) & self.regs.mhp;

        let mut new_sdp = 0u32;
        for i in 0..count {
            let index = shp.wrapping_add(i);
            let hdr = bufs.hdrs.get(index);
            new_sdp += (hdr.frame_len() as u32).div_ceil(RX_CALYPTE_BLOCK_SIZE);
            bufs.hdrs.set(index, hdr.cleared());
        }

        self.regs.shp = ptr as u32;
        self.regs.sdp = self.regs.sdp.wrapping_add(new_sdp) & self.regs.mdp;
        if count != 0 {
            self.regs.sp_flush();
        }
    }

    // -- TX pointer ops -----------------------------------------------------

    fn tx_get_hwptr(&mut self) -> u64 {
        let hdp = self.regs.hdp;
        self.regs.hp_update();
        let count = self.regs.hdp.wrapping_sub(hdp) & self.regs.mdp;
        self.free_bytes += count as u64;
        self.regs.hhp as u64
    }

    /// Frames are placed back-to-back in 32-byte blocks; both `free_bytes`
    /// and the data pointer advance by the rounded length.
    fn tx_set_swptr(&mut self, ptr: u64) {
        let Some(bufs) = self.bufs.as_ref() else {
            return;
        };
        dma_wmb();

        let shp = self.regs.shp;
        let count = (ptr as u32).wrapping_sub(shp) & self.regs.mhp;
        let mut sdp = self.regs.sdp;
        let block_mask = TX_CALYPTE_BLOCK_SIZE - 1;

        for i in 0..count {
            let frame_len = bufs.hdrs.get(shp.wrapping_add(i)).frame_len() as u32;
            let rounded = (frame_len + block_mask) & !block_mask;
            self.free_bytes = self.free_bytes.saturating_sub(rounded as u64);
            // Round the data pointer up to the next whole block.
            sdp = (sdp.wrapping_add(frame_len).wrapping_add(block_mask) & !block_mask)
                & self.regs.mdp;
        }

        dma_wmb();
        self.regs.sdp = sdp;
        self.regs.shp = ptr as u32;
        self.regs.sp_flush();
    }

    // -- stop ---------------------------------------------------------------

    /// Under USERSPACE the kernel does not know the final software
    /// pointers; adopt the hardware ones before stopping so the controller
    /// does not end up dirty.
    fn stop_prepare(&mut self) {
        if self.regs.direction() == ChannelDirection::Tx
            && self.flags & CHANNEL_FLAG_USERSPACE != 0
        {
            self.regs.hp_update();
            self.regs.sdp = self.regs.hdp;
            self.regs.shp = self.regs.hhp;
            self.regs.sp_flush();
        }
    }

    // -- flags and counters -------------------------------------------------

    fn get_flags(&self) -> u32 {
        self.flags
    }

    fn set_flags(&mut self, flags: u32) -> u32 {
        if flags & CHANNEL_FLAG_USERSPACE != 0 {
            self.flags |= CHANNEL_FLAG_USERSPACE;
        } else {
            self.flags &= !CHANNEL_FLAG_USERSPACE;
        }
        self.get_flags()
    }

    fn counters(&self) -> ChannelCounters {
        ChannelCounters {
            processed: self.regs.cntr_processed(),
            discarded: self.regs.cntr_discarded(),
        }
    }
}

pub(crate) struct CtrlV3Rx(V3Common);

pub(crate) struct CtrlV3Tx(V3Common);

impl CtrlV3Rx {
    pub(crate) fn new(comp: Comp, binding: &QueueBinding, name: String) -> Self {
        Self(V3Common::new(comp, ChannelDirection::Rx, binding, name))
    }

    pub(crate) fn common_mut(&mut self) -> &mut V3Common {
        &mut self.0
    }
}

impl CtrlV3Tx {
    pub(crate) fn new(comp: Comp, binding: &QueueBinding, name: String) -> Self {
        Self(V3Common::new(comp, ChannelDirection::Tx, binding, name))
    }

    pub(crate) fn common_mut(&mut self) -> &mut V3Common {
        &mut self.0
    }
}

impl DmaController for CtrlV3Rx {
    fn attach_ring(&mut self, ctx: &AttachCtx<'_>, ring: &NdpRing) -> DriverResult<u64> {
        self.0.rx_attach_ring(ctx, ring)
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
        self.0.flags &= !CHANNEL_FLAG_USERSPACE;
    }

    fn get_hwptr(&mut self, _ring: &NdpRing) -> u64 {
        self.0.rx_get_hwptr()
    }

    fn set_swptr(&mut self, _ring: &NdpRing, ptr: u64, _cancel: &CancelToken) {
        self.0.rx_set_swptr(ptr)
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

impl DmaController for CtrlV3Tx {
    fn attach_ring(&mut self, ctx: &AttachCtx<'_>, ring: &NdpRing) -> DriverResult<u64> {
        self.0.tx_attach_ring(ctx, ring)
    }

    fn detach_ring(&mut self, device: &NfbDevice) {
        self.0.detach_ring(device)
    }

    fn start(&mut self, ring: &NdpRing) -> DriverResult<u64> {
        self.0.start(ring)
    }

    fn stop_prepare(&mut self) {
        self.0.stop_prepare()
    }

    fn stop_attempt(&mut self) -> DriverResult<()> {
        self.0.regs.stop(false)
    }

    fn stop_force(&mut self) {
        let _ = self.0.regs.stop_force();
    }

    fn on_stopped(&mut self) {
        self.0.flags &= !CHANNEL_FLAG_USERSPACE;
    }

    fn get_hwptr(&mut self, _ring: &NdpRing) -> u64 {
        self.0.tx_get_hwptr()
    }

    fn set_swptr(&mut self, _ring: &NdpRing, ptr: u64, _cancel: &CancelToken) {
        self.0.tx_set_swptr(ptr)
    }

    fn get_flags(&self) -> u32 {
        self.0.get_flags()
    }

    fn set_flags(&mut self, flags: u32) -> u32 {
        self.0.set_flags(flags)
    }

    fn get_free_space(&mut self) -> Option<u64> {
        Some(self.0.free_bytes)
    }

    fn counters(&self) -> ChannelCounters {
        self.0.counters()
    }
}
