//! XDP queue controller: a Medusa controller instance driven by the
//! adapter's poll loops.
//!
//! The RX side refills descriptors in bursts from the active pool and runs
//! completed frames through the program; the TX side submits frames (in
//! place for `XDP_TX` and XSK, copied for stack transmit), honoring the
//! type-0-on-upper-change rule, and reclaims completions in ring order.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use core::ptr;

use nfb_abi::PhysAddr;
use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::ChannelDirection;
use nfb_lib::clock::busy_wait_ms;
use nfb_lib::klog_warn;
use nfb_mm::dma::{DmaRegion, dma_alloc_coherent, dma_free_coherent};

use crate::comp::Comp;
use crate::ndp::ctrl::{
    CtrlGeneration, DmaRing, NdpCtrl, NdpDesc, NdpHdr, StartParams, UPDATE_BUFFER_SIZE,
    desc_upper_addr, start_with_recovery,
};
use crate::xdp::pool::{PP_MAX_FRAME_LEN, PagePool, XskDesc, XskPool};
use crate::xdp::{ETH_ZLEN, FrameSink, XDP_PACKET_BURST, XdpAction, XdpChannel, XdpProgram};

const DESC_SIZE: u64 = 8;
const HDR_SIZE: u64 = 4;

/// Buffer source for one queue.
pub enum XCtrlKind {
    PagePool(PagePool),
    Xsk(XskPool),
}

/// What one RX descriptor slot is backed by.
#[derive(Clone, Copy)]
enum RxFrame {
    None,
    Pool(u16),
    Xsk(u64),
}

/// What one TX descriptor slot carries.
#[derive(Clone, Copy)]
enum TxSlot {
    None,
    Type0,
    /// Driver pool frame returned to the pool on completion.
    Pool(u16),
    /// User frame; completes `completions` user descriptors in order.
    Xsk { completions: u32 },
    /// In-place retransmit of a received XSK frame; returns to the fill
    /// ring on completion.
    XskRexmit { addr: u64 },
}

pub struct XCtrl {
    regs: NdpCtrl,
    name: String,
    kind: XCtrlKind,
    desc: DmaRing<NdpDesc>,
    hdrs: Option<DmaRing<NdpHdr>>,
    update: DmaRegion,
    /// RX: frame backing each header slot; fill position runs ahead of the
    /// consume position by the number of posted buffers.
    rx_frames: Vec<RxFrame>,
    rx_fill_ptr: u32,
    /// TX: slot bookkeeping plus the cleaned-up-to pointer.
    tx_slots: Vec<TxSlot>,
    tx_clean_ptr: u32,
    /// XSK frames in submission order, waiting for completion.
    inflight: VecDeque<u64>,
    /// Frames dropped since the last successful submission; their
    /// completions coalesce onto the next submitted slot.
    pending_drops: u32,
}

impl XCtrl {
    /// Allocate the controller's DMA resources for one queue direction.
    pub fn alloc(
        comp: Comp,
        direction: ChannelDirection,
        nb_desc: u32,
        kind: XCtrlKind,
    ) -> DriverResult<XCtrl> {
        let name = alloc::format!("xdp-{}", direction.as_str());
        let regs = NdpCtrl::new(comp, CtrlGeneration::Medusa, direction);

        let desc_region = dma_alloc_coherent(nb_desc as u64 * DESC_SIZE)?;
        let update = match dma_alloc_coherent(UPDATE_BUFFER_SIZE) {
            Ok(region) => region,
            Err(err) => {
                dma_free_coherent(desc_region);
                return Err(err);
            }
        };
        let hdrs = if direction == ChannelDirection::Rx {
            match dma_alloc_coherent(nb_desc as u64 * HDR_SIZE) {
                Ok(region) => Some(DmaRing::new(region, nb_desc)),
                Err(err) => {
                    dma_free_coherent(update);
                    dma_free_coherent(desc_region);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut rx_frames = Vec::new();
        let mut tx_slots = Vec::new();
        match direction {
            ChannelDirection::Rx => rx_frames.resize(nb_desc as usize, RxFrame::None),
            ChannelDirection::Tx => tx_slots.resize(nb_desc as usize, TxSlot::None),
        }

        Ok(XCtrl {
            regs,
            name,
            kind,
            desc: DmaRing::new(desc_region, nb_desc),
            hdrs,
            update,
            rx_frames,
            rx_fill_ptr: 0,
            tx_slots,
            tx_clean_ptr: 0,
            inflight: VecDeque::new(),
            pending_drops: 0,
        })
    }

    pub(crate) fn desc_ring(&self) -> &DmaRing<NdpDesc> {
        &self.desc
    }

    pub(crate) fn hdrs_ring(&self) -> Option<&DmaRing<NdpHdr>> {
        self.hdrs.as_ref()
    }

    pub(crate) fn update_region(&self) -> &DmaRegion {
        &self.update
    }

    pub fn start(&mut self) -> DriverResult<()> {
        let sp = StartParams {
            desc_buffer: self.desc.phys().as_u64(),
            hdr_buffer: self.hdrs.as_ref().map(|h| h.phys().as_u64()).unwrap_or(0),
            update_buffer: self.update.phys.as_u64(),
            update_buffer_virt: Some(self.update.virt),
            nb_desc: self.desc.count(),
            nb_hdr: self.hdrs.as_ref().map(|h| h.count()).unwrap_or(self.desc.count()),
            ..StartParams::default()
        };
        start_with_recovery(&mut self.regs, &sp, &self.name)?;

        self.rx_fill_ptr = 0;
        self.tx_clean_ptr = 0;
        self.inflight.clear();
        self.pending_drops = 0;
        for slot in self.tx_slots.iter_mut() {
            *slot = TxSlot::None;
        }
        for frame in self.rx_frames.iter_mut() {
            *frame = RxFrame::None;
        }
        Ok(())
    }

    /// Quiesce the queue: a short attempt loop with a force-stop fallback,
    /// then completion of everything still in flight.
    pub fn stop(&mut self) -> DriverResult<()> {
        let mut cnt = 0;
        let stopped = loop {
            match self.regs.stop(false) {
                Ok(()) => break true,
                Err(DriverError::InProgress) => cnt = 0,
                Err(_) => {}
            }
            busy_wait_ms(10);
            cnt += 1;
            if cnt >= 10 {
                break false;
            }
        };
        if !stopped {
            let _ = self.regs.stop_force();
            klog_warn!("nfb_xdp: queue {} did not stop cleanly", self.name);
        }

        self.release_outstanding();
        Ok(())
    }

    /// Return every posted or in-flight frame to its owner.
    fn release_outstanding(&mut self) {
        match &self.kind {
            XCtrlKind::PagePool(pool) => {
                for frame in self.rx_frames.iter_mut() {
                    if let RxFrame::Pool(slot) = *frame {
                        pool.release_slot(slot);
                    }
                    *frame = RxFrame::None;
                }
                for slot in self.tx_slots.iter_mut() {
                    if let TxSlot::Pool(page) = *slot {
                        pool.release_slot(page);
                    }
                    *slot = TxSlot::None;
                }
            }
            XCtrlKind::Xsk(pool) => {
                for frame in self.rx_frames.iter_mut() {
                    if let RxFrame::Xsk(addr) = *frame {
                        pool.fill_enqueue(addr);
                    }
                    *frame = RxFrame::None;
                }
                while let Some(addr) = self.inflight.pop_front() {
                    pool.completion_push(addr);
                }
                for slot in self.tx_slots.iter_mut() {
                    *slot = TxSlot::None;
                }
            }
        }
    }

    pub fn destroy(mut self) {
        self.release_outstanding();
        if let Some(hdrs) = self.hdrs.take() {
            dma_free_coherent(hdrs.into_region());
        }
        dma_free_coherent(*self.desc.region());
        dma_free_coherent(self.update);
    }

    // -- RX -----------------------------------------------------------------

    /// Post one burst of buffers from the pool when at least a burst of
    /// descriptor and header slots is free. Returns buffers posted.
    fn rx_fill(&mut self) -> u32 {
        let batch = XDP_PACKET_BURST;
        self.regs.hdp_update();

        let mdp = self.regs.mdp;
        let mhp = self.regs.mhp;
        let mut sdp = self.regs.sdp;
        let mut fill = self.rx_fill_ptr;

        let mut free_desc = self.regs.hdp.wrapping_sub(sdp).wrapping_sub(1) & mdp;
        let free_hdrs = self.regs.shp.wrapping_sub(fill).wrapping_sub(1) & mhp;
        if free_desc < batch || free_hdrs < batch {
            return 0;
        }

        let mut filled = 0;
        for _ in 0..batch {
            let (dma, frame, capacity, next) = match &self.kind {
                XCtrlKind::PagePool(pool) => match pool.alloc_slot() {
                    Some(slot) => (
                        pool.dma_of(slot),
                        RxFrame::Pool(slot),
                        PP_MAX_FRAME_LEN as u16,
                        true,
                    ),
                    None => break,
                },
                XCtrlKind::Xsk(pool) => match pool.fill_dequeue() {
                    Some(addr) => (
                        pool.phys_of(addr),
                        RxFrame::Xsk(addr),
                        pool.frame_size() as u16,
                        false,
                    ),
                    None => break,
                },
            };
            let dma = dma.as_u64();

            if desc_upper_addr(dma) != self.regs.last_upper_addr {
                if free_desc == 0 {
                    self.rx_recycle(frame);
                    break;
                }
                self.regs.last_upper_addr = desc_upper_addr(dma);
                self.desc.set(sdp, NdpDesc::rx_desc0(dma));
                sdp = sdp.wrapping_add(1);
                free_desc -= 1;
            }
            if free_desc == 0 {
                self.rx_recycle(frame);
                break;
            }

            self.desc.set(sdp, NdpDesc::rx_desc2(dma, capacity, next));
            sdp = sdp.wrapping_add(1);
            free_desc -= 1;

            self.rx_frames[(fill & mhp) as usize] = frame;
            fill = fill.wrapping_add(1);
            filled += 1;
        }

        if filled != 0 {
            self.rx_fill_ptr = fill;
            self.regs.sdp = sdp & mdp;
            self.regs.sdp_flush();
        }
        filled
    }

    fn rx_recycle(&self, frame: RxFrame) {
        match (&self.kind, frame) {
            (XCtrlKind::PagePool(pool), RxFrame::Pool(slot)) => pool.release_slot(slot),
            (XCtrlKind::Xsk(pool), RxFrame::Xsk(addr)) => pool.fill_enqueue(addr),
            _ => {}
        }
    }

    /// Process up to `budget` completed frames through the program.
    pub fn rx_poll(
        &mut self,
        budget: u32,
        program: Option<&dyn XdpProgram>,
        sink: &dyn FrameSink,
        tx: Option<&mut XCtrl>,
        channel: &XdpChannel,
    ) -> u32 {
        self.rx_fill();

        let Some(hdrs) = self.hdrs.as_ref() else {
            return 0;
        };
        self.regs.hhp_update();

        let mhp = self.regs.mhp;
        let mut shp = self.regs.shp;
        let mut processed = 0;
        let mut tx = tx;

        let capacity = match &self.kind {
            XCtrlKind::PagePool(_) => PP_MAX_FRAME_LEN as usize,
            XCtrlKind::Xsk(pool) => pool.frame_size() as usize,
        };

        while processed < budget && shp != self.regs.hhp {
            let hdr = hdrs.get(shp);
            let frame_len = hdr.frame_len() as usize;
            let frame = core::mem::replace(
                &mut self.rx_frames[(shp & mhp) as usize],
                RxFrame::None,
            );

            if frame_len == 0 || frame_len > capacity {
                // A malformed header is fatal for the channel: stop
                // consuming before corrupt lengths reach downstream users.
                klog_warn!(
                    "nfb_xdp: queue {}: malformed packet header (len {})",
                    self.name,
                    frame_len
                );
                self.rx_recycle(frame);
                break;
            }

            let frame_ptr = match (&self.kind, frame) {
                (XCtrlKind::PagePool(pool), RxFrame::Pool(slot)) => pool.frame_ptr(slot),
                (XCtrlKind::Xsk(pool), RxFrame::Xsk(addr)) => pool.frame_ptr(addr),
                _ => {
                    // Buffer accounting out of sync with the hardware: a
                    // malformed header stream is fatal for the channel.
                    klog_warn!("nfb_xdp: queue {}: orphaned rx slot", self.name);
                    shp = shp.wrapping_add(1);
                    processed += 1;
                    continue;
                }
            };
            // SAFETY: the frame is exclusively owned between fill and this
            // point; the hardware completed it (hhp passed the slot).
            let data = unsafe { core::slice::from_raw_parts_mut(frame_ptr, frame_len) };

            let action = match program {
                Some(program) => program.run(data),
                None => XdpAction::Pass,
            };

            match action {
                XdpAction::Pass => {
                    channel.rxq.stats.count(frame_len as u64);
                    match (&self.kind, frame) {
                        (XCtrlKind::Xsk(pool), RxFrame::Xsk(addr)) => {
                            pool.rx_push(XskDesc {
                                addr,
                                len: frame_len as u32,
                            });
                        }
                        _ => {
                            sink.deliver(channel.index(), data);
                            self.rx_recycle(frame);
                        }
                    }
                }
                XdpAction::Drop => {
                    channel.rxq.stats.drop_one();
                    self.rx_recycle(frame);
                }
                XdpAction::Tx => {
                    let dma = self.frame_dma(frame);
                    let slot = match frame {
                        RxFrame::Pool(page) => Some(TxSlot::Pool(page)),
                        RxFrame::Xsk(addr) => Some(TxSlot::XskRexmit { addr }),
                        RxFrame::None => None,
                    };
                    let done = match (tx.as_mut(), slot) {
                        (Some(txc), Some(slot)) => txc
                            .tx_submit_inplace(dma, frame_len as u32, slot, channel)
                            .is_ok(),
                        _ => false,
                    };
                    if !done {
                        channel.txq.stats.drop_one();
                        self.rx_recycle(frame);
                    }
                }
                XdpAction::Redirect => {
                    channel.rxq.stats.count(frame_len as u64);
                    sink.redirect(channel.index(), data);
                    self.rx_recycle(frame);
                }
            }

            shp = shp.wrapping_add(1);
            processed += 1;
        }

        if processed != 0 {
            self.regs.shp = shp & mhp;
            self.regs.sp_flush();
        }
        processed
    }

    fn frame_dma(&self, frame: RxFrame) -> PhysAddr {
        match (&self.kind, frame) {
            (XCtrlKind::PagePool(pool), RxFrame::Pool(slot)) => pool.dma_of(slot),
            (XCtrlKind::Xsk(pool), RxFrame::Xsk(addr)) => pool.phys_of(addr),
            _ => PhysAddr::NULL,
        }
    }

    // -- TX -----------------------------------------------------------------

    /// Reclaim completed TX slots in ring order.
    fn tx_reclaim(&mut self, _channel: &XdpChannel) -> u32 {
        self.regs.hdp_update();
        let mdp = self.regs.mdp;
        let mut clean = self.tx_clean_ptr;
        let mut completed = 0;

        while clean != self.regs.hdp {
            let slot = core::mem::replace(&mut self.tx_slots[(clean & mdp) as usize], TxSlot::None);
            match slot {
                TxSlot::None | TxSlot::Type0 => {}
                TxSlot::Pool(page) => {
                    if let XCtrlKind::PagePool(pool) = &self.kind {
                        pool.release_slot(page);
                    }
                    completed += 1;
                }
                TxSlot::Xsk { completions } => {
                    if let XCtrlKind::Xsk(pool) = &self.kind {
                        // Completions return in the order frames were taken
                        // from the user ring.
                        for _ in 0..completions {
                            if let Some(addr) = self.inflight.pop_front() {
                                pool.completion_push(addr);
                            }
                        }
                    }
                    completed += 1;
                }
                TxSlot::XskRexmit { addr } => {
                    if let XCtrlKind::Xsk(pool) = &self.kind {
                        pool.fill_enqueue(addr);
                    }
                    completed += 1;
                }
            }
            clean = clean.wrapping_add(1);
        }
        self.tx_clean_ptr = clean;
        completed
    }

    /// Submit one already-mapped frame. At most two descriptors are used
    /// (address update plus data).
    fn tx_submit_inplace(
        &mut self,
        dma: PhysAddr,
        len: u32,
        slot: TxSlot,
        channel: &XdpChannel,
    ) -> DriverResult<()> {
        let mdp = self.regs.mdp;
        let mut sdp = self.regs.sdp;

        let mut free_desc = self.regs.hdp.wrapping_sub(sdp).wrapping_sub(1) & mdp;
        if free_desc < 2 {
            self.tx_reclaim(channel);
            free_desc = self.regs.hdp.wrapping_sub(sdp).wrapping_sub(1) & mdp;
            if free_desc < 2 {
                return Err(DriverError::Busy);
            }
        }

        let dma = dma.as_u64();
        if desc_upper_addr(dma) != self.regs.last_upper_addr {
            self.regs.last_upper_addr = desc_upper_addr(dma);
            self.desc.set(sdp, NdpDesc::tx_desc0(dma));
            self.tx_slots[(sdp & mdp) as usize] = TxSlot::Type0;
            sdp = sdp.wrapping_add(1);
        }

        self.desc.set(sdp, NdpDesc::tx_desc2(dma, len as u16, 0, false));
        self.tx_slots[(sdp & mdp) as usize] = slot;
        sdp = sdp.wrapping_add(1);

        self.regs.sdp = sdp & mdp;
        self.regs.sdp_flush();

        channel.txq.stats.count(len as u64);
        Ok(())
    }

    /// Stack transmit: copy the frame into a pool buffer, padding short
    /// frames to the minimum Ethernet length.
    pub fn tx_submit_copy(&mut self, frame: &[u8], channel: &XdpChannel) -> DriverResult<()> {
        let XCtrlKind::PagePool(pool) = &self.kind else {
            // In XSK mode the TX ring belongs to the user.
            return Err(DriverError::NotReady);
        };
        if frame.len() > PP_MAX_FRAME_LEN as usize {
            return Err(DriverError::InvalidArgument);
        }

        let page = pool.alloc_slot().ok_or(DriverError::NoMemory)?;
        let len = (frame.len() as u32).max(ETH_ZLEN);
        let dst = pool.frame_ptr(page);
        // SAFETY: the slot was just allocated and is exclusively ours; the
        // copy plus zero padding stays within the frame capacity.
        unsafe {
            ptr::copy_nonoverlapping(frame.as_ptr(), dst, frame.len());
            if frame.len() < len as usize {
                ptr::write_bytes(dst.add(frame.len()), 0, len as usize - frame.len());
            }
        }

        let dma = pool.dma_of(page);
        match self.tx_submit_inplace(dma, len, TxSlot::Pool(page), channel) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let XCtrlKind::PagePool(pool) = &self.kind {
                    pool.release_slot(page);
                }
                channel.txq.stats.drop_one();
                Err(err)
            }
        }
    }

    /// One TX poll round: reclaim completions and, in XSK mode, submit a
    /// batch of user descriptors.
    pub fn tx_poll(&mut self, budget: u32, channel: &XdpChannel) -> u32 {
        let completed = self.tx_reclaim(channel);

        let pool = match &self.kind {
            XCtrlKind::Xsk(pool) => Some(pool.clone()),
            XCtrlKind::PagePool(_) => None,
        };
        if let Some(pool) = pool {
            let mut batch: Vec<XskDesc> = Vec::new();
            pool.tx_peek_batch(&mut batch, budget as usize);

            for desc in batch {
                if !pool.contains(desc.addr, desc.len.max(ETH_ZLEN)) {
                    // Out-of-pool descriptor: drop, completing in order.
                    self.inflight.push_back(desc.addr);
                    self.pending_drops += 1;
                    channel.txq.stats.drop_one();
                    continue;
                }

                let mut len = desc.len;
                if len < ETH_ZLEN {
                    // Pad in place; the pool area is writable.
                    // SAFETY: bounds checked above against the pool size.
                    unsafe {
                        ptr::write_bytes(
                            pool.frame_ptr(desc.addr).add(len as usize),
                            0,
                            (ETH_ZLEN - len) as usize,
                        );
                    }
                    len = ETH_ZLEN;
                }

                let completions = 1 + self.pending_drops;
                self.inflight.push_back(desc.addr);
                match self.tx_submit_inplace(
                    pool.phys_of(desc.addr),
                    len,
                    TxSlot::Xsk { completions },
                    channel,
                ) {
                    Ok(()) => self.pending_drops = 0,
                    Err(_) => {
                        // Ring full: the frame completes with the next
                        // successful submission.
                        self.pending_drops += 1;
                        channel.txq.stats.drop_one();
                    }
                }
            }
        }

        completed
    }
}
