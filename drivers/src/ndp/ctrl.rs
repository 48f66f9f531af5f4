//! DMA controller register protocol shared by the Medusa (v2) and Calypte
//! (v3) generations: register map, descriptor and header wire formats, and
//! the pointer/start/stop engine both controller front-ends drive.
//!
//! All DMA words are little-endian; register access goes through the
//! controller's component window.

use nfb_abi::{PhysAddr, VirtAddr};
use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::ChannelDirection;
use nfb_mm::dma::DmaRegion;

use crate::comp::{COMP_LOCK_DMA_CTRL, Comp};
use crate::lock::AppId;
use crate::ndp::{dma_rmb, dma_wmb};

// ---------------------------------------------------------------------------
// Register map (common to both generations unless noted)
// ---------------------------------------------------------------------------

pub const REG_CONTROL: usize = 0x00;
pub const CONTROL_STOP: u32 = 0x0;
pub const CONTROL_START: u32 = 0x1;
pub const REG_STATUS: usize = 0x04;
pub const STATUS_RUNNING: u32 = 0x1;
pub const REG_SDP: usize = 0x10;
pub const REG_SHP: usize = 0x14;
pub const REG_HDP: usize = 0x18;
pub const REG_HHP: usize = 0x1C;
/// Medusa only.
pub const REG_TIMEOUT: usize = 0x20;
pub const REG_DESC_BASE: usize = 0x40;
pub const REG_HDR_BASE: usize = 0x48;
/// Medusa only.
pub const REG_UPDATE_BASE: usize = 0x50;
pub const REG_MDP: usize = 0x58;
pub const REG_MHP: usize = 0x5C;
/// Processed packets (sent on TX, received on RX).
pub const REG_CNTR_PROCESSED: usize = 0x60;
/// Discarded packets.
pub const REG_CNTR_DISCARDED: usize = 0x70;

/// Two 32-bit words written by hardware: `(HDP, HHP)`.
pub const UPDATE_BUFFER_SIZE: u64 = 8;

/// Unit of RX refill in PACKET_SIMPLE mode.
pub const RX_DESC_BURST: u32 = 64;

/// Calypte RX data slot granularity in bytes.
pub const RX_CALYPTE_BLOCK_SIZE: u32 = 128;
/// Calypte TX data granularity in bytes.
pub const TX_CALYPTE_BLOCK_SIZE: u32 = 32;

/// Medusa start programs this adaptive-timeout seed.
pub const TIMEOUT_DEFAULT: u32 = 0x4000;

/// Consecutive no-progress refill cycles before SDP is flushed short of a
/// full burst to avoid a descriptor deadlock (USER mode).
pub const NEXT_SDP_AGE_MAX: u8 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtrlGeneration {
    /// v2, host-side descriptor ring with an update buffer.
    Medusa,
    /// v3, pointers read directly from registers.
    Calypte,
}

// ---------------------------------------------------------------------------
// Descriptor wire format
// ---------------------------------------------------------------------------

/// Portion of a DMA address carried by a type-0 descriptor: everything
/// above the low 30 bits.
#[inline]
pub const fn desc_upper_addr(addr: u64) -> u64 {
    addr & 0xFFFF_FFFF_C000_0000
}

/// Sentinel forcing a type-0 descriptor before the first data descriptor
/// after start: no real address matches it.
pub const LAST_UPPER_ADDR_INVALID: u64 = u64::MAX;

/// One 64-bit descriptor word. Bit layout (LSB first):
///
/// - type 0 (upper address): `phys_lo:32` (addr bits 30..61), `phys_hi:2`
///   (addr bits 62..63), `rsvd:28`, `type:2 = 0`
/// - type 2 (data): `phys:30`, `int:1`, `rsvd:1`, `len:16`, `meta:12`,
///   `shared:1`, `next:1`, `type:2 = 2`
/// - type 3 (dual address, legacy v1): `phys0:30`, `int0:1`, `int1:1`,
///   `phys1:30`, `type:2 = 3`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct NdpDesc(pub u64);

impl NdpDesc {
    /// Type-0 descriptor announcing the upper 34 bits of `phys`.
    #[inline]
    pub const fn rx_desc0(phys: u64) -> Self {
        let lo = (phys >> 30) & 0xFFFF_FFFF;
        let hi = (phys >> 62) & 0x3;
        Self(lo | (hi << 32))
    }

    #[inline]
    pub const fn tx_desc0(phys: u64) -> Self {
        Self::rx_desc0(phys)
    }

    /// RX data descriptor: `len` is the buffer capacity.
    #[inline]
    pub const fn rx_desc2(phys: u64, len: u16, next: bool) -> Self {
        Self::desc2(phys, len, 0, next)
    }

    /// TX data descriptor: `len` is the frame byte count.
    #[inline]
    pub const fn tx_desc2(phys: u64, len: u16, meta: u16, next: bool) -> Self {
        Self::desc2(phys, len, meta, next)
    }

    #[inline]
    const fn desc2(phys: u64, len: u16, meta: u16, next: bool) -> Self {
        Self(
            (phys & 0x3FFF_FFFF)
                | ((len as u64) << 32)
                | (((meta as u64) & 0xFFF) << 48)
                | ((next as u64) << 61)
                | (2u64 << 62),
        )
    }

    /// Legacy v1 dual-address descriptor; kept for wire-format completeness.
    #[inline]
    pub const fn rx_desc3(phys0: u64, phys1: u64) -> Self {
        Self((phys0 & 0x3FFF_FFFF) | ((phys1 & 0x3FFF_FFFF) << 32) | (3u64 << 62))
    }

    #[inline]
    pub const fn desc_type(self) -> u8 {
        (self.0 >> 62) as u8
    }

    #[inline]
    pub const fn is_data(self) -> bool {
        self.desc_type() == 2
    }

    /// Low 30 address bits of a type-2 descriptor.
    #[inline]
    pub const fn data_phys_low(self) -> u64 {
        self.0 & 0x3FFF_FFFF
    }

    #[inline]
    pub const fn data_len(self) -> u16 {
        (self.0 >> 32) as u16
    }

    #[inline]
    pub const fn data_meta(self) -> u16 {
        ((self.0 >> 48) & 0xFFF) as u16
    }

    #[inline]
    pub const fn data_next(self) -> bool {
        (self.0 >> 61) & 1 != 0
    }

    /// Upper address announced by a type-0 descriptor.
    #[inline]
    pub const fn upper_addr(self) -> u64 {
        ((self.0 & 0xFFFF_FFFF) << 30) | (((self.0 >> 32) & 0x3) << 62)
    }
}

// ---------------------------------------------------------------------------
// Header wire formats
// ---------------------------------------------------------------------------

/// Medusa RX/TX header: `{frame_len:16, hdr_len:8, meta:4, _:2, free_desc:2}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct NdpHdr(pub u32);

impl NdpHdr {
    #[inline]
    pub const fn new(frame_len: u16, hdr_len: u8, meta: u8, free_desc: u8) -> Self {
        Self(
            frame_len as u32
                | ((hdr_len as u32) << 16)
                | (((meta as u32) & 0xF) << 24)
                | (((free_desc as u32) & 0x3) << 30),
        )
    }

    #[inline]
    pub const fn frame_len(self) -> u16 {
        self.0 as u16
    }

    #[inline]
    pub const fn hdr_len(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub const fn meta(self) -> u8 {
        ((self.0 >> 24) & 0xF) as u8
    }

    /// How many descriptors the hardware released producing this frame
    /// (0, 1 or 2).
    #[inline]
    pub const fn free_desc(self) -> u8 {
        ((self.0 >> 30) & 0x3) as u8
    }
}

/// Calypte RX header:
/// `{frame_len:16, frame_ptr:16, valid:1, _:7, metadata:24}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct CalypteHdr(pub u64);

impl CalypteHdr {
    #[inline]
    pub const fn new(frame_len: u16, frame_ptr: u16, valid: bool, metadata: u32) -> Self {
        Self(
            frame_len as u64
                | ((frame_ptr as u64) << 16)
                | ((valid as u64) << 32)
                | (((metadata as u64) & 0xFF_FFFF) << 40),
        )
    }

    #[inline]
    pub const fn frame_len(self) -> u16 {
        self.0 as u16
    }

    #[inline]
    pub const fn frame_ptr(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[inline]
    pub const fn valid(self) -> bool {
        (self.0 >> 32) & 1 != 0
    }

    #[inline]
    pub const fn metadata(self) -> u32 {
        ((self.0 >> 40) & 0xFF_FFFF) as u32
    }

    #[inline]
    pub const fn cleared(self) -> Self {
        Self(self.0 & !(1u64 << 32))
    }
}

// ---------------------------------------------------------------------------
// DMA-coherent typed rings
// ---------------------------------------------------------------------------

/// A power-of-two array of `T` in DMA-coherent memory, indexed modulo its
/// length. Both sides may touch it concurrently, so every access is
/// volatile.
pub struct DmaRing<T: Copy> {
    region: DmaRegion,
    mask: u32,
    _marker: core::marker::PhantomData<T>,
}

impl<T: Copy> DmaRing<T> {
    /// `count` must be a power of two and fit in `region`.
    pub fn new(region: DmaRegion, count: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        debug_assert!(region.size >= count as u64 * core::mem::size_of::<T>() as u64);
        Self {
            region,
            mask: count - 1,
            _marker: core::marker::PhantomData,
        }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.mask + 1
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.region.phys
    }

    #[inline]
    pub fn virt(&self) -> VirtAddr {
        self.region.virt
    }

    #[inline]
    pub fn region(&self) -> &DmaRegion {
        &self.region
    }

    #[inline]
    pub fn get(&self, index: u32) -> T {
        let index = index & self.mask;
        // SAFETY: masked index is in bounds of the region by construction.
        unsafe {
            core::ptr::read_volatile(
                (self.region.as_ptr() as *const T).add(index as usize),
            )
        }
    }

    #[inline]
    pub fn set(&self, index: u32, value: T) {
        let index = index & self.mask;
        // SAFETY: masked index is in bounds of the region by construction.
        unsafe {
            core::ptr::write_volatile(
                (self.region.as_mut_ptr() as *mut T).add(index as usize),
                value,
            )
        }
    }

    pub fn into_region(self) -> DmaRegion {
        self.region
    }
}

// ---------------------------------------------------------------------------
// Controller register engine
// ---------------------------------------------------------------------------

/// Parameters for arming a controller.
#[derive(Clone, Copy, Debug, Default)]
pub struct StartParams {
    pub desc_buffer: u64,
    pub data_buffer: u64,
    pub hdr_buffer: u64,
    pub update_buffer: u64,
    pub update_buffer_virt: Option<VirtAddr>,
    pub nb_data: u32,
    pub nb_desc: u32,
    pub nb_hdr: u32,
}

/// Pointer and register state of one controller instance. Front-ends embed
/// this and layer mode-specific descriptor logic on top.
pub struct NdpCtrl {
    pub last_upper_addr: u64,
    pub mdp: u32,
    pub mhp: u32,
    pub sdp: u32,
    pub hdp: u32,
    pub shp: u32,
    pub hhp: u32,

    comp: Comp,
    update_virt: Option<VirtAddr>,
    generation: CtrlGeneration,
    direction: ChannelDirection,
}

impl NdpCtrl {
    pub fn new(comp: Comp, generation: CtrlGeneration, direction: ChannelDirection) -> Self {
        Self {
            last_upper_addr: LAST_UPPER_ADDR_INVALID,
            mdp: 0,
            mhp: 0,
            sdp: 0,
            hdp: 0,
            shp: 0,
            hhp: 0,
            comp,
            update_virt: None,
            generation,
            direction,
        }
    }

    #[inline]
    pub fn generation(&self) -> CtrlGeneration {
        self.generation
    }

    #[inline]
    pub fn direction(&self) -> ChannelDirection {
        self.direction
    }

    #[inline]
    pub fn comp(&self) -> &Comp {
        &self.comp
    }

    #[inline]
    fn update_word(&self, index: usize) -> u32 {
        match self.update_virt {
            Some(virt) => {
                // SAFETY: the update buffer is a live DMA region of at least
                // two u32 words for the whole started period.
                unsafe { core::ptr::read_volatile(virt.as_ptr::<u32>().add(index)) }
            }
            None => 0,
        }
    }

    /// Refresh `hdp` from the update buffer (Medusa) or register (Calypte).
    pub fn hdp_update(&mut self) {
        match self.generation {
            CtrlGeneration::Medusa => {
                dma_rmb();
                self.hdp = self.update_word(0);
            }
            CtrlGeneration::Calypte => {
                self.hdp = self.comp.read32(REG_HDP) & self.mdp;
            }
        }
    }

    /// Refresh `hhp` from the update buffer (Medusa) or register (Calypte).
    pub fn hhp_update(&mut self) {
        match self.generation {
            CtrlGeneration::Medusa => {
                dma_rmb();
                self.hhp = self.update_word(1);
            }
            CtrlGeneration::Calypte => {
                self.hhp = self.comp.read32(REG_HHP);
            }
        }
    }

    /// Refresh both hardware pointers with one 64-bit register read
    /// (Calypte).
    pub fn hp_update(&mut self) {
        let hwpointers = self.comp.read64(REG_HDP);
        self.hdp = (hwpointers as u32) & self.mdp;
        self.hhp = ((hwpointers >> 32) as u32) & self.mhp;
    }

    /// Flush both software pointers with one 64-bit register write.
    pub fn sp_flush(&self) {
        dma_wmb();
        self.comp
            .write64(REG_SDP, self.sdp as u64 | ((self.shp as u64) << 32));
    }

    /// Flush only the software descriptor pointer.
    pub fn sdp_flush(&self) {
        dma_wmb();
        self.comp.write32(REG_SDP, self.sdp);
    }

    /// Packets processed by the controller (sent for TX, received for RX).
    pub fn cntr_processed(&self) -> u64 {
        self.comp.read64(REG_CNTR_PROCESSED)
    }

    /// Packets discarded by the controller.
    pub fn cntr_discarded(&self) -> u64 {
        self.comp.read64(REG_CNTR_DISCARDED)
    }

    /// Arm the controller. On success the component's DMA-controller
    /// feature is locked and the hardware is running with all pointers
    /// zeroed.
    ///
    /// `Dirty` means the STATUS register already reported RUNNING — the
    /// controller was not stopped cleanly; the caller may force-stop and
    /// retry once.
    pub fn start(&mut self, sp: &StartParams) -> DriverResult<()> {
        let calypte_tx =
            self.generation == CtrlGeneration::Calypte && self.direction == ChannelDirection::Tx;

        let (nb_d, d_buffer) = match self.generation {
            CtrlGeneration::Medusa => (sp.nb_desc, sp.desc_buffer),
            CtrlGeneration::Calypte => (sp.nb_data, sp.data_buffer),
        };

        if !calypte_tx {
            if nb_d == 0 || !nb_d.is_power_of_two() {
                return Err(DriverError::InvalidArgument);
            }
            if self.direction == ChannelDirection::Rx
                && (sp.nb_hdr == 0 || !sp.nb_hdr.is_power_of_two())
            {
                return Err(DriverError::InvalidArgument);
            }
        }

        self.comp.try_lock(AppId::KERNEL, COMP_LOCK_DMA_CTRL)?;

        if self.generation == CtrlGeneration::Medusa {
            self.update_virt = sp.update_buffer_virt;
        }

        if calypte_tx {
            // Masks are programmed by hardware for Calypte TX.
            self.mdp = self.comp.read32(REG_MDP);
            self.mhp = self.comp.read32(REG_MHP);
        } else {
            self.mdp = nb_d - 1;
            self.mhp = sp.nb_hdr.wrapping_sub(1);
        }

        self.sdp = 0;
        self.hdp = 0;
        self.shp = 0;
        self.hhp = 0;

        if self.generation == CtrlGeneration::Medusa {
            if let Some(virt) = sp.update_buffer_virt {
                // SAFETY: update buffer is a live, exclusive DMA region.
                unsafe {
                    core::ptr::write_volatile(virt.as_mut_ptr::<u32>(), 0);
                    core::ptr::write_volatile(virt.as_mut_ptr::<u32>().add(1), 0);
                }
            }
        }

        // First descriptor after start must be type 0.
        self.last_upper_addr = LAST_UPPER_ADDR_INVALID;

        let status = self.comp.read32(REG_STATUS);
        if status & STATUS_RUNNING != 0 {
            self.comp.unlock(AppId::KERNEL, COMP_LOCK_DMA_CTRL);
            return Err(DriverError::Dirty);
        }

        if !calypte_tx {
            self.comp.write64(REG_DESC_BASE, d_buffer);
        }
        if self.generation == CtrlGeneration::Medusa {
            self.comp.write64(REG_UPDATE_BASE, sp.update_buffer);
        }
        if self.direction == ChannelDirection::Rx {
            self.comp.write64(REG_HDR_BASE, sp.hdr_buffer);
        }
        if !calypte_tx {
            self.comp.write32(REG_MDP, self.mdp);
            self.comp.write32(REG_MHP, self.mhp);
        }

        // Zero both buffer pointers with one write.
        self.comp.write64(REG_SDP, 0);

        if self.generation == CtrlGeneration::Medusa {
            self.comp.write32(REG_TIMEOUT, TIMEOUT_DEFAULT);
        }

        self.comp.write32(REG_CONTROL, CONTROL_START);
        Ok(())
    }

    /// One stop attempt.
    ///
    /// Non-forced TX with unconsumed descriptors returns `Again` when the
    /// hardware pointer made no progress since the last attempt and
    /// `InProgress` when it is still draining. Success releases the
    /// component lock.
    pub fn stop(&mut self, force: bool) -> DriverResult<()> {
        let mut busy = false;

        if self.direction == ChannelDirection::Tx {
            let hdp_prev = self.hdp;
            self.hdp_update();
            if self.sdp != self.hdp {
                if force {
                    busy = true;
                } else if hdp_prev == self.hdp {
                    return Err(DriverError::Again);
                } else {
                    return Err(DriverError::InProgress);
                }
            }
        }

        self.comp.write32(REG_CONTROL, CONTROL_STOP);

        // The RX engine can complete a few frames during the stop process,
        // pushing HW pointers past the SW ones after software stopped
        // accepting data. Catch the SW side up.
        if self.generation == CtrlGeneration::Calypte && self.direction == ChannelDirection::Rx {
            let hdp = self.comp.read32(REG_HDP);
            self.comp.write32(REG_SDP, hdp);
            let hhp = self.comp.read32(REG_HHP);
            self.comp.write32(REG_SHP, hhp);
        }

        let mut stopped = false;
        let mut counter = 0;
        while counter < 100 {
            let status = self.comp.read32(REG_STATUS);
            if status & STATUS_RUNNING == 0 {
                stopped = true;
                break;
            }
            counter += 1;
        }

        if !force && !stopped {
            return Err(DriverError::Again);
        }

        self.comp.unlock(AppId::KERNEL, COMP_LOCK_DMA_CTRL);
        if busy {
            return Err(DriverError::Busy);
        }
        if !stopped {
            return Err(DriverError::Again);
        }
        Ok(())
    }

    pub fn stop_force(&mut self) -> DriverResult<()> {
        self.stop(true)
    }
}

/// Arm a controller, recovering once from a dirty state: if STATUS still
/// reports RUNNING the controller is force-stopped and started again, with
/// an advisory log either way.
pub(crate) fn start_with_recovery(
    regs: &mut NdpCtrl,
    sp: &StartParams,
    name: &str,
) -> DriverResult<()> {
    use nfb_lib::clock::busy_wait_ms;
    use nfb_lib::klog_error;

    match regs.start(sp) {
        Err(DriverError::Dirty) => {
            let _ = regs.stop_force();
            busy_wait_ms(10);
            match regs.start(sp) {
                Ok(()) => {
                    klog_error!(
                        "ndp: queue {} was in dirty state, restart seems successful, but errors can occur",
                        name
                    );
                    Ok(())
                }
                Err(_) => {
                    klog_error!("ndp: queue {} is in dirty state, can't be started", name);
                    Err(DriverError::Dirty)
                }
            }
        }
        other => other,
    }
}
