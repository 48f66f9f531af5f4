//! NDP channel: one controller plus one ring, with the subscription
//! bookkeeping and the rxsync/txsync pointer protocol.
//!
//! Locking: a structural mutex (`state`) serialises create/destroy/start/
//! stop/subscribe/resize; a short-hold pointer lock (`inner`) guards every
//! hardware pointer mutation and the subscription cursor scan. `state` is
//! always taken before `inner`, never the other way around.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::{
    CHANNEL_FLAG_EXCLUSIVE, CHANNEL_FLAG_USERSPACE, ChannelDirection, ChannelId, SyncState,
};
use nfb_lib::clock::busy_wait_ms;
use nfb_lib::{klog_error, klog_warn};

use crate::config;
use crate::device::NfbDevice;
use crate::ndp::binding::QueueBinding;
use crate::ndp::ctrl::CtrlGeneration;
use crate::ndp::ctrl_v2::{CtrlV2Rx, CtrlV2Tx};
use crate::ndp::ctrl_v3::{CtrlV3Rx, CtrlV3Tx};
use crate::ndp::ring::NdpRing;
use crate::ndp::subscription::NdpSubscription;
use crate::ndp::{CancelToken, dma_rmb, dma_wmb};

/// Non-forced TX stop gives the hardware this many 10 ms drain slices
/// (~10 s) before reporting `Again` to the caller.
const STOP_DRAIN_MAX_SLICES: u32 = 1000;

/// Packet counters read from the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelCounters {
    /// Frames processed (received for RX, sent for TX).
    pub processed: u64,
    /// Frames discarded by the controller.
    pub discarded: u64,
}

/// Context handed to a controller while it attaches or detaches ring
/// resources: where to register mmap windows and publish FDT properties.
pub struct AttachCtx<'a> {
    pub device: &'a NfbDevice,
    pub queue_name: &'a str,
}

impl AttachCtx<'_> {
    /// FDT path of the queue's published node.
    pub fn queue_fdt_path(&self, direction: ChannelDirection) -> String {
        let mut path = String::from(match direction {
            ChannelDirection::Rx => "/drivers/ndp/rx_queues/",
            ChannelDirection::Tx => "/drivers/ndp/tx_queues/",
        });
        path.push_str(self.queue_name);
        path
    }
}

/// Per-generation controller operations. Four implementations exist:
/// Medusa RX/TX and Calypte RX/TX. The channel holds the trait object and
/// dispatches once per start/stop/sync — never per packet.
pub trait DmaController: Send {
    /// Allocate per-ring resources (descriptor/header/update buffers),
    /// register their mmap windows, publish FDT properties. Returns the
    /// channel pointer mask.
    fn attach_ring(&mut self, ctx: &AttachCtx<'_>, ring: &NdpRing) -> DriverResult<u64>;

    /// Release everything `attach_ring` created.
    fn detach_ring(&mut self, device: &NfbDevice);

    /// Arm the controller; returns the initial hardware pointer.
    fn start(&mut self, ring: &NdpRing) -> DriverResult<u64>;

    /// Hook before the stop sequence begins (Calypte TX under USERSPACE
    /// advances software pointers to the hardware ones here).
    fn stop_prepare(&mut self) {}

    /// One non-blocking stop attempt; see `NdpCtrl::stop` for the
    /// `Again`/`InProgress` contract.
    fn stop_attempt(&mut self) -> DriverResult<()>;

    /// Force the controller down regardless of drain state.
    fn stop_force(&mut self);

    /// Hook after the controller came to rest.
    fn on_stopped(&mut self) {}

    /// Refresh and return the hardware pointer.
    fn get_hwptr(&mut self, ring: &NdpRing) -> u64;

    /// Publish a new software pointer, emitting descriptors as needed.
    fn set_swptr(&mut self, ring: &NdpRing, ptr: u64, cancel: &CancelToken);

    fn get_flags(&self) -> u32;

    /// Request a flag set; returns the set actually in force.
    fn set_flags(&mut self, flags: u32) -> u32;

    /// Byte-granular free space, for controllers that track it.
    fn get_free_space(&mut self) -> Option<u64> {
        None
    }

    fn counters(&self) -> ChannelCounters;
}

struct ChannelState {
    start_count: u32,
    subscriptions_count: u32,
    /// Channel-level flags (EXCLUSIVE); controller-level flags live in the
    /// controller.
    flags: u32,
}

struct ChannelInner {
    ctrl: Box<dyn DmaController>,
    ring: NdpRing,
    hwptr: u64,
    swptr: u64,
    ptrmask: u64,
    locked_sub: Option<*const NdpSubscription>,
    subs: Vec<*const NdpSubscription>,
}

// SAFETY: the raw subscription pointers are only dereferenced under the
// inner lock and each target outlives its presence in the list (start
// inserts, stop removes, destroy requires stopped).
unsafe impl Send for ChannelInner {}

pub struct NdpChannel {
    id: ChannelId,
    name: String,
    frame_size_min: Option<u32>,
    frame_size_max: Option<u32>,
    state: spin::Mutex<ChannelState>,
    inner: nfb_lib::IrqMutex<ChannelInner>,
}

impl NdpChannel {
    /// Build the channel for one controller binding: open its component,
    /// publish the queue node and create the default-sized ring.
    pub fn create(device: &NfbDevice, binding: QueueBinding) -> DriverResult<Box<NdpChannel>> {
        let id = binding.id;
        let name = NfbDevice::queue_node_name(id);

        let ctrl_node = {
            let fdt = device.fdt().read();
            fdt.path_offset(&binding.ctrl_path)?
        };
        let comp = device.comp_open(ctrl_node)?;

        let ctrl: Box<dyn DmaController> = match (binding.generation, id.direction) {
            (CtrlGeneration::Medusa, ChannelDirection::Rx) => {
                Box::new(CtrlV2Rx::new(comp, &binding, name.clone()))
            }
            (CtrlGeneration::Medusa, ChannelDirection::Tx) => {
                Box::new(CtrlV2Tx::new(comp, &binding, name.clone()))
            }
            (CtrlGeneration::Calypte, ChannelDirection::Rx) => {
                Box::new(CtrlV3Rx::new(comp, &binding, name.clone()))
            }
            (CtrlGeneration::Calypte, ChannelDirection::Tx) => {
                Box::new(CtrlV3Tx::new(comp, &binding, name.clone()))
            }
        };

        let channel = Box::new(NdpChannel {
            id,
            name: name.clone(),
            frame_size_min: binding.frame_size_min,
            frame_size_max: binding.frame_size_max,
            state: spin::Mutex::new(ChannelState {
                start_count: 0,
                subscriptions_count: 0,
                flags: 0,
            }),
            inner: nfb_lib::IrqMutex::new(ChannelInner {
                ctrl,
                ring: NdpRing::empty(),
                hwptr: 0,
                swptr: 0,
                ptrmask: 0,
                locked_sub: None,
                subs: Vec::new(),
            }),
        });

        // Publish the queue node with its controller phandle.
        {
            let mut fdt = device.fdt().write();
            let queues = fdt.path_offset(match id.direction {
                ChannelDirection::Rx => "/drivers/ndp/rx_queues",
                ChannelDirection::Tx => "/drivers/ndp/tx_queues",
            })?;
            let node = fdt.add_subnode(queues, &name)?;
            if let Some(phandle) = binding.phandle {
                let _ = fdt.setprop_u32(node, "ctrl", phandle);
            }
            if let Some(pcie) = binding.pcie_index {
                let _ = fdt.setprop_u32(node, "numa", pcie);
            }
        }

        let params = config::params();
        let block_count = params.ndp_ring_size / params.ndp_ring_block_size;
        if let Err(err) = channel.ring_create(device, block_count, params.ndp_ring_block_size) {
            klog_warn!("ndp: queue {}: default ring not created: {}", name, err);
        }

        Ok(channel)
    }

    /// Bare channel over an arbitrary controller, for the in-kernel suites.
    pub(crate) fn new_for_tests(
        id: ChannelId,
        ctrl: Box<dyn DmaController>,
        ptrmask: u64,
    ) -> Box<NdpChannel> {
        Box::new(NdpChannel {
            id,
            name: NfbDevice::queue_node_name(id),
            frame_size_min: None,
            frame_size_max: None,
            state: spin::Mutex::new(ChannelState {
                start_count: 0,
                subscriptions_count: 0,
                flags: 0,
            }),
            inner: nfb_lib::IrqMutex::new(ChannelInner {
                ctrl,
                ring: NdpRing::empty(),
                hwptr: 0,
                swptr: 0,
                ptrmask,
                locked_sub: None,
                subs: Vec::new(),
            }),
        })
    }

    /// Tear the channel down. All subscriptions must be gone.
    pub fn destroy(&self, device: &NfbDevice) {
        self.ring_destroy(device);
        let mut fdt = device.fdt().write();
        let path = AttachCtx {
            device,
            queue_name: &self.name,
        }
        .queue_fdt_path(self.id.direction);
        if let Ok(node) = fdt.path_offset(&path) {
            let _ = fdt.del_node(node);
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn frame_size_min(&self) -> Option<u32> {
        self.frame_size_min
    }

    #[inline]
    pub fn frame_size_max(&self) -> Option<u32> {
        self.frame_size_max
    }

    pub fn ring_size(&self) -> u64 {
        self.inner.lock().ring.size()
    }

    pub fn ptrmask(&self) -> u64 {
        self.inner.lock().ptrmask
    }

    pub fn counters(&self) -> ChannelCounters {
        self.inner.lock().ctrl.counters()
    }

    // -- ring management ----------------------------------------------------

    /// Allocate the ring, register its mmap window, publish its geometry
    /// and hand it to the controller.
    fn ring_create(
        &self,
        device: &NfbDevice,
        block_count: u64,
        block_size: u64,
    ) -> DriverResult<()> {
        if block_count == 0 {
            return Ok(());
        }
        let mut ring = NdpRing::alloc(block_count, block_size)?;

        let writable = self.id.direction == ChannelDirection::Tx;
        let offset = match device.register_mmap(ring.mmap_size(), writable, ring.mmap_segments()) {
            Ok(offset) => offset,
            Err(err) => {
                ring.free();
                return Err(err);
            }
        };
        ring.set_mmap_offset(offset);

        let ctx = AttachCtx {
            device,
            queue_name: &self.name,
        };
        self.update_ring_fdt(device, &ring);

        let mut inner = self.inner.lock();
        let ChannelInner { ctrl, .. } = &mut *inner;
        match ctrl.attach_ring(&ctx, &ring) {
            Ok(ptrmask) => {
                inner.ptrmask = ptrmask;
                inner.ring = ring;
                Ok(())
            }
            Err(err) => {
                drop(inner);
                device.unregister_mmap(offset);
                ring.free();
                Err(err)
            }
        }
    }

    /// Inverse of `ring_create`.
    fn ring_destroy(&self, device: &NfbDevice) {
        let mut inner = self.inner.lock();
        if inner.ring.is_empty() {
            return;
        }
        let offset = inner.ring.mmap_offset();
        inner.ctrl.detach_ring(device);
        inner.ring.free();
        inner.ptrmask = 0;
        drop(inner);
        device.unregister_mmap(offset);
        self.update_ring_fdt(device, &NdpRing::empty());
    }

    /// Keep the published queue node in sync with the ring geometry.
    fn update_ring_fdt(&self, device: &NfbDevice, ring: &NdpRing) {
        let path = AttachCtx {
            device,
            queue_name: &self.name,
        }
        .queue_fdt_path(self.id.direction);
        let mut fdt = device.fdt().write();
        if let Ok(node) = fdt.path_offset(&path) {
            let _ = fdt.setprop_u64(node, "size", ring.size());
            let _ = fdt.setprop_u64(node, "mmap_size", ring.mmap_size());
            let _ = fdt.setprop_u64(node, "mmap_base", ring.mmap_offset());
        }
    }

    /// Resize the ring. Only legal while fully stopped; the previous ring
    /// is restored if the new allocation fails.
    pub fn resize(&self, device: &NfbDevice, size: u64) -> DriverResult<()> {
        if !nfb_lib::alignment::ispow2_u64(size) {
            return Err(DriverError::InvalidArgument);
        }
        let state = self.state.lock();
        if state.start_count != 0 {
            return Err(DriverError::Busy);
        }

        let block_size = config::params().ndp_ring_block_size;
        let block_count = size / block_size;
        let original_size = self.inner.lock().ring.size();

        self.ring_destroy(device);
        match self.ring_create(device, block_count, block_size) {
            Ok(()) => Ok(()),
            Err(err) => {
                if original_size != 0 {
                    let _ = self.ring_create(device, original_size / block_size, block_size);
                }
                Err(err)
            }
        }
    }

    // -- subscription bookkeeping -------------------------------------------

    /// Negotiate flags and account a new subscription.
    ///
    /// The first subscription programs the controller flags; later ones
    /// must request a compatible set. `EXCLUSIVE` is handled by the
    /// channel, everything else by the controller.
    pub fn subscribe(&self, flags: &mut u32) -> DriverResult<()> {
        let mut state = self.state.lock();
        let mask = CHANNEL_FLAG_EXCLUSIVE;
        let requested = *flags;

        let result = if state.subscriptions_count == 0 {
            let granted = self.inner.lock().ctrl.set_flags(requested & !mask);
            *flags = granted;
            if granted != (requested & !mask) {
                Err(DriverError::Permission)
            } else {
                state.flags = requested & mask;
                Ok(())
            }
        } else {
            let current = self.inner.lock().ctrl.get_flags();
            if (requested | state.flags) & mask != 0 {
                Err(DriverError::Permission)
            } else if requested ^ (state.flags | current) != 0 {
                Err(DriverError::Permission)
            } else {
                Ok(())
            }
        };

        if result.is_ok() {
            state.subscriptions_count += 1;
        }
        result
    }

    pub fn unsubscribe(&self, _sub: &NdpSubscription) {
        let mut state = self.state.lock();
        state.subscriptions_count -= 1;
    }

    /// True if a subscription can be created at all (a ring exists).
    pub fn has_ring(&self) -> bool {
        !self.inner.lock().ring.is_empty()
    }

    // -- start / stop -------------------------------------------------------

    /// First start arms the controller; every start registers the
    /// subscription's cursors at the current hardware pointer.
    pub fn start(&self, sub: &NdpSubscription) -> DriverResult<()> {
        let mut state = self.state.lock();

        if state.start_count == 0 {
            let mut inner = self.inner.lock();
            let hwptr = {
                let ChannelInner { ctrl, ring, .. } = &mut *inner;
                ctrl.start(ring)?
            };
            inner.hwptr = hwptr;
            inner.swptr = hwptr;
        }
        state.start_count += 1;

        let mut inner = self.inner.lock();
        sub.set_cursors(inner.hwptr);
        inner.subs.push(sub as *const NdpSubscription);
        Ok(())
    }

    /// Last stop quiesces the controller. `Again` keeps the channel
    /// running and the subscription registered; the caller retries.
    pub fn stop(
        &self,
        sub: &NdpSubscription,
        force: bool,
        cancel: &CancelToken,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();

        {
            let mut inner = self.inner.lock();
            if inner.locked_sub == Some(sub as *const NdpSubscription) {
                inner.locked_sub = None;
            }
        }

        state.start_count -= 1;
        if state.start_count == 0 {
            if let Err(err) = self.stop_controller(force, cancel) {
                state.start_count += 1;
                return Err(err);
            }
        }

        let mut inner = self.inner.lock();
        let sub_ptr = sub as *const NdpSubscription;
        inner.subs.retain(|p| *p != sub_ptr);
        Ok(())
    }

    /// Drive the controller stop protocol: repeated attempts with 10 ms
    /// slices, `InProgress` resetting the short counter, a ~10 s drain
    /// budget for non-forced TX and a force-stop fallback that leaves the
    /// controller dirty.
    fn stop_controller(&self, force: bool, cancel: &CancelToken) -> DriverResult<()> {
        self.inner.lock().ctrl.stop_prepare();

        let mut cnt: u32 = 0;
        let mut slices: u32 = 0;
        loop {
            match self.inner.lock().ctrl.stop_attempt() {
                Ok(()) => {
                    self.inner.lock().ctrl.on_stopped();
                    return Ok(());
                }
                Err(DriverError::InProgress) => cnt = 0,
                Err(DriverError::Again) if !force => return Err(DriverError::Again),
                Err(_) => {}
            }

            busy_wait_ms(10);
            cnt += 1;
            slices += 1;

            if !force && slices >= STOP_DRAIN_MAX_SLICES {
                return Err(DriverError::Again);
            }
            if !(cnt < 10 || (!cancel.is_cancelled() && !force)) {
                break;
            }
        }

        let mut inner = self.inner.lock();
        inner.ctrl.stop_force();
        klog_error!(
            "ndp: queue {} didn't stop in {} msecs. This may be due to firmware error.",
            self.name,
            cnt * 10
        );
        inner.ctrl.on_stopped();
        Ok(())
    }

    // -- sync ---------------------------------------------------------------

    pub fn sync(&self, sub: &NdpSubscription, sync: &mut SyncState, cancel: &CancelToken) {
        match self.id.direction {
            ChannelDirection::Rx => self.rxsync(sub, sync, cancel),
            ChannelDirection::Tx => self.txsync(sub, sync, cancel),
        }
    }

    /// RX: pages are released to hardware only once **all** readers have
    /// consumed them — the hardware-facing pointer follows the
    /// farthest-behind subscription.
    fn rxsync(&self, sub: &NdpSubscription, sync: &mut SyncState, cancel: &CancelToken) {
        sub.store_swptr(sync.swptr);

        let mut inner = self.inner.lock();
        dma_rmb();

        let mut max_lock = 0u64;
        let mut swptr = sub.swptr();
        for &p in inner.subs.iter() {
            // SAFETY: entries are live while registered (see ChannelInner).
            let list_sub = unsafe { &*p };
            let sub_swptr = list_sub.swptr();
            let sub_lock = inner.hwptr.wrapping_sub(sub_swptr) & inner.ptrmask;
            if sub_lock > max_lock {
                max_lock = sub_lock;
                swptr = sub_swptr;
            }
        }

        if swptr != inner.swptr {
            inner.swptr = swptr;
            let ChannelInner { ctrl, ring, .. } = &mut *inner;
            ctrl.set_swptr(ring, swptr, cancel);
        }

        let hwptr = {
            let ChannelInner { ctrl, ring, .. } = &mut *inner;
            ctrl.get_hwptr(ring)
        };
        inner.hwptr = hwptr;
        sub.store_hwptr(hwptr);

        dma_wmb();
        drop(inner);

        sync.hwptr = hwptr;
    }

    /// TX: subscriptions are mutually exclusive at lock granularity; the
    /// holder publishes data and extends or releases its window.
    fn txsync(&self, sub: &NdpSubscription, sync: &mut SyncState, cancel: &CancelToken) {
        sub.store_swptr(sync.swptr);
        sub.store_hwptr(sync.hwptr);

        let mut inner = self.inner.lock();
        dma_rmb();

        let sub_ptr = sub as *const NdpSubscription;
        let holds_lock = inner.locked_sub == Some(sub_ptr);

        if holds_lock || inner.locked_sub.is_none() {
            if holds_lock && sub.hwptr() != inner.swptr {
                // The subscriber published data up to its hwptr.
                inner.swptr = sub.hwptr();
                let swptr = inner.swptr;
                let ChannelInner { ctrl, ring, .. } = &mut *inner;
                ctrl.set_swptr(ring, swptr, cancel);
            }

            let hwptr = {
                let ChannelInner { ctrl, ring, .. } = &mut *inner;
                ctrl.get_hwptr(ring)
            };
            inner.hwptr = hwptr;
            if let Some(free) = inner.ctrl.get_free_space() {
                sync.size = free;
            }

            let chlen = inner
                .hwptr
                .wrapping_sub(inner.swptr)
                .wrapping_sub(1)
                & inner.ptrmask;
            let len = sub.swptr().wrapping_sub(sub.hwptr()) & inner.ptrmask;
            let len = len.min(chlen);

            if holds_lock {
                if len == 0 {
                    inner.locked_sub = None;
                }
            } else if len != 0 {
                inner.locked_sub = Some(sub_ptr);
            }

            sub.store_hwptr(inner.swptr);
            sub.store_swptr(inner.swptr.wrapping_add(len) & inner.ptrmask);
        } else {
            // Another subscription holds the lock: zero-length window.
            sub.store_hwptr(inner.swptr);
            sub.store_swptr(inner.swptr);
        }

        drop(inner);
        sync.hwptr = sub.hwptr();
        sync.swptr = sub.swptr();
    }

    /// Data available to an RX subscription since its last sync.
    pub fn rx_data_available(&self, sub: &NdpSubscription) -> u64 {
        if self.id.direction != ChannelDirection::Rx {
            return 0;
        }
        let mut inner = self.inner.lock();
        let hwptr = {
            let ChannelInner { ctrl, ring, .. } = &mut *inner;
            ctrl.get_hwptr(ring)
        };
        inner.hwptr = hwptr;
        hwptr.wrapping_sub(sub.swptr()) & inner.ptrmask
    }

    // -- flags --------------------------------------------------------------

    pub fn get_flags(&self) -> u32 {
        let state = self.state.lock();
        let flags = self.inner.lock().ctrl.get_flags();
        flags | state.flags
    }

    /// Toggle DISCARD via the controller's read-modify-write protocol.
    /// `Permission` when the controller does not honor the request.
    pub fn set_discard(&self, enable: bool) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        let current = inner.ctrl.get_flags();
        let requested = if enable {
            current | nfb_abi::ndp::CHANNEL_FLAG_DISCARD
        } else {
            current & !nfb_abi::ndp::CHANNEL_FLAG_DISCARD
        };
        let granted = inner.ctrl.set_flags(requested);
        if granted != requested {
            return Err(DriverError::Permission);
        }
        Ok(())
    }

    /// Clear USERSPACE on the controller (used by stop paths and tests).
    pub fn clear_userspace_flag(&self) {
        let mut inner = self.inner.lock();
        let current = inner.ctrl.get_flags();
        let _ = inner.ctrl.set_flags(current & !CHANNEL_FLAG_USERSPACE);
    }
}

// SAFETY: all interior state is behind locks; raw pointers are handled per
// the ChannelInner invariant.
unsafe impl Sync for NdpChannel {}
