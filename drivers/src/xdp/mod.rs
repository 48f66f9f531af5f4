//! XDP adapter: express-data-path consumption of NDP queues.
//!
//! Each adapter channel pairs one RX and one TX Medusa queue and runs them
//! through its own controller instances (the component lock arbitrates
//! against the character-device data path). Two buffer modes exist per
//! channel, switchable while the rest of the device keeps running:
//!
//! - **page-pool** (default): buffers come from a driver-owned DMA pool;
//!   received frames run through the attached program and are passed,
//!   dropped, retransmitted in place or redirected.
//! - **XSK**: buffers come from a user-provided frame pool; TX is driven
//!   by the user ring with in-order completions.

pub mod ctrl;
pub mod napi;
pub mod pool;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::ChannelDirection;
use nfb_lib::{IrqMutex, klog_info, klog_warn};

use crate::device::NfbDevice;
use crate::ndp::binding::{COMPAT_NDP_RX, COMPAT_NDP_TX};
use crate::xdp::ctrl::{XCtrl, XCtrlKind};
use crate::xdp::napi::NapiContext;
use crate::xdp::pool::{PagePool, XskPool};

/// Unit of RX refill and poll processing.
pub const XDP_PACKET_BURST: u32 = 64;

/// Descriptors per XDP queue.
pub const XDP_DESC_COUNT: u32 = 4096;

/// Minimum Ethernet frame; shorter TX frames are padded in place.
pub const ETH_ZLEN: u32 = 60;

/// Verdict of an XDP program over one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XdpAction {
    Pass,
    Drop,
    Tx,
    Redirect,
}

/// The attached packet program. `None` behaves as `Pass`-everything.
pub trait XdpProgram: Send + Sync {
    fn run(&self, frame: &mut [u8]) -> XdpAction;
}

/// Where passed and redirected frames go.
pub trait FrameSink: Send + Sync {
    /// Deliver a received frame up the stack.
    fn deliver(&self, queue: u32, frame: &[u8]);

    /// Hand a redirected frame off; default delivery keeps traffic flowing
    /// when no redirect target is wired.
    fn redirect(&self, queue: u32, frame: &[u8]) {
        self.deliver(queue, frame);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XdpQueueStats {
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub(crate) struct StatsCell {
    packets: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

impl StatsCell {
    pub(crate) fn count(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn drop_one(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> XdpQueueStats {
        XdpQueueStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

bitflags::bitflags! {
    /// Channel lifecycle bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct ChannelStatus: u32 {
        const RUNNING = 1 << 0;
        const XSK = 1 << 1;
    }
}

/// One RX queue driven by the adapter.
pub struct XdpRxQueue {
    pub(crate) ctrl: IrqMutex<Option<XCtrl>>,
    pub napi: NapiContext,
    pub(crate) stats: StatsCell,
}

/// One TX queue driven by the adapter.
pub struct XdpTxQueue {
    pub(crate) ctrl: IrqMutex<Option<XCtrl>>,
    pub napi: NapiContext,
    pub(crate) stats: StatsCell,
}

struct ChannelState {
    status: ChannelStatus,
    xsk_pool: Option<XskPool>,
}

/// One RX/TX queue pair.
pub struct XdpChannel {
    device: *const NfbDevice,
    index: u32,
    rx_ctrl_path: String,
    tx_ctrl_path: String,
    pub rxq: XdpRxQueue,
    pub txq: XdpTxQueue,
    state: spin::Mutex<ChannelState>,
}

// SAFETY: the device outlives the adapter; queue state is behind locks.
unsafe impl Send for XdpChannel {}
unsafe impl Sync for XdpChannel {}

impl XdpChannel {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    fn device(&self) -> &NfbDevice {
        // SAFETY: see Send/Sync note.
        unsafe { &*self.device }
    }

    pub fn rx_stats(&self) -> XdpQueueStats {
        self.rxq.stats.snapshot()
    }

    pub fn tx_stats(&self) -> XdpQueueStats {
        self.txq.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().status.contains(ChannelStatus::RUNNING)
    }

    pub fn is_xsk_mode(&self) -> bool {
        self.state.lock().status.contains(ChannelStatus::XSK)
    }

    fn build_ctrls(&self, kind_rx: XCtrlKind, kind_tx: XCtrlKind) -> DriverResult<(XCtrl, XCtrl)> {
        let device = self.device();
        let rx_node = {
            let fdt = device.fdt().read();
            fdt.path_offset(&self.rx_ctrl_path)?
        };
        let rx = XCtrl::alloc(
            device.comp_open(rx_node)?,
            ChannelDirection::Rx,
            XDP_DESC_COUNT,
            kind_rx,
        )?;
        let tx_node = {
            let fdt = device.fdt().read();
            fdt.path_offset(&self.tx_ctrl_path)?
        };
        let tx = match XCtrl::alloc(
            device.comp_open(tx_node)?,
            ChannelDirection::Tx,
            XDP_DESC_COUNT,
            kind_tx,
        ) {
            Ok(tx) => tx,
            Err(err) => {
                rx.destroy();
                return Err(err);
            }
        };
        Ok((rx, tx))
    }

    /// Start the channel in page-pool mode.
    pub fn start_pp(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.status.contains(ChannelStatus::RUNNING) {
            return Err(DriverError::Busy);
        }

        let pool = PagePool::alloc(XDP_DESC_COUNT)?;
        let (mut rx, mut tx) = self.build_ctrls(
            XCtrlKind::PagePool(pool.clone()),
            XCtrlKind::PagePool(pool),
        )?;
        if let Err(err) = rx.start() {
            rx.destroy();
            tx.destroy();
            return Err(err);
        }
        if let Err(err) = tx.start() {
            let _ = rx.stop();
            rx.destroy();
            tx.destroy();
            return Err(err);
        }

        *self.rxq.ctrl.lock() = Some(rx);
        *self.txq.ctrl.lock() = Some(tx);
        state.status = ChannelStatus::RUNNING;
        Ok(())
    }

    /// Start the channel in XSK mode with the pool recorded by
    /// `setup_xsk_pool`.
    fn start_xsk(&self, state: &mut ChannelState) -> DriverResult<()> {
        if state.status.contains(ChannelStatus::RUNNING) {
            return Err(DriverError::Busy);
        }
        let pool = state.xsk_pool.clone().ok_or(DriverError::InvalidArgument)?;

        let (mut rx, mut tx) =
            self.build_ctrls(XCtrlKind::Xsk(pool.clone()), XCtrlKind::Xsk(pool))?;
        if let Err(err) = rx.start() {
            rx.destroy();
            tx.destroy();
            return Err(err);
        }
        if let Err(err) = tx.start() {
            let _ = rx.stop();
            rx.destroy();
            tx.destroy();
            return Err(err);
        }

        *self.rxq.ctrl.lock() = Some(rx);
        *self.txq.ctrl.lock() = Some(tx);
        state.status = ChannelStatus::RUNNING | ChannelStatus::XSK;
        Ok(())
    }

    /// Stop both queues and release their controllers.
    pub fn stop(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if !state.status.contains(ChannelStatus::RUNNING) {
            return Err(DriverError::InvalidArgument);
        }

        if let Some(mut rx) = self.rxq.ctrl.lock().take() {
            let _ = rx.stop();
            rx.destroy();
        }
        if let Some(mut tx) = self.txq.ctrl.lock().take() {
            let _ = tx.stop();
            tx.destroy();
        }
        state.status.remove(ChannelStatus::RUNNING);
        Ok(())
    }

    /// Switch this queue to AF_XDP operation backed by `pool`.
    /// Other channels are unaffected.
    pub fn setup_xsk_pool(&self, pool: XskPool) -> DriverResult<()> {
        let _ = self.stop();
        let mut state = self.state.lock();
        state.xsk_pool = Some(pool);
        let ret = self.start_xsk(&mut state);
        drop(state);
        match ret {
            Ok(()) => {
                klog_info!("nfb_xdp: channel {} switched to AF_XDP operation", self.index);
                Ok(())
            }
            Err(err) => {
                klog_warn!(
                    "nfb_xdp: failed to start channel {}, channel unusable",
                    self.index
                );
                Err(err)
            }
        }
    }

    /// Return this queue to default page-pool operation.
    pub fn teardown_xsk_pool(&self) -> DriverResult<()> {
        let _ = self.stop();
        {
            let mut state = self.state.lock();
            state.xsk_pool = None;
        }
        let ret = self.start_pp();
        match ret {
            Ok(()) => {
                klog_info!("nfb_xdp: channel {} switched to XDP operation", self.index);
                Ok(())
            }
            Err(err) => {
                klog_warn!(
                    "nfb_xdp: failed to start channel {}, channel unusable",
                    self.index
                );
                Err(err)
            }
        }
    }
}

/// The per-device XDP adapter.
pub struct XdpAdapter {
    channels: Vec<Box<XdpChannel>>,
    program: IrqMutex<Option<Box<dyn XdpProgram>>>,
    sink: Box<dyn FrameSink>,
}

impl XdpAdapter {
    /// Pair up Medusa RX and TX controllers from the firmware tree.
    /// Calypte queues are skipped: the express path drives the v2 protocol.
    pub fn attach(device: &NfbDevice, sink: Box<dyn FrameSink>) -> DriverResult<XdpAdapter> {
        let mut rx_paths = Vec::new();
        let mut tx_paths = Vec::new();
        {
            let fdt = device.fdt().read();
            let mut offset = None;
            while let Some(node) = fdt.node_offset_by_compatible(offset, COMPAT_NDP_RX) {
                offset = Some(node);
                if let Some(path) = fdt.get_path(node) {
                    rx_paths.push(path);
                }
            }
            let mut offset = None;
            while let Some(node) = fdt.node_offset_by_compatible(offset, COMPAT_NDP_TX) {
                offset = Some(node);
                if let Some(path) = fdt.get_path(node) {
                    tx_paths.push(path);
                }
            }
        }

        let pairs = rx_paths.len().min(tx_paths.len());
        let mut channels = Vec::with_capacity(pairs);
        for (index, (rx_ctrl_path, tx_ctrl_path)) in
            rx_paths.into_iter().zip(tx_paths).enumerate()
        {
            channels.push(Box::new(XdpChannel {
                device: device as *const NfbDevice,
                index: index as u32,
                rx_ctrl_path,
                tx_ctrl_path,
                rxq: XdpRxQueue {
                    ctrl: IrqMutex::new(None),
                    napi: NapiContext::new(XDP_PACKET_BURST),
                    stats: StatsCell::default(),
                },
                txq: XdpTxQueue {
                    ctrl: IrqMutex::new(None),
                    napi: NapiContext::new(XDP_PACKET_BURST),
                    stats: StatsCell::default(),
                },
                state: spin::Mutex::new(ChannelState {
                    status: ChannelStatus::empty(),
                    xsk_pool: None,
                }),
            }));
        }

        klog_info!("nfb_xdp: {} channels available", channels.len());
        Ok(XdpAdapter {
            channels,
            program: IrqMutex::new(None),
            sink,
        })
    }

    pub fn channel(&self, index: u32) -> Option<&XdpChannel> {
        self.channels.get(index as usize).map(|c| c.as_ref())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Swap the attached program; the old one is returned to the caller
    /// for teardown.
    pub fn setup_prog(&self, prog: Option<Box<dyn XdpProgram>>) -> Option<Box<dyn XdpProgram>> {
        let mut slot = self.program.lock();
        let old = core::mem::replace(&mut *slot, prog);
        klog_info!("nfb_xdp: program swapped");
        old
    }

    /// One RX poll round on a channel: refill descriptors and process up
    /// to `budget` frames through the program. Returns frames processed.
    pub fn rx_poll(&self, index: u32, budget: u32) -> u32 {
        let Some(channel) = self.channel(index) else {
            return 0;
        };
        let mut guard = channel.rxq.ctrl.lock();
        let Some(ctrl) = guard.as_mut() else {
            return 0;
        };
        let program = self.program.lock();
        let mut tx_guard = channel.txq.ctrl.lock();
        ctrl.rx_poll(
            budget,
            program.as_deref(),
            self.sink.as_ref(),
            tx_guard.as_mut(),
            channel,
        )
    }

    /// One TX poll round: reclaim completions (and in XSK mode submit user
    /// descriptors). Returns descriptors completed.
    pub fn tx_poll(&self, index: u32, budget: u32) -> u32 {
        let Some(channel) = self.channel(index) else {
            return 0;
        };
        let mut guard = channel.txq.ctrl.lock();
        match guard.as_mut() {
            Some(ctrl) => ctrl.tx_poll(budget, channel),
            None => 0,
        }
    }

    /// Transmit one frame from the stack on the queue pair `index`
    /// (netdev-style xmit).
    pub fn start_xmit(&self, index: u32, frame: &[u8]) -> DriverResult<()> {
        let Some(channel) = self.channel(index) else {
            return Err(DriverError::NoDevice);
        };
        let mut guard = channel.txq.ctrl.lock();
        let ctrl = guard.as_mut().ok_or(DriverError::NotReady)?;
        ctrl.tx_submit_copy(frame, channel)
    }

    /// Bring every channel up in page-pool mode.
    pub fn up(&self) {
        for channel in &self.channels {
            if let Err(err) = channel.start_pp() {
                klog_warn!(
                    "nfb_xdp: failed to start channel {} (error: {})",
                    channel.index,
                    err
                );
            }
        }
    }

    /// Stop every channel.
    pub fn down(&self) {
        for channel in &self.channels {
            let _ = channel.stop();
        }
    }
}
