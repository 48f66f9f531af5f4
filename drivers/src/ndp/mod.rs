//! NDP: the network data plane.
//!
//! One [`NdpChannel`] per DMA controller discovered in the firmware FDT,
//! each owning a ring buffer and a controller implementation (Medusa/v2 or
//! Calypte/v3, RX or TX). Consumers attach through [`NdpSubscriber`] /
//! subscription handles and drive the queue with start/sync/stop.

pub mod binding;
pub mod channel;
pub mod ctrl;
pub mod ctrl_v2;
pub mod ctrl_v3;
pub mod ring;
pub mod subscriber;
pub mod subscription;

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, Ordering, fence};

use nfb_abi::error::DriverResult;
use nfb_abi::ndp::{ChannelDirection, ChannelId};
use nfb_lib::{klog_info, klog_warn};

use crate::device::NfbDevice;
use crate::ndp::binding::QueueBinding;
use crate::ndp::channel::NdpChannel;

/// Read barrier before consuming DMA-written memory (update buffers, header
/// rings).
#[inline(always)]
pub(crate) fn dma_rmb() {
    fence(Ordering::Acquire);
}

/// Write barrier before telling the card about new descriptors/pointers.
#[inline(always)]
pub(crate) fn dma_wmb() {
    fence(Ordering::Release);
}

/// Cooperative cancellation flag checked inside TX busy-wait and stop
/// loops; the platform sets it when the calling task is being killed.
pub struct CancelToken(AtomicBool);

impl CancelToken {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The NDP subsystem of one device.
pub struct Ndp {
    channels: Vec<Box<NdpChannel>>,
}

impl Ndp {
    /// Discover DMA controllers in the firmware FDT and create one channel
    /// per controller, with dense per-direction indices.
    pub fn attach(device: &mut NfbDevice) -> DriverResult<Ndp> {
        {
            let mut fdt = device.fdt().write();
            let drivers = match fdt.path_offset("/drivers") {
                Ok(node) => node,
                Err(_) => {
                    let root = fdt.root();
                    fdt.add_subnode(root, "drivers")?
                }
            };
            let ndp = match fdt.subnode_offset(drivers, "ndp") {
                Ok(node) => node,
                Err(_) => fdt.add_subnode(drivers, "ndp")?,
            };
            let _ = fdt.add_subnode(ndp, "rx_queues");
            let ndp = fdt.path_offset("/drivers/ndp")?;
            let _ = fdt.add_subnode(ndp, "tx_queues");
        }

        // Collect controller bindings before any further FDT edits.
        let mut bindings: Vec<QueueBinding> = Vec::new();
        {
            let fdt = device.fdt().read();
            let mut rx_index = 0u32;
            let mut tx_index = 0u32;
            for compat in binding::CONTROLLER_COMPATIBLES {
                let mut offset = None;
                while let Some(node) = fdt.node_offset_by_compatible(offset, compat.string) {
                    offset = Some(node);
                    let index = match compat.direction {
                        ChannelDirection::Rx => {
                            let i = rx_index;
                            rx_index += 1;
                            i
                        }
                        ChannelDirection::Tx => {
                            let i = tx_index;
                            tx_index += 1;
                            i
                        }
                    };
                    let id = ChannelId {
                        direction: compat.direction,
                        index,
                    };
                    match QueueBinding::from_fdt(&fdt, node, compat, id) {
                        Ok(binding) => bindings.push(binding),
                        Err(err) => {
                            klog_warn!("ndp: queue {} binding rejected: {}", id, err);
                        }
                    }
                }
            }
        }

        let mut channels = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let id = binding.id;
            match NdpChannel::create(device, binding) {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    klog_warn!("ndp: queue {} not attached: {}", id, err);
                }
            }
        }

        klog_info!("ndp: {} queues attached", channels.len());
        Ok(Ndp { channels })
    }

    /// Tear down all channels. Every subscription must already be stopped
    /// and destroyed.
    pub fn detach(self, device: &NfbDevice) {
        for channel in &self.channels {
            channel.destroy(device);
        }
    }

    pub fn channel_by_id(&self, id: ChannelId) -> Option<&NdpChannel> {
        self.channels
            .iter()
            .map(|c| c.as_ref())
            .find(|c| c.id() == id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &NdpChannel> {
        self.channels.iter().map(|c| c.as_ref())
    }

    pub fn channel_count(&self, direction: ChannelDirection) -> usize {
        self.channels
            .iter()
            .filter(|c| c.id().direction == direction)
            .count()
    }
}
