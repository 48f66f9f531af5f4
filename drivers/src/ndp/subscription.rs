//! One consumer's handle onto a channel, with its private ring cursors.

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::{ChannelDirection, SubscriptionId, SyncState};

use crate::ndp::CancelToken;
use crate::ndp::channel::NdpChannel;

const STATUS_SUBSCRIBED: u8 = 1;
const STATUS_RUNNING: u8 = 2;

pub struct NdpSubscription {
    id: SubscriptionId,
    channel: *const NdpChannel,
    status: AtomicU8,
    swptr: AtomicU64,
    hwptr: AtomicU64,
}

// SAFETY: the channel outlives every subscription (device detach requires
// all subscribers released); cursors are atomics.
unsafe impl Send for NdpSubscription {}
unsafe impl Sync for NdpSubscription {}

impl NdpSubscription {
    pub(crate) fn new(id: SubscriptionId, channel: *const NdpChannel) -> Self {
        Self {
            id,
            channel,
            status: AtomicU8::new(STATUS_SUBSCRIBED),
            swptr: AtomicU64::new(0),
            hwptr: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[inline]
    pub fn channel(&self) -> &NdpChannel {
        // SAFETY: see Send/Sync note above.
        unsafe { &*self.channel }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUNNING
    }

    #[inline]
    pub fn swptr(&self) -> u64 {
        self.swptr.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn hwptr(&self) -> u64 {
        self.hwptr.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn store_swptr(&self, value: u64) {
        self.swptr.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn store_hwptr(&self, value: u64) {
        self.hwptr.store(value, Ordering::Relaxed);
    }

    /// Reset both cursors to the channel's hardware pointer (done while the
    /// channel registers the subscription under its pointer lock).
    pub(crate) fn set_cursors(&self, hwptr: u64) {
        self.swptr.store(hwptr, Ordering::Relaxed);
        self.hwptr.store(hwptr, Ordering::Relaxed);
    }

    /// Arm the subscription. First starter arms the channel's controller.
    pub fn start(&self, sync: &mut SyncState) -> DriverResult<()> {
        if self.status.load(Ordering::Acquire) != STATUS_SUBSCRIBED {
            return Err(DriverError::NotReady);
        }

        self.channel().start(self)?;

        if self.channel().id().direction == ChannelDirection::Rx {
            sync.swptr = self.swptr();
            sync.hwptr = self.hwptr();
        }

        self.status.store(STATUS_RUNNING, Ordering::Release);
        Ok(())
    }

    /// Exchange cursors with the channel.
    pub fn sync(&self, sync: &mut SyncState, cancel: &CancelToken) -> DriverResult<()> {
        if self.status.load(Ordering::Acquire) != STATUS_RUNNING {
            return Err(DriverError::NotReady);
        }
        self.channel().sync(self, sync, cancel);
        Ok(())
    }

    /// Quiesce. `Again` means in-flight TX data is still draining and the
    /// caller should retry (or force).
    pub fn stop(&self, force: bool, cancel: &CancelToken) -> DriverResult<()> {
        if self.status.load(Ordering::Acquire) != STATUS_RUNNING {
            return Err(DriverError::NotReady);
        }
        self.channel().stop(self, force, cancel)?;
        self.status.store(STATUS_SUBSCRIBED, Ordering::Release);
        Ok(())
    }

    /// Bytes ready for an RX subscription since its last sync.
    pub fn rx_data_available(&self) -> u64 {
        if !self.is_running() {
            return 0;
        }
        self.channel().rx_data_available(self)
    }
}
