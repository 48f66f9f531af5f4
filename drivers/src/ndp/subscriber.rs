//! Subscriber: one opener's view of the NDP subsystem.
//!
//! Owns the subscriptions created through it (ids are opaque and local to
//! the subscriber), the cancellation token for its busy-wait loops and the
//! poll-readiness state. Destroy order is always subscriber → its
//! subscriptions → channel bookkeeping.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, Ordering};

use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::{SubscribeRequest, SubscriptionId, SyncState};
use nfb_lib::klog_warn;

use crate::device::NfbDevice;
use crate::lock::AppId;
use crate::ndp::CancelToken;
use crate::ndp::subscription::NdpSubscription;

pub struct NdpSubscriber {
    device: *const NfbDevice,
    app: AppId,
    subscriptions: Vec<Box<NdpSubscription>>,
    next_id: u32,
    /// RX data became available since the last poll.
    wake_rx: AtomicBool,
    cancel: CancelToken,
}

// SAFETY: the device outlives all subscribers (release precedes detach).
unsafe impl Send for NdpSubscriber {}

impl NdpSubscriber {
    pub(crate) fn new(device: *const NfbDevice, app: AppId) -> Box<NdpSubscriber> {
        Box::new(NdpSubscriber {
            device,
            app,
            subscriptions: Vec::new(),
            next_id: 1,
            wake_rx: AtomicBool::new(false),
            cancel: CancelToken::new(),
        })
    }

    #[inline]
    fn device(&self) -> &NfbDevice {
        // SAFETY: see Send note above.
        unsafe { &*self.device }
    }

    #[inline]
    pub fn app(&self) -> AppId {
        self.app
    }

    /// Cancellation token for this subscriber's blocking loops. The
    /// platform cancels it when the owning task is being killed.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn by_id(&self, id: SubscriptionId) -> DriverResult<&NdpSubscription> {
        self.subscriptions
            .iter()
            .map(|sub| sub.as_ref())
            .find(|sub| sub.id() == id)
            .ok_or(DriverError::NoDevice)
    }

    /// Bind a new subscription to the requested channel, negotiating
    /// flags. The granted flag set is written back into `req`.
    pub fn subscribe(&mut self, req: &mut SubscribeRequest) -> DriverResult<SubscriptionId> {
        let ndp = self.device().ndp().ok_or(DriverError::NoDevice)?;
        let channel = ndp
            .channel_by_id(req.channel)
            .ok_or(DriverError::NoDevice)?;
        if !channel.has_ring() {
            return Err(DriverError::NotReady);
        }

        channel.subscribe(&mut req.flags)?;

        let channel_ptr = channel as *const _;
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions
            .push(Box::new(NdpSubscription::new(id, channel_ptr)));
        Ok(id)
    }

    pub fn start(&self, id: SubscriptionId, sync: &mut SyncState) -> DriverResult<()> {
        self.by_id(id)?.start(sync)
    }

    pub fn sync(&self, id: SubscriptionId, sync: &mut SyncState) -> DriverResult<()> {
        self.by_id(id)?.sync(sync, &self.cancel)
    }

    pub fn stop(&self, id: SubscriptionId, force: bool) -> DriverResult<()> {
        self.by_id(id)?.stop(force, &self.cancel)
    }

    /// Destroy one subscription. Must be stopped first; running
    /// subscriptions are stopped with force as a fallback.
    pub fn destroy_subscription(&mut self, id: SubscriptionId) -> DriverResult<()> {
        let index = self
            .subscriptions
            .iter()
            .position(|sub| sub.id() == id)
            .ok_or(DriverError::NoDevice)?;

        let sub = &self.subscriptions[index];
        if sub.is_running() {
            if sub.stop(false, &self.cancel).is_err() {
                let _ = sub.stop(true, &self.cancel);
            }
        }
        sub.channel().unsubscribe(sub);
        self.subscriptions.remove(index);
        Ok(())
    }

    /// Largest amount of RX data waiting on any of this subscriber's
    /// subscriptions.
    pub fn new_data(&self) -> u64 {
        self.subscriptions
            .iter()
            .map(|sub| sub.rx_data_available())
            .max()
            .unwrap_or(0)
    }

    /// Poll hook: true when RX data is pending. The wake flag is a
    /// one-shot set by the poll timer and cleared on observation.
    pub fn poll(&self) -> bool {
        if self.wake_rx.swap(false, Ordering::AcqRel) {
            return true;
        }
        if self.new_data() > 0 {
            self.wake_rx.store(false, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Timer callback: re-scan for RX data and latch the wake flag.
    pub fn poll_timer_tick(&self) -> bool {
        if self.new_data() > 0 {
            self.wake_rx.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Release everything: stop and destroy all subscriptions.
    pub fn destroy(mut self: Box<Self>) {
        self.cancel.cancel();
        let ids: Vec<SubscriptionId> =
            self.subscriptions.iter().map(|sub| sub.id()).collect();
        for id in ids {
            if let Err(err) = self.destroy_subscription(id) {
                klog_warn!("ndp: subscription {:?} not destroyed cleanly: {}", id, err);
            }
        }
    }
}
