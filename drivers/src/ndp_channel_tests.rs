//! Channel sync protocol (over a scripted controller) and the full
//! device attach / ioctl surface over the synthetic firmware.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use nfb_lib::IrqMutex;
use nfb_lib::testing::TestResult;
use nfb_lib::{assert_eq_test, assert_test, pass};

use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::{
    CHANNEL_FLAG_EXCLUSIVE, CHANNEL_FLAG_USE_HEADER, CHANNEL_FLAG_USE_OFFSET, ChannelId,
    SubscribeRequest, SubscriptionId, SyncState,
};

use crate::device::{Ioctl, NfbDevice};
use crate::ndp::CancelToken;
use crate::ndp::channel::{AttachCtx, ChannelCounters, DmaController, NdpChannel};
use crate::ndp::ring::NdpRing;
use crate::ndp::subscription::NdpSubscription;
use crate::testbed;

// ---------------------------------------------------------------------------
// Scripted controller
// ---------------------------------------------------------------------------

struct MockState {
    hwptr: u64,
    swptr_log: Vec<u64>,
    free_space: Option<u64>,
    stop_result: DriverResult<()>,
    started: u32,
    stopped: u32,
}

#[derive(Clone)]
struct MockHandle(Arc<IrqMutex<MockState>>);

impl MockHandle {
    fn new() -> Self {
        Self(Arc::new(IrqMutex::new(MockState {
            hwptr: 0,
            swptr_log: Vec::new(),
            free_space: None,
            stop_result: Ok(()),
            started: 0,
            stopped: 0,
        })))
    }

    fn set_hwptr(&self, value: u64) {
        self.0.lock().hwptr = value;
    }

    fn set_stop_result(&self, result: DriverResult<()>) {
        self.0.lock().stop_result = result;
    }

    fn swptr_log(&self) -> Vec<u64> {
        self.0.lock().swptr_log.clone()
    }

    fn started(&self) -> u32 {
        self.0.lock().started
    }

    fn stopped(&self) -> u32 {
        self.0.lock().stopped
    }
}

struct MockCtrl(MockHandle);

impl DmaController for MockCtrl {
    fn attach_ring(&mut self, _ctx: &AttachCtx<'_>, _ring: &NdpRing) -> DriverResult<u64> {
        Ok(0)
    }

    fn detach_ring(&mut self, _device: &NfbDevice) {}

    fn start(&mut self, _ring: &NdpRing) -> DriverResult<u64> {
        let mut state = self.0.0.lock();
        state.started += 1;
        Ok(state.hwptr)
    }

    fn stop_attempt(&mut self) -> DriverResult<()> {
        let mut state = self.0.0.lock();
        let result = state.stop_result;
        if result.is_ok() {
            state.stopped += 1;
        }
        result
    }

    fn stop_force(&mut self) {
        self.0.0.lock().stopped += 1;
    }

    fn get_hwptr(&mut self, _ring: &NdpRing) -> u64 {
        self.0.0.lock().hwptr
    }

    fn set_swptr(&mut self, _ring: &NdpRing, ptr: u64, _cancel: &CancelToken) {
        self.0.0.lock().swptr_log.push(ptr);
    }

    fn get_flags(&self) -> u32 {
        0
    }

    fn set_flags(&mut self, flags: u32) -> u32 {
        flags
    }

    fn get_free_space(&mut self) -> Option<u64> {
        self.0.0.lock().free_space
    }

    fn counters(&self) -> ChannelCounters {
        ChannelCounters::default()
    }
}

fn mock_channel(id: ChannelId, ptrmask: u64) -> (Box<NdpChannel>, MockHandle) {
    let handle = MockHandle::new();
    let channel = NdpChannel::new_for_tests(id, Box::new(MockCtrl(handle.clone())), ptrmask);
    (channel, handle)
}

// ---------------------------------------------------------------------------
// rxsync / txsync
// ---------------------------------------------------------------------------

const MASK_8M: u64 = 0x7F_FFFF;

pub fn test_rxsync_follows_farthest_behind() -> TestResult {
    let (channel, hw) = mock_channel(ChannelId::rx(0), MASK_8M);
    let cancel = CancelToken::new();

    let slow = NdpSubscription::new(SubscriptionId(1), channel.as_ref() as *const _);
    let fast = NdpSubscription::new(SubscriptionId(2), channel.as_ref() as *const _);
    assert_test!(channel.start(&slow).is_ok());
    assert_test!(channel.start(&fast).is_ok());

    hw.set_hwptr(0x40_0000);

    // The slower reader advances 1 MiB; its cursor is flushed to hardware.
    let mut sync = SyncState {
        swptr: 0x10_0000,
        ..SyncState::default()
    };
    channel.sync(&slow, &mut sync, &cancel);
    assert_eq_test!(sync.hwptr, 0x40_0000);
    assert_eq_test!(hw.swptr_log(), alloc::vec![0x10_0000]);

    // The faster reader advances 4 MiB, but hardware still only gets the
    // slower reader's cursor: no page is released until all have read it.
    let mut sync = SyncState {
        swptr: 0x40_0000,
        ..SyncState::default()
    };
    channel.sync(&fast, &mut sync, &cancel);
    assert_eq_test!(hw.swptr_log(), alloc::vec![0x10_0000]);

    // Once the slower catches up, its new cursor goes out.
    let mut sync = SyncState {
        swptr: 0x40_0000,
        ..SyncState::default()
    };
    channel.sync(&slow, &mut sync, &cancel);
    assert_eq_test!(hw.swptr_log(), alloc::vec![0x10_0000, 0x40_0000]);
    pass!()
}

pub fn test_rxsync_no_progress_is_noop() -> TestResult {
    let (channel, hw) = mock_channel(ChannelId::rx(0), MASK_8M);
    let cancel = CancelToken::new();

    let sub = NdpSubscription::new(SubscriptionId(1), channel.as_ref() as *const _);
    assert_test!(channel.start(&sub).is_ok());

    // swptr == hwptr == 0: nothing to release, nothing to flush.
    let mut sync = SyncState::default();
    channel.sync(&sub, &mut sync, &cancel);
    assert_eq_test!(sync.hwptr, 0);
    assert_test!(hw.swptr_log().is_empty());
    pass!()
}

pub fn test_txsync_lock_protocol() -> TestResult {
    let (channel, hw) = mock_channel(ChannelId::tx(0), 0xFFF);
    let cancel = CancelToken::new();

    let a = NdpSubscription::new(SubscriptionId(1), channel.as_ref() as *const _);
    let b = NdpSubscription::new(SubscriptionId(2), channel.as_ref() as *const _);
    assert_test!(channel.start(&a).is_ok());
    assert_test!(channel.start(&b).is_ok());

    // `a` requests a 100-byte window and takes the TX lock.
    let mut sync = SyncState {
        swptr: 100,
        hwptr: 0,
        size: 0,
    };
    channel.sync(&a, &mut sync, &cancel);
    assert_eq_test!(sync.hwptr, 0);
    assert_eq_test!(sync.swptr, 100);

    // `b` gets a zero-length window while `a` holds the lock.
    let mut sync = SyncState {
        swptr: 50,
        hwptr: 0,
        size: 0,
    };
    channel.sync(&b, &mut sync, &cancel);
    assert_eq_test!(sync.hwptr, sync.swptr, "competing tx window not empty");

    // `a` publishes its 100 bytes and asks for nothing more: the data is
    // pushed to hardware and the lock is released.
    let mut sync = SyncState {
        swptr: 100,
        hwptr: 100,
        size: 0,
    };
    channel.sync(&a, &mut sync, &cancel);
    assert_eq_test!(hw.swptr_log(), alloc::vec![100]);

    // Now `b` can lock a fresh window starting at the published point.
    let mut sync = SyncState {
        swptr: 150,
        hwptr: 100,
        size: 0,
    };
    channel.sync(&b, &mut sync, &cancel);
    assert_eq_test!(sync.hwptr, 100);
    assert_eq_test!(sync.swptr, 150);
    pass!()
}

pub fn test_start_count_arms_once() -> TestResult {
    let (channel, hw) = mock_channel(ChannelId::rx(0), MASK_8M);
    let cancel = CancelToken::new();

    let a = NdpSubscription::new(SubscriptionId(1), channel.as_ref() as *const _);
    let b = NdpSubscription::new(SubscriptionId(2), channel.as_ref() as *const _);
    assert_test!(channel.start(&a).is_ok());
    assert_test!(channel.start(&b).is_ok());
    assert_eq_test!(hw.started(), 1, "controller armed more than once");

    assert_test!(channel.stop(&a, false, &cancel).is_ok());
    assert_eq_test!(hw.stopped(), 0, "controller stopped before last unsub");
    assert_test!(channel.stop(&b, false, &cancel).is_ok());
    assert_eq_test!(hw.stopped(), 1);
    pass!()
}

pub fn test_stop_again_keeps_channel_running() -> TestResult {
    let (channel, hw) = mock_channel(ChannelId::tx(0), 0xFFF);
    let cancel = CancelToken::new();

    let sub = NdpSubscription::new(SubscriptionId(1), channel.as_ref() as *const _);
    assert_test!(channel.start(&sub).is_ok());

    hw.set_stop_result(Err(DriverError::Again));
    assert_eq_test!(
        channel.stop(&sub, false, &cancel),
        Err(DriverError::Again)
    );

    // The channel is still armed: a later forced stop succeeds.
    hw.set_stop_result(Ok(()));
    assert_test!(channel.stop(&sub, true, &cancel).is_ok());
    assert_eq_test!(hw.stopped(), 1);
    pass!()
}

pub fn test_exclusive_flag_blocks_second_subscriber() -> TestResult {
    let (channel, _hw) = mock_channel(ChannelId::rx(0), MASK_8M);

    let mut flags = CHANNEL_FLAG_EXCLUSIVE;
    assert_test!(channel.subscribe(&mut flags).is_ok());

    let mut flags = 0;
    assert_eq_test!(
        channel.subscribe(&mut flags),
        Err(DriverError::Permission)
    );
    pass!()
}

// ---------------------------------------------------------------------------
// Device attach and the ioctl surface
// ---------------------------------------------------------------------------

pub fn test_attach_publishes_queue_nodes() -> TestResult {
    let device = match testbed::attach_device() {
        Ok(device) => device,
        Err(_) => return TestResult::Fail,
    };

    let ndp = match device.ndp() {
        Some(ndp) => ndp,
        None => return TestResult::Fail,
    };
    assert_eq_test!(ndp.channel_count(nfb_abi::ndp::ChannelDirection::Rx), 2);
    assert_eq_test!(ndp.channel_count(nfb_abi::ndp::ChannelDirection::Tx), 2);

    let fdt = device.fdt().read();
    let node = match fdt.path_offset("/drivers/ndp/rx_queues/rx0") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(fdt.getprop_u32(node, "protocol"), Some(2));
    assert_eq_test!(fdt.getprop_u64(node, "size"), Some(4 * 1024 * 1024));
    assert_eq_test!(fdt.getprop_u64(node, "mmap_size"), Some(8 * 1024 * 1024));
    assert_test!(fdt.getprop_u64(node, "hdr_mmap_base").is_some());
    assert_test!(fdt.getprop_u64(node, "off_mmap_base").is_some());
    assert_eq_test!(fdt.getprop_u32(node, "buffer_size"), Some(4096));

    let node = match fdt.path_offset("/drivers/ndp/tx_queues/tx1") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(fdt.getprop_u32(node, "protocol"), Some(3));
    assert_eq_test!(
        fdt.getprop_u32(node, "data_buff_size"),
        Some(testbed::V3_TX_DATA_BUFF_SIZE)
    );
    assert_eq_test!(
        fdt.getprop_u32(node, "hdr_buff_size"),
        Some(testbed::V3_TX_HDR_BUFF_SIZE)
    );

    assert_test!(fdt.path_offset("/drivers/mi").is_ok());
    pass!()
}

pub fn test_read_fdt_truncates_at_totalsize() -> TestResult {
    let device = match testbed::attach_device() {
        Ok(device) => device,
        Err(_) => return TestResult::Fail,
    };
    let total = device.fdt().read().totalsize();

    let mut buf = [0u8; 8];
    assert_eq_test!(device.read_fdt(&mut buf, 0), 8);
    // DTB magic, big-endian.
    assert_eq_test!(&buf[..4], &[0xd0, 0x0d, 0xfe, 0xed]);

    assert_eq_test!(device.read_fdt(&mut buf, total), 0);
    assert_eq_test!(device.read_fdt(&mut buf, total - 3), 3);
    pass!()
}

pub fn test_mmap_requires_exact_match() -> TestResult {
    let device = match testbed::attach_device() {
        Ok(device) => device,
        Err(_) => return TestResult::Fail,
    };
    let fdt = device.fdt().read();
    let node = match fdt.path_offset("/drivers/ndp/rx_queues/rx0") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    let base = fdt.getprop_u64(node, "mmap_base").unwrap_or(u64::MAX);
    let size = fdt.getprop_u64(node, "mmap_size").unwrap_or(0);
    drop(fdt);

    assert_test!(device.mmap(base, size, false).is_ok());
    // Wrong length, wrong offset, and writing an RX window all fail.
    assert_test!(device.mmap(base, size / 2, false).is_err());
    assert_test!(device.mmap(base + 0x1000, size, false).is_err());
    assert_test!(device.mmap(base, size, true).is_err());
    pass!()
}

pub fn test_ioctl_subscribe_start_sync_stop() -> TestResult {
    let device = match testbed::attach_device() {
        Ok(device) => device,
        Err(_) => return TestResult::Fail,
    };
    let mut app = device.open(false);

    let mut req = SubscribeRequest {
        channel: ChannelId::rx(0),
        flags: CHANNEL_FLAG_USE_HEADER | CHANNEL_FLAG_USE_OFFSET,
    };
    let mut id = SubscriptionId(0);
    let ret = device.ioctl(
        &mut app,
        Ioctl::NdpSubscribe {
            req: &mut req,
            id_out: &mut id,
        },
    );
    assert_test!(ret.is_ok(), "subscribe failed");

    let mut sync = SyncState::default();
    assert_test!(
        device
            .ioctl(&mut app, Ioctl::NdpStart { id, sync: &mut sync })
            .is_ok()
    );

    // Medusa RX started: the prefill burst went out to the fake hardware.
    let sdp = testbed::bar_read32(testbed::V2_RX_COMP_BASE + crate::ndp::ctrl::REG_SDP);
    assert_test!(sdp > 0, "rx prefill did not flush SDP");

    // No data, no movement: the sync is a no-op for hardware pointers.
    let mut sync = SyncState::default();
    assert_test!(
        device
            .ioctl(&mut app, Ioctl::NdpSync { id, sync: &mut sync })
            .is_ok()
    );
    assert_eq_test!(sync.hwptr, 0);
    assert_eq_test!(
        testbed::bar_read32(testbed::V2_RX_COMP_BASE + crate::ndp::ctrl::REG_SDP),
        sdp
    );

    assert_test!(
        device
            .ioctl(&mut app, Ioctl::NdpStop { id, force: false })
            .is_ok()
    );
    device.release(app);
    pass!()
}

pub fn test_ioctl_lock_surface() -> TestResult {
    let device = match testbed::attach_device() {
        Ok(device) => device,
        Err(_) => return TestResult::Fail,
    };
    let mut app_a = device.open(false);
    let mut app_b = device.open(false);

    let path = "/firmware/mi_bus/dma_ctrl_rx0";
    assert_test!(
        device
            .ioctl(&mut app_a, Ioctl::LockTryLock { path, features: 0x2 })
            .is_ok()
    );
    assert_eq_test!(
        device.ioctl(&mut app_b, Ioctl::LockTryLock { path, features: 0x2 }),
        Err(DriverError::Busy)
    );

    // Releasing the first app frees the features for the second.
    device.release(app_a);
    assert_test!(
        device
            .ioctl(&mut app_b, Ioctl::LockTryLock { path, features: 0x2 })
            .is_ok()
    );
    device.release(app_b);
    pass!()
}

pub fn test_resize_rules() -> TestResult {
    let device = match testbed::attach_device() {
        Ok(device) => device,
        Err(_) => return TestResult::Fail,
    };
    let ndp = match device.ndp() {
        Some(ndp) => ndp,
        None => return TestResult::Fail,
    };
    let channel = match ndp.channel_by_id(ChannelId::rx(0)) {
        Some(channel) => channel,
        None => return TestResult::Fail,
    };

    assert_eq_test!(
        channel.resize(&device, 3 * 1024 * 1024),
        Err(DriverError::InvalidArgument)
    );

    // Resize while running is refused.
    let sub = NdpSubscription::new(SubscriptionId(7), channel as *const _);
    assert_test!(channel.start(&sub).is_ok());
    assert_eq_test!(
        channel.resize(&device, 8 * 1024 * 1024),
        Err(DriverError::Busy)
    );
    let cancel = CancelToken::new();
    assert_test!(channel.stop(&sub, false, &cancel).is_ok());

    // Stopped: growing the ring republishes the new geometry.
    assert_test!(channel.resize(&device, 8 * 1024 * 1024).is_ok());
    assert_eq_test!(channel.ring_size(), 8 * 1024 * 1024);
    let fdt = device.fdt().read();
    let node = match fdt.path_offset("/drivers/ndp/rx_queues/rx0") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(fdt.getprop_u64(node, "size"), Some(8 * 1024 * 1024));
    pass!()
}

nfb_lib::define_test_suite!(
    ndp_channel,
    [
        test_rxsync_follows_farthest_behind,
        test_rxsync_no_progress_is_noop,
        test_txsync_lock_protocol,
        test_start_count_arms_once,
        test_stop_again_keeps_channel_running,
        test_exclusive_flag_blocks_second_subscriber,
        test_attach_publishes_queue_nodes,
        test_read_fdt_truncates_at_totalsize,
        test_mmap_requires_exact_match,
        test_ioctl_subscribe_start_sync_stop,
        test_ioctl_lock_surface,
        test_resize_rules,
    ]
);
