//! XDP adapter tests: pool accounting, program dispatch, in-place
//! retransmit, copy-xmit padding, XSK completion ordering and the
//! page-pool ↔ XSK mode switch.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use nfb_lib::IrqMutex;
use nfb_lib::testing::TestResult;
use nfb_lib::{assert_eq_test, assert_test, pass};

use nfb_abi::ndp::ChannelDirection;
use nfb_mm::dma::dma_alloc_coherent;

use crate::device::NfbDevice;
use crate::ndp::ctrl::REG_SDP;
use crate::xdp::ctrl::{XCtrl, XCtrlKind};
use crate::xdp::pool::{PagePool, XskDesc, XskPool};
use crate::xdp::{ETH_ZLEN, FrameSink, XdpAction, XdpAdapter, XdpProgram};
use crate::testbed;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SinkState {
    delivered: u32,
    redirected: u32,
    last: Vec<u8>,
}

#[derive(Clone, Default)]
struct TestSink(Arc<IrqMutex<SinkState>>);

impl FrameSink for TestSink {
    fn deliver(&self, _queue: u32, frame: &[u8]) {
        let mut state = self.0.lock();
        state.delivered += 1;
        state.last = frame.to_vec();
    }

    fn redirect(&self, _queue: u32, _frame: &[u8]) {
        self.0.lock().redirected += 1;
    }
}

#[derive(Clone, Default)]
struct ScriptedProgram(Arc<IrqMutex<VecDeque<XdpAction>>>);

impl ScriptedProgram {
    fn push(&self, action: XdpAction) {
        self.0.lock().push_back(action);
    }
}

impl XdpProgram for ScriptedProgram {
    fn run(&self, _frame: &mut [u8]) -> XdpAction {
        self.0.lock().pop_front().unwrap_or(XdpAction::Pass)
    }
}

const NB_DESC: u32 = 256;

struct Fixture {
    device: Box<NfbDevice>,
    adapter: XdpAdapter,
    sink: TestSink,
}

fn fixture() -> Option<Fixture> {
    let device = testbed::attach_device().ok()?;
    let sink = TestSink::default();
    let adapter = XdpAdapter::attach(&device, Box::new(sink.clone())).ok()?;
    if adapter.channel_count() != 1 {
        return None;
    }
    Some(Fixture {
        device,
        adapter,
        sink,
    })
}

fn build_ctrl(
    device: &NfbDevice,
    path: &str,
    direction: ChannelDirection,
    kind: XCtrlKind,
) -> Option<XCtrl> {
    let node = device.fdt().read().path_offset(path).ok()?;
    let comp = device.comp_open(node).ok()?;
    let mut ctrl = XCtrl::alloc(comp, direction, NB_DESC, kind).ok()?;
    ctrl.start().ok()?;
    Some(ctrl)
}

fn rx_path() -> &'static str {
    "/firmware/mi_bus/dma_ctrl_rx0"
}

fn tx_path() -> &'static str {
    "/firmware/mi_bus/dma_ctrl_tx0"
}

/// Pretend the card completed descriptors/frames by writing the Medusa
/// update buffer.
fn fake_hw_update(ctrl: &mut XCtrl, hdp: u32, hhp: u32) {
    let update = ctrl.update_region().virt;
    // SAFETY: live update buffer owned by the controller under test.
    unsafe {
        core::ptr::write_volatile(update.as_mut_ptr::<u32>(), hdp);
        core::ptr::write_volatile(update.as_mut_ptr::<u32>().add(1), hhp);
    }
}

// ---------------------------------------------------------------------------
// Page-pool mode
// ---------------------------------------------------------------------------

pub fn test_pp_fill_posts_one_burst() -> TestResult {
    let Some(fx) = fixture() else {
        return TestResult::Fail;
    };
    let pool = match PagePool::alloc(128) {
        Ok(pool) => pool,
        Err(_) => return TestResult::Fail,
    };
    let Some(mut rx) = build_ctrl(
        &fx.device,
        rx_path(),
        ChannelDirection::Rx,
        XCtrlKind::PagePool(pool.clone()),
    ) else {
        return TestResult::Fail;
    };
    let Some(channel) = fx.adapter.channel(0) else {
        return TestResult::Fail;
    };

    // A zero-budget poll still refills the descriptor ring.
    rx.rx_poll(0, None, &fx.sink, None, channel);

    assert_eq_test!(pool.available(), 128 - 64);
    // First descriptor after start carries the upper address.
    assert_eq_test!(rx.desc_ring().get(0).desc_type(), 0);
    assert_eq_test!(rx.desc_ring().get(1).desc_type(), 2);
    assert_eq_test!(
        testbed::bar_read32(testbed::V2_RX_COMP_BASE + REG_SDP),
        65
    );
    pass!()
}

pub fn test_pp_program_actions() -> TestResult {
    let Some(fx) = fixture() else {
        return TestResult::Fail;
    };
    let pool = match PagePool::alloc(128) {
        Ok(pool) => pool,
        Err(_) => return TestResult::Fail,
    };
    let Some(mut rx) = build_ctrl(
        &fx.device,
        rx_path(),
        ChannelDirection::Rx,
        XCtrlKind::PagePool(pool.clone()),
    ) else {
        return TestResult::Fail;
    };
    let Some(mut tx) = build_ctrl(
        &fx.device,
        tx_path(),
        ChannelDirection::Tx,
        XCtrlKind::PagePool(pool.clone()),
    ) else {
        return TestResult::Fail;
    };
    let Some(channel) = fx.adapter.channel(0) else {
        return TestResult::Fail;
    };

    // Fill, then let the fake hardware complete four frames.
    rx.rx_poll(0, None, &fx.sink, None, channel);
    if let Some(hdrs) = rx.hdrs_ring() {
        for i in 0..4 {
            hdrs.set(i, crate::ndp::ctrl::NdpHdr::new(100, 0, 0, 1));
        }
    }
    fake_hw_update(&mut rx, 0, 4);

    let program = ScriptedProgram::default();
    program.push(XdpAction::Pass);
    program.push(XdpAction::Drop);
    program.push(XdpAction::Tx);
    program.push(XdpAction::Redirect);

    let processed = rx.rx_poll(64, Some(&program), &fx.sink, Some(&mut tx), channel);
    assert_eq_test!(processed, 4);

    let sink = fx.sink.0.lock();
    assert_eq_test!(sink.delivered, 1);
    assert_eq_test!(sink.redirected, 1);
    assert_eq_test!(sink.last.len(), 100);
    drop(sink);

    assert_eq_test!(channel.rx_stats().packets, 2);
    assert_eq_test!(channel.rx_stats().dropped, 1);
    // The in-place retransmit reached the TX ring: address update plus one
    // data descriptor of the received length.
    assert_eq_test!(channel.tx_stats().packets, 1);
    assert_eq_test!(tx.desc_ring().get(0).desc_type(), 0);
    assert_eq_test!(tx.desc_ring().get(1).desc_type(), 2);
    assert_eq_test!(tx.desc_ring().get(1).data_len(), 100);

    // Pool accounting: the second poll round refilled the remaining 64
    // frames before processing, so after 4 completions 3 recycled frames
    // remain free and 1 is parked in the TX ring.
    assert_eq_test!(pool.available(), 3);
    // Completion returns the parked frame.
    let tx_sdp = testbed::bar_read32(testbed::V2_TX_COMP_BASE + REG_SDP);
    fake_hw_update(&mut tx, tx_sdp, 0);
    tx.tx_poll(64, channel);
    assert_eq_test!(pool.available(), 4);
    pass!()
}

pub fn test_xmit_copy_pads_short_frames() -> TestResult {
    let Some(fx) = fixture() else {
        return TestResult::Fail;
    };
    let pool = match PagePool::alloc(16) {
        Ok(pool) => pool,
        Err(_) => return TestResult::Fail,
    };
    let Some(mut tx) = build_ctrl(
        &fx.device,
        tx_path(),
        ChannelDirection::Tx,
        XCtrlKind::PagePool(pool.clone()),
    ) else {
        return TestResult::Fail;
    };
    let Some(channel) = fx.adapter.channel(0) else {
        return TestResult::Fail;
    };

    assert_test!(tx.tx_submit_copy(&[0xAB], channel).is_ok());

    // type0 + data descriptor, padded to the minimum Ethernet frame.
    assert_eq_test!(tx.desc_ring().get(0).desc_type(), 0);
    let data = tx.desc_ring().get(1);
    assert_eq_test!(data.data_len(), ETH_ZLEN as u16);

    // The first pool slot took the copy: one marker byte, zero padding.
    let frame = pool.frame_ptr(0);
    // SAFETY: slot 0 was just populated by the copy path.
    let bytes = unsafe { core::slice::from_raw_parts(frame, ETH_ZLEN as usize) };
    assert_eq_test!(bytes[0], 0xAB);
    assert_test!(bytes[1..].iter().all(|&b| b == 0), "padding not zeroed");
    pass!()
}

// ---------------------------------------------------------------------------
// XSK mode
// ---------------------------------------------------------------------------

pub fn test_xsk_rx_delivers_to_user_ring() -> TestResult {
    let Some(fx) = fixture() else {
        return TestResult::Fail;
    };
    let region = match dma_alloc_coherent(64 * 2048) {
        Ok(region) => region,
        Err(_) => return TestResult::Fail,
    };
    let pool = match XskPool::new(region, 2048) {
        Ok(pool) => pool,
        Err(_) => return TestResult::Fail,
    };
    let Some(mut rx) = build_ctrl(
        &fx.device,
        rx_path(),
        ChannelDirection::Rx,
        XCtrlKind::Xsk(pool.clone()),
    ) else {
        return TestResult::Fail;
    };
    let Some(channel) = fx.adapter.channel(0) else {
        return TestResult::Fail;
    };

    pool.fill_enqueue(4096);
    rx.rx_poll(0, None, &fx.sink, None, channel);

    if let Some(hdrs) = rx.hdrs_ring() {
        hdrs.set(0, crate::ndp::ctrl::NdpHdr::new(80, 0, 0, 0));
    }
    fake_hw_update(&mut rx, 0, 1);
    let processed = rx.rx_poll(64, None, &fx.sink, None, channel);
    assert_eq_test!(processed, 1);

    assert_eq_test!(
        pool.rx_dequeue(),
        Some(XskDesc {
            addr: 4096,
            len: 80
        })
    );
    assert_eq_test!(pool.rx_dequeue(), None);
    pass!()
}

pub fn test_xsk_completions_in_submission_order() -> TestResult {
    let Some(fx) = fixture() else {
        return TestResult::Fail;
    };
    let region = match dma_alloc_coherent(64 * 2048) {
        Ok(region) => region,
        Err(_) => return TestResult::Fail,
    };
    let pool_size = region.size;
    let pool = match XskPool::new(region, 2048) {
        Ok(pool) => pool,
        Err(_) => return TestResult::Fail,
    };
    let Some(mut tx) = build_ctrl(
        &fx.device,
        tx_path(),
        ChannelDirection::Tx,
        XCtrlKind::Xsk(pool.clone()),
    ) else {
        return TestResult::Fail;
    };
    let Some(channel) = fx.adapter.channel(0) else {
        return TestResult::Fail;
    };

    // Three user descriptors: a short frame, an out-of-pool address (the
    // drop coalesces onto the next submission) and a regular frame.
    pool.tx_enqueue(XskDesc { addr: 0, len: 50 });
    pool.tx_enqueue(XskDesc {
        addr: pool_size,
        len: 100,
    });
    pool.tx_enqueue(XskDesc {
        addr: 2048,
        len: 60,
    });
    tx.tx_poll(64, channel);

    // The short frame went out padded.
    let data = tx.desc_ring().get(1);
    assert_eq_test!(data.data_len(), ETH_ZLEN as u16);
    assert_eq_test!(channel.tx_stats().dropped, 1);

    // Nothing completes before the hardware catches up.
    assert_eq_test!(pool.completion_dequeue(), None);

    let sdp = testbed::bar_read32(testbed::V2_TX_COMP_BASE + REG_SDP);
    fake_hw_update(&mut tx, sdp, 0);
    tx.tx_poll(64, channel);

    // Completions come back in the order the frames were taken from the
    // user ring, the dropped one included.
    assert_eq_test!(pool.completion_dequeue(), Some(0));
    assert_eq_test!(pool.completion_dequeue(), Some(pool_size));
    assert_eq_test!(pool.completion_dequeue(), Some(2048));
    assert_eq_test!(pool.completion_dequeue(), None);
    pass!()
}

// ---------------------------------------------------------------------------
// Mode switching
// ---------------------------------------------------------------------------

pub fn test_mode_switch_restarts_channel() -> TestResult {
    let Some(fx) = fixture() else {
        return TestResult::Fail;
    };
    let Some(channel) = fx.adapter.channel(0) else {
        return TestResult::Fail;
    };

    assert_test!(channel.start_pp().is_ok());
    assert_test!(channel.is_running());
    // Double start is refused.
    assert_test!(channel.start_pp().is_err());

    let region = match dma_alloc_coherent(64 * 2048) {
        Ok(region) => region,
        Err(_) => return TestResult::Fail,
    };
    let pool = match XskPool::new(region, 2048) {
        Ok(pool) => pool,
        Err(_) => return TestResult::Fail,
    };

    assert_test!(channel.setup_xsk_pool(pool).is_ok());
    assert_test!(channel.is_running());
    assert_test!(channel.is_xsk_mode());

    assert_test!(channel.teardown_xsk_pool().is_ok());
    assert_test!(channel.is_running());
    assert_test!(!channel.is_xsk_mode());

    assert_test!(channel.stop().is_ok());
    assert_test!(!channel.is_running());
    pass!()
}

nfb_lib::define_test_suite!(
    xdp,
    [
        test_pp_fill_posts_one_burst,
        test_pp_program_actions,
        test_xmit_copy_pads_short_frames,
        test_xsk_rx_delivers_to_user_ring,
        test_xsk_completions_in_submission_order,
        test_mode_switch_restarts_channel,
    ]
);
