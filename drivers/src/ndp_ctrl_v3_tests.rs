//! Calypte controller tests: valid-bit RX harvesting, block-granular TX
//! accounting and the USERSPACE stop preparation.

use alloc::string::ToString;

use nfb_lib::testing::TestResult;
use nfb_lib::{assert_eq_test, assert_test, pass};

use nfb_abi::ndp::{CHANNEL_FLAG_USERSPACE, ChannelId};

use crate::device::NfbDevice;
use crate::ndp::CancelToken;
use crate::ndp::binding::QueueBinding;
use crate::ndp::channel::{AttachCtx, DmaController};
use crate::ndp::ctrl::{CalypteHdr, CtrlGeneration, REG_HDP, REG_SDP, REG_SHP};
use crate::ndp::ctrl_v3::{CtrlV3Rx, CtrlV3Tx};
use crate::ndp::ring::NdpRing;
use crate::testbed;

fn rx_binding() -> QueueBinding {
    QueueBinding {
        id: ChannelId::rx(1),
        generation: CtrlGeneration::Calypte,
        ctrl_path: "/firmware/mi_bus/dma_calypte_rx0".to_string(),
        phandle: None,
        pcie_index: Some(0),
        frame_size_min: Some(testbed::TEST_FRAME_SIZE_MIN),
        frame_size_max: Some(testbed::TEST_FRAME_SIZE_MAX),
        tx_data_buff_size: None,
        tx_hdr_buff_size: None,
    }
}

fn tx_binding() -> QueueBinding {
    QueueBinding {
        id: ChannelId::tx(1),
        generation: CtrlGeneration::Calypte,
        ctrl_path: "/firmware/mi_bus/dma_calypte_tx0".to_string(),
        phandle: None,
        pcie_index: Some(0),
        frame_size_min: Some(testbed::TEST_FRAME_SIZE_MIN),
        frame_size_max: Some(testbed::TEST_FRAME_SIZE_MAX),
        tx_data_buff_size: Some(testbed::V3_TX_DATA_BUFF_SIZE),
        tx_hdr_buff_size: Some(testbed::V3_TX_HDR_BUFF_SIZE),
    }
}

fn rx_fixture() -> Option<(alloc::boxed::Box<NfbDevice>, CtrlV3Rx, NdpRing)> {
    let device = testbed::attach_device().ok()?;
    testbed::reset_dma_arena();

    let node = device
        .fdt()
        .read()
        .path_offset("/firmware/mi_bus/dma_calypte_rx0")
        .ok()?;
    let comp = device.comp_open(node).ok()?;
    let mut ctrl = CtrlV3Rx::new(comp, &rx_binding(), "rx1".to_string());

    // Single contiguous block, 8192 slots of 128 bytes.
    let ring = NdpRing::alloc(1, 1024 * 1024).ok()?;
    let ctx = AttachCtx {
        device: &device,
        queue_name: "rx1",
    };
    let mask = ctrl.attach_ring(&ctx, &ring).ok()?;
    if mask != 8191 {
        return None;
    }
    Some((device, ctrl, ring))
}

fn tx_fixture() -> Option<(alloc::boxed::Box<NfbDevice>, CtrlV3Tx, NdpRing)> {
    let device = testbed::attach_device().ok()?;
    testbed::reset_dma_arena();

    let node = device
        .fdt()
        .read()
        .path_offset("/firmware/mi_bus/dma_calypte_tx0")
        .ok()?;
    let comp = device.comp_open(node).ok()?;
    let mut ctrl = CtrlV3Tx::new(comp, &tx_binding(), "tx1".to_string());

    let ring = NdpRing::empty();
    let ctx = AttachCtx {
        device: &device,
        queue_name: "tx1",
    };
    ctrl.attach_ring(&ctx, &ring).ok()?;
    Some((device, ctrl, ring))
}

pub fn test_rx_multi_block_ring_rejected() -> TestResult {
    let Some((device, mut ctrl, _ring)) = rx_fixture() else {
        return TestResult::Fail;
    };
    // A second attach over a fragmented ring fails: Calypte RX needs one
    // contiguous data block.
    ctrl.detach_ring(&device);
    let split = match NdpRing::alloc(2, 512 * 1024) {
        Ok(ring) => ring,
        Err(_) => return TestResult::Fail,
    };
    let ctx = AttachCtx {
        device: &device,
        queue_name: "rx1",
    };
    assert_test!(ctrl.attach_ring(&ctx, &split).is_err());
    pass!()
}

pub fn test_rx_valid_bit_harvest() -> TestResult {
    let Some((_device, mut ctrl, ring)) = rx_fixture() else {
        return TestResult::Fail;
    };
    assert_test!(ctrl.start(&ring).is_ok());

    // Nothing valid yet.
    assert_eq_test!(ctrl.get_hwptr(&ring), 0);

    // The producer marks three frames in place.
    {
        let Some(hdrs) = ctrl.common_mut().hdr_ring() else {
            return TestResult::Fail;
        };
        hdrs.set(0, CalypteHdr::new(200, 0, true, 0));
        hdrs.set(1, CalypteHdr::new(128, 0, true, 0));
        hdrs.set(2, CalypteHdr::new(64, 0, true, 0));
    }
    assert_eq_test!(ctrl.get_hwptr(&ring), 3);
    // Idempotent until more frames arrive.
    assert_eq_test!(ctrl.get_hwptr(&ring), 3);
    pass!()
}

pub fn test_rx_consume_releases_slots_and_clears_valid() -> TestResult {
    let Some((_device, mut ctrl, ring)) = rx_fixture() else {
        return TestResult::Fail;
    };
    assert_test!(ctrl.start(&ring).is_ok());

    {
        let Some(hdrs) = ctrl.common_mut().hdr_ring() else {
            return TestResult::Fail;
        };
        // 200 bytes -> two 128-byte slots; 100 bytes -> one.
        hdrs.set(0, CalypteHdr::new(200, 0, true, 0));
        hdrs.set(1, CalypteHdr::new(100, 2, true, 0));
    }
    assert_eq_test!(ctrl.get_hwptr(&ring), 2);

    let cancel = CancelToken::new();
    ctrl.set_swptr(&ring, 2, &cancel);

    let base = testbed::V3_RX_COMP_BASE;
    assert_eq_test!(testbed::bar_read32(base + REG_SDP), 3);
    assert_eq_test!(testbed::bar_read32(base + REG_SHP), 2);

    // Consumed headers lost their valid bit so the ring can wrap.
    let Some(hdrs) = ctrl.common_mut().hdr_ring() else {
        return TestResult::Fail;
    };
    assert_test!(!hdrs.get(0).valid());
    assert_test!(!hdrs.get(1).valid());
    assert_eq_test!(hdrs.get(1).frame_ptr(), 2, "clear must preserve fields");
    pass!()
}

pub fn test_tx_masks_come_from_registers() -> TestResult {
    let Some((_device, mut ctrl, ring)) = tx_fixture() else {
        return TestResult::Fail;
    };
    assert_test!(ctrl.start(&ring).is_ok());

    let common = ctrl.common_mut();
    assert_eq_test!(common.regs().mdp, testbed::V3_TX_DATA_BUFF_SIZE / 2 - 1);
    assert_eq_test!(common.regs().mhp, testbed::V3_TX_HDR_BUFF_SIZE / 16 - 1);
    assert_eq_test!(common.free_bytes(), (testbed::V3_TX_DATA_BUFF_SIZE / 2 - 1) as u64);
    pass!()
}

pub fn test_tx_block_accounting() -> TestResult {
    let Some((_device, mut ctrl, ring)) = tx_fixture() else {
        return TestResult::Fail;
    };
    assert_test!(ctrl.start(&ring).is_ok());
    let initial = ctrl.common_mut().free_bytes();

    {
        let Some(hdrs) = ctrl.common_mut().hdr_ring() else {
            return TestResult::Fail;
        };
        hdrs.set(0, CalypteHdr::new(50, 0, false, 0));
    }
    let cancel = CancelToken::new();
    ctrl.set_swptr(&ring, 1, &cancel);
    // 50 bytes round up to two 32-byte blocks.
    assert_eq_test!(ctrl.common_mut().free_bytes(), initial - 64);
    assert_eq_test!(testbed::bar_read32(testbed::V3_TX_COMP_BASE + REG_SDP), 64);

    {
        let Some(hdrs) = ctrl.common_mut().hdr_ring() else {
            return TestResult::Fail;
        };
        hdrs.set(1, CalypteHdr::new(32, 0, false, 0));
    }
    ctrl.set_swptr(&ring, 2, &cancel);
    // An exact multiple consumes exactly its own size.
    assert_eq_test!(ctrl.common_mut().free_bytes(), initial - 96);
    assert_eq_test!(testbed::bar_read32(testbed::V3_TX_COMP_BASE + REG_SDP), 96);
    pass!()
}

pub fn test_tx_reclaim_returns_bytes() -> TestResult {
    let Some((_device, mut ctrl, ring)) = tx_fixture() else {
        return TestResult::Fail;
    };
    assert_test!(ctrl.start(&ring).is_ok());
    let initial = ctrl.common_mut().free_bytes();

    {
        let Some(hdrs) = ctrl.common_mut().hdr_ring() else {
            return TestResult::Fail;
        };
        hdrs.set(0, CalypteHdr::new(64, 0, false, 0));
    }
    let cancel = CancelToken::new();
    ctrl.set_swptr(&ring, 1, &cancel);
    assert_eq_test!(ctrl.common_mut().free_bytes(), initial - 64);

    // Hardware caught up: HDP register reaches the software pointer.
    testbed::bar_write32(testbed::V3_TX_COMP_BASE + REG_HDP, 64);
    let _ = ctrl.get_hwptr(&ring);
    assert_eq_test!(ctrl.common_mut().free_bytes(), initial);
    pass!()
}

pub fn test_tx_userspace_stop_adopts_hw_pointers() -> TestResult {
    let Some((_device, mut ctrl, ring)) = tx_fixture() else {
        return TestResult::Fail;
    };
    assert_test!(ctrl.start(&ring).is_ok());
    assert_eq_test!(
        ctrl.set_flags(CHANNEL_FLAG_USERSPACE),
        CHANNEL_FLAG_USERSPACE
    );

    // Userspace drove the queue; hardware pointers are ahead of what the
    // kernel last flushed.
    let base = testbed::V3_TX_COMP_BASE;
    testbed::bar_write32(base + REG_HDP, 0x180);
    testbed::bar_write32(base + crate::ndp::ctrl::REG_HHP, 5);

    ctrl.stop_prepare();
    let common = ctrl.common_mut();
    assert_eq_test!(common.regs().sdp, 0x180);
    assert_eq_test!(common.regs().shp, 5);
    // The adopted pointers were flushed, so the stop finds a clean queue.
    assert_eq_test!(testbed::bar_read32(base + REG_SDP), 0x180);
    assert_eq_test!(testbed::bar_read32(base + REG_SHP), 5);

    assert_test!(ctrl.stop_attempt().is_ok());
    ctrl.on_stopped();
    assert_eq_test!(ctrl.get_flags() & CHANNEL_FLAG_USERSPACE, 0);
    pass!()
}

nfb_lib::define_test_suite!(
    ndp_ctrl_v3,
    [
        test_rx_multi_block_ring_rejected,
        test_rx_valid_bit_harvest,
        test_rx_consume_releases_slots_and_clears_valid,
        test_tx_masks_come_from_registers,
        test_tx_block_accounting,
        test_tx_reclaim_returns_bytes,
        test_tx_userspace_stop_adopts_hw_pointers,
    ]
);
