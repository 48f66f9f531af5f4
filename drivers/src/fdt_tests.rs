//! Device-tree parser/editor tests over the synthetic firmware blob.

use nfb_lib::testing::TestResult;
use nfb_lib::{assert_eq_test, assert_test, pass};

use crate::fdt::Fdt;
use crate::testbed;

pub fn test_empty_tree_round_trip() -> TestResult {
    let fdt = Fdt::new_empty();
    let bytes = fdt.as_bytes();
    assert_eq_test!(bytes.len(), fdt.totalsize());

    let reparsed = match Fdt::from_bytes(bytes) {
        Ok(fdt) => fdt,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(reparsed.totalsize(), fdt.totalsize());
    pass!()
}

pub fn test_from_bytes_rejects_garbage() -> TestResult {
    assert_test!(Fdt::from_bytes(&[0u8; 16]).is_err(), "short blob");
    assert_test!(
        Fdt::from_bytes(&[0xFFu8; 64]).is_err(),
        "bad magic accepted"
    );
    pass!()
}

pub fn test_path_and_subnode_lookup() -> TestResult {
    let fdt = testbed::build_fw_fdt();
    assert_test!(fdt.path_offset("/firmware").is_ok());
    assert_test!(fdt.path_offset("/firmware/mi_bus").is_ok());
    assert_test!(fdt.path_offset("/firmware/mi_bus/dma_ctrl_rx0").is_ok());
    assert_test!(fdt.path_offset("/firmware/nope").is_err());
    assert_test!(fdt.path_offset("relative").is_err());

    let bus = match fdt.path_offset("/firmware/mi_bus") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    assert_test!(fdt.subnode_offset(bus, "dma_ctrl_tx0").is_ok());
    assert_test!(fdt.subnode_offset(bus, "dma_ctrl_tx9").is_err());
    pass!()
}

pub fn test_get_path_round_trip() -> TestResult {
    let fdt = testbed::build_fw_fdt();
    let node = match fdt.path_offset("/firmware/mi_bus/dma_calypte_rx0") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    let path = match fdt.get_path(node) {
        Some(path) => path,
        None => return TestResult::Fail,
    };
    assert_eq_test!(path.as_str(), "/firmware/mi_bus/dma_calypte_rx0");
    pass!()
}

pub fn test_props_and_compatible() -> TestResult {
    let fdt = testbed::build_fw_fdt();
    let node = match fdt.path_offset("/firmware/mi_bus/dma_ctrl_rx0") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    assert_test!(fdt.node_check_compatible(node, "netcope,dma_ctrl_ndp_rx"));
    assert_test!(!fdt.node_check_compatible(node, "netcope,dma_ctrl_ndp_tx"));
    assert_eq_test!(fdt.getprop_u32(node, "pcie"), Some(0));
    assert_eq_test!(fdt.getprop_u32(node, "missing"), None);

    let bus = match fdt.path_offset("/firmware/mi_bus") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(fdt.getprop_str(bus, "resource"), Some("PCI0,BAR0"));
    pass!()
}

pub fn test_compatible_iteration_order() -> TestResult {
    let fdt = testbed::build_fw_fdt();
    let first = fdt.node_offset_by_compatible(None, "netcope,dma_ctrl_ndp_rx");
    assert_test!(first.is_some());
    let next = fdt.node_offset_by_compatible(first, "netcope,dma_ctrl_ndp_rx");
    assert_test!(next.is_none(), "only one medusa rx controller expected");
    pass!()
}

pub fn test_phandle_resolution() -> TestResult {
    let fdt = testbed::build_fw_fdt();
    let ctrl = match fdt.path_offset("/firmware/mi_bus/dma_ctrl_rx0") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    let params = match fdt.node_by_phandle_ref(ctrl, "params") {
        Some(node) => node,
        None => return TestResult::Fail,
    };
    assert_eq_test!(
        fdt.getprop_u32(params, "frame_size_min"),
        Some(testbed::TEST_FRAME_SIZE_MIN)
    );
    assert_eq_test!(
        fdt.getprop_u32(params, "frame_size_max"),
        Some(testbed::TEST_FRAME_SIZE_MAX)
    );
    pass!()
}

pub fn test_setprop_replaces_and_resizes() -> TestResult {
    let mut fdt = Fdt::new_empty();
    let root = fdt.root();
    assert_test!(fdt.add_subnode(root, "queues").is_ok());

    let node = match fdt.path_offset("/queues") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    assert_test!(fdt.setprop_u32(node, "protocol", 2).is_ok());
    let node = fdt.path_offset("/queues").unwrap_or(0);
    assert_eq_test!(fdt.getprop_u32(node, "protocol"), Some(2));

    // Replace with a wider value, then shrink back.
    assert_test!(fdt.setprop_u64(node, "protocol", 3).is_ok());
    let node = fdt.path_offset("/queues").unwrap_or(0);
    assert_eq_test!(fdt.getprop_u64(node, "protocol"), Some(3));
    assert_test!(fdt.setprop_u32(node, "protocol", 2).is_ok());
    let node = fdt.path_offset("/queues").unwrap_or(0);
    assert_eq_test!(fdt.getprop_u32(node, "protocol"), Some(2));

    // The blob stays parseable after every splice.
    assert_test!(Fdt::from_bytes(fdt.as_bytes()).is_ok());
    pass!()
}

pub fn test_add_subnode_rejects_duplicates() -> TestResult {
    let mut fdt = Fdt::new_empty();
    let root = fdt.root();
    assert_test!(fdt.add_subnode(root, "drivers").is_ok());
    let root = fdt.root();
    assert_test!(fdt.add_subnode(root, "drivers").is_err());
    pass!()
}

pub fn test_del_node_removes_subtree() -> TestResult {
    let mut fdt = testbed::build_fw_fdt();
    let bus = match fdt.path_offset("/firmware/mi_bus") {
        Ok(node) => node,
        Err(_) => return TestResult::Fail,
    };
    assert_test!(fdt.del_node(bus).is_ok());
    assert_test!(fdt.path_offset("/firmware/mi_bus").is_err());
    assert_test!(fdt.path_offset("/firmware").is_ok());
    assert_test!(Fdt::from_bytes(fdt.as_bytes()).is_ok());
    pass!()
}

nfb_lib::define_test_suite!(
    fdt,
    [
        test_empty_tree_round_trip,
        test_from_bytes_rejects_garbage,
        test_path_and_subnode_lookup,
        test_get_path_round_trip,
        test_props_and_compatible,
        test_compatible_iteration_order,
        test_phandle_resolution,
        test_setprop_replaces_and_resizes,
        test_add_subnode_rejects_duplicates,
        test_del_node_removes_subtree,
    ]
);
