//! In-kernel test registry for the NFB driver stack.
//!
//! Suites are defined next to the code they cover (the `*_tests` modules
//! in `nfb-drivers`) and registered here; the boot path calls
//! [`tests_run_all`] when testing is enabled on the cmdline.

#![no_std]

use nfb_lib::klog_info;
use nfb_lib::testing::{
    HARNESS_MAX_SUITES, TestRunSummary, TestSuiteDesc, TestSuiteResult,
};

pub const TESTS_MAX_SUITES: usize = HARNESS_MAX_SUITES;

/// Every suite shipped by the driver stack, in dependency order: leaves
/// first so an infrastructure failure shows up before the suites built on
/// top of it.
fn all_suites() -> [&'static TestSuiteDesc; 8] {
    [
        &nfb_drivers::ndp_desc_tests::NDP_DESC_SUITE_DESC,
        &nfb_drivers::fdt_tests::FDT_SUITE_DESC,
        &nfb_drivers::lock_tests::COMP_LOCK_SUITE_DESC,
        &nfb_drivers::ndp_ring_tests::NDP_RING_SUITE_DESC,
        &nfb_drivers::ndp_channel_tests::NDP_CHANNEL_SUITE_DESC,
        &nfb_drivers::ndp_ctrl_v2_tests::NDP_CTRL_V2_SUITE_DESC,
        &nfb_drivers::ndp_ctrl_v3_tests::NDP_CTRL_V3_SUITE_DESC,
        &nfb_drivers::xdp_tests::XDP_SUITE_DESC,
    ]
}

/// Run all registered suites and return the aggregate summary.
pub fn tests_run_all() -> TestRunSummary {
    let mut summary = TestRunSummary::default();

    for desc in all_suites() {
        let Some(run) = desc.run else {
            continue;
        };
        let mut result = TestSuiteResult::new(desc.name);
        let _ = run(core::ptr::null(), &mut result as *mut TestSuiteResult);
        summary.add_suite_result(&result);
    }

    klog_info!(
        "nfb-tests: {} suites, {}/{} tests passed in {} ms",
        summary.suite_count,
        summary.passed,
        summary.total_tests,
        summary.elapsed_ms
    );
    summary
}
