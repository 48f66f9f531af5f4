//! Cooperative component-lock semantics.

use nfb_lib::testing::TestResult;
use nfb_lib::{assert_eq_test, assert_test, pass};

use nfb_abi::error::DriverError;

use crate::lock::{AppId, LockTable};

const PATH: &str = "/firmware/mi_bus/dma_ctrl_rx0";

pub fn test_disjoint_masks_share_component() -> TestResult {
    let table = LockTable::new();
    assert_test!(table.try_lock(AppId(1), PATH, 0x1).is_ok());
    assert_test!(table.try_lock(AppId(2), PATH, 0x2).is_ok());
    assert_eq_test!(table.held_features(PATH), 0x3);
    pass!()
}

pub fn test_overlapping_mask_is_busy() -> TestResult {
    let table = LockTable::new();
    assert_test!(table.try_lock(AppId(1), PATH, 0x3).is_ok());
    assert_eq_test!(
        table.try_lock(AppId(2), PATH, 0x2),
        Err(DriverError::Busy)
    );
    // A different component is unaffected.
    assert_test!(table.try_lock(AppId(2), "/other", 0x2).is_ok());
    pass!()
}

pub fn test_relock_extends_idempotently() -> TestResult {
    let table = LockTable::new();
    assert_test!(table.try_lock(AppId(1), PATH, 0x1).is_ok());
    assert_test!(table.try_lock(AppId(1), PATH, 0x1).is_ok());
    assert_test!(table.try_lock(AppId(1), PATH, 0x4).is_ok());
    assert_eq_test!(table.held_features(PATH), 0x5);
    pass!()
}

pub fn test_partial_unlock_keeps_rest() -> TestResult {
    let table = LockTable::new();
    assert_test!(table.try_lock(AppId(1), PATH, 0x7).is_ok());
    assert_test!(table.unlock(AppId(1), PATH, 0x2).is_ok());
    assert_eq_test!(table.held_features(PATH), 0x5);

    // Another app can now take the released feature.
    assert_test!(table.try_lock(AppId(2), PATH, 0x2).is_ok());
    pass!()
}

pub fn test_empty_mask_drops_record() -> TestResult {
    let table = LockTable::new();
    assert_test!(table.try_lock(AppId(1), PATH, 0x1).is_ok());
    assert_test!(table.unlock(AppId(1), PATH, 0xFF).is_ok());
    assert_eq_test!(table.held_features(PATH), 0);
    // The record is gone; unlocking again reports no device.
    assert_eq_test!(
        table.unlock(AppId(1), PATH, 0x1),
        Err(DriverError::NoDevice)
    );
    pass!()
}

pub fn test_unlock_foreign_lock_fails() -> TestResult {
    let table = LockTable::new();
    assert_test!(table.try_lock(AppId(1), PATH, 0x1).is_ok());
    assert_eq_test!(
        table.unlock(AppId(2), PATH, 0x1),
        Err(DriverError::NoDevice)
    );
    assert_eq_test!(table.held_features(PATH), 0x1);
    pass!()
}

pub fn test_release_app_drops_everything() -> TestResult {
    let table = LockTable::new();
    assert_test!(table.try_lock(AppId(1), PATH, 0x1).is_ok());
    assert_test!(table.try_lock(AppId(1), "/other", 0x2).is_ok());
    assert_test!(table.try_lock(AppId(2), PATH, 0x8).is_ok());

    table.release_app(AppId(1));
    assert_eq_test!(table.held_features(PATH), 0x8);
    assert_eq_test!(table.held_features("/other"), 0);
    pass!()
}

nfb_lib::define_test_suite!(
    comp_lock,
    [
        test_disjoint_masks_share_component,
        test_overlapping_mask_is_busy,
        test_relock_extends_idempotently,
        test_partial_unlock_keeps_rest,
        test_empty_mask_drops_record,
        test_unlock_foreign_lock_fails,
        test_release_app_drops_everything,
    ]
);
