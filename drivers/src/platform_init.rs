//! Platform bring-up for the driver stack.
//!
//! Call once before attaching devices: switches klog to the locked serial
//! backend and calibrates the busy-wait clock.

use nfb_lib::clock;

use crate::serial;

/// `cycles_per_us == 0` keeps the default 3 GHz estimate.
pub fn platform_init(cycles_per_us: u64) {
    serial::init();
    clock::clock_calibrate(cycles_per_us);
    nfb_lib::klog_info!("nfb: platform services initialised");
}
