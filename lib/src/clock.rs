//! TSC-based monotonic clock and bounded busy waits.
//!
//! The DMA controllers poll status registers with fixed millisecond budgets
//! during stop, and the TX descriptor path issues short microsecond backoffs
//! while waiting for the card to release descriptors. Both are served from
//! the invariant TSC; before calibration a conservative 3 GHz estimate is
//! used, which only affects wait lengths, never correctness.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::tsc::rdtsc;

/// Default cycles-per-microsecond estimate (3 GHz) used before calibration.
const DEFAULT_CYCLES_PER_US: u64 = 3_000;

static CYCLES_PER_US: AtomicU64 = AtomicU64::new(DEFAULT_CYCLES_PER_US);
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

/// Record the calibrated TSC frequency. Called once during platform bring-up.
pub fn clock_calibrate(cycles_per_us: u64) {
    if cycles_per_us != 0 {
        CYCLES_PER_US.store(cycles_per_us, Ordering::Relaxed);
    }
    BOOT_TSC.compare_exchange(0, rdtsc(), Ordering::Relaxed, Ordering::Relaxed)
        .ok();
}

#[inline]
fn cycles_per_us() -> u64 {
    CYCLES_PER_US.load(Ordering::Relaxed)
}

/// Monotonic time in microseconds since the first calibration (or since the
/// first call, whichever came earlier).
#[inline]
pub fn monotonic_us() -> u64 {
    let boot = BOOT_TSC.load(Ordering::Relaxed);
    if boot == 0 {
        BOOT_TSC.compare_exchange(0, rdtsc(), Ordering::Relaxed, Ordering::Relaxed)
            .ok();
        return 0;
    }
    rdtsc().wrapping_sub(boot) / cycles_per_us()
}

/// System uptime in milliseconds.
#[inline]
pub fn uptime_ms() -> u64 {
    monotonic_us() / 1_000
}

/// Spin for at least `us` microseconds.
pub fn busy_wait_us(us: u64) {
    let deadline = rdtsc().wrapping_add(us.saturating_mul(cycles_per_us()));
    while (rdtsc().wrapping_sub(deadline) as i64) < 0 {
        core::hint::spin_loop();
    }
}

/// Spin for at least `ms` milliseconds.
#[inline]
pub fn busy_wait_ms(ms: u64) {
    busy_wait_us(ms.saturating_mul(1_000));
}
