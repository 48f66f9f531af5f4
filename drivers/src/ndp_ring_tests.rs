//! Ring buffer and DMA arena tests.

use nfb_lib::testing::TestResult;
use nfb_lib::{assert_eq_test, assert_test, pass};

use nfb_abi::error::DriverError;
use nfb_mm::dma::{dma_alloc_coherent, dma_arena_available, dma_free_coherent};

use crate::ndp::ring::NdpRing;
use crate::testbed;

const BLOCK: u64 = 64 * 1024;

pub fn test_arena_alloc_free_coalesces() -> TestResult {
    testbed::reset_dma_arena();
    let total = dma_arena_available();

    let a = match dma_alloc_coherent(BLOCK) {
        Ok(region) => region,
        Err(_) => return TestResult::Fail,
    };
    let b = match dma_alloc_coherent(BLOCK) {
        Ok(region) => region,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(dma_arena_available(), total - 2 * BLOCK);
    // Regions are zeroed and page aligned.
    assert_test!(a.phys.is_page_aligned());
    // SAFETY: freshly allocated, exclusively owned.
    let first = unsafe { core::ptr::read(a.as_ptr()) };
    assert_eq_test!(first, 0u8);

    dma_free_coherent(a);
    dma_free_coherent(b);
    assert_eq_test!(dma_arena_available(), total);
    pass!()
}

pub fn test_ring_alloc_validates_geometry() -> TestResult {
    testbed::reset_dma_arena();

    // Non-power-of-two total size.
    assert_test!(NdpRing::alloc(3, BLOCK).is_err());
    // Block size must be a page multiple.
    assert_test!(NdpRing::alloc(1, 100).is_err());
    // Zero blocks is an empty ring, not an error.
    let empty = match NdpRing::alloc(0, BLOCK) {
        Ok(ring) => ring,
        Err(_) => return TestResult::Fail,
    };
    assert_test!(empty.is_empty());
    pass!()
}

pub fn test_ring_phys_mapping() -> TestResult {
    testbed::reset_dma_arena();
    let mut ring = match NdpRing::alloc(4, BLOCK) {
        Ok(ring) => ring,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(ring.size(), 4 * BLOCK);
    assert_eq_test!(ring.block_count(), 4);

    // Offsets map into their block with the in-block remainder.
    let p0 = ring.phys_of(0);
    assert_eq_test!(p0, ring.block(0).phys);
    let p1 = ring.phys_of(BLOCK + 123);
    assert_eq_test!(p1.as_u64(), ring.block(1).phys.as_u64() + 123);
    // Logical offsets wrap modulo the ring size.
    assert_eq_test!(ring.phys_of(4 * BLOCK), p0);

    ring.free();
    assert_test!(ring.is_empty());
    pass!()
}

pub fn test_ring_mmap_window_is_double() -> TestResult {
    testbed::reset_dma_arena();
    let mut ring = match NdpRing::alloc(2, BLOCK) {
        Ok(ring) => ring,
        Err(_) => return TestResult::Fail,
    };
    assert_eq_test!(ring.mmap_size(), 2 * ring.size());

    let segments = ring.mmap_segments();
    assert_eq_test!(segments.len(), 4);
    // Blocks repeat in order: the second half mirrors the first.
    assert_eq_test!(segments[0].phys, segments[2].phys);
    assert_eq_test!(segments[1].phys, segments[3].phys);
    let total: u64 = segments.iter().map(|s| s.len).sum();
    assert_eq_test!(total, ring.mmap_size());

    ring.free();
    pass!()
}

pub fn test_ring_wrap_equals_linear_read() -> TestResult {
    testbed::reset_dma_arena();
    let mut ring = match NdpRing::alloc(2, BLOCK) {
        Ok(ring) => ring,
        Err(_) => return TestResult::Fail,
    };
    let size = ring.size();

    // A write crossing the wrap point reads back identically whether the
    // range is addressed pre-wrap or post-wrap.
    let payload: [u8; 64] = core::array::from_fn(|i| i as u8 ^ 0x5A);
    let offset = size - 20;
    ring.copy_in(offset, &payload);

    let mut wrapped = [0u8; 64];
    ring.copy_out(offset, &mut wrapped);
    assert_eq_test!(wrapped, payload);

    // The tail of the write landed at the logical start.
    let mut head = [0u8; 44];
    ring.copy_out(0, &mut head);
    assert_eq_test!(&head[..], &payload[20..]);

    ring.free();
    pass!()
}

pub fn test_ring_exhaustion_reports_no_memory() -> TestResult {
    testbed::reset_dma_arena();
    // More than the carve-out can hold.
    let err = NdpRing::alloc(32, 4 * 1024 * 1024).err();
    assert_eq_test!(err, Some(DriverError::NoMemory));
    // The failed allocation rolled back completely.
    let ring = NdpRing::alloc(2, BLOCK);
    assert_test!(ring.is_ok());
    if let Ok(mut ring) = ring {
        ring.free();
    }
    pass!()
}

nfb_lib::define_test_suite!(
    ndp_ring,
    [
        test_arena_alloc_free_coalesces,
        test_ring_alloc_validates_geometry,
        test_ring_phys_mapping,
        test_ring_mmap_window_is_double,
        test_ring_exhaustion_reports_no_memory,
        test_ring_wrap_equals_linear_read,
    ]
);
