//! Shared fixtures for the in-kernel suites: a static DMA carve-out, a
//! fake BAR window whose registers are plain memory, and a synthetic
//! firmware FDT describing one Medusa and one Calypte queue pair.
//!
//! The fake BAR makes controller programming observable: whatever the
//! driver writes to `DESC_BASE`, `MDP` or `CONTROL` can be read back, and
//! a test can preload `STATUS` or `MDP`/`MHP` to play the hardware's part.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::cell::UnsafeCell;

use nfb_abi::{PhysAddr, VirtAddr};
use nfb_abi::error::DriverResult;
use nfb_mm::MmioRegion;
use nfb_mm::dma::dma_arena_init;

use crate::bus::MiResource;
use crate::device::{BarWindow, NfbDevice};
use crate::fdt::Fdt;

/// Backing for the DMA arena: four default rings, ring-side buffers and
/// an XDP page pool.
const DMA_BACKING_SIZE: usize = 64 * 1024 * 1024;

/// Physical base chosen so the first ring straddles the 1 GiB boundary,
/// exercising the upper-address descriptor rule.
pub const TEST_DMA_PHYS_BASE: u64 = 0x3FF0_0000;

const BAR_SIZE: usize = 64 * 1024;

/// Component windows inside the fake BAR.
pub const V2_RX_COMP_BASE: usize = 0x0000;
pub const V2_TX_COMP_BASE: usize = 0x1000;
pub const V3_RX_COMP_BASE: usize = 0x2000;
pub const V3_TX_COMP_BASE: usize = 0x3000;
const COMP_SIZE: u32 = 0x400;

/// Calypte TX on-card buffer geometry published in the synthetic tree.
pub const V3_TX_DATA_BUFF_SIZE: u32 = 0x8000;
pub const V3_TX_HDR_BUFF_SIZE: u32 = 0x1000;

pub const TEST_FRAME_SIZE_MIN: u32 = 60;
pub const TEST_FRAME_SIZE_MAX: u32 = 0x3FFF;

#[repr(C, align(4096))]
struct Backing<const N: usize>(UnsafeCell<[u8; N]>);

// SAFETY: test suites run sequentially; each suite re-initialises the
// backing before use.
unsafe impl<const N: usize> Sync for Backing<N> {}

static DMA_BACKING: Backing<DMA_BACKING_SIZE> = Backing(UnsafeCell::new([0; DMA_BACKING_SIZE]));
static BAR_BACKING: Backing<BAR_SIZE> = Backing(UnsafeCell::new([0; BAR_SIZE]));

/// Reset the DMA arena over the static carve-out. Invalidates any region
/// allocated by a previous test.
pub fn reset_dma_arena() {
    dma_arena_init(
        VirtAddr::new(DMA_BACKING.0.get() as u64),
        PhysAddr::new(TEST_DMA_PHYS_BASE),
        DMA_BACKING_SIZE as u64,
    );
}

fn bar_base() -> *mut u8 {
    BAR_BACKING.0.get() as *mut u8
}

/// Zero the fake BAR (all controllers back to reset state).
pub fn reset_bar() {
    // SAFETY: suites run sequentially; no controller is live across the
    // reset.
    unsafe { core::ptr::write_bytes(bar_base(), 0, BAR_SIZE) };
}

pub fn bar_region() -> MmioRegion {
    MmioRegion::from_raw(
        VirtAddr::new(bar_base() as u64),
        PhysAddr::new(0xF000_0000),
        BAR_SIZE,
    )
}

/// Peek a controller register: `comp_base` + register offset.
pub fn bar_read32(offset: usize) -> u32 {
    bar_region().read(offset)
}

pub fn bar_read64(offset: usize) -> u64 {
    bar_region().read(offset)
}

/// Poke a controller register, playing the hardware's part.
pub fn bar_write32(offset: usize, value: u32) {
    bar_region().write(offset, value)
}

/// Synthetic firmware tree: one MI bus with a Medusa RX/TX pair and a
/// Calypte RX/TX pair, shared frame-size params and the Calypte TX buffer
/// nodes.
pub fn build_fw_fdt() -> Fdt {
    let mut fdt = Fdt::new_empty();
    let root = fdt.root();
    let _ = fdt.add_subnode(root, "firmware");

    let fw = fdt.path_offset("/firmware").unwrap_or(0);
    let _ = fdt.add_subnode(fw, "mi_bus");
    let bus = fdt.path_offset("/firmware/mi_bus").unwrap_or(0);
    let _ = fdt.setprop_str(bus, "compatible", "netcope,bus,mi");
    let _ = fdt.setprop_str(bus, "resource", "PCI0,BAR0");

    let add_comp = |fdt: &mut Fdt, name: &str, compat: &str, base: u32| {
        let bus = fdt.path_offset("/firmware/mi_bus").unwrap_or(0);
        let _ = fdt.add_subnode(bus, name);
        let mut path = alloc::string::String::from("/firmware/mi_bus/");
        path.push_str(name);
        let node = fdt.path_offset(&path).unwrap_or(0);
        let _ = fdt.setprop_str(node, "compatible", compat);
        let mut reg = [0u8; 8];
        reg[0..4].copy_from_slice(&base.to_be_bytes());
        reg[4..8].copy_from_slice(&COMP_SIZE.to_be_bytes());
        let _ = fdt.setprop(node, "reg", &reg);
        let _ = fdt.setprop_u32(node, "params", 10);
        let _ = fdt.setprop_u32(node, "pcie", 0);
    };

    add_comp(
        &mut fdt,
        "dma_ctrl_rx0",
        "netcope,dma_ctrl_ndp_rx",
        V2_RX_COMP_BASE as u32,
    );
    add_comp(
        &mut fdt,
        "dma_ctrl_tx0",
        "netcope,dma_ctrl_ndp_tx",
        V2_TX_COMP_BASE as u32,
    );
    add_comp(
        &mut fdt,
        "dma_calypte_rx0",
        "cesnet,dma_ctrl_calypte_rx",
        V3_RX_COMP_BASE as u32,
    );
    add_comp(
        &mut fdt,
        "dma_calypte_tx0",
        "cesnet,dma_ctrl_calypte_tx",
        V3_TX_COMP_BASE as u32,
    );

    // Shared controller parameters.
    let bus = fdt.path_offset("/firmware/mi_bus").unwrap_or(0);
    let _ = fdt.add_subnode(bus, "params");
    let params = fdt.path_offset("/firmware/mi_bus/params").unwrap_or(0);
    let _ = fdt.setprop_u32(params, "phandle", 10);
    let _ = fdt.setprop_u32(params, "frame_size_min", TEST_FRAME_SIZE_MIN);
    let _ = fdt.setprop_u32(params, "frame_size_max", TEST_FRAME_SIZE_MAX);

    // Calypte TX on-card buffers.
    let bus = fdt.path_offset("/firmware/mi_bus").unwrap_or(0);
    let _ = fdt.add_subnode(bus, "tx_data_buff");
    let node = fdt.path_offset("/firmware/mi_bus/tx_data_buff").unwrap_or(0);
    let _ = fdt.setprop_u32(node, "phandle", 11);
    let mut reg = [0u8; 8];
    reg[4..8].copy_from_slice(&V3_TX_DATA_BUFF_SIZE.to_be_bytes());
    let _ = fdt.setprop(node, "reg", &reg);

    let bus = fdt.path_offset("/firmware/mi_bus").unwrap_or(0);
    let _ = fdt.add_subnode(bus, "tx_hdr_buff");
    let node = fdt.path_offset("/firmware/mi_bus/tx_hdr_buff").unwrap_or(0);
    let _ = fdt.setprop_u32(node, "phandle", 12);
    let mut reg = [0u8; 8];
    reg[4..8].copy_from_slice(&V3_TX_HDR_BUFF_SIZE.to_be_bytes());
    let _ = fdt.setprop(node, "reg", &reg);

    // Tell the Calypte TX controller about its buffers.
    let node = fdt
        .path_offset("/firmware/mi_bus/dma_calypte_tx0")
        .unwrap_or(0);
    let _ = fdt.setprop_u32(node, "data_buff", 11);
    let _ = fdt.setprop_u32(node, "hdr_buff", 12);

    // Calypte TX masks are read back from registers at start; preload the
    // fake hardware with the same geometry the tree advertises.
    bar_write32(V3_TX_COMP_BASE + crate::ndp::ctrl::REG_MDP, V3_TX_DATA_BUFF_SIZE / 2 - 1);
    bar_write32(
        V3_TX_COMP_BASE + crate::ndp::ctrl::REG_MHP,
        V3_TX_HDR_BUFF_SIZE / 16 - 1,
    );

    fdt
}

/// Fresh device over the synthetic firmware: arena reset, BAR cleared,
/// buses and all four NDP queues attached.
pub fn attach_device() -> DriverResult<Box<NfbDevice>> {
    reset_dma_arena();
    reset_bar();
    let fdt = build_fw_fdt();
    let mut device = NfbDevice::new(fdt);
    let mut bars = Vec::new();
    bars.push(BarWindow {
        resource: MiResource {
            pci_index: 0,
            bar: 0,
        },
        region: bar_region(),
    });
    device.attach(bars)?;
    Ok(device)
}
