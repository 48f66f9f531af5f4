//! Per-queue FDT binding: everything the driver learns about a DMA
//! controller from the firmware tree before touching its registers.

use alloc::string::String;

use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::{ChannelDirection, ChannelId};
use nfb_lib::klog_warn;

use crate::fdt::Fdt;
use crate::ndp::ctrl::CtrlGeneration;

/// Compatible string recognised as a DMA controller.
pub struct ControllerCompatible {
    pub string: &'static str,
    pub generation: CtrlGeneration,
    pub direction: ChannelDirection,
}

pub const COMPAT_NDP_RX: &str = "netcope,dma_ctrl_ndp_rx";
pub const COMPAT_NDP_TX: &str = "netcope,dma_ctrl_ndp_tx";
pub const COMPAT_CALYPTE_RX: &str = "cesnet,dma_ctrl_calypte_rx";
pub const COMPAT_CALYPTE_TX: &str = "cesnet,dma_ctrl_calypte_tx";

pub const CONTROLLER_COMPATIBLES: &[ControllerCompatible] = &[
    ControllerCompatible {
        string: COMPAT_NDP_RX,
        generation: CtrlGeneration::Medusa,
        direction: ChannelDirection::Rx,
    },
    ControllerCompatible {
        string: COMPAT_NDP_TX,
        generation: CtrlGeneration::Medusa,
        direction: ChannelDirection::Tx,
    },
    ControllerCompatible {
        string: COMPAT_CALYPTE_RX,
        generation: CtrlGeneration::Calypte,
        direction: ChannelDirection::Rx,
    },
    ControllerCompatible {
        string: COMPAT_CALYPTE_TX,
        generation: CtrlGeneration::Calypte,
        direction: ChannelDirection::Tx,
    },
];

/// Everything extracted from one controller node.
pub struct QueueBinding {
    pub id: ChannelId,
    pub generation: CtrlGeneration,
    /// Canonical path of the controller node; re-resolved after FDT edits.
    pub ctrl_path: String,
    /// Phandle of the controller node, published on the queue node.
    pub phandle: Option<u32>,
    /// Backing PCI endpoint index (NUMA hint).
    pub pcie_index: Option<u32>,
    pub frame_size_min: Option<u32>,
    pub frame_size_max: Option<u32>,
    /// Calypte TX: size of the on-card data buffer.
    pub tx_data_buff_size: Option<u32>,
    /// Calypte TX: size of the on-card header buffer.
    pub tx_hdr_buff_size: Option<u32>,
}

impl QueueBinding {
    pub fn from_fdt(
        fdt: &Fdt,
        node: usize,
        compat: &ControllerCompatible,
        id: ChannelId,
    ) -> DriverResult<QueueBinding> {
        let ctrl_path = fdt.get_path(node).ok_or(DriverError::NoDevice)?;

        let pcie_index = fdt.getprop_u32(node, "pcie");
        if pcie_index.is_none() {
            klog_warn!(
                "ndp: can't find exact pci device for queue {}, this can affect performance on NUMA systems",
                id
            );
        }

        // `ctrl/params` carries the frame size limits.
        let (frame_size_min, frame_size_max) = match fdt.node_by_phandle_ref(node, "params") {
            Some(params) => (
                fdt.getprop_u32(params, "frame_size_min"),
                fdt.getprop_u32(params, "frame_size_max"),
            ),
            None => (None, None),
        };

        let mut tx_data_buff_size = None;
        let mut tx_hdr_buff_size = None;
        if compat.generation == CtrlGeneration::Calypte
            && compat.direction == ChannelDirection::Tx
        {
            tx_data_buff_size = buffer_reg_size(fdt, node, "data_buff");
            tx_hdr_buff_size = buffer_reg_size(fdt, node, "hdr_buff");
            if tx_data_buff_size.is_none() || tx_hdr_buff_size.is_none() {
                return Err(DriverError::NotReady);
            }
        }

        Ok(QueueBinding {
            id,
            generation: compat.generation,
            ctrl_path,
            phandle: fdt.phandle(node),
            pcie_index,
            frame_size_min,
            frame_size_max,
            tx_data_buff_size,
            tx_hdr_buff_size,
        })
    }
}

/// Size cell of the `reg` property of a buffer node referenced by phandle.
fn buffer_reg_size(fdt: &Fdt, ctrl_node: usize, prop: &str) -> Option<u32> {
    let buff = fdt.node_by_phandle_ref(ctrl_node, prop)?;
    let reg = fdt.getprop(buff, "reg")?;
    if reg.len() < 8 {
        return None;
    }
    Some(u32::from_be_bytes(reg[4..8].try_into().ok()?))
}
