//! Memory primitives for the NFB driver stack: the DMA-coherent arena that
//! backs every ring and update buffer, and the bounds-checked MMIO window
//! used for register access.

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod dma;
pub mod mmio;

pub use dma::{DmaRegion, dma_alloc_coherent, dma_arena_init, dma_free_coherent};
pub use mmio::MmioRegion;
