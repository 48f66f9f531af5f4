//! NFB Driver-Userland ABI Types
//!
//! This crate provides the canonical definitions for all types shared between
//! the NFB driver stack and its consumers: address newtypes used for DMA
//! programming, the error taxonomy with its errno mapping, and the
//! ioctl-level NDP data-plane ABI (channel requests, sync exchange, lock
//! requests).
//!
//! All types in this crate are `#[repr(C)]` for ABI stability.

#![no_std]
#![forbid(unsafe_code)]

pub mod addr;
pub mod error;
pub mod ndp;

/// Standard 4 KiB page size; every DMA buffer in the stack is sized and
/// aligned in multiples of this.
pub const PAGE_SIZE: u64 = 0x1000;

pub use addr::*;
pub use error::*;
pub use ndp::*;
