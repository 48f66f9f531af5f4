#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod bus;
pub mod comp;
pub mod config;
pub mod device;
pub mod fdt;
pub mod lock;
pub mod ndp;
pub mod platform_init;
pub mod serial;
pub mod xdp;

pub mod testbed;

pub mod fdt_tests;
pub mod lock_tests;
pub mod ndp_channel_tests;
pub mod ndp_ctrl_v3_tests;
pub mod ndp_ring_tests;
pub mod xdp_tests;
