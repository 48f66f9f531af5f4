//! Component handles: named, bounds-checked slices of an MI bus.
//!
//! A component is discovered from an FDT node carrying `reg = <offset size>`
//! and addressed by its canonical FDT path. All register access is checked
//! against the component's size; the controller lock (`COMP_LOCK_DMA_CTRL`)
//! goes through the device's cooperative lock table.

use alloc::string::String;

use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::LockFeatures;

use crate::bus::MiBus;
use crate::device::NfbDevice;
use crate::lock::AppId;

/// Feature bit taken by a DMA controller for its exclusive register window.
pub const COMP_LOCK_DMA_CTRL: LockFeatures = 1;

/// A named view of a bus: `{bus, base, size, path}`.
///
/// Holds raw pointers back to the owning device and bus. Both live for the
/// whole device attachment, and components are torn down before detach, so
/// the pointers never dangle while a `Comp` exists.
pub struct Comp {
    device: *const NfbDevice,
    bus: *const MiBus,
    base: usize,
    size: usize,
    path: String,
}

// SAFETY: the pointed-to device and bus are owned by the attachment and
// outlive every component; all mutable bus state is behind its own locks.
unsafe impl Send for Comp {}
unsafe impl Sync for Comp {}

impl Comp {
    pub(crate) fn new(
        device: *const NfbDevice,
        bus: *const MiBus,
        base: usize,
        size: usize,
        path: String,
    ) -> Self {
        Self {
            device,
            bus,
            base,
            size,
            path,
        }
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn bus(&self) -> &MiBus {
        // SAFETY: see struct invariant.
        unsafe { &*self.bus }
    }

    #[inline]
    fn device(&self) -> &NfbDevice {
        // SAFETY: see struct invariant.
        unsafe { &*self.device }
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> DriverResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DriverError::InvalidArgument),
        }
    }

    pub fn read32(&self, offset: usize) -> u32 {
        debug_assert!(self.check(offset, 4).is_ok());
        let mut buf = [0u8; 4];
        let _ = self.bus().read(&mut buf, self.base + offset);
        u32::from_le_bytes(buf)
    }

    pub fn read64(&self, offset: usize) -> u64 {
        debug_assert!(self.check(offset, 8).is_ok());
        let mut buf = [0u8; 8];
        let _ = self.bus().read(&mut buf, self.base + offset);
        u64::from_le_bytes(buf)
    }

    pub fn write32(&self, offset: usize, value: u32) {
        debug_assert!(self.check(offset, 4).is_ok());
        let _ = self.bus().write(&value.to_le_bytes(), self.base + offset);
    }

    pub fn write64(&self, offset: usize, value: u64) {
        debug_assert!(self.check(offset, 8).is_ok());
        let _ = self.bus().write(&value.to_le_bytes(), self.base + offset);
    }

    /// Checked block read for consumers outside the data path.
    pub fn read_block(&self, buf: &mut [u8], offset: usize) -> DriverResult<usize> {
        self.check(offset, buf.len())?;
        self.bus().read(buf, self.base + offset)
    }

    /// Checked block write for consumers outside the data path.
    pub fn write_block(&self, buf: &[u8], offset: usize) -> DriverResult<usize> {
        self.check(offset, buf.len())?;
        self.bus().write(buf, self.base + offset)
    }

    /// Try to take cooperative features of this component for `app`.
    pub fn try_lock(&self, app: AppId, features: LockFeatures) -> DriverResult<()> {
        self.device().locks().try_lock(app, &self.path, features)
    }

    /// Release cooperative features of this component for `app`.
    pub fn unlock(&self, app: AppId, features: LockFeatures) {
        let _ = self.device().locks().unlock(app, &self.path, features);
    }
}
