//! Cooperative component locks.
//!
//! Locks are advisory and keyed by canonical FDT path. Each application may
//! hold a 32-bit feature mask per component; applications with disjoint
//! masks share the component, overlapping requests fail with `Busy`. An
//! application may extend its own mask idempotently. When an application's
//! mask drops to zero its record is removed, and releasing an application
//! drops everything it still holds.

use alloc::string::String;
use alloc::vec::Vec;

use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::LockFeatures;
use nfb_lib::IrqMutex;

/// Identity of one device opener; assigned at `open`, used to tie lock
/// records (and subscriptions) to their owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AppId(pub u32);

impl AppId {
    /// Lock owner used for the driver's own component locks.
    pub const KERNEL: AppId = AppId(0);
}

struct LockItem {
    path: String,
    app: AppId,
    features: LockFeatures,
}

/// Per-device table of cooperative locks.
pub struct LockTable {
    items: IrqMutex<Vec<LockItem>>,
}

impl LockTable {
    pub const fn new() -> Self {
        Self {
            items: IrqMutex::new(Vec::new()),
        }
    }

    /// Try to lock `features` of the component at `path` for `app`.
    ///
    /// Fails with `Busy` if any requested feature is held by another
    /// application. Re-locking features already held by `app` is an
    /// idempotent extension.
    pub fn try_lock(&self, app: AppId, path: &str, features: LockFeatures) -> DriverResult<()> {
        let mut items = self.items.lock();

        let mut own: Option<usize> = None;
        for (i, item) in items.iter().enumerate() {
            if item.path == path {
                if item.app != app && (item.features & features) != 0 {
                    return Err(DriverError::Busy);
                }
                if item.app == app {
                    own = Some(i);
                }
            }
        }

        match own {
            Some(i) => items[i].features |= features,
            None => items.push(LockItem {
                path: String::from(path),
                app,
                features,
            }),
        }
        Ok(())
    }

    /// Unlock `features` of `path` for `app`. Any feature set may be
    /// unlocked; an empty remaining mask drops the record.
    pub fn unlock(&self, app: AppId, path: &str, features: LockFeatures) -> DriverResult<()> {
        let mut items = self.items.lock();

        let idx = items
            .iter()
            .position(|item| item.app == app && item.path == path)
            .ok_or(DriverError::NoDevice)?;

        items[idx].features &= !features;
        if items[idx].features == 0 {
            items.swap_remove(idx);
        }
        Ok(())
    }

    /// Drop every lock still held by `app` (application release).
    pub fn release_app(&self, app: AppId) {
        let mut items = self.items.lock();
        items.retain(|item| item.app != app);
    }

    /// Features currently held on `path` across all applications
    /// (diagnostic).
    pub fn held_features(&self, path: &str) -> LockFeatures {
        let items = self.items.lock();
        items
            .iter()
            .filter(|item| item.path == path)
            .fold(0, |acc, item| acc | item.features)
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}
