//! Device core: FDT snapshot, mmap window registry, application lifecycle
//! and the ioctl dispatch that ties the subsystems together.
//!
//! An [`NfbDevice`] is created from the card's firmware FDT and then
//! attached: MI buses first, then the NDP subsystem (one channel per DMA
//! controller found in the tree). The device is heap-pinned for its whole
//! lifetime — components and channels keep raw pointers back to it, the
//! same stable-`Box` pattern the netdev registry uses for device handles.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nfb_abi::PhysAddr;
use nfb_abi::error::{DriverError, DriverResult};
use nfb_abi::ndp::{SubscribeRequest, SubscriptionId, SyncState};
use nfb_lib::{IrqMutex, IrqRwLock, klog_info, klog_warn};
use nfb_mm::MmioRegion;

use crate::bus::{MiBus, MiResource};
use crate::comp::Comp;
use crate::fdt::Fdt;
use crate::lock::{AppId, LockTable};
use crate::ndp::Ndp;
use crate::ndp::subscriber::NdpSubscriber;

/// One BAR window handed to the driver by the platform's PCI layer.
pub struct BarWindow {
    pub resource: MiResource,
    pub region: MmioRegion,
}

/// One physically-backed piece of an mmap window, in mapping order.
#[derive(Clone, Copy, Debug)]
pub struct MmapSegment {
    pub phys: PhysAddr,
    pub len: u64,
}

struct MmapWindow {
    offset: u64,
    size: u64,
    writable: bool,
    segments: Vec<MmapSegment>,
}

/// ioctl requests understood by the device node.
pub enum Ioctl<'a> {
    LockTryLock {
        path: &'a str,
        features: u32,
    },
    LockUnlock {
        path: &'a str,
        features: u32,
    },
    NdpSubscribe {
        req: &'a mut SubscribeRequest,
        id_out: &'a mut SubscriptionId,
    },
    NdpStart {
        id: SubscriptionId,
        sync: &'a mut SyncState,
    },
    NdpStop {
        id: SubscriptionId,
        force: bool,
    },
    NdpSync {
        id: SubscriptionId,
        sync: &'a mut SyncState,
    },
}

/// State of one opener of the device node.
pub struct NfbApp {
    id: AppId,
    /// Opened with the exclusive flag; required for exclusive operations.
    exclusive: bool,
    subscriber: Option<Box<NdpSubscriber>>,
}

impl NfbApp {
    #[inline]
    pub fn id(&self) -> AppId {
        self.id
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    #[inline]
    pub fn subscriber(&self) -> Option<&NdpSubscriber> {
        self.subscriber.as_deref()
    }
}

pub struct NfbDevice {
    fdt: IrqRwLock<Fdt>,
    buses: Vec<Box<MiBus>>,
    mmaps: IrqMutex<Vec<MmapWindow>>,
    next_mmap_offset: AtomicU64,
    locks: LockTable,
    ndp: Option<Ndp>,
    next_app: AtomicU32,
}

impl NfbDevice {
    /// Wrap the firmware FDT. The returned box must stay pinned; `attach`
    /// and everything after it hand out pointers into this allocation.
    pub fn new(fdt: Fdt) -> Box<NfbDevice> {
        Box::new(NfbDevice {
            fdt: IrqRwLock::new(fdt),
            buses: Vec::new(),
            mmaps: IrqMutex::new(Vec::new()),
            next_mmap_offset: AtomicU64::new(0),
            locks: LockTable::new(),
            ndp: None,
            next_app: AtomicU32::new(1),
        })
    }

    // -- accessors ----------------------------------------------------------

    #[inline]
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn fdt(&self) -> &IrqRwLock<Fdt> {
        &self.fdt
    }

    pub fn ndp(&self) -> Option<&Ndp> {
        self.ndp.as_ref()
    }

    pub fn buses(&self) -> &[Box<MiBus>] {
        &self.buses
    }

    // -- attach / detach ----------------------------------------------------

    /// Bring the device up: attach MI buses for every `netcope,bus,mi` node,
    /// then the NDP subsystem.
    pub fn attach(&mut self, bars: Vec<BarWindow>) -> DriverResult<()> {
        self.attach_buses(bars)?;

        let ndp = Ndp::attach(self)?;
        self.ndp = Some(ndp);
        klog_info!("nfb: device attached");
        Ok(())
    }

    /// Tear the device down in reverse attach order. All applications must
    /// have been released.
    pub fn detach(&mut self) {
        if let Some(ndp) = self.ndp.take() {
            ndp.detach(self);
        }
        let mut fdt = self.fdt.write();
        if let Ok(node) = fdt.path_offset("/drivers/mi") {
            let _ = fdt.del_node(node);
        }
        drop(fdt);
        self.buses.clear();
        klog_info!("nfb: device detached");
    }

    fn attach_buses(&mut self, bars: Vec<BarWindow>) -> DriverResult<()> {
        // Collect bus nodes first: FDT edits below invalidate offsets.
        struct BusNode {
            path: String,
            resource: MiResource,
            write_combining: bool,
        }
        let mut nodes: Vec<BusNode> = Vec::new();
        {
            let fdt = self.fdt.read();
            let mut offset = None;
            while let Some(node) = fdt.node_offset_by_compatible(offset, "netcope,bus,mi") {
                offset = Some(node);
                let Some(resource) = fdt.getprop_str(node, "resource") else {
                    continue;
                };
                let Ok(resource) = MiResource::parse(resource) else {
                    klog_warn!("nfb_mi: malformed resource string, node skipped");
                    continue;
                };
                let Some(path) = fdt.get_path(node) else {
                    continue;
                };
                nodes.push(BusNode {
                    path,
                    resource,
                    write_combining: fdt.getprop(node, "map-as-wc").is_some(),
                });
            }
        }

        {
            let mut fdt = self.fdt.write();
            let drivers = match fdt.path_offset("/drivers") {
                Ok(node) => node,
                Err(_) => {
                    let root = fdt.root();
                    fdt.add_subnode(root, "drivers")?
                }
            };
            let _ = fdt.add_subnode(drivers, "mi");
        }

        for node in nodes {
            let Some(bar) = bars.iter().find(|b| b.resource == node.resource) else {
                klog_warn!("nfb_mi: no BAR window for PCI{},BAR{}",
                    node.resource.pci_index, node.resource.bar);
                continue;
            };

            let size = bar.region.size() as u64;
            let segments = alloc::vec![MmapSegment {
                phys: bar.region.phys_base(),
                len: size,
            }];
            let offset = self.register_mmap(size, true, segments)?;

            let mut bus = Box::new(MiBus::new(
                bar.region,
                node.resource,
                node.path.clone(),
                node.write_combining,
            ));
            bus.set_mmap_offset(offset);

            let mut fdt = self.fdt.write();
            let nodename = alloc::format!(
                "PCI{},BAR{}",
                node.resource.pci_index,
                node.resource.bar
            );
            let mi = fdt.path_offset("/drivers/mi")?;
            if let Ok(sub) = fdt.add_subnode(mi, &nodename) {
                let _ = fdt.setprop_u64(sub, "mmap_base", offset);
                let _ = fdt.setprop_u64(sub, "mmap_size", size);
            }
            // Compatibility properties on the /drivers/mi node itself.
            if node.resource.pci_index == 0 && node.resource.bar == 0 {
                let mi = fdt.path_offset("/drivers/mi")?;
                let _ = fdt.setprop_u64(mi, "mmap_base", offset);
                let _ = fdt.setprop_u64(mi, "mmap_size", size);
            }
            drop(fdt);

            klog_info!(
                "nfb_mi: MI{} on PCI{} attached successfully",
                node.resource.bar,
                node.resource.pci_index
            );
            self.buses.push(bus);
        }
        Ok(())
    }

    // -- components ---------------------------------------------------------

    /// Open a component by FDT node offset. The node must carry
    /// `reg = <offset size>` and live under an attached MI bus.
    pub fn comp_open(&self, node: usize) -> DriverResult<Comp> {
        let fdt = self.fdt.read();
        let path = fdt.get_path(node).ok_or(DriverError::NoDevice)?;
        let reg = fdt.getprop(node, "reg").ok_or(DriverError::NoDevice)?;
        if reg.len() != 8 {
            return Err(DriverError::BadFormat);
        }
        let base = u32::from_be_bytes([reg[0], reg[1], reg[2], reg[3]]) as usize;
        let size = u32::from_be_bytes([reg[4], reg[5], reg[6], reg[7]]) as usize;
        drop(fdt);

        // Longest-prefix match against attached bus paths; the firmware
        // nests components under their bus node.
        let bus = self
            .buses
            .iter()
            .filter(|bus| path.starts_with(bus.path()))
            .max_by_key(|bus| bus.path().len())
            .or_else(|| self.buses.first())
            .ok_or(DriverError::NoDevice)?;

        if base + size > bus.size() {
            return Err(DriverError::InvalidArgument);
        }

        Ok(Comp::new(
            self as *const NfbDevice,
            bus.as_ref() as *const MiBus,
            base,
            size,
            path,
        ))
    }

    // -- mmap registry ------------------------------------------------------

    /// Register a window of `size` bytes backed by `segments` (mapped in
    /// order, so a doubly-mapped ring simply lists its blocks twice).
    /// Returns the window's fixed offset in the device mmap space.
    pub fn register_mmap(
        &self,
        size: u64,
        writable: bool,
        segments: Vec<MmapSegment>,
    ) -> DriverResult<u64> {
        let total: u64 = segments.iter().map(|s| s.len).sum();
        if total != size || size == 0 {
            return Err(DriverError::InvalidArgument);
        }
        let aligned = nfb_lib::align_up_u64(size, nfb_abi::PAGE_SIZE);
        let offset = self.next_mmap_offset.fetch_add(aligned, Ordering::Relaxed);
        self.mmaps.lock().push(MmapWindow {
            offset,
            size,
            writable,
            segments,
        });
        Ok(offset)
    }

    pub fn unregister_mmap(&self, offset: u64) {
        self.mmaps.lock().retain(|w| w.offset != offset);
    }

    /// Resolve an mmap request. Exact `(offset, length)` match is required;
    /// asking for write access to a read-only window fails.
    pub fn mmap(&self, offset: u64, length: u64, write: bool) -> DriverResult<Vec<MmapSegment>> {
        let windows = self.mmaps.lock();
        let window = windows
            .iter()
            .find(|w| w.offset == offset)
            .ok_or(DriverError::NoDevice)?;
        if window.size != length {
            return Err(DriverError::InvalidArgument);
        }
        if write && !window.writable {
            return Err(DriverError::InvalidArgument);
        }
        Ok(window.segments.clone())
    }

    // -- char-device surface ------------------------------------------------

    /// `read` on the device node: bytes of the current FDT snapshot,
    /// truncated at `fdt_totalsize`.
    pub fn read_fdt(&self, buf: &mut [u8], offset: usize) -> usize {
        let fdt = self.fdt.read();
        let bytes = fdt.as_bytes();
        let total = fdt.totalsize().min(bytes.len());
        if offset >= total {
            return 0;
        }
        let len = buf.len().min(total - offset);
        buf[..len].copy_from_slice(&bytes[offset..offset + len]);
        len
    }

    /// Open the device node. `exclusive` corresponds to the open flag that
    /// gates exclusive operations.
    pub fn open(&self, exclusive: bool) -> Box<NfbApp> {
        let id = AppId(self.next_app.fetch_add(1, Ordering::Relaxed));
        let subscriber = self
            .ndp
            .as_ref()
            .map(|_| NdpSubscriber::new(self as *const NfbDevice, id));
        Box::new(NfbApp {
            id,
            exclusive,
            subscriber,
        })
    }

    /// Release an opener: stop and destroy its subscriptions, then drop all
    /// cooperative locks it still holds.
    pub fn release(&self, mut app: Box<NfbApp>) {
        if let Some(subscriber) = app.subscriber.take() {
            subscriber.destroy();
        }
        self.locks.release_app(app.id);
    }

    /// ioctl dispatch.
    pub fn ioctl(&self, app: &mut NfbApp, request: Ioctl<'_>) -> DriverResult<()> {
        match request {
            Ioctl::LockTryLock { path, features } => {
                if path.len() > nfb_abi::ndp::MAX_FDT_PATH {
                    return Err(DriverError::InvalidArgument);
                }
                self.locks.try_lock(app.id, path, features)
            }
            Ioctl::LockUnlock { path, features } => self.locks.unlock(app.id, path, features),
            Ioctl::NdpSubscribe { req, id_out } => {
                let sub = app
                    .subscriber
                    .as_mut()
                    .ok_or(DriverError::NoDevice)?;
                *id_out = sub.subscribe(req)?;
                Ok(())
            }
            Ioctl::NdpStart { id, sync } => {
                let sub = app
                    .subscriber
                    .as_mut()
                    .ok_or(DriverError::NoDevice)?;
                sub.start(id, sync)
            }
            Ioctl::NdpStop { id, force } => {
                let sub = app
                    .subscriber
                    .as_mut()
                    .ok_or(DriverError::NoDevice)?;
                sub.stop(id, force)
            }
            Ioctl::NdpSync { id, sync } => {
                let sub = app
                    .subscriber
                    .as_mut()
                    .ok_or(DriverError::NoDevice)?;
                sub.sync(id, sync)
            }
        }
    }

    /// Queue name for the FDT subtree, e.g. `rx3`.
    pub(crate) fn queue_node_name(id: nfb_abi::ndp::ChannelId) -> String {
        id.to_string()
    }
}
