//! NDP data-plane ABI: the structures exchanged over the character-device
//! ioctl surface.
//!
//! A consumer subscribes to a channel identified by `(direction, index)`,
//! receives an opaque subscription id, then drives the queue with
//! start/sync/stop requests carrying byte-granular ring cursors.

/// Direction of a DMA channel, from the host's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelDirection {
    /// Card-to-host: hardware produces, software consumes.
    Rx = 0,
    /// Host-to-card: software produces, hardware consumes.
    Tx = 1,
}

impl ChannelDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelDirection::Rx => "rx",
            ChannelDirection::Tx => "tx",
        }
    }
}

/// Channel identity: direction plus a dense per-direction index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ChannelId {
    pub direction: ChannelDirection,
    pub index: u32,
}

impl ChannelId {
    #[inline]
    pub const fn rx(index: u32) -> Self {
        Self {
            direction: ChannelDirection::Rx,
            index,
        }
    }

    #[inline]
    pub const fn tx(index: u32) -> Self {
        Self {
            direction: ChannelDirection::Tx,
            index,
        }
    }
}

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.direction.as_str(), self.index)
    }
}

// ---------------------------------------------------------------------------
// Channel flags
// ---------------------------------------------------------------------------

/// RX: when the ring is full, drop new frames instead of stalling the card.
pub const CHANNEL_FLAG_DISCARD: u32 = 1 << 0;
/// At most one subscription may exist on the channel.
pub const CHANNEL_FLAG_EXCLUSIVE: u32 = 1 << 1;
/// V3 TX: the ring is driven by userspace, not by the kernel.
pub const CHANNEL_FLAG_USERSPACE: u32 = 1 << 2;
/// The controller exposes a header ring to consumers (implicit for V2).
pub const CHANNEL_FLAG_USE_HEADER: u32 = 1 << 3;
/// The controller exposes an offset ring to consumers (implicit for V2).
pub const CHANNEL_FLAG_USE_OFFSET: u32 = 1 << 4;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Opaque subscription handle, local to the issuing subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SubscriptionId(pub u32);

/// `Subscribe` request: bind a new subscription to a channel.
///
/// `flags` is a read-modify-write field: the caller requests a set, the
/// driver writes back the set actually in force.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct SubscribeRequest {
    pub channel: ChannelId,
    pub flags: u32,
}

/// Cursor exchange for `Start` and `Sync`.
///
/// Pointers are byte offsets into the channel's logical ring space and wrap
/// modulo the ring size. For RX the caller presents `swptr` (consumed-up-to)
/// and receives `hwptr` (produced-up-to). For TX the caller presents
/// `(swptr, hwptr)` as the published-through and requested-lock-to points and
/// receives the granted window. `size` reports byte-granular free space on
/// controllers that track it (V3 TX), else zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SyncState {
    pub swptr: u64,
    pub hwptr: u64,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Cooperative component locks
// ---------------------------------------------------------------------------

/// Longest canonical FDT path accepted by the lock surface.
pub const MAX_FDT_PATH: usize = 256;

/// Feature bitmask accompanying a lock request. Applications with disjoint
/// masks may hold the same component concurrently.
pub type LockFeatures = u32;

// ---------------------------------------------------------------------------
// ioctl command numbers
// ---------------------------------------------------------------------------

pub const NFB_LOCK_IOC_TRY_LOCK: u32 = 0x6e01;
pub const NFB_LOCK_IOC_UNLOCK: u32 = 0x6e02;
pub const NDP_IOC_SUBSCRIBE: u32 = 0x6e10;
pub const NDP_IOC_START: u32 = 0x6e11;
pub const NDP_IOC_STOP: u32 = 0x6e12;
pub const NDP_IOC_SYNC: u32 = 0x6e13;
