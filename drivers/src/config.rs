//! Runtime tunables, the module-parameter equivalents of the stack.
//!
//! Values are parsed from a boot-cmdline-style string with the usual size
//! suffixes (`K`, `M`, `G`). Each tunable keeps its default unless named.

use nfb_lib::IrqMutex;
use nfb_lib::alignment::ispow2_u64;

/// Default size for a new ring.
const DEFAULT_RING_SIZE: u64 = 4 * 1024 * 1024;
/// Default size of one block in a new ring.
const DEFAULT_RING_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
/// Size of the buffer for one packet in PACKET_SIMPLE mode (max RX/TX
/// packet). Must be a power of two.
const DEFAULT_CTRL_BUFFER_SIZE: u32 = 4096;

#[derive(Clone, Copy, Debug)]
pub struct TuningParams {
    pub ndp_ring_size: u64,
    pub ndp_ring_block_size: u64,
    pub ndp_ctrl_buffer_size: u32,
}

impl TuningParams {
    pub const fn defaults() -> Self {
        Self {
            ndp_ring_size: DEFAULT_RING_SIZE,
            ndp_ring_block_size: DEFAULT_RING_BLOCK_SIZE,
            ndp_ctrl_buffer_size: DEFAULT_CTRL_BUFFER_SIZE,
        }
    }
}

static PARAMS: IrqMutex<TuningParams> = IrqMutex::new(TuningParams::defaults());

/// Parse a decimal size with an optional `K`/`M`/`G` suffix.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (digits, multiplier) = match value.as_bytes()[value.len() - 1] {
        b'k' | b'K' => (&value[..value.len() - 1], 1024u64),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(multiplier))
}

/// Apply `name=value` pairs from a cmdline-style string. Unknown names are
/// ignored; malformed values keep the previous setting.
pub fn configure_from_cmdline(cmdline: &str) {
    let mut params = PARAMS.lock();
    for token in cmdline.split_whitespace() {
        let Some((name, value)) = token.split_once('=') else {
            continue;
        };
        let Some(parsed) = parse_size(value) else {
            continue;
        };
        match name {
            "ndp_ring_size" => params.ndp_ring_size = parsed,
            "ndp_ring_block_size" => params.ndp_ring_block_size = parsed,
            "ndp_ctrl_buffer_size" => {
                if parsed != 0 && ispow2_u64(parsed) && parsed <= u32::MAX as u64 {
                    params.ndp_ctrl_buffer_size = parsed as u32;
                }
            }
            _ => {}
        }
    }
}

pub fn params() -> TuningParams {
    *PARAMS.lock()
}

#[allow(dead_code)]
pub(crate) fn reset_defaults() {
    *PARAMS.lock() = TuningParams::defaults();
}
