//! Flattened Device Tree: parser and editor over the DTB wire format.
//!
//! The card's firmware personality arrives as a DTB; the driver reads it to
//! discover buses and DMA controllers, and writes it to publish the nodes
//! consumers see through the character device (`/drivers/...` subtrees with
//! mmap window geometry). Both sides therefore live here: a token walker
//! over the structure block and a splicing editor that keeps the header
//! consistent.
//!
//! Node handles are byte offsets of `FDT_BEGIN_NODE` tokens within the
//! structure block, libfdt-style. **Any edit invalidates node offsets** —
//! callers re-resolve by path after editing, never cache offsets across
//! mutations.
//!
//! Format reference: the devicetree specification; all header and token
//! fields are big-endian.

use alloc::string::String;
use alloc::vec::Vec;

use nfb_abi::error::{DriverError, DriverResult};

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x0000_0001;
const FDT_END_NODE: u32 = 0x0000_0002;
const FDT_PROP: u32 = 0x0000_0003;
const FDT_NOP: u32 = 0x0000_0004;
const FDT_END: u32 = 0x0000_0009;

const HDR_MAGIC: usize = 0;
const HDR_TOTALSIZE: usize = 4;
const HDR_OFF_DT_STRUCT: usize = 8;
const HDR_OFF_DT_STRINGS: usize = 12;
const HDR_OFF_MEM_RSVMAP: usize = 16;
const HDR_VERSION: usize = 20;
const HDR_LAST_COMP_VERSION: usize = 24;
const HDR_BOOT_CPUID: usize = 28;
const HDR_SIZE_DT_STRINGS: usize = 32;
const HDR_SIZE_DT_STRUCT: usize = 36;
const HDR_LEN: usize = 40;

#[inline]
const fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// An owned, editable device tree blob.
pub struct Fdt {
    buf: Vec<u8>,
}

impl Fdt {
    // -- construction -------------------------------------------------------

    /// Build a minimal valid tree: an empty root node.
    pub fn new_empty() -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&[0u8; HDR_LEN]);
        // memory reservation map: one terminating (0, 0) entry
        buf.extend_from_slice(&[0u8; 16]);
        let off_struct = buf.len();
        // root: BEGIN_NODE, empty name (4 bytes incl. padding), END_NODE, END
        buf.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&FDT_END_NODE.to_be_bytes());
        buf.extend_from_slice(&FDT_END.to_be_bytes());
        let size_struct = buf.len() - off_struct;
        let off_strings = buf.len();

        let mut fdt = Self { buf };
        fdt.write_header_u32(HDR_MAGIC, FDT_MAGIC);
        fdt.write_header_u32(HDR_TOTALSIZE, off_strings as u32);
        fdt.write_header_u32(HDR_OFF_DT_STRUCT, off_struct as u32);
        fdt.write_header_u32(HDR_OFF_DT_STRINGS, off_strings as u32);
        fdt.write_header_u32(HDR_OFF_MEM_RSVMAP, HDR_LEN as u32);
        fdt.write_header_u32(HDR_VERSION, FDT_VERSION);
        fdt.write_header_u32(HDR_LAST_COMP_VERSION, FDT_LAST_COMP_VERSION);
        fdt.write_header_u32(HDR_BOOT_CPUID, 0);
        fdt.write_header_u32(HDR_SIZE_DT_STRINGS, 0);
        fdt.write_header_u32(HDR_SIZE_DT_STRUCT, size_struct as u32);
        fdt
    }

    /// Take ownership of an existing blob after validating its header.
    pub fn from_bytes(bytes: &[u8]) -> DriverResult<Self> {
        if bytes.len() < HDR_LEN {
            return Err(DriverError::BadFormat);
        }
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != FDT_MAGIC {
            return Err(DriverError::BadFormat);
        }
        let totalsize =
            u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if totalsize < HDR_LEN || totalsize > bytes.len() {
            return Err(DriverError::BadFormat);
        }
        let fdt = Self {
            buf: Vec::from(&bytes[..totalsize]),
        };
        let off_struct = fdt.header_u32(HDR_OFF_DT_STRUCT) as usize;
        let size_struct = fdt.header_u32(HDR_SIZE_DT_STRUCT) as usize;
        let off_strings = fdt.header_u32(HDR_OFF_DT_STRINGS) as usize;
        let size_strings = fdt.header_u32(HDR_SIZE_DT_STRINGS) as usize;
        if off_struct + size_struct > totalsize || off_strings + size_strings > totalsize {
            return Err(DriverError::BadFormat);
        }
        Ok(fdt)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn totalsize(&self) -> usize {
        self.header_u32(HDR_TOTALSIZE) as usize
    }

    // -- header helpers -----------------------------------------------------

    fn header_u32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    fn write_header_u32(&mut self, off: usize, value: u32) {
        self.buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
    }

    #[inline]
    fn off_struct(&self) -> usize {
        self.header_u32(HDR_OFF_DT_STRUCT) as usize
    }

    #[inline]
    fn size_struct(&self) -> usize {
        self.header_u32(HDR_SIZE_DT_STRUCT) as usize
    }

    #[inline]
    fn off_strings(&self) -> usize {
        self.header_u32(HDR_OFF_DT_STRINGS) as usize
    }

    #[inline]
    fn size_strings(&self) -> usize {
        self.header_u32(HDR_SIZE_DT_STRINGS) as usize
    }

    // -- token walking ------------------------------------------------------

    fn token(&self, rel: usize) -> Option<u32> {
        let abs = self.off_struct() + rel;
        if rel + 4 > self.size_struct() {
            return None;
        }
        Some(u32::from_be_bytes([
            self.buf[abs],
            self.buf[abs + 1],
            self.buf[abs + 2],
            self.buf[abs + 3],
        ]))
    }

    fn struct_bytes(&self, rel: usize, len: usize) -> Option<&[u8]> {
        if rel + len > self.size_struct() {
            return None;
        }
        let abs = self.off_struct() + rel;
        Some(&self.buf[abs..abs + len])
    }

    fn cstr_at(&self, rel: usize) -> Option<&str> {
        let abs = self.off_struct() + rel;
        let end = self.off_struct() + self.size_struct();
        let mut i = abs;
        while i < end && self.buf[i] != 0 {
            i += 1;
        }
        core::str::from_utf8(&self.buf[abs..i]).ok()
    }

    /// Offset just past a node's name (start of its props/children tokens).
    fn node_body(&self, node: usize) -> Option<usize> {
        if self.token(node)? != FDT_BEGIN_NODE {
            return None;
        }
        let name = self.cstr_at(node + 4)?;
        Some(node + 4 + pad4(name.len() + 1))
    }

    /// Name of the node at `node`.
    pub fn node_name(&self, node: usize) -> Option<&str> {
        if self.token(node)? != FDT_BEGIN_NODE {
            return None;
        }
        self.cstr_at(node + 4)
    }

    /// Advance over one token, returning the offset of the next one.
    fn skip_token(&self, rel: usize) -> Option<usize> {
        match self.token(rel)? {
            FDT_BEGIN_NODE => self.node_body(rel),
            FDT_END_NODE | FDT_NOP => Some(rel + 4),
            FDT_PROP => {
                let len = u32::from_be_bytes(
                    self.struct_bytes(rel + 4, 4)?.try_into().ok()?,
                ) as usize;
                Some(rel + 12 + pad4(len))
            }
            FDT_END => None,
            _ => None,
        }
    }

    /// Offset of the `FDT_END_NODE` token closing `node`.
    fn node_end(&self, node: usize) -> Option<usize> {
        let mut pos = self.node_body(node)?;
        let mut depth = 0usize;
        loop {
            match self.token(pos)? {
                FDT_BEGIN_NODE => {
                    depth += 1;
                    pos = self.node_body(pos)?;
                }
                FDT_END_NODE => {
                    if depth == 0 {
                        return Some(pos);
                    }
                    depth -= 1;
                    pos += 4;
                }
                _ => pos = self.skip_token(pos)?,
            }
        }
    }

    /// Root node offset (always 0 in a valid blob, after leading NOPs).
    pub fn root(&self) -> usize {
        let mut pos = 0;
        while self.token(pos) == Some(FDT_NOP) {
            pos += 4;
        }
        pos
    }

    /// Find a direct child of `parent` by name.
    pub fn subnode_offset(&self, parent: usize, name: &str) -> DriverResult<usize> {
        let mut pos = self.node_body(parent).ok_or(DriverError::BadFormat)?;
        loop {
            match self.token(pos).ok_or(DriverError::BadFormat)? {
                FDT_BEGIN_NODE => {
                    if self.node_name(pos) == Some(name) {
                        return Ok(pos);
                    }
                    pos = self
                        .node_end(pos)
                        .ok_or(DriverError::BadFormat)?
                        + 4;
                }
                FDT_END_NODE => return Err(DriverError::NoDevice),
                FDT_END => return Err(DriverError::BadFormat),
                _ => pos = self.skip_token(pos).ok_or(DriverError::BadFormat)?,
            }
        }
    }

    /// Resolve an absolute path (`/drivers/ndp/rx_queues`) to a node offset.
    pub fn path_offset(&self, path: &str) -> DriverResult<usize> {
        if !path.starts_with('/') {
            return Err(DriverError::InvalidArgument);
        }
        let mut node = self.root();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = self.subnode_offset(node, part)?;
        }
        Ok(node)
    }

    /// Canonical path of the node at `node`.
    pub fn get_path(&self, node: usize) -> Option<String> {
        let mut stack: Vec<&str> = Vec::new();
        let mut pos = self.root();
        if pos == node {
            return Some(String::from("/"));
        }
        pos = self.node_body(pos)?;
        loop {
            match self.token(pos)? {
                FDT_BEGIN_NODE => {
                    let name = self.node_name(pos)?;
                    stack.push(name);
                    if pos == node {
                        let mut path = String::new();
                        for part in &stack {
                            path.push('/');
                            path.push_str(part);
                        }
                        return Some(path);
                    }
                    pos = self.node_body(pos)?;
                }
                FDT_END_NODE => {
                    stack.pop()?;
                    pos += 4;
                    if stack.is_empty() && self.token(pos) == Some(FDT_END) {
                        return None;
                    }
                }
                FDT_END => return None,
                _ => pos = self.skip_token(pos)?,
            }
        }
    }

    /// Next node in document order, or `None` at the end of the tree.
    pub fn next_node(&self, node: usize) -> Option<usize> {
        let mut pos = if self.token(node)? == FDT_BEGIN_NODE {
            self.node_body(node)?
        } else {
            node
        };
        loop {
            match self.token(pos)? {
                FDT_BEGIN_NODE => return Some(pos),
                FDT_END => return None,
                _ => pos = self.skip_token(pos)?,
            }
        }
    }

    // -- properties ---------------------------------------------------------

    /// Raw property value of `name` on `node`.
    pub fn getprop(&self, node: usize, name: &str) -> Option<&[u8]> {
        let mut pos = self.node_body(node)?;
        loop {
            match self.token(pos)? {
                FDT_PROP => {
                    let len = u32::from_be_bytes(
                        self.struct_bytes(pos + 4, 4)?.try_into().ok()?,
                    ) as usize;
                    let nameoff = u32::from_be_bytes(
                        self.struct_bytes(pos + 8, 4)?.try_into().ok()?,
                    ) as usize;
                    if self.string_at(nameoff) == Some(name) {
                        return self.struct_bytes(pos + 12, len);
                    }
                    pos = self.skip_token(pos)?;
                }
                FDT_NOP => pos += 4,
                // Properties always precede subnodes.
                _ => return None,
            }
        }
    }

    pub fn getprop_u32(&self, node: usize, name: &str) -> Option<u32> {
        let raw = self.getprop(node, name)?;
        if raw.len() != 4 {
            return None;
        }
        Some(u32::from_be_bytes(raw.try_into().ok()?))
    }

    pub fn getprop_u64(&self, node: usize, name: &str) -> Option<u64> {
        let raw = self.getprop(node, name)?;
        if raw.len() != 8 {
            return None;
        }
        Some(u64::from_be_bytes(raw.try_into().ok()?))
    }

    pub fn getprop_str(&self, node: usize, name: &str) -> Option<&str> {
        let raw = self.getprop(node, name)?;
        let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
        core::str::from_utf8(raw).ok()
    }

    /// True if the node's `compatible` list contains `compat`.
    pub fn node_check_compatible(&self, node: usize, compat: &str) -> bool {
        let Some(raw) = self.getprop(node, "compatible") else {
            return false;
        };
        raw.split(|&b| b == 0)
            .any(|entry| !entry.is_empty() && entry == compat.as_bytes())
    }

    /// Next node (after `start`, or from the root when `None`) whose
    /// `compatible` list contains `compat`.
    pub fn node_offset_by_compatible(
        &self,
        start: Option<usize>,
        compat: &str,
    ) -> Option<usize> {
        let mut node = match start {
            Some(off) => self.next_node(off)?,
            None => self.root(),
        };
        loop {
            if self.node_check_compatible(node, compat) {
                return Some(node);
            }
            node = self.next_node(node)?;
        }
    }

    /// Phandle of `node`, if present.
    pub fn phandle(&self, node: usize) -> Option<u32> {
        self.getprop_u32(node, "phandle")
            .or_else(|| self.getprop_u32(node, "linux,phandle"))
    }

    /// Node carrying the given phandle value.
    pub fn node_by_phandle(&self, phandle: u32) -> Option<usize> {
        let mut node = self.root();
        loop {
            if self.phandle(node) == Some(phandle) {
                return Some(node);
            }
            node = self.next_node(node)?;
        }
    }

    /// Follow a phandle-valued property of `node` to its target node.
    pub fn node_by_phandle_ref(&self, node: usize, prop: &str) -> Option<usize> {
        let phandle = self.getprop_u32(node, prop)?;
        self.node_by_phandle(phandle)
    }

    // -- strings block ------------------------------------------------------

    fn string_at(&self, nameoff: usize) -> Option<&str> {
        if nameoff >= self.size_strings() {
            return None;
        }
        let abs = self.off_strings() + nameoff;
        let end = self.off_strings() + self.size_strings();
        let mut i = abs;
        while i < end && self.buf[i] != 0 {
            i += 1;
        }
        core::str::from_utf8(&self.buf[abs..i]).ok()
    }

    /// Offset of `name` in the strings block, appending it if new.
    fn add_string(&mut self, name: &str) -> u32 {
        let bytes = name.as_bytes();
        let strings_start = self.off_strings();
        let strings_len = self.size_strings();
        let block = &self.buf[strings_start..strings_start + strings_len];
        let mut pos = 0;
        while pos < block.len() {
            let mut end = pos;
            while end < block.len() && block[end] != 0 {
                end += 1;
            }
            if &block[pos..end] == bytes {
                return pos as u32;
            }
            pos = end + 1;
        }

        let nameoff = strings_len;
        let insert_at = strings_start + strings_len;
        self.buf
            .splice(insert_at..insert_at, bytes.iter().copied().chain([0u8]));
        self.write_header_u32(HDR_SIZE_DT_STRINGS, (strings_len + bytes.len() + 1) as u32);
        self.write_header_u32(HDR_TOTALSIZE, self.buf.len() as u32);
        nameoff as u32
    }

    // -- editing ------------------------------------------------------------

    /// Splice the structure block, keeping the header consistent.
    fn splice_struct(&mut self, rel: usize, remove: usize, insert: &[u8]) {
        let abs = self.off_struct() + rel;
        self.buf.splice(abs..abs + remove, insert.iter().copied());
        let new_struct = self.size_struct() + insert.len() - remove;
        let new_strings_off = self.off_strings() + insert.len() - remove;
        self.write_header_u32(HDR_SIZE_DT_STRUCT, new_struct as u32);
        self.write_header_u32(HDR_OFF_DT_STRINGS, new_strings_off as u32);
        self.write_header_u32(HDR_TOTALSIZE, self.buf.len() as u32);
    }

    /// Set (replace or create) a property. Invalidates node offsets.
    pub fn setprop(&mut self, node: usize, name: &str, value: &[u8]) -> DriverResult<()> {
        let nameoff = self.add_string(name);

        // Locate an existing property of the same name.
        let mut pos = self.node_body(node).ok_or(DriverError::BadFormat)?;
        let mut existing = None;
        loop {
            match self.token(pos).ok_or(DriverError::BadFormat)? {
                FDT_PROP => {
                    let len = u32::from_be_bytes(
                        self.struct_bytes(pos + 4, 4)
                            .ok_or(DriverError::BadFormat)?
                            .try_into()
                            .unwrap_or([0; 4]),
                    ) as usize;
                    let off = u32::from_be_bytes(
                        self.struct_bytes(pos + 8, 4)
                            .ok_or(DriverError::BadFormat)?
                            .try_into()
                            .unwrap_or([0; 4]),
                    ) as usize;
                    if self.string_at(off) == Some(name) {
                        existing = Some((pos, len));
                        break;
                    }
                    pos = self.skip_token(pos).ok_or(DriverError::BadFormat)?;
                }
                FDT_NOP => pos += 4,
                _ => break,
            }
        }

        let mut encoded = Vec::with_capacity(12 + pad4(value.len()));
        encoded.extend_from_slice(&FDT_PROP.to_be_bytes());
        encoded.extend_from_slice(&(value.len() as u32).to_be_bytes());
        encoded.extend_from_slice(&nameoff.to_be_bytes());
        encoded.extend_from_slice(value);
        encoded.resize(12 + pad4(value.len()), 0);

        match existing {
            Some((prop_pos, old_len)) => {
                self.splice_struct(prop_pos, 12 + pad4(old_len), &encoded);
            }
            None => {
                let body = self.node_body(node).ok_or(DriverError::BadFormat)?;
                self.splice_struct(body, 0, &encoded);
            }
        }
        Ok(())
    }

    pub fn setprop_u32(&mut self, node: usize, name: &str, value: u32) -> DriverResult<()> {
        self.setprop(node, name, &value.to_be_bytes())
    }

    pub fn setprop_u64(&mut self, node: usize, name: &str, value: u64) -> DriverResult<()> {
        self.setprop(node, name, &value.to_be_bytes())
    }

    pub fn setprop_str(&mut self, node: usize, name: &str, value: &str) -> DriverResult<()> {
        let mut raw = Vec::with_capacity(value.len() + 1);
        raw.extend_from_slice(value.as_bytes());
        raw.push(0);
        self.setprop(node, name, &raw)
    }

    /// Add an empty child node. Fails with `Busy` if it already exists.
    /// Invalidates node offsets; returns the new node's offset.
    pub fn add_subnode(&mut self, parent: usize, name: &str) -> DriverResult<usize> {
        if self.subnode_offset(parent, name).is_ok() {
            return Err(DriverError::Busy);
        }
        let end = self.node_end(parent).ok_or(DriverError::BadFormat)?;

        let mut encoded = Vec::with_capacity(8 + pad4(name.len() + 1));
        encoded.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        encoded.extend_from_slice(name.as_bytes());
        encoded.push(0);
        encoded.resize(4 + pad4(name.len() + 1), 0);
        encoded.extend_from_slice(&FDT_END_NODE.to_be_bytes());

        self.splice_struct(end, 0, &encoded);
        Ok(end)
    }

    /// Remove a node and its whole subtree. Invalidates node offsets.
    pub fn del_node(&mut self, node: usize) -> DriverResult<()> {
        let end = self.node_end(node).ok_or(DriverError::BadFormat)?;
        self.splice_struct(node, end + 4 - node, &[]);
        Ok(())
    }
}
