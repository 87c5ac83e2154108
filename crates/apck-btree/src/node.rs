//! In-memory B-tree nodes: parsing, record addressing and free-space
//! reconciliation.
//!
//! A node block is densely packed: table of contents after the header, key
//! heap growing upward, value heap growing downward from the block end (or
//! from just before the info footer on root nodes), and two singly-linked
//! free lists threading the gaps. Everything here is bounds-checked against
//! the areas declared in the node header before any byte is interpreted.

use crate::{BtreeKind, CheckContext, read_object};
use apck_error::{Result, corruption};
use apck_ondisk::{BtnodeHeader, KvLoc, KvOff, Nloc};
use apck_types::{
    BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_MASK, BTNODE_ROOT, BTOFF_INVALID,
    BTREE_INFO_SIZE, BTREE_NODE_HEADER_SIZE, BlockNumber, KVLOC_SIZE, KVOFF_SIZE, NLOC_SIZE,
    OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE, ObjectId, Xid,
};
use tracing::trace;

/// Identity of the on-disk object backing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub block_nr: BlockNumber,
    pub oid: ObjectId,
    pub xid: Xid,
    pub type_code: u16,
    pub subtype_code: u16,
}

/// Byte-granular allocation bitmap over one node area.
#[derive(Debug, Clone)]
struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            bits: vec![0_u8; len.div_ceil(8)],
            len,
        }
    }

    fn get(&self, i: usize) -> bool {
        (self.bits[i / 8] >> (i % 8)) & 1 == 1
    }

    fn set(&mut self, i: usize) {
        self.bits[i / 8] |= 1 << (i % 8);
    }

    /// Number of clear bits in the area.
    fn count_zeros(&self) -> usize {
        (0..self.len).filter(|i| !self.get(*i)).count()
    }
}

/// One parsed B-tree node.
///
/// `toc`, `key`, `free` and `data` are byte offsets inside the block, in
/// monotonically increasing order. The free bitmaps record which bytes the
/// on-disk free lists claim; the used bitmaps are filled by the walker as
/// records are located.
#[derive(Debug)]
pub struct Node {
    flags: u16,
    level: u16,
    records: u32,

    toc: usize,
    key: usize,
    free: usize,
    data: usize,

    free_key_bmap: Bitmap,
    free_val_bmap: Bitmap,
    used_key_bmap: Bitmap,
    used_val_bmap: Bitmap,

    key_free_total: u16,
    val_free_total: u16,

    raw: Vec<u8>,
    pub object: ObjectInfo,
}

impl Node {
    /// Read and sanity-check one node.
    ///
    /// Resolves `oid` through `omap_root` when the tree is logical, maps
    /// the block, decodes the header offsets, verifies the node invariants
    /// and the object type/subtype expected for `kind`, and parses both
    /// free lists into bitmaps.
    pub fn read(
        ctx: &CheckContext<'_>,
        oid: ObjectId,
        kind: BtreeKind,
        omap_root: Option<&Node>,
    ) -> Result<Self> {
        let (raw, object) = read_object(ctx, oid, omap_root)?;
        let hdr = BtnodeHeader::parse(&raw)?;

        let toc = BTREE_NODE_HEADER_SIZE + usize::from(hdr.table_space.off);
        let key = toc + usize::from(hdr.table_space.len);
        let free = key + usize::from(hdr.free_space.off);
        let data = free + usize::from(hdr.free_space.len);

        let block_size = ctx.block_size.as_usize();
        let is_root = hdr.flags & BTNODE_ROOT != 0;
        let footer_len = if is_root { BTREE_INFO_SIZE } else { 0 };

        let mut sane = hdr.flags & !BTNODE_MASK == 0;
        if !is_root && hdr.nkeys == 0 {
            sane = false; // Empty children should just be deleted
        }
        if toc != BTREE_NODE_HEADER_SIZE {
            sane = false; // The table of contents follows the header
        }
        if data > block_size - footer_len {
            sane = false; // The value area must start before it ends
        }
        let entry_size = if hdr.flags & BTNODE_FIXED_KV_SIZE != 0 {
            KVOFF_SIZE
        } else {
            KVLOC_SIZE
        };
        // All records must have an entry in the table of contents
        if hdr.nkeys as usize * entry_size > key - toc {
            sane = false;
        }
        if !sane {
            return Err(corruption(
                "B-tree node",
                format!("block {} is not sane.", object.block_nr),
            ));
        }

        if is_root && object.type_code != OBJECT_TYPE_BTREE {
            return Err(corruption("B-tree node", "wrong object type for root."));
        }
        if !is_root && object.type_code != OBJECT_TYPE_BTREE_NODE {
            return Err(corruption("B-tree node", "wrong object type for nonroot."));
        }
        if object.subtype_code != kind.subtype() {
            return Err(corruption(kind.node_context(), "wrong object subtype."));
        }

        trace!(
            target: "apck::btree",
            event = "node_read",
            block = object.block_nr.0,
            level = hdr.level,
            records = hdr.nkeys
        );

        let key_area_len = free - key;
        let val_area_len = block_size - footer_len - data;

        let mut node = Self {
            flags: hdr.flags,
            level: hdr.level,
            records: hdr.nkeys,
            toc,
            key,
            free,
            data,
            free_key_bmap: Bitmap::new(key_area_len),
            free_val_bmap: Bitmap::new(val_area_len),
            used_key_bmap: Bitmap::new(key_area_len),
            used_val_bmap: Bitmap::new(val_area_len),
            key_free_total: hdr.key_free_list.len,
            val_free_total: hdr.val_free_list.len,
            raw,
            object,
        };
        node.parse_key_free_list(hdr.key_free_list)?;
        node.parse_val_free_list(hdr.val_free_list)?;
        Ok(node)
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    #[must_use]
    pub fn has_fixed_kv_size(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    #[must_use]
    pub fn level(&self) -> u16 {
        self.level
    }

    #[must_use]
    pub fn records(&self) -> u32 {
        self.records
    }

    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn val_area_len(&self) -> usize {
        self.free_val_bmap.len
    }

    /// Walk the key free list into `free_key_bmap`. Offsets are relative to
    /// the start of the key area and grow upward.
    fn parse_key_free_list(&mut self, head: Nloc) -> Result<()> {
        let area_len = self.free_key_bmap.len;
        let mut total = i64::from(head.len);
        let mut off = head.off;

        while total > 0 {
            // Tiny free areas may not be in the list
            if off == BTOFF_INVALID {
                break;
            }

            let off_us = usize::from(off);
            if off_us + NLOC_SIZE > area_len {
                return Err(corruption(
                    "B-tree node",
                    "no room for free list entry in key area.",
                ));
            }
            let cell = Nloc::parse(&self.raw, self.key + off_us)?;
            let len = usize::from(cell.len);
            if len < NLOC_SIZE {
                return Err(corruption("B-tree node", "free key is too small."));
            }
            if off_us + len > area_len {
                return Err(corruption("B-tree node", "free key is out-of-bounds."));
            }

            for i in off_us..off_us + len {
                if self.free_key_bmap.get(i) {
                    return Err(corruption(
                        "B-tree node",
                        "byte listed twice in free key list.",
                    ));
                }
                self.free_key_bmap.set(i);
            }
            total -= len as i64;

            off = cell.off;
        }

        if off != BTOFF_INVALID {
            return Err(corruption("B-tree node", "bad last key in free list."));
        }
        Ok(())
    }

    /// Walk the value free list into `free_val_bmap`. Offsets are measured
    /// backwards from the end of the value area.
    fn parse_val_free_list(&mut self, head: Nloc) -> Result<()> {
        let area_len = self.val_area_len();
        let mut total = i64::from(head.len);
        let mut off = head.off;

        while total > 0 {
            // Tiny free areas may not be in the list
            if off == BTOFF_INVALID {
                break;
            }

            let off_us = usize::from(off);
            if off_us < NLOC_SIZE {
                return Err(corruption(
                    "B-tree node",
                    "no room for free list entry in value area.",
                ));
            }
            if off_us > area_len {
                return Err(corruption("B-tree node", "free value is out-of-bounds."));
            }
            let cell = Nloc::parse(&self.raw, self.data + area_len - off_us)?;
            let len = usize::from(cell.len);
            if len < NLOC_SIZE {
                return Err(corruption("B-tree node", "free value is too small."));
            }
            if len > off_us {
                return Err(corruption("B-tree node", "free value is out-of-bounds."));
            }

            for i in area_len - off_us..area_len - off_us + len {
                if self.free_val_bmap.get(i) {
                    return Err(corruption(
                        "B-tree node",
                        "byte listed twice in free value list.",
                    ));
                }
                self.free_val_bmap.set(i);
            }
            total -= len as i64;

            off = cell.off;
        }

        if off != BTOFF_INVALID {
            return Err(corruption("B-tree node", "bad last value in free list."));
        }
        Ok(())
    }

    /// Locate the key of record `index`.
    ///
    /// Returns `(offset_in_block, length)` after checking the whole range
    /// lies inside the key area.
    pub fn locate_key(&self, index: u32) -> Result<(usize, usize)> {
        if index >= self.records {
            return Err(corruption("B-tree node", "requested index out-of-bounds."));
        }

        let (len, off_in_area) = if self.has_fixed_kv_size() {
            let entry = KvOff::parse(&self.raw, self.toc, index as usize)?;
            (16, usize::from(entry.k))
        } else {
            let entry = KvLoc::parse(&self.raw, self.toc, index as usize)?;
            (usize::from(entry.k.len), usize::from(entry.k.off))
        };

        let off = self.key + off_in_area;
        if off + len > self.free {
            return Err(corruption("B-tree", "key is out-of-bounds."));
        }
        Ok((off, len))
    }

    /// Locate the value of record `index`.
    ///
    /// Value offsets are measured backwards from the end of the value area;
    /// the area excludes the info footer on root nodes. The whole byte
    /// range must lie inside the area.
    pub fn locate_data(&self, index: u32) -> Result<(usize, usize)> {
        if index >= self.records {
            return Err(corruption("B-tree", "requested index out-of-bounds."));
        }

        let area_len = self.val_area_len();
        let (len, v_off) = if self.has_fixed_kv_size() {
            let entry = KvOff::parse(&self.raw, self.toc, index as usize)?;
            // Node type decides the length
            let len = if self.is_leaf() { 16 } else { 8 };
            (len, usize::from(entry.v))
        } else {
            let entry = KvLoc::parse(&self.raw, self.toc, index as usize)?;
            (usize::from(entry.v.len), usize::from(entry.v.off))
        };

        if v_off > area_len {
            return Err(corruption("B-tree", "value is out-of-bounds."));
        }
        let off_in_area = area_len - v_off;
        if off_in_area >= area_len || off_in_area + len > area_len {
            return Err(corruption("B-tree", "value is out-of-bounds."));
        }
        Ok((self.data + off_in_area, len))
    }

    /// Mark a located key as used; overlapping records are corruption.
    pub(crate) fn mark_key_used(&mut self, off_in_block: usize, len: usize) -> Result<()> {
        mark_used(&mut self.used_key_bmap, off_in_block - self.key, len)
    }

    /// Mark a located value as used; overlapping records are corruption.
    pub(crate) fn mark_val_used(&mut self, off_in_block: usize, len: usize) -> Result<()> {
        mark_used(&mut self.used_val_bmap, off_in_block - self.data, len)
    }

    /// Reconcile the free-list and used bitmaps after every record has
    /// been located.
    ///
    /// The free list must never claim a used byte, and the advertised free
    /// total must equal the number of unused bytes in the area, including
    /// fragments too small to be linked, which only the used bitmap sees.
    pub(crate) fn reconcile_bitmaps(&self) -> Result<()> {
        let unused = compare_bmaps(&self.free_key_bmap, &self.used_key_bmap)?;
        if unused != usize::from(self.key_free_total) {
            return Err(corruption("B-tree", "wrong free space total for key area."));
        }

        let unused = compare_bmaps(&self.free_val_bmap, &self.used_val_bmap)?;
        if unused != usize::from(self.val_free_total) {
            return Err(corruption(
                "B-tree",
                "wrong free space total for value area.",
            ));
        }
        Ok(())
    }
}

fn mark_used(bitmap: &mut Bitmap, off: usize, len: usize) -> Result<()> {
    for i in off..off + len {
        if bitmap.get(i) {
            return Err(corruption("B-tree node", "overlapping record data."));
        }
        bitmap.set(i);
    }
    Ok(())
}

/// Compare one area's free-list bitmap against its used bitmap, returning
/// the total number of unused bytes.
fn compare_bmaps(free_bmap: &Bitmap, used_bmap: &Bitmap) -> Result<usize> {
    let mut unused = 0;
    for i in 0..used_bmap.len {
        if !used_bmap.get(i) {
            unused += 1;
        }
        if used_bmap.get(i) && free_bmap.get(i) {
            return Err(corruption("B-tree node", "used record space listed as free."));
        }
    }
    Ok(unused)
}
