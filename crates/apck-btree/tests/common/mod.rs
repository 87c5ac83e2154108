//! Builders for synthetic APFS blocks used by the integration tests.
//!
//! Every produced block carries a correct fletcher64 seal, so the checker
//! exercises the same paths it would on a real image; corruption is
//! injected through the builder knobs, never by breaking the checksum.
#![allow(dead_code)]

use apck_ondisk::fletcher64;
use apck_types::{
    APFS_KIND_NEW, APFS_TYPE_EXTENT, APFS_TYPE_INODE, BTNODE_FIXED_KV_SIZE, BTNODE_ROOT,
    BTOFF_INVALID, BTREE_INFO_SIZE, BTREE_NODE_HEADER_SIZE, OBJ_TYPE_SHIFT,
    OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_OMAP, PEXT_KIND_SHIFT, S_IFREG,
};

pub const BS: usize = 4096;

/// Write an object header (checksum patched in by `seal`).
pub fn object_header(block: &mut [u8], oid: u64, xid: u64, type_code: u16, subtype: u16) {
    block[0x08..0x10].copy_from_slice(&oid.to_le_bytes());
    block[0x10..0x18].copy_from_slice(&xid.to_le_bytes());
    block[0x18..0x1C].copy_from_slice(&u32::from(type_code).to_le_bytes());
    block[0x1C..0x20].copy_from_slice(&u32::from(subtype).to_le_bytes());
}

/// Compute and store the fletcher64 object checksum.
pub fn seal(block: &mut [u8]) {
    let cksum = fletcher64(&block[8..]).expect("block is 4-byte aligned");
    block[0..8].copy_from_slice(&cksum.to_le_bytes());
}

/// Footer statistics for a root node.
#[derive(Debug, Clone, Copy, Default)]
pub struct FooterSpec {
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl FooterSpec {
    /// Footer of an omap tree with the given counts.
    pub fn omap(key_count: u64, node_count: u64) -> Self {
        Self {
            key_size: 16,
            val_size: 16,
            longest_key: 16,
            longest_val: 16,
            key_count,
            node_count,
        }
    }

    /// Footer of an extentref tree with the given counts.
    pub fn extentref(key_count: u64, node_count: u64) -> Self {
        Self {
            key_size: 0,
            val_size: 0,
            longest_key: 8,
            longest_val: 20,
            key_count,
            node_count,
        }
    }

    /// Footer of a catalog tree with the given counts and measured sizes.
    pub fn catalog(key_count: u64, node_count: u64, longest_key: u32, longest_val: u32) -> Self {
        Self {
            key_size: 0,
            val_size: 0,
            longest_key,
            longest_val,
            key_count,
            node_count,
        }
    }

    /// Footer of an empty snapshot metadata tree.
    pub fn snap_meta() -> Self {
        Self {
            node_count: 1,
            ..Self::default()
        }
    }
}

/// Description of one synthetic B-tree node block.
pub struct NodeSpec {
    pub oid: u64,
    pub xid: u64,
    pub subtype: u16,
    pub flags: u16,
    pub level: u16,
    pub records: Vec<(Vec<u8>, Vec<u8>)>,
    pub footer: Option<FooterSpec>,
    /// Extra unused bytes appended to the key area.
    pub key_area_extra: usize,
    /// Extra unused bytes prepended to the value area.
    pub val_area_extra: usize,
    /// Override the key free list head `(off, len)`.
    pub key_free_list: Option<(u16, u16)>,
    /// Override the value free list head `(off, len)`.
    pub val_free_list: Option<(u16, u16)>,
    /// Per-record overrides of the TOC value offset.
    pub val_off_overrides: Vec<(usize, u16)>,
}

impl NodeSpec {
    pub fn new(oid: u64, xid: u64, subtype: u16, flags: u16, level: u16) -> Self {
        Self {
            oid,
            xid,
            subtype,
            flags,
            level,
            records: Vec::new(),
            footer: None,
            key_area_extra: 0,
            val_area_extra: 0,
            key_free_list: None,
            val_free_list: None,
            val_off_overrides: Vec::new(),
        }
    }

    pub fn record(mut self, key: Vec<u8>, val: Vec<u8>) -> Self {
        self.records.push((key, val));
        self
    }

    pub fn footer(mut self, footer: FooterSpec) -> Self {
        self.footer = Some(footer);
        self
    }
}

/// Assemble one node block from its spec.
pub fn build_node(spec: &NodeSpec) -> Vec<u8> {
    let mut block = vec![0_u8; BS];
    let is_root = spec.flags & BTNODE_ROOT != 0;
    let fixed = spec.flags & BTNODE_FIXED_KV_SIZE != 0;
    let obj_type = if is_root {
        OBJECT_TYPE_BTREE
    } else {
        OBJECT_TYPE_BTREE_NODE
    };
    object_header(&mut block, spec.oid, spec.xid, obj_type, spec.subtype);

    let entry_size = if fixed { 4 } else { 8 };
    let toc = BTREE_NODE_HEADER_SIZE;
    let toc_len = spec.records.len() * entry_size;
    let key_area = toc + toc_len;

    let keys_len: usize = spec.records.iter().map(|(k, _)| k.len()).sum();
    let vals_len: usize = spec.records.iter().map(|(_, v)| v.len()).sum();
    let footer_len = if is_root { BTREE_INFO_SIZE } else { 0 };
    let area_end = BS - footer_len;
    let data = area_end - vals_len - spec.val_area_extra;
    let free = key_area + keys_len + spec.key_area_extra;

    // Node header fields after the object header
    let base = 0x20;
    block[base..base + 2].copy_from_slice(&spec.flags.to_le_bytes());
    block[base + 2..base + 4].copy_from_slice(&spec.level.to_le_bytes());
    block[base + 4..base + 8].copy_from_slice(&(spec.records.len() as u32).to_le_bytes());
    // table_space
    block[base + 8..base + 10].copy_from_slice(&0_u16.to_le_bytes());
    block[base + 10..base + 12].copy_from_slice(&(toc_len as u16).to_le_bytes());
    // free_space
    block[base + 12..base + 14].copy_from_slice(&((free - key_area) as u16).to_le_bytes());
    block[base + 14..base + 16].copy_from_slice(&((data - free) as u16).to_le_bytes());
    // key_free_list
    let (kf_off, kf_len) = spec
        .key_free_list
        .unwrap_or((BTOFF_INVALID, spec.key_area_extra as u16));
    block[base + 16..base + 18].copy_from_slice(&kf_off.to_le_bytes());
    block[base + 18..base + 20].copy_from_slice(&kf_len.to_le_bytes());
    // val_free_list
    let (vf_off, vf_len) = spec
        .val_free_list
        .unwrap_or((BTOFF_INVALID, spec.val_area_extra as u16));
    block[base + 20..base + 22].copy_from_slice(&vf_off.to_le_bytes());
    block[base + 22..base + 24].copy_from_slice(&vf_len.to_le_bytes());

    // TOC entries, key heap (upward) and value heap (downward)
    let mut key_off = 0_usize;
    let mut val_acc = 0_usize;
    for (i, (key, val)) in spec.records.iter().enumerate() {
        val_acc += val.len();
        let mut v_off = val_acc as u16;
        if let Some(&(_, over)) = spec.val_off_overrides.iter().find(|(idx, _)| *idx == i) {
            v_off = over;
        }

        let entry = toc + i * entry_size;
        if fixed {
            block[entry..entry + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
            block[entry + 2..entry + 4].copy_from_slice(&v_off.to_le_bytes());
        } else {
            block[entry..entry + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
            block[entry + 2..entry + 4].copy_from_slice(&(key.len() as u16).to_le_bytes());
            block[entry + 4..entry + 6].copy_from_slice(&v_off.to_le_bytes());
            block[entry + 6..entry + 8].copy_from_slice(&(val.len() as u16).to_le_bytes());
        }

        block[key_area + key_off..key_area + key_off + key.len()].copy_from_slice(key);
        key_off += key.len();

        let val_pos = area_end - val_acc;
        block[val_pos..val_pos + val.len()].copy_from_slice(val);
    }

    if let Some(footer) = &spec.footer {
        let info = BS - BTREE_INFO_SIZE;
        block[info + 0x04..info + 0x08].copy_from_slice(&(BS as u32).to_le_bytes());
        block[info + 0x08..info + 0x0C].copy_from_slice(&footer.key_size.to_le_bytes());
        block[info + 0x0C..info + 0x10].copy_from_slice(&footer.val_size.to_le_bytes());
        block[info + 0x10..info + 0x14].copy_from_slice(&footer.longest_key.to_le_bytes());
        block[info + 0x14..info + 0x18].copy_from_slice(&footer.longest_val.to_le_bytes());
        block[info + 0x18..info + 0x20].copy_from_slice(&footer.key_count.to_le_bytes());
        block[info + 0x20..info + 0x28].copy_from_slice(&footer.node_count.to_le_bytes());
    }

    seal(&mut block);
    block
}

/// Build an `omap_phys` object block pointing at a tree root.
pub fn omap_phys_block(oid: u64, xid: u64, tree_oid: u64) -> Vec<u8> {
    let mut block = vec![0_u8; BS];
    object_header(&mut block, oid, xid, OBJECT_TYPE_OMAP, 0);
    block[0x28..0x2C].copy_from_slice(&u32::from(OBJECT_TYPE_BTREE).to_le_bytes());
    block[0x30..0x38].copy_from_slice(&tree_oid.to_le_bytes());
    seal(&mut block);
    block
}

/// Place blocks at their block numbers in a zeroed image.
pub fn image_with(total_blocks: u64, blocks: Vec<(u64, Vec<u8>)>) -> Vec<u8> {
    let mut image = vec![0_u8; total_blocks as usize * BS];
    for (bno, block) in blocks {
        let start = bno as usize * BS;
        image[start..start + block.len()].copy_from_slice(&block);
    }
    image
}

// ── Record payloads ─────────────────────────────────────────────────────────

pub fn omap_key(oid: u64, xid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&oid.to_le_bytes());
    key.extend_from_slice(&xid.to_le_bytes());
    key
}

pub fn omap_val(paddr: u64) -> Vec<u8> {
    let mut val = vec![0_u8; 16];
    val[4..8].copy_from_slice(&(BS as u32).to_le_bytes());
    val[8..16].copy_from_slice(&paddr.to_le_bytes());
    val
}

/// The 8-byte child object id stored in non-leaf records.
pub fn child_val(oid: u64) -> Vec<u8> {
    oid.to_le_bytes().to_vec()
}

pub fn cat_key(id: u64, record_type: u8) -> Vec<u8> {
    let packed = (u64::from(record_type) << OBJ_TYPE_SHIFT) | id;
    packed.to_le_bytes().to_vec()
}

pub fn inode_key(id: u64) -> Vec<u8> {
    cat_key(id, APFS_TYPE_INODE)
}

pub fn inode_val() -> Vec<u8> {
    let mut val = vec![0_u8; 92];
    val[56..60].copy_from_slice(&1_u32.to_le_bytes()); // nlink
    val[80..82].copy_from_slice(&S_IFREG.to_le_bytes());
    val
}

pub fn extref_key(bno: u64) -> Vec<u8> {
    cat_key(bno, APFS_TYPE_EXTENT)
}

pub fn extref_val(blocks: u64, owner: u64, refcnt: u32) -> Vec<u8> {
    let mut val = vec![0_u8; 20];
    let len_and_kind = (u64::from(APFS_KIND_NEW) << PEXT_KIND_SHIFT) | blocks;
    val[0..8].copy_from_slice(&len_and_kind.to_le_bytes());
    val[8..16].copy_from_slice(&owner.to_le_bytes());
    val[16..20].copy_from_slice(&refcnt.to_le_bytes());
    val
}
