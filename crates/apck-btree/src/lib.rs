#![forbid(unsafe_code)]
//! B-tree traversal and verification engine for the APFS checker.
//!
//! Walks the four on-disk B-tree personalities (object map, catalog,
//! extent reference, snapshot metadata), proving key ordering, node
//! layout, free-space accounting, object identity and footer statistics on
//! every node, and resolves point lookups through the same node reader.
//!
//! Structural violations are fatal: they surface as
//! [`apck_error::CheckError::Corruption`] and abort the whole check.

pub mod key;
pub mod node;
pub mod query;
pub mod records;

pub use key::{Key, dentry_hash, keycmp};
pub use node::{Node, ObjectInfo};
pub use query::{
    ExtrefRecord, OmapRecord, QUERY_EXACT, QUERY_MULTIPLE, Query, btree_query, extentref_lookup,
    omap_lookup,
};

use apck_block::{ByteDevice, read_block};
use apck_error::{CheckError, Result, corruption};
use apck_ondisk::{BtreeInfo, ObjectHeader, OmapPhys, verify_object_checksum};
use apck_types::{
    BlockNumber, BlockSize, OBJECT_TYPE_BLOCKREFTREE, OBJECT_TYPE_FSTREE, OBJECT_TYPE_INVALID,
    OBJECT_TYPE_OMAP, OBJECT_TYPE_SNAPMETATREE, OMAP_FLAGS_VALID_MASK, OMAP_KEY_SIZE,
    OMAP_VAL_SIZE, ObjectId, PHYS_EXT_KEY_SIZE, PHYS_EXT_VAL_SIZE, Xid, read_le_u64,
};
use std::cmp::Ordering;
use tracing::debug;

/// The four B-tree personalities this checker understands. Personality
/// decides the expected object subtype, the key decoder, the fixed-kv rule
/// and the leaf-record validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtreeKind {
    Omap,
    Catalog,
    Extentref,
    SnapMeta,
}

impl BtreeKind {
    pub(crate) fn subtype(self) -> u16 {
        match self {
            Self::Omap => OBJECT_TYPE_OMAP,
            Self::Catalog => OBJECT_TYPE_FSTREE,
            Self::Extentref => OBJECT_TYPE_BLOCKREFTREE,
            Self::SnapMeta => OBJECT_TYPE_SNAPMETATREE,
        }
    }

    pub(crate) fn node_context(self) -> &'static str {
        match self {
            Self::Omap => "Object map node",
            Self::Catalog => "Catalog node",
            Self::Extentref => "Extent reference tree node",
            Self::SnapMeta => "Snapshot metadata node",
        }
    }

    /// Context label used in footer and tree-level diagnostics.
    #[must_use]
    pub fn context(self) -> &'static str {
        match self {
            Self::Omap => "Object map",
            Self::Catalog => "Catalog",
            Self::Extentref => "Extent reference tree",
            Self::SnapMeta => "Snapshot metadata tree",
        }
    }

    /// Physical trees store their nodes at their object ids, with no omap
    /// indirection; their xids must cover their descendants'.
    pub(crate) fn is_physical(self) -> bool {
        matches!(self, Self::Omap | Self::Extentref)
    }
}

/// Read-only state shared by a whole check pass: the image, its geometry
/// and the container transaction, plus the volume's filename-folding
/// policy.
pub struct CheckContext<'a> {
    pub dev: &'a dyn ByteDevice,
    pub block_size: BlockSize,
    pub xid: Xid,
    pub case_insensitive: bool,
}

impl CheckContext<'_> {
    pub fn read_block(&self, bno: BlockNumber) -> Result<Vec<u8>> {
        read_block(self.dev, self.block_size, bno)
    }
}

/// Materialize one object block: resolve the id through the omap when the
/// object is virtual, then verify its checksum and header identity.
pub fn read_object(
    ctx: &CheckContext<'_>,
    oid: ObjectId,
    omap_root: Option<&Node>,
) -> Result<(Vec<u8>, ObjectInfo)> {
    let bno = match omap_root {
        Some(omap) => BlockNumber(omap_lookup(ctx, omap, oid.0)?.bno),
        None => BlockNumber(oid.0),
    };

    let raw = ctx.read_block(bno)?;
    verify_object_checksum(&raw)
        .map_err(|_| corruption("Object header", format!("bad checksum in block {bno}.")))?;

    let hdr = ObjectHeader::parse(&raw)?;
    if hdr.oid != oid {
        return Err(corruption(
            "Object header",
            format!("wrong object id in block {bno}."),
        ));
    }
    if hdr.xid.0 == 0 {
        return Err(corruption(
            "Object header",
            format!("invalid transaction id in block {bno}."),
        ));
    }
    if hdr.xid > ctx.xid {
        return Err(corruption(
            "Object header",
            format!("transaction id in block {bno} is in the future."),
        ));
    }

    let info = ObjectInfo {
        block_nr: bno,
        oid: hdr.oid,
        xid: hdr.xid,
        type_code: hdr.type_code(),
        subtype_code: hdr.subtype_code(),
    };
    Ok((raw, info))
}

/// Statistics accumulated over one tree, compared against its info footer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub key_count: u64,
    pub node_count: u64,
    pub longest_key: usize,
    pub longest_val: usize,
}

/// An end-to-end verified B-tree: its personality, its retained root node
/// and the statistics measured during the walk.
#[derive(Debug)]
pub struct Btree {
    pub kind: BtreeKind,
    pub root: Node,
    pub stats: TreeStats,
}

struct TreeCheck<'a> {
    ctx: &'a CheckContext<'a>,
    kind: BtreeKind,
    omap_root: Option<&'a Node>,
    stats: TreeStats,
}

impl TreeCheck<'_> {
    fn read_node(&self, oid: ObjectId) -> Result<Node> {
        Node::read(self.ctx, oid, self.kind, self.omap_root)
    }

    /// Walk one subtree, enforcing ordering, level, fixed-size and xid
    /// invariants, and dispatching leaf records to their validators.
    /// `last_key` carries the largest key seen so far, so ordering holds
    /// across node boundaries.
    fn walk(&mut self, node: &mut Node, last_key: &mut Key) -> Result<()> {
        let case_insensitive = self.ctx.case_insensitive;

        if node.is_leaf() {
            if node.level() != 0 {
                return Err(corruption("B-tree", "nonleaf node flagged as leaf."));
            }
            self.stats.key_count += u64::from(node.records());
        }
        self.stats.node_count += 1;

        match self.kind {
            BtreeKind::Omap => {
                if !node.has_fixed_kv_size() {
                    return Err(corruption("Object map", "key size should be fixed."));
                }
            }
            BtreeKind::Catalog => {
                if node.has_fixed_kv_size() {
                    return Err(corruption("Catalog", "key size should not be fixed."));
                }
            }
            // This makes little sense, but it appears to be true
            BtreeKind::Extentref => {
                if node.has_fixed_kv_size() {
                    return Err(corruption(
                        "Extent reference tree",
                        "key size shouldn't be fixed.",
                    ));
                }
            }
            BtreeKind::SnapMeta => {
                if node.has_fixed_kv_size() {
                    return Err(corruption("Snap meta tree", "key size shouldn't be fixed."));
                }
                if node.records() != 0 {
                    return Err(CheckError::UnknownFeature("Snapshots"));
                }
                if !node.is_leaf() {
                    return Err(corruption("Snap meta tree", "has no root node."));
                }
            }
        }

        for i in 0..node.records() {
            let (key_off, key_len) = node.locate_key(i)?;
            if key_len > self.stats.longest_key {
                self.stats.longest_key = key_len;
            }
            node.mark_key_used(key_off, key_len)?;

            let curr_key = {
                let raw_key = &node.raw()[key_off..key_off + key_len];
                match self.kind {
                    BtreeKind::Omap => {
                        let key = key::read_omap_key(raw_key)?;
                        // When a key is added, the node is updated
                        if key.number > node.object.xid.0 {
                            return Err(corruption(
                                "Object map",
                                "node xid is older than key xid.",
                            ));
                        }
                        key
                    }
                    BtreeKind::Catalog => key::read_cat_key(raw_key, case_insensitive)?,
                    BtreeKind::Extentref => key::read_extentref_key(raw_key)?,
                    BtreeKind::SnapMeta => {
                        return Err(CheckError::UnknownFeature("Snapshots"));
                    }
                }
            };

            if keycmp(last_key, &curr_key, case_insensitive) == Ordering::Greater {
                return Err(corruption("B-tree", "keys are out of order."));
            }
            if i != 0
                && node.is_leaf()
                && keycmp(last_key, &curr_key, case_insensitive) == Ordering::Equal
            {
                return Err(corruption("B-tree", "leaf keys are repeated."));
            }
            *last_key = curr_key;

            let (off, len) = node.locate_data(i)?;
            node.mark_val_used(off, len)?;

            if node.is_leaf() {
                if len > self.stats.longest_val {
                    self.stats.longest_val = len;
                }
                let raw = node.raw();
                let raw_key = &raw[key_off..key_off + key_len];
                let raw_val = &raw[off..off + len];
                match self.kind {
                    BtreeKind::Catalog => {
                        records::parse_cat_record(self.ctx, raw_key, raw_val)?;
                    }
                    BtreeKind::Extentref => {
                        // Physical extents must not overlap
                        last_key.id = records::parse_phys_ext_record(raw_key, raw_val)?;
                    }
                    BtreeKind::Omap | BtreeKind::SnapMeta => {}
                }
                continue;
            }

            if len != 8 {
                return Err(corruption("B-tree", "wrong size of nonleaf record value."));
            }
            let child_id = read_le_u64(node.raw(), off)?;
            let mut child = self.read_node(ObjectId(child_id))?;

            if u32::from(child.level()) + 1 != u32::from(node.level()) {
                return Err(corruption("B-tree", "node levels are corrupted."));
            }
            if child.is_root() {
                return Err(corruption("B-tree", "nonroot node is flagged as root."));
            }

            // If a physical node changes, the parent must update the bno
            if self.kind.is_physical() && node.object.xid < child.object.xid {
                return Err(corruption(
                    "Physical tree",
                    "xid of node is older than xid of its child.",
                ));
            }

            self.walk(&mut child, last_key)?;
        }

        // All records of this node are processed, so it's a good time for this
        node.reconcile_bitmaps()
    }

    /// Check the info footer against the collected statistics.
    fn check_btree_footer(&self, root: &Node) -> Result<()> {
        let context = self.kind.context();

        // Flags are not part of the footer, but this check fits best here
        if !root.is_root() {
            return Err(corruption(context, "wrong flag in root node."));
        }

        let info = BtreeInfo::parse_from_block_tail(root.raw())?;
        if info.node_size as usize != self.ctx.block_size.as_usize() {
            return Err(corruption(
                context,
                "nodes with more than a block are not supported.",
            ));
        }

        if info.key_count != self.stats.key_count {
            return Err(corruption(context, "wrong key count in info footer."));
        }
        if info.node_count != self.stats.node_count {
            return Err(corruption(context, "wrong node count in info footer."));
        }

        if self.kind == BtreeKind::Omap {
            if info.key_size as usize != OMAP_KEY_SIZE {
                return Err(corruption(context, "wrong key size in info footer."));
            }
            if info.val_size as usize != OMAP_VAL_SIZE {
                return Err(corruption(context, "wrong value size in info footer."));
            }
            if info.longest_key as usize != OMAP_KEY_SIZE {
                return Err(corruption(context, "wrong maximum key size in info footer."));
            }
            if info.longest_val as usize != OMAP_VAL_SIZE {
                return Err(corruption(
                    context,
                    "wrong maximum value size in info footer.",
                ));
            }
            return Ok(());
        }

        // For now, only the omap reports fixed key/value sizes
        if info.key_size != 0 {
            return Err(corruption(context, "key size should not be set."));
        }
        if info.val_size != 0 {
            return Err(corruption(context, "value size should not be set."));
        }

        match self.kind {
            BtreeKind::Catalog => {
                if (info.longest_key as usize) < self.stats.longest_key {
                    return Err(corruption(context, "wrong maximum key size in info footer."));
                }
                if (info.longest_val as usize) < self.stats.longest_val {
                    return Err(corruption(
                        context,
                        "wrong maximum value size in info footer.",
                    ));
                }
            }
            BtreeKind::Extentref => {
                // The extentref only seems to have records of one type.
                // No idea why it reports keys/values of variable size.
                if info.longest_key as usize != PHYS_EXT_KEY_SIZE {
                    return Err(corruption(context, "wrong maximum key size in info footer."));
                }
                if info.longest_val as usize != PHYS_EXT_VAL_SIZE {
                    return Err(corruption(
                        context,
                        "wrong maximum value size in info footer.",
                    ));
                }
            }
            BtreeKind::SnapMeta => {
                // Only empty snapshot metadata trees are supported
                if info.longest_key != 0 || info.longest_val != 0 {
                    return Err(CheckError::UnknownFeature("Snapshots"));
                }
            }
            BtreeKind::Omap => {}
        }
        Ok(())
    }
}

fn build_tree(
    ctx: &CheckContext<'_>,
    kind: BtreeKind,
    root_oid: ObjectId,
    omap_root: Option<&Node>,
) -> Result<Btree> {
    let mut check = TreeCheck {
        ctx,
        kind,
        omap_root,
        stats: TreeStats::default(),
    };

    let mut root = check.read_node(root_oid)?;
    let mut last_key = Key::default();
    check.walk(&mut root, &mut last_key)?;
    check.check_btree_footer(&root)?;

    debug!(
        target: "apck::btree",
        event = "tree_checked",
        kind = kind.context(),
        nodes = check.stats.node_count,
        keys = check.stats.key_count
    );

    Ok(Btree {
        kind,
        root,
        stats: check.stats,
    })
}

/// Parse and check an object map, starting from its `omap_phys` object.
pub fn parse_omap_btree(ctx: &CheckContext<'_>, oid: ObjectId) -> Result<Btree> {
    let (raw, obj) = read_object(ctx, oid, None)?;
    if obj.type_code != OBJECT_TYPE_OMAP {
        return Err(corruption("Object map", "wrong object type."));
    }
    if obj.subtype_code != OBJECT_TYPE_INVALID {
        return Err(corruption("Object map", "wrong object subtype."));
    }

    let phys = OmapPhys::parse(&raw)?;
    if phys.flags & !OMAP_FLAGS_VALID_MASK != 0 {
        return Err(corruption("Object map", "invalid flag in use."));
    }

    build_tree(ctx, BtreeKind::Omap, phys.tree_oid, None)
}

/// Parse and check a catalog tree; its nodes are virtual objects resolved
/// through the volume's object map.
pub fn parse_cat_btree(
    ctx: &CheckContext<'_>,
    oid: ObjectId,
    omap_root: &Node,
) -> Result<Btree> {
    build_tree(ctx, BtreeKind::Catalog, oid, Some(omap_root))
}

/// Parse and check an extent reference tree. These are physical objects.
pub fn parse_extentref_btree(ctx: &CheckContext<'_>, oid: ObjectId) -> Result<Btree> {
    build_tree(ctx, BtreeKind::Extentref, oid, None)
}

/// Parse and check a snapshot metadata tree. These are physical objects;
/// only empty trees are supported.
pub fn parse_snap_meta_btree(ctx: &CheckContext<'_>, oid: ObjectId) -> Result<Btree> {
    build_tree(ctx, BtreeKind::SnapMeta, oid, None)
}
