//! Iterative B-tree queries.
//!
//! A query resolves a search key to the leaf record with the greatest key
//! not above the target. Multi-match queries keep a chain of parent
//! cursors so iteration can resume in a sibling subtree after one branch is
//! exhausted; the "no data" and "try another branch" conditions are local
//! signals consumed here and never escape to callers.

use crate::key::{Key, keycmp, read_cat_key, read_extentref_key, read_omap_key};
use crate::node::Node;
use crate::{BtreeKind, CheckContext};
use apck_error::{Result, corruption};
use apck_ondisk::keys::{OmapKey, OmapVal, PhysExtVal};
use apck_types::{BTREE_MAX_DEPTH, ObjectId, PEXT_LEN_MASK, read_le_u64};
use std::cmp::Ordering;

/// Search for multiple matches.
pub const QUERY_MULTIPLE: u32 = 0x01;
/// Find the next of multiple matches.
pub const QUERY_NEXT: u32 = 0x02;
/// Search for an exact match.
pub const QUERY_EXACT: u32 = 0x04;
/// The search at this level is over.
pub const QUERY_DONE: u32 = 0x08;

/// Outcome of a single-node search, consumed by `btree_query`.
enum Outcome {
    /// A record was selected; `off`/`len` are set.
    Hit,
    /// No appropriate entry exists.
    NoData,
    /// The next match may be in a sibling branch; pop to the parent.
    Again,
}

/// A query owns the node it searches, except at the tree root, which
/// outlives every query on it.
#[derive(Debug)]
enum QueryNode<'a> {
    Root(&'a Node),
    Child(Node),
}

impl QueryNode<'_> {
    fn get(&self) -> &Node {
        match self {
            QueryNode::Root(node) => node,
            QueryNode::Child(node) => node,
        }
    }
}

/// Cursor state for one level of a lookup.
#[derive(Debug)]
pub struct Query<'a> {
    node: QueryNode<'a>,
    kind: BtreeKind,
    omap_root: Option<&'a Node>,
    key: Key,
    parent: Option<Box<Query<'a>>>,
    flags: u32,
    index: u32,
    key_off: usize,
    key_len: usize,
    off: usize,
    len: usize,
    depth: u32,
}

impl<'a> Query<'a> {
    /// Start a query at the root of a tree. The search begins past the
    /// last record and works backwards.
    #[must_use]
    pub fn new(
        root: &'a Node,
        kind: BtreeKind,
        omap_root: Option<&'a Node>,
        key: Key,
        flags: u32,
    ) -> Self {
        Self {
            index: root.records(),
            node: QueryNode::Root(root),
            kind,
            omap_root,
            key,
            parent: None,
            flags,
            key_off: 0,
            key_len: 0,
            off: 0,
            len: 0,
            depth: 0,
        }
    }

    /// Push a child-level query, remembering the parent cursor.
    fn child(node: Node, parent: Box<Query<'a>>) -> Box<Query<'a>> {
        Box::new(Self {
            index: node.records(),
            node: QueryNode::Child(node),
            kind: parent.kind,
            omap_root: parent.omap_root,
            key: parent.key.clone(),
            flags: parent.flags & !(QUERY_DONE | QUERY_NEXT),
            key_off: 0,
            key_len: 0,
            off: 0,
            len: 0,
            depth: parent.depth + 1,
            parent: Some(parent),
        })
    }

    #[must_use]
    pub fn node(&self) -> &Node {
        self.node.get()
    }

    /// Raw bytes of the found record's key.
    #[must_use]
    pub fn key_bytes(&self) -> &[u8] {
        &self.node().raw()[self.key_off..self.key_off + self.key_len]
    }

    /// Raw bytes of the found record's value.
    #[must_use]
    pub fn value_bytes(&self) -> &[u8] {
        &self.node().raw()[self.off..self.off + self.len]
    }

    /// Decode the key at the current cursor position.
    fn key_from_query(&self, ctx: &CheckContext<'_>) -> Result<Key> {
        let raw = self.key_bytes();
        let mut key = match self.kind {
            BtreeKind::Omap => read_omap_key(raw)?,
            BtreeKind::Catalog => read_cat_key(raw, ctx.case_insensitive)?,
            BtreeKind::Extentref => read_extentref_key(raw)?,
            BtreeKind::SnapMeta => {
                return Err(corruption("B-tree", "query on a snapshot metadata tree."));
            }
        };

        if self.flags & QUERY_MULTIPLE != 0 {
            // A multiple query must ignore these fields
            key.number = 0;
            key.name = None;
        }
        Ok(key)
    }

    /// Step the cursor one record backwards in the current node.
    fn node_next(&mut self, ctx: &CheckContext<'_>) -> Result<Outcome> {
        if self.flags & QUERY_DONE != 0 {
            // Nothing left to search; the query failed
            return Ok(Outcome::NoData);
        }

        if self.index == 0 {
            // The next record may be in another node
            return Ok(Outcome::Again);
        }
        self.index -= 1;

        let (key_off, key_len) = self.node().locate_key(self.index)?;
        self.key_off = key_off;
        self.key_len = key_len;
        let curr_key = self.key_from_query(ctx)?;

        let cmp = keycmp(&curr_key, &self.key, ctx.case_insensitive);
        if cmp == Ordering::Greater {
            return Err(corruption("B-tree", "records are out of order."));
        }

        if cmp != Ordering::Equal && self.node().is_leaf() && self.flags & QUERY_EXACT != 0 {
            return Ok(Outcome::NoData);
        }

        let (off, len) = self.node().locate_data(self.index)?;
        if len == 0 {
            return Err(corruption(
                "B-tree",
                format!(
                    "corrupted record value in node {}.",
                    self.node().object.block_nr
                ),
            ));
        }
        self.off = off;
        self.len = len;

        if cmp != Ordering::Equal {
            // This is the last entry that can be relevant in this node.
            // Keep searching the children, but don't return to this level.
            self.flags |= QUERY_DONE;
        }

        Ok(Outcome::Hit)
    }

    /// Search one node by bisection for the greatest key not above the
    /// target.
    fn node_query(&mut self, ctx: &CheckContext<'_>) -> Result<Outcome> {
        if self.flags & QUERY_NEXT != 0 {
            return self.node_next(ctx);
        }

        let mut left: u32 = 0;
        let mut right: u32 = 0;
        let mut cmp = Ordering::Greater;
        loop {
            if cmp == Ordering::Greater {
                if self.index == 0 || self.index - 1 < left {
                    return Ok(Outcome::NoData);
                }
                right = self.index - 1;
                self.index = (left + right) / 2;
            } else {
                left = self.index;
                self.index = (left + right).div_ceil(2);
            }

            let (key_off, key_len) = self.node().locate_key(self.index)?;
            self.key_off = key_off;
            self.key_len = key_len;
            let curr_key = self.key_from_query(ctx)?;

            cmp = keycmp(&curr_key, &self.key, ctx.case_insensitive);
            if cmp == Ordering::Equal && self.flags & QUERY_MULTIPLE == 0 {
                break;
            }
            if left == right {
                break;
            }
        }

        if cmp == Ordering::Greater {
            return Ok(Outcome::NoData);
        }

        if cmp != Ordering::Equal && self.node().is_leaf() && self.flags & QUERY_EXACT != 0 {
            return Ok(Outcome::NoData);
        }

        if self.flags & QUERY_MULTIPLE != 0 {
            if cmp != Ordering::Equal {
                // Last relevant entry in this level
                self.flags |= QUERY_DONE;
            }
            self.flags |= QUERY_NEXT;
        }

        let (off, len) = self.node().locate_data(self.index)?;
        if len == 0 {
            return Err(corruption(
                "B-tree",
                format!(
                    "corrupted record value in node {}.",
                    self.node().object.block_nr
                ),
            ));
        }
        self.off = off;
        self.len = len;
        Ok(Outcome::Hit)
    }

    /// Read the child object id from a successful non-leaf hit.
    fn child_from_query(&self) -> Result<u64> {
        // The data on a nonleaf node is the child id
        if self.len != 8 {
            return Err(corruption("B-tree", "wrong size of nonleaf record value."));
        }
        Ok(read_le_u64(self.node().raw(), self.off)?)
    }
}

impl Drop for Query<'_> {
    fn drop(&mut self) {
        // Release the ancestor chain iteratively
        let mut parent = self.parent.take();
        while let Some(mut query) = parent {
            parent = query.parent.take();
        }
    }
}

/// Execute a query against a tree, descending from the query's node to a
/// leaf. Returns the final cursor and whether a record was found; every
/// structural inconsistency met along the way is fatal.
pub fn btree_query<'a>(
    ctx: &CheckContext<'_>,
    mut query: Box<Query<'a>>,
) -> Result<(Box<Query<'a>>, bool)> {
    loop {
        if query.depth >= BTREE_MAX_DEPTH {
            // This is the maximum depth allowed by the module
            return Err(corruption("B-tree", "is too deep."));
        }

        match query.node_query(ctx)? {
            Outcome::Again => {
                // Move back up one level and continue the query
                let Some(parent) = query.parent.take() else {
                    return Ok((query, false)); // We are at the root of the tree
                };
                query = parent;
                continue;
            }
            Outcome::NoData => return Ok((query, false)),
            Outcome::Hit => {}
        }

        if query.node().is_leaf() {
            return Ok((query, true)); // All done
        }

        // Now go a level deeper and search the child
        let child_id = query.child_from_query()?;
        let child = Node::read(ctx, ObjectId(child_id), query.kind, query.omap_root)?;

        if query.flags & QUERY_MULTIPLE != 0 {
            // We are looking for multiple entries, so we must remember
            // the parent node and index to continue the search later.
            query = Query::child(child, query);
        } else {
            // Reuse the same query to search the child
            query.node = QueryNode::Child(child);
            query.index = query.node().records();
            query.depth += 1;
        }
    }
}

/// Object map record data in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapRecord {
    pub bno: u64,
    pub xid: u64,
}

/// Find the object map record for an object id at the current transaction.
pub fn omap_lookup(ctx: &CheckContext<'_>, root: &Node, id: u64) -> Result<OmapRecord> {
    let query = Box::new(Query::new(
        root,
        BtreeKind::Omap,
        None,
        Key::omap(id, ctx.xid.0),
        0,
    ));

    // Omap queries for live objects must not fail
    let missing = || corruption("Object map", format!("record missing for id {id:#x}."));

    let (query, found) = btree_query(ctx, query)?;
    if !found {
        return Err(missing());
    }

    let val = OmapVal::parse(query.value_bytes())
        .map_err(|_| corruption("Object map record", "wrong size of value."))?;
    let key = OmapKey::parse(query.key_bytes())
        .map_err(|_| corruption("Object map record", "wrong size of key."))?;

    // The bisection returns the greatest key at or below the target, so a
    // missing id would otherwise resolve to a neighboring object
    if key.oid != id {
        return Err(missing());
    }

    Ok(OmapRecord {
        bno: val.paddr,
        xid: key.xid,
    })
}

/// Extent reference record data in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtrefRecord {
    pub phys_addr: u64,
    pub blocks: u64,
    pub owner: u64,
    pub refcnt: u32,
}

/// Find the best match for an extent in the extent reference tree.
pub fn extentref_lookup(ctx: &CheckContext<'_>, root: &Node, bno: u64) -> Result<ExtrefRecord> {
    let query = Box::new(Query::new(
        root,
        BtreeKind::Extentref,
        None,
        Key::extentref(bno),
        0,
    ));

    let (query, found) = btree_query(ctx, query)?;
    if !found {
        return Err(corruption(
            "Extent reference tree",
            format!("record missing for block number {bno:#x}."),
        ));
    }

    let val = PhysExtVal::parse(query.value_bytes())
        .map_err(|_| corruption("Extent reference record", "wrong size of value."))?;
    let hdr = read_le_u64(query.key_bytes(), 0)?;

    // The physical address is used as the id in the extentref tree
    Ok(ExtrefRecord {
        phys_addr: hdr & apck_types::OBJ_ID_MASK,
        blocks: val.len_and_kind & PEXT_LEN_MASK,
        owner: val.owning_obj_id,
        refcnt: val.refcnt,
    })
}
