use apck_types::{
    BTREE_INFO_SIZE, BTREE_NODE_HEADER_SIZE, KVLOC_SIZE, KVOFF_SIZE, OBJECT_HEADER_SIZE,
    ParseError, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// An `nloc_t`: a location inside a B-tree node, relative to some area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nloc {
    pub off: u16,
    pub len: u16,
}

impl Nloc {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            off: read_le_u16(data, offset)?,
            len: read_le_u16(data, offset + 2)?,
        })
    }
}

/// The node-specific fields of `btree_node_phys_t`, which follow the object
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtnodeHeader {
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_space: Nloc,
    pub free_space: Nloc,
    pub key_free_list: Nloc,
    pub val_free_list: Nloc,
}

impl BtnodeHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BTREE_NODE_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTREE_NODE_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        let base = OBJECT_HEADER_SIZE;
        Ok(Self {
            flags: read_le_u16(block, base)?,
            level: read_le_u16(block, base + 0x02)?,
            nkeys: read_le_u32(block, base + 0x04)?,
            table_space: Nloc::parse(block, base + 0x08)?,
            free_space: Nloc::parse(block, base + 0x0C)?,
            key_free_list: Nloc::parse(block, base + 0x10)?,
            val_free_list: Nloc::parse(block, base + 0x14)?,
        })
    }
}

/// A `kvoff_t` TOC entry for fixed key/value size nodes: two plain offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvOff {
    pub k: u16,
    pub v: u16,
}

impl KvOff {
    /// Read entry `index` of a TOC starting at `toc_off` in the block.
    pub fn parse(block: &[u8], toc_off: usize, index: usize) -> Result<Self, ParseError> {
        let base = toc_off
            .checked_add(index.checked_mul(KVOFF_SIZE).ok_or(ParseError::InvalidField {
                field: "toc_index",
                reason: "overflow",
            })?)
            .ok_or(ParseError::InvalidField {
                field: "toc_index",
                reason: "overflow",
            })?;
        Ok(Self {
            k: read_le_u16(block, base)?,
            v: read_le_u16(block, base + 2)?,
        })
    }
}

/// A `kvloc_t` TOC entry for variable key/value size nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvLoc {
    pub k: Nloc,
    pub v: Nloc,
}

impl KvLoc {
    /// Read entry `index` of a TOC starting at `toc_off` in the block.
    pub fn parse(block: &[u8], toc_off: usize, index: usize) -> Result<Self, ParseError> {
        let base = toc_off
            .checked_add(index.checked_mul(KVLOC_SIZE).ok_or(ParseError::InvalidField {
                field: "toc_index",
                reason: "overflow",
            })?)
            .ok_or(ParseError::InvalidField {
                field: "toc_index",
                reason: "overflow",
            })?;
        Ok(Self {
            k: Nloc::parse(block, base)?,
            v: Nloc::parse(block, base + 4)?,
        })
    }
}

/// The `btree_info_t` footer stored at the tail of every root node block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BtreeInfo {
    /// Parse the footer from the last `BTREE_INFO_SIZE` bytes of a root
    /// node block.
    pub fn parse_from_block_tail(block: &[u8]) -> Result<Self, ParseError> {
        let Some(base) = block.len().checked_sub(BTREE_INFO_SIZE) else {
            return Err(ParseError::InsufficientData {
                needed: BTREE_INFO_SIZE,
                offset: 0,
                actual: block.len(),
            });
        };

        Ok(Self {
            flags: read_le_u32(block, base)?,
            node_size: read_le_u32(block, base + 0x04)?,
            key_size: read_le_u32(block, base + 0x08)?,
            val_size: read_le_u32(block, base + 0x0C)?,
            longest_key: read_le_u32(block, base + 0x10)?,
            longest_val: read_le_u32(block, base + 0x14)?,
            key_count: read_le_u64(block, base + 0x18)?,
            node_count: read_le_u64(block, base + 0x20)?,
        })
    }
}
