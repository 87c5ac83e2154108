use crate::object::ObjectHeader;
use apck_types::{
    APFS_MAGIC, NX_MAGIC, ObjectId, ParseError, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Offset of `nx_omap_oid` within `nx_superblock_t`.
const NX_OMAP_OID_OFFSET: usize = 0xA0;
/// Offset of the `nx_fs_oid` array.
const NX_FS_OID_OFFSET: usize = 0xB8;
/// Offset of `nx_max_file_systems`.
const NX_MAX_FILE_SYSTEMS_OFFSET: usize = 0xB4;
/// Number of entries in `nx_fs_oid`.
const NX_MAX_FILE_SYSTEMS: usize = 100;

/// The subset of `nx_superblock_t` the checker bootstraps from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NxSuperblock {
    pub header: ObjectHeader,
    pub block_size: u32,
    pub block_count: u64,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub omap_oid: ObjectId,
    pub max_file_systems: u32,
    pub first_fs_oid: ObjectId,
}

impl NxSuperblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let header = ObjectHeader::parse(block)?;

        let magic = read_le_u32(block, 0x20)?;
        if magic != NX_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(NX_MAGIC),
                actual: u64::from(magic),
            });
        }

        let max_file_systems = read_le_u32(block, NX_MAX_FILE_SYSTEMS_OFFSET)?;
        if max_file_systems as usize > NX_MAX_FILE_SYSTEMS {
            return Err(ParseError::InvalidField {
                field: "nx_max_file_systems",
                reason: "exceeds the 100-volume limit",
            });
        }

        Ok(Self {
            header,
            block_size: read_le_u32(block, 0x24)?,
            block_count: read_le_u64(block, 0x28)?,
            features: read_le_u64(block, 0x30)?,
            readonly_compatible_features: read_le_u64(block, 0x38)?,
            incompatible_features: read_le_u64(block, 0x40)?,
            omap_oid: ObjectId(read_le_u64(block, NX_OMAP_OID_OFFSET)?),
            max_file_systems,
            first_fs_oid: ObjectId(read_le_u64(block, NX_FS_OID_OFFSET)?),
        })
    }
}

/// The subset of `apfs_superblock_t` the checker needs: tree roots and the
/// feature flags that select the filename comparison policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApfsSuperblock {
    pub header: ObjectHeader,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub omap_oid: ObjectId,
    pub root_tree_oid: ObjectId,
    pub extentref_tree_oid: ObjectId,
    pub snap_meta_tree_oid: ObjectId,
}

impl ApfsSuperblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let header = ObjectHeader::parse(block)?;

        let magic = read_le_u32(block, 0x20)?;
        if magic != APFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(APFS_MAGIC),
                actual: u64::from(magic),
            });
        }

        Ok(Self {
            header,
            features: read_le_u64(block, 0x28)?,
            readonly_compatible_features: read_le_u64(block, 0x30)?,
            incompatible_features: read_le_u64(block, 0x38)?,
            omap_oid: ObjectId(read_le_u64(block, 0x80)?),
            root_tree_oid: ObjectId(read_le_u64(block, 0x88)?),
            extentref_tree_oid: ObjectId(read_le_u64(block, 0x90)?),
            snap_meta_tree_oid: ObjectId(read_le_u64(block, 0x98)?),
        })
    }
}

/// The subset of `omap_phys_t` the checker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapPhys {
    pub header: ObjectHeader,
    pub flags: u32,
    pub snap_count: u32,
    pub tree_type: u32,
    pub snapshot_tree_type: u32,
    pub tree_oid: ObjectId,
    pub snapshot_tree_oid: ObjectId,
}

impl OmapPhys {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let header = ObjectHeader::parse(block)?;
        Ok(Self {
            header,
            flags: read_le_u32(block, 0x20)?,
            snap_count: read_le_u32(block, 0x24)?,
            tree_type: read_le_u32(block, 0x28)?,
            snapshot_tree_type: read_le_u32(block, 0x2C)?,
            tree_oid: ObjectId(read_le_u64(block, 0x30)?),
            snapshot_tree_oid: ObjectId(read_le_u64(block, 0x38)?),
        })
    }
}
