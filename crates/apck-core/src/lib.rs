#![forbid(unsafe_code)]
//! Container bootstrap and check orchestration.
//!
//! Walks from block zero to the volume trees: container superblock →
//! container object map → volume superblock → volume object map → catalog,
//! extent reference and snapshot metadata trees. Every tree is fully
//! verified by `apck-btree`; this crate wires them together and aggregates
//! the statistics into a report.

use apck_block::{ByteDevice, FileByteDevice};
use apck_btree::{
    Btree, CheckContext, TreeStats, parse_cat_btree, parse_extentref_btree, parse_omap_btree,
    parse_snap_meta_btree, read_object,
};
use apck_error::{Result, corruption};
use apck_ondisk::{ApfsSuperblock, NxSuperblock};
use apck_types::{
    APFS_INCOMPAT_CASE_INSENSITIVE, BlockSize, OBJECT_TYPE_FS, OBJECT_TYPE_NX_SUPERBLOCK,
    read_le_u32,
};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Per-tree statistics as measured by the walk.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TreeReport {
    pub key_count: u64,
    pub node_count: u64,
    pub longest_key: usize,
    pub longest_val: usize,
}

impl From<TreeStats> for TreeReport {
    fn from(stats: TreeStats) -> Self {
        Self {
            key_count: stats.key_count,
            node_count: stats.node_count,
            longest_key: stats.longest_key,
            longest_val: stats.longest_val,
        }
    }
}

/// Outcome of a clean check pass over one container.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub block_size: u32,
    pub block_count: u64,
    pub xid: u64,
    pub case_insensitive: bool,
    pub container_omap: TreeReport,
    pub volume_omap: TreeReport,
    pub catalog: TreeReport,
    pub extentref: TreeReport,
    pub snap_meta: TreeReport,
}

/// The verified trees of one volume, retained for later passes.
#[derive(Debug)]
pub struct CheckedVolume {
    pub container_omap: Btree,
    pub volume_omap: Btree,
    pub catalog: Btree,
    pub extentref: Btree,
    pub snap_meta: Btree,
}

/// Read the container superblock at block zero. The block size is only
/// known once the superblock is parsed, so probe the geometry field first
/// and then re-read the full block for the checksum.
fn read_nx_superblock(dev: &dyn ByteDevice) -> Result<(NxSuperblock, BlockSize)> {
    let mut probe = [0_u8; 4096];
    dev.read_exact_at(0, &mut probe)?;
    let block_size = BlockSize::new(read_le_u32(&probe, 0x24)?)?;

    let mut block = vec![0_u8; block_size.as_usize()];
    dev.read_exact_at(0, &mut block)?;
    apck_ondisk::verify_object_checksum(&block)
        .map_err(|_| corruption("Container superblock", "bad checksum in block 0x0."))?;

    let nxsb = NxSuperblock::parse(&block)?;
    if nxsb.header.type_code() != OBJECT_TYPE_NX_SUPERBLOCK {
        return Err(corruption("Container superblock", "wrong object type."));
    }
    if nxsb.header.xid.0 == 0 {
        return Err(corruption("Container superblock", "invalid transaction id."));
    }
    Ok((nxsb, block_size))
}

/// Check every tree of the first volume in a container.
pub fn check_container(dev: &dyn ByteDevice) -> Result<(CheckReport, CheckedVolume)> {
    let (nxsb, block_size) = read_nx_superblock(dev)?;
    info!(
        target: "apck::core",
        event = "container",
        block_size = nxsb.block_size,
        xid = nxsb.header.xid.0
    );

    let mut ctx = CheckContext {
        dev,
        block_size,
        xid: nxsb.header.xid,
        case_insensitive: false,
    };

    let container_omap = parse_omap_btree(&ctx, nxsb.omap_oid)?;

    if nxsb.first_fs_oid.0 == 0 {
        return Err(corruption("Container superblock", "no volumes."));
    }
    let (vol_raw, vol_obj) =
        read_object(&ctx, nxsb.first_fs_oid, Some(&container_omap.root))?;
    if vol_obj.type_code != OBJECT_TYPE_FS {
        return Err(corruption("Volume superblock", "wrong object type."));
    }
    let apsb = ApfsSuperblock::parse(&vol_raw)?;

    ctx.case_insensitive =
        apsb.incompatible_features & APFS_INCOMPAT_CASE_INSENSITIVE != 0;
    info!(
        target: "apck::core",
        event = "volume",
        case_insensitive = ctx.case_insensitive
    );

    let volume_omap = parse_omap_btree(&ctx, apsb.omap_oid)?;
    let catalog = parse_cat_btree(&ctx, apsb.root_tree_oid, &volume_omap.root)?;
    let extentref = parse_extentref_btree(&ctx, apsb.extentref_tree_oid)?;
    let snap_meta = parse_snap_meta_btree(&ctx, apsb.snap_meta_tree_oid)?;

    let report = CheckReport {
        block_size: nxsb.block_size,
        block_count: nxsb.block_count,
        xid: nxsb.header.xid.0,
        case_insensitive: ctx.case_insensitive,
        container_omap: container_omap.stats.into(),
        volume_omap: volume_omap.stats.into(),
        catalog: catalog.stats.into(),
        extentref: extentref.stats.into(),
        snap_meta: snap_meta.stats.into(),
    };
    let volume = CheckedVolume {
        container_omap,
        volume_omap,
        catalog,
        extentref,
        snap_meta,
    };
    Ok((report, volume))
}

/// Check a container image stored in a file or block device node.
pub fn check_container_at_path(path: impl AsRef<Path>) -> Result<(CheckReport, CheckedVolume)> {
    let dev = FileByteDevice::open(path)?;
    check_container(&dev)
}

/// Parse just the container superblock of an image, without walking trees.
pub fn inspect_container(dev: &dyn ByteDevice) -> Result<NxSuperblock> {
    let (nxsb, _) = read_nx_superblock(dev)?;
    Ok(nxsb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apck_block::MemByteDevice;
    use proptest::prelude::*;

    #[test]
    fn empty_image_fails_cleanly() {
        let dev = MemByteDevice::new(Vec::new());
        assert!(check_container(&dev).is_err());
    }

    #[test]
    fn zeroed_image_is_rejected_on_geometry() {
        let dev = MemByteDevice::new(vec![0_u8; 64 * 1024]);
        let err = check_container(&dev).unwrap_err();
        // A zeroed block-size field is not a valid power of two
        assert!(err.to_string().contains("block_size"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn proptest_check_container_no_panic(
            image in proptest::collection::vec(any::<u8>(), 0..=32 * 1024),
        ) {
            let dev = MemByteDevice::new(image);
            let _ = check_container(&dev);
        }
    }
}
