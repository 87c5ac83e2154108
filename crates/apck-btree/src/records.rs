//! Leaf-record validators.
//!
//! Each validator receives the raw key and value bytes of one leaf record
//! whose key has already been decoded and ordered. They check the value
//! layout and the cross-field constraints that do not require state beyond
//! the record itself.

use crate::CheckContext;
use apck_error::{CheckError, Result, corruption};
use apck_ondisk::keys::{
    DrecVal, DstreamIdVal, FileExtentKey, FileExtentVal, InodeVal, PhysExtVal, SiblingLinkKey,
    SiblingMapVal, SiblingVal, XattrVal, key_header_type,
};
use apck_types::{
    APFS_KIND_NEW, APFS_KIND_UPDATE, APFS_TYPE_DIR_REC, APFS_TYPE_DSTREAM_ID,
    APFS_TYPE_FILE_EXTENT, APFS_TYPE_INODE, APFS_TYPE_SIBLING_LINK, APFS_TYPE_SIBLING_MAP,
    APFS_TYPE_XATTR, DREC_TYPE_MASK, DT_BLK, DT_CHR, DT_DIR, DT_FIFO, DT_LNK, DT_REG, DT_SOCK,
    FILE_EXTENT_FLAG_MASK, FILE_EXTENT_LEN_MASK, PEXT_KIND_MASK, PEXT_KIND_SHIFT, PEXT_LEN_MASK,
    S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, XATTR_DATA_EMBEDDED,
    XATTR_DATA_STREAM, XATTR_DSTREAM_SIZE, XATTR_FLAGS_VALID_MASK, read_le_u64,
};

/// Dispatch one catalog leaf record to the validator for its type.
pub fn parse_cat_record(ctx: &CheckContext<'_>, raw_key: &[u8], raw_val: &[u8]) -> Result<()> {
    let hdr = read_le_u64(raw_key, 0)?;
    match key_header_type(hdr) {
        APFS_TYPE_INODE => parse_inode_record(raw_val),
        APFS_TYPE_DIR_REC => parse_dentry_record(raw_val),
        APFS_TYPE_FILE_EXTENT => parse_extent_record(ctx, raw_key, raw_val),
        APFS_TYPE_SIBLING_LINK => parse_sibling_record(raw_key, raw_val),
        APFS_TYPE_XATTR => parse_xattr_record(raw_val),
        APFS_TYPE_SIBLING_MAP => parse_sibling_map_record(raw_val),
        APFS_TYPE_DSTREAM_ID => parse_dstream_id_record(raw_val),
        _ => Err(CheckError::UnknownFeature(
            "Snapshots, encryption, directory statistics",
        )),
    }
}

fn parse_inode_record(raw_val: &[u8]) -> Result<()> {
    let val =
        InodeVal::parse(raw_val).map_err(|_| corruption("Inode record", "value is too small."))?;

    if val.nlink < 0 {
        return Err(corruption("Inode record", "negative link count."));
    }
    let file_type = val.mode & S_IFMT;
    if !matches!(
        file_type,
        S_IFIFO | S_IFCHR | S_IFDIR | S_IFBLK | S_IFREG | S_IFLNK | S_IFSOCK
    ) {
        return Err(corruption("Inode record", "invalid file mode."));
    }
    Ok(())
}

fn parse_dentry_record(raw_val: &[u8]) -> Result<()> {
    let val =
        DrecVal::parse(raw_val).map_err(|_| corruption("Dentry record", "value is too small."))?;

    if val.file_id == 0 {
        return Err(corruption("Dentry record", "file id is zero."));
    }
    let dtype = val.flags & DREC_TYPE_MASK;
    if !matches!(dtype, DT_FIFO | DT_CHR | DT_DIR | DT_BLK | DT_REG | DT_LNK | DT_SOCK) {
        return Err(corruption("Dentry record", "invalid file type."));
    }
    if val.flags & !DREC_TYPE_MASK != 0 {
        return Err(corruption("Dentry record", "invalid flag in use."));
    }
    Ok(())
}

fn parse_extent_record(ctx: &CheckContext<'_>, raw_key: &[u8], raw_val: &[u8]) -> Result<()> {
    let key = FileExtentKey::parse(raw_key)
        .map_err(|_| corruption("File extent record", "wrong size of key."))?;
    let val = FileExtentVal::parse(raw_val)
        .map_err(|_| corruption("File extent record", "wrong size of value."))?;

    let block_size = u64::from(ctx.block_size.get());
    if key.logical_addr % block_size != 0 {
        return Err(corruption("File extent record", "unaligned logical address."));
    }

    let length = val.len_and_flags & FILE_EXTENT_LEN_MASK;
    if val.len_and_flags & FILE_EXTENT_FLAG_MASK != 0 {
        return Err(corruption("File extent record", "invalid flag in use."));
    }
    if length == 0 || length % block_size != 0 {
        return Err(corruption("File extent record", "invalid extent length."));
    }
    if val.crypto_id != 0 {
        return Err(CheckError::UnknownFeature("Encryption"));
    }
    Ok(())
}

fn parse_xattr_record(raw_val: &[u8]) -> Result<()> {
    let val =
        XattrVal::parse(raw_val).map_err(|_| corruption("Xattr record", "value is too small."))?;

    if val.flags & !XATTR_FLAGS_VALID_MASK != 0 {
        return Err(corruption("Xattr record", "invalid flag in use."));
    }
    let stream = val.flags & XATTR_DATA_STREAM != 0;
    let embedded = val.flags & XATTR_DATA_EMBEDDED != 0;
    if stream == embedded {
        return Err(corruption(
            "Xattr record",
            "must be either embedded or a data stream.",
        ));
    }

    if usize::from(val.xdata_len) != val.xdata.len() {
        return Err(corruption("Xattr record", "wrong length for embedded data."));
    }
    if stream && val.xdata.len() != XATTR_DSTREAM_SIZE {
        return Err(corruption("Xattr record", "wrong size of data stream info."));
    }
    Ok(())
}

fn parse_sibling_record(raw_key: &[u8], raw_val: &[u8]) -> Result<()> {
    SiblingLinkKey::parse(raw_key)
        .map_err(|_| corruption("Sibling link record", "wrong size of key."))?;
    let val = SiblingVal::parse(raw_val)
        .map_err(|_| corruption("Sibling link record", "value is too small."))?;

    let namelen = usize::from(val.name_len);
    // The name length counts the NUL termination
    if val.name.len() != namelen {
        return Err(corruption("Sibling link record", "wrong name length."));
    }
    if val.name.last() != Some(&0) {
        return Err(corruption(
            "Sibling link record",
            "name lacks NUL-termination.",
        ));
    }
    Ok(())
}

fn parse_sibling_map_record(raw_val: &[u8]) -> Result<()> {
    let val = SiblingMapVal::parse(raw_val)
        .map_err(|_| corruption("Sibling map record", "wrong size of value."))?;
    if val.file_id == 0 {
        return Err(corruption("Sibling map record", "file id is zero."));
    }
    Ok(())
}

fn parse_dstream_id_record(raw_val: &[u8]) -> Result<()> {
    let val = DstreamIdVal::parse(raw_val)
        .map_err(|_| corruption("Data stream record", "wrong size of value."))?;
    if val.refcnt == 0 {
        return Err(corruption("Data stream record", "reference count is zero."));
    }
    Ok(())
}

/// Validate a physical-extent leaf record and derive the id the ordering
/// cursor should carry: the extent's last block, so that a later extent
/// starting inside this one compares out of order.
pub fn parse_phys_ext_record(raw_key: &[u8], raw_val: &[u8]) -> Result<u64> {
    let hdr = read_le_u64(raw_key, 0)?;
    let val = PhysExtVal::parse(raw_val)
        .map_err(|_| corruption("Extent reference record", "wrong size of value."))?;

    let kind = ((val.len_and_kind & PEXT_KIND_MASK) >> PEXT_KIND_SHIFT) as u8;
    if kind != APFS_KIND_NEW && kind != APFS_KIND_UPDATE {
        return Err(corruption("Extent reference record", "invalid kind."));
    }

    let blocks = val.len_and_kind & PEXT_LEN_MASK;
    if blocks == 0 {
        return Err(corruption("Extent reference record", "has zero blocks."));
    }
    if val.refcnt == 0 {
        return Err(corruption(
            "Extent reference record",
            "reference count is zero.",
        ));
    }
    if val.owning_obj_id == 0 {
        return Err(corruption("Extent reference record", "no owner set."));
    }

    let bno = hdr & apck_types::OBJ_ID_MASK;
    Ok(bno + blocks - 1)
}
