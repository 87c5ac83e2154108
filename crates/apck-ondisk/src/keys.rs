use apck_types::{
    OBJ_ID_MASK, OBJ_TYPE_MASK, OBJ_TYPE_SHIFT, OMAP_KEY_SIZE, OMAP_VAL_SIZE, PHYS_EXT_VAL_SIZE,
    ParseError, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Minimum value length of a `j_inode_val_t` (the fixed part, before any
/// extended fields).
pub const INODE_VAL_MIN_SIZE: usize = 92;
/// Fixed part of a `j_drec_val_t`: file_id (8) + date_added (8) + flags (2).
pub const DREC_VAL_MIN_SIZE: usize = 18;
/// `j_file_extent_val_t`: len_and_flags (8) + phys_block_num (8) + crypto_id (8).
pub const FILE_EXTENT_VAL_SIZE: usize = 24;
/// Fixed part of a `j_xattr_val_t`: flags (2) + xdata_len (2).
pub const XATTR_VAL_MIN_SIZE: usize = 4;
/// Fixed part of a `j_sibling_val_t`: parent_id (8) + name_len (2).
pub const SIBLING_VAL_MIN_SIZE: usize = 10;
/// `j_sibling_map_val_t`: file_id (8).
pub const SIBLING_MAP_VAL_SIZE: usize = 8;
/// `j_dstream_id_val_t`: refcnt (4).
pub const DSTREAM_ID_VAL_SIZE: usize = 4;
/// Fixed part of the hashed dentry key: header (8) + name_len_and_hash (4).
pub const DREC_HASHED_KEY_MIN_SIZE: usize = 12;
/// Fixed part of the xattr (and snapshot-name) key: header (8) + name_len (2).
pub const XATTR_KEY_MIN_SIZE: usize = 10;
/// `j_file_extent_key_t`: header (8) + logical_addr (8).
pub const FILE_EXTENT_KEY_SIZE: usize = 16;
/// `j_sibling_key_t`: header (8) + sibling_id (8).
pub const SIBLING_LINK_KEY_SIZE: usize = 16;

fn exact(data: &[u8], size: usize) -> Result<(), ParseError> {
    if data.len() != size {
        return Err(ParseError::InsufficientData {
            needed: size,
            offset: 0,
            actual: data.len(),
        });
    }
    Ok(())
}

fn at_least(data: &[u8], size: usize) -> Result<(), ParseError> {
    if data.len() < size {
        return Err(ParseError::InsufficientData {
            needed: size,
            offset: 0,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Extract the object id from a `j_key_t` header word.
#[must_use]
pub fn key_header_id(obj_id_and_type: u64) -> u64 {
    obj_id_and_type & OBJ_ID_MASK
}

/// Extract the record type from a `j_key_t` header word.
#[must_use]
pub fn key_header_type(obj_id_and_type: u64) -> u8 {
    ((obj_id_and_type & OBJ_TYPE_MASK) >> OBJ_TYPE_SHIFT) as u8
}

/// An `omap_key_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapKey {
    pub oid: u64,
    pub xid: u64,
}

impl OmapKey {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        exact(data, OMAP_KEY_SIZE)?;
        Ok(Self {
            oid: read_le_u64(data, 0)?,
            xid: read_le_u64(data, 8)?,
        })
    }
}

/// An `omap_val_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapVal {
    pub flags: u32,
    pub size: u32,
    pub paddr: u64,
}

impl OmapVal {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        exact(data, OMAP_VAL_SIZE)?;
        Ok(Self {
            flags: read_le_u32(data, 0)?,
            size: read_le_u32(data, 4)?,
            paddr: read_le_u64(data, 8)?,
        })
    }
}

/// A hashed directory-entry key. The name bytes include the terminating NUL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrecHashedKey<'a> {
    pub obj_id_and_type: u64,
    pub name_len_and_hash: u32,
    pub name: &'a [u8],
}

impl<'a> DrecHashedKey<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        at_least(data, DREC_HASHED_KEY_MIN_SIZE + 1)?;
        Ok(Self {
            obj_id_and_type: read_le_u64(data, 0)?,
            name_len_and_hash: read_le_u32(data, 8)?,
            name: &data[DREC_HASHED_KEY_MIN_SIZE..],
        })
    }
}

/// An xattr key. Snapshot-name keys share this exact layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XattrKey<'a> {
    pub obj_id_and_type: u64,
    pub name_len: u16,
    pub name: &'a [u8],
}

impl<'a> XattrKey<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        at_least(data, XATTR_KEY_MIN_SIZE + 1)?;
        Ok(Self {
            obj_id_and_type: read_le_u64(data, 0)?,
            name_len: read_le_u16(data, 8)?,
            name: &data[XATTR_KEY_MIN_SIZE..],
        })
    }
}

/// A file-extent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentKey {
    pub obj_id_and_type: u64,
    pub logical_addr: u64,
}

impl FileExtentKey {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        exact(data, FILE_EXTENT_KEY_SIZE)?;
        Ok(Self {
            obj_id_and_type: read_le_u64(data, 0)?,
            logical_addr: read_le_u64(data, 8)?,
        })
    }
}

/// A sibling-link key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingLinkKey {
    pub obj_id_and_type: u64,
    pub sibling_id: u64,
}

impl SiblingLinkKey {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        exact(data, SIBLING_LINK_KEY_SIZE)?;
        Ok(Self {
            obj_id_and_type: read_le_u64(data, 0)?,
            sibling_id: read_le_u64(data, 8)?,
        })
    }
}

/// A `j_phys_ext_val_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysExtVal {
    pub len_and_kind: u64,
    pub owning_obj_id: u64,
    pub refcnt: u32,
}

impl PhysExtVal {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        exact(data, PHYS_EXT_VAL_SIZE)?;
        Ok(Self {
            len_and_kind: read_le_u64(data, 0)?,
            owning_obj_id: read_le_u64(data, 8)?,
            refcnt: read_le_u32(data, 16)?,
        })
    }
}

/// The fixed part of a `j_inode_val_t`; extended fields may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeVal {
    pub parent_id: u64,
    pub private_id: u64,
    pub internal_flags: u64,
    pub nlink: i32,
    pub owner: u32,
    pub group: u32,
    pub mode: u16,
}

impl InodeVal {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        at_least(data, INODE_VAL_MIN_SIZE)?;
        Ok(Self {
            parent_id: read_le_u64(data, 0)?,
            private_id: read_le_u64(data, 8)?,
            internal_flags: read_le_u64(data, 48)?,
            nlink: read_le_u32(data, 56)? as i32,
            owner: read_le_u32(data, 72)?,
            group: read_le_u32(data, 76)?,
            mode: read_le_u16(data, 80)?,
        })
    }
}

/// The fixed part of a `j_drec_val_t`; extended fields may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrecVal {
    pub file_id: u64,
    pub date_added: u64,
    pub flags: u16,
}

impl DrecVal {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        at_least(data, DREC_VAL_MIN_SIZE)?;
        Ok(Self {
            file_id: read_le_u64(data, 0)?,
            date_added: read_le_u64(data, 8)?,
            flags: read_le_u16(data, 16)?,
        })
    }
}

/// A `j_file_extent_val_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentVal {
    pub len_and_flags: u64,
    pub phys_block_num: u64,
    pub crypto_id: u64,
}

impl FileExtentVal {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        exact(data, FILE_EXTENT_VAL_SIZE)?;
        Ok(Self {
            len_and_flags: read_le_u64(data, 0)?,
            phys_block_num: read_le_u64(data, 8)?,
            crypto_id: read_le_u64(data, 16)?,
        })
    }
}

/// An xattr value with its embedded or stream-reference payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XattrVal<'a> {
    pub flags: u16,
    pub xdata_len: u16,
    pub xdata: &'a [u8],
}

impl<'a> XattrVal<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        at_least(data, XATTR_VAL_MIN_SIZE)?;
        Ok(Self {
            flags: read_le_u16(data, 0)?,
            xdata_len: read_le_u16(data, 2)?,
            xdata: &data[XATTR_VAL_MIN_SIZE..],
        })
    }
}

/// A `j_sibling_val_t` with its borrowed name bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingVal<'a> {
    pub parent_id: u64,
    pub name_len: u16,
    pub name: &'a [u8],
}

impl<'a> SiblingVal<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        at_least(data, SIBLING_VAL_MIN_SIZE + 1)?;
        Ok(Self {
            parent_id: read_le_u64(data, 0)?,
            name_len: read_le_u16(data, 8)?,
            name: &data[SIBLING_VAL_MIN_SIZE..],
        })
    }
}

/// A `j_sibling_map_val_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingMapVal {
    pub file_id: u64,
}

impl SiblingMapVal {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        exact(data, SIBLING_MAP_VAL_SIZE)?;
        Ok(Self {
            file_id: read_le_u64(data, 0)?,
        })
    }
}

/// A `j_dstream_id_val_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DstreamIdVal {
    pub refcnt: u32,
}

impl DstreamIdVal {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        exact(data, DSTREAM_ID_VAL_SIZE)?;
        Ok(Self {
            refcnt: read_le_u32(data, 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apck_types::{APFS_TYPE_INODE, OBJ_TYPE_SHIFT};
    use proptest::prelude::*;

    #[test]
    fn key_header_packing() {
        let packed = (u64::from(APFS_TYPE_INODE) << OBJ_TYPE_SHIFT) | 0xABCD;
        assert_eq!(key_header_id(packed), 0xABCD);
        assert_eq!(key_header_type(packed), APFS_TYPE_INODE);
    }

    #[test]
    fn omap_key_and_val_exact_sizes() {
        let mut key = [0_u8; 16];
        key[0..8].copy_from_slice(&100_u64.to_le_bytes());
        key[8..16].copy_from_slice(&7_u64.to_le_bytes());
        let parsed = OmapKey::parse(&key).expect("omap key");
        assert_eq!(parsed.oid, 100);
        assert_eq!(parsed.xid, 7);
        assert!(OmapKey::parse(&key[..15]).is_err());

        let mut val = [0_u8; 16];
        val[8..16].copy_from_slice(&0x2000_u64.to_le_bytes());
        let parsed = OmapVal::parse(&val).expect("omap val");
        assert_eq!(parsed.paddr, 0x2000);
        assert!(OmapVal::parse(&[0_u8; 20]).is_err());
    }

    #[test]
    fn drec_key_carries_name_tail() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0x9000_0000_0000_0005_u64.to_le_bytes());
        raw.extend_from_slice(&0_u32.to_le_bytes());
        raw.extend_from_slice(b"a\0");
        let key = DrecHashedKey::parse(&raw).expect("drec key");
        assert_eq!(key.name, b"a\0");
        assert!(DrecHashedKey::parse(&raw[..12]).is_err());
    }

    #[test]
    fn phys_ext_val_fields() {
        let mut raw = [0_u8; 20];
        raw[0..8].copy_from_slice(&((1_u64 << 60) | 10).to_le_bytes());
        raw[8..16].copy_from_slice(&555_u64.to_le_bytes());
        raw[16..20].copy_from_slice(&2_u32.to_le_bytes());
        let val = PhysExtVal::parse(&raw).expect("phys ext val");
        assert_eq!(val.len_and_kind & 0x0FFF_FFFF_FFFF_FFFF, 10);
        assert_eq!(val.owning_obj_id, 555);
        assert_eq!(val.refcnt, 2);
    }

    #[test]
    fn inode_val_minimum_length() {
        let raw = vec![0_u8; INODE_VAL_MIN_SIZE];
        assert!(InodeVal::parse(&raw).is_ok());
        assert!(InodeVal::parse(&raw[..91]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn proptest_key_parsers_no_panic(data in proptest::collection::vec(any::<u8>(), 0..=64)) {
            let _ = OmapKey::parse(&data);
            let _ = OmapVal::parse(&data);
            let _ = DrecHashedKey::parse(&data);
            let _ = XattrKey::parse(&data);
            let _ = FileExtentKey::parse(&data);
            let _ = SiblingLinkKey::parse(&data);
            let _ = PhysExtVal::parse(&data);
        }

        #[test]
        fn proptest_val_parsers_no_panic(data in proptest::collection::vec(any::<u8>(), 0..=128)) {
            let _ = InodeVal::parse(&data);
            let _ = DrecVal::parse(&data);
            let _ = FileExtentVal::parse(&data);
            let _ = XattrVal::parse(&data);
            let _ = SiblingVal::parse(&data);
            let _ = SiblingMapVal::parse(&data);
            let _ = DstreamIdVal::parse(&data);
        }
    }
}
