//! Decoded B-tree keys and their ordering.
//!
//! A key is the tree-agnostic tuple `(id, type, number, name)`. Ordering is
//! lexicographic on those fields; a missing name compares equal at its
//! position. Xattr names compare bytewise, every other name compares as its
//! NFD-normalized (and, on case-insensitive volumes, case-folded) codepoint
//! sequence.

use apck_error::{Result, corruption};
use apck_ondisk::keys::{
    self, DrecHashedKey, FileExtentKey, OmapKey, SiblingLinkKey, XattrKey, key_header_id,
    key_header_type,
};
use apck_types::{
    APFS_TYPE_DIR_REC, APFS_TYPE_EXTENT, APFS_TYPE_FILE_EXTENT, APFS_TYPE_SIBLING_LINK,
    APFS_TYPE_SNAP_NAME, APFS_TYPE_XATTR, DREC_LEN_MASK, KEY_HEADER_SIZE, OMAP_KEY_SIZE,
    PHYS_EXT_KEY_SIZE, read_le_u64,
};
use crc::{CRC_32_ISCSI, Crc};
use std::cmp::Ordering;
use unicode_normalization::char::decompose_canonical;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// In-memory representation of a key, as relevant for a B-tree walk or
/// query. The name is owned so it survives the node it was decoded from.
#[derive(Debug, Clone, Default)]
pub struct Key {
    pub id: u64,
    /// Record type (0 for the omap).
    pub kind: u8,
    /// Extent offset, name hash or omap xid, depending on the record type.
    pub number: u64,
    pub name: Option<String>,
}

impl Key {
    /// Search key for an omap query at a given transaction.
    #[must_use]
    pub fn omap(oid: u64, xid: u64) -> Self {
        Self {
            id: oid,
            kind: 0,
            number: xid,
            name: None,
        }
    }

    /// Search key for an extent-reference query.
    #[must_use]
    pub fn extentref(bno: u64) -> Self {
        Self {
            id: bno,
            kind: APFS_TYPE_EXTENT,
            number: 0,
            name: None,
        }
    }
}

/// Compare two keys in B-tree order.
pub fn keycmp(k1: &Key, k2: &Key, case_insensitive: bool) -> Ordering {
    match k1.id.cmp(&k2.id) {
        Ordering::Equal => {}
        other => return other,
    }
    match k1.kind.cmp(&k2.kind) {
        Ordering::Equal => {}
        other => return other,
    }
    match k1.number.cmp(&k2.number) {
        Ordering::Equal => {}
        other => return other,
    }

    // Keys without a name compare equal at the name position
    let (Some(n1), Some(n2)) = (&k1.name, &k2.name) else {
        return Ordering::Equal;
    };

    if k1.kind == APFS_TYPE_XATTR {
        // xattr names are always case sensitive
        return n1.as_bytes().cmp(n2.as_bytes());
    }
    filename_cmp(n1, n2, case_insensitive)
}

/// NFD-decompose a filename into codepoints, case-folding each one on
/// case-insensitive volumes.
fn normalize(name: &str, case_fold: bool) -> Vec<u32> {
    let mut out = Vec::with_capacity(name.len());
    for c in name.chars() {
        decompose_canonical(c, |d| {
            if case_fold {
                out.extend(d.to_lowercase().map(|l| l as u32));
            } else {
                out.push(d as u32);
            }
        });
    }
    out
}

/// Normalize and compare two APFS filenames.
fn filename_cmp(name1: &str, name2: &str, case_fold: bool) -> Ordering {
    normalize(name1, case_fold).cmp(&normalize(name2, case_fold))
}

/// The key hash stored in a hashed dentry key: CRC32C over the normalized
/// UTF-32 name in the upper 22 bits, the name length (counting the NUL) in
/// the lower 10.
#[must_use]
pub fn dentry_hash(name: &str, case_fold: bool) -> u32 {
    let mut bytes = Vec::with_capacity(name.len() * 4);
    for cp in normalize(name, case_fold) {
        bytes.extend_from_slice(&cp.to_le_bytes());
    }
    // APFS seeds the CRC with 0xFFFFFFFF and never inverts; undo the
    // final xor the ISCSI parameter set applies.
    let hash = CASTAGNOLI.checksum(&bytes) ^ 0xFFFF_FFFF;

    // APFS counts the NUL termination for the filename length
    let namelen = (name.len() + 1) as u32;
    ((hash & 0x003F_FFFF) << 10) | (namelen & DREC_LEN_MASK)
}

/// Parse an on-disk object map key.
pub fn read_omap_key(raw: &[u8]) -> Result<Key> {
    if raw.len() != OMAP_KEY_SIZE {
        return Err(corruption("Object map", "wrong size of key."));
    }
    let omap_key = OmapKey::parse(raw)?;
    Ok(Key {
        id: omap_key.oid,
        kind: 0,
        number: omap_key.xid,
        name: None,
    })
}

/// Parse an on-disk extent-reference key.
pub fn read_extentref_key(raw: &[u8]) -> Result<Key> {
    if raw.len() != PHYS_EXT_KEY_SIZE {
        return Err(corruption("Extent reference tree", "wrong size of key."));
    }
    let hdr = read_le_u64(raw, 0)?;
    if key_header_type(hdr) != APFS_TYPE_EXTENT {
        return Err(corruption("Extent reference tree", "wrong record type."));
    }
    Ok(Key {
        id: key_header_id(hdr),
        kind: key_header_type(hdr),
        number: 0,
        name: None,
    })
}

/// Pull a NUL-terminated name out of a key's trailing bytes.
fn name_from_bytes(bytes: &[u8], context: &'static str) -> Result<String> {
    let Some((&0, body)) = bytes.split_last() else {
        return Err(corruption(context, "name lacks NUL-termination."));
    };
    // Names are compared and hashed as Unicode, so they must decode
    let Ok(name) = std::str::from_utf8(body) else {
        return Err(corruption(context, "name is not valid UTF-8."));
    };
    if name.bytes().any(|b| b == 0) {
        return Err(corruption(context, "name has an embedded NUL."));
    }
    Ok(name.to_owned())
}

fn read_dir_rec_key(raw: &[u8], case_insensitive: bool) -> Result<Key> {
    let raw_key = DrecHashedKey::parse(raw)
        .map_err(|_| corruption("Catalog", "wrong size for directory record key."))?;
    let name = name_from_bytes(raw_key.name, "Catalog")?;

    let number = u64::from(raw_key.name_len_and_hash);
    if raw_key.name_len_and_hash != dentry_hash(&name, case_insensitive) {
        return Err(corruption("Catalog", "corrupted dentry hash."));
    }

    // APFS counts the NUL termination for the filename length
    let namelen = (raw_key.name_len_and_hash & DREC_LEN_MASK) as usize;
    if name.len() + 1 != namelen {
        return Err(corruption("Catalog", "wrong name length in dentry key."));
    }
    if raw.len() != keys::DREC_HASHED_KEY_MIN_SIZE + namelen {
        return Err(corruption(
            "Catalog",
            "size of dentry key doesn't match the name length.",
        ));
    }

    Ok(Key {
        id: key_header_id(raw_key.obj_id_and_type),
        kind: APFS_TYPE_DIR_REC,
        number,
        name: Some(name),
    })
}

/// Shared reader for the xattr and snapshot-name keys, which have the same
/// layout.
fn read_named_key(raw: &[u8], kind: u8, context: &'static str) -> Result<Key> {
    let raw_key =
        XattrKey::parse(raw).map_err(|_| corruption(context, "wrong size for record key."))?;
    let name = name_from_bytes(raw_key.name, context)?;

    // APFS counts the NUL termination in the string length
    let namelen = usize::from(raw_key.name_len);
    if name.len() + 1 != namelen {
        return Err(corruption(context, "wrong name length in key."));
    }
    if raw.len() != keys::XATTR_KEY_MIN_SIZE + namelen {
        return Err(corruption(context, "size of key doesn't match the name length."));
    }

    Ok(Key {
        id: key_header_id(raw_key.obj_id_and_type),
        kind,
        number: 0,
        name: Some(name),
    })
}

/// Parse an on-disk catalog key.
pub fn read_cat_key(raw: &[u8], case_insensitive: bool) -> Result<Key> {
    if raw.len() < KEY_HEADER_SIZE {
        return Err(corruption("Catalog", "key is too small."));
    }
    let hdr = read_le_u64(raw, 0)?;
    let kind = key_header_type(hdr);

    match kind {
        APFS_TYPE_DIR_REC => read_dir_rec_key(raw, case_insensitive),
        APFS_TYPE_XATTR => read_named_key(raw, kind, "Xattr record"),
        APFS_TYPE_SNAP_NAME => read_named_key(raw, kind, "Snapshot name record"),
        APFS_TYPE_FILE_EXTENT => {
            let raw_key = FileExtentKey::parse(raw)
                .map_err(|_| corruption("Catalog", "wrong size of key for extent record."))?;
            Ok(Key {
                id: key_header_id(hdr),
                kind,
                number: raw_key.logical_addr,
                name: None,
            })
        }
        APFS_TYPE_SIBLING_LINK => {
            let raw_key = SiblingLinkKey::parse(raw)
                .map_err(|_| corruption("Catalog", "wrong size of key for sibling link record."))?;
            Ok(Key {
                id: key_header_id(hdr),
                kind,
                number: raw_key.sibling_id,
                name: None,
            })
        }
        _ => {
            // All other key types are just the header
            if raw.len() != KEY_HEADER_SIZE {
                return Err(corruption("Catalog", "wrong size of key for catalog record."));
            }
            Ok(Key {
                id: key_header_id(hdr),
                kind,
                number: 0,
                name: None,
            })
        }
    }
}
