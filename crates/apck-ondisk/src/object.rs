use apck_types::{
    OBJECT_HEADER_SIZE, OBJECT_TYPE_MASK, ObjectId, ParseError, Xid, ensure_slice, read_le_u32,
    read_le_u64,
};
use serde::{Deserialize, Serialize};

/// The 32-byte `obj_phys_t` header carried by every APFS metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub cksum: u64,
    pub oid: ObjectId,
    pub xid: Xid,
    pub obj_type: u32,
    pub subtype: u32,
}

impl ObjectHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < OBJECT_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: OBJECT_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            cksum: read_le_u64(block, 0x00)?,
            oid: ObjectId(read_le_u64(block, 0x08)?),
            xid: Xid(read_le_u64(block, 0x10)?),
            obj_type: read_le_u32(block, 0x18)?,
            subtype: read_le_u32(block, 0x1C)?,
        })
    }

    /// The type code (low 16 bits of `o_type`; the high bits are storage
    /// flags).
    #[must_use]
    pub fn type_code(self) -> u16 {
        (self.obj_type & OBJECT_TYPE_MASK) as u16
    }

    /// The subtype code. Subtypes never carry storage flags but share the
    /// type-code namespace.
    #[must_use]
    pub fn subtype_code(self) -> u16 {
        (self.subtype & OBJECT_TYPE_MASK) as u16
    }
}

/// Fletcher-64 over a stream of little-endian u32 words, as used for APFS
/// object checksums. `data` must be a multiple of four bytes (APFS blocks
/// always are once the 8-byte checksum field is skipped).
pub fn fletcher64(data: &[u8]) -> Result<u64, ParseError> {
    if data.len() % 4 != 0 {
        return Err(ParseError::InvalidField {
            field: "checksum_region",
            reason: "length must be a multiple of 4",
        });
    }

    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;
    for word in data.chunks_exact(4) {
        sum1 += u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        sum2 += sum1;
    }

    let c1 = 0xFFFF_FFFF - (sum1 + sum2) % 0xFFFF_FFFF;
    let c2 = 0xFFFF_FFFF - (sum1 + c1) % 0xFFFF_FFFF;
    Ok((c2 << 32) | c1)
}

/// Verify the object checksum of a metadata block: the fletcher64 of
/// everything after the 8-byte checksum field must equal the stored value.
pub fn verify_object_checksum(block: &[u8]) -> Result<(), ParseError> {
    ensure_slice(block, 0, OBJECT_HEADER_SIZE)?;
    let stored = read_le_u64(block, 0)?;
    let computed = fletcher64(&block[8..])?;
    if stored != computed {
        return Err(ParseError::InvalidField {
            field: "object_cksum",
            reason: "fletcher64 checksum mismatch",
        });
    }
    Ok(())
}
