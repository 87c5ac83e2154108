#![forbid(unsafe_code)]
//! On-disk format parsing for APFS structures.
//!
//! Pure parsing crate — no I/O, no side effects. Parses byte slices into
//! typed Rust structures representing object headers, B-tree node headers,
//! tables of contents, info footers, key and value layouts, object maps and
//! the container/volume superblocks.

pub mod keys;
pub mod node;
pub mod object;
pub mod volume;

pub use keys::{
    DrecHashedKey, DrecVal, DstreamIdVal, FileExtentKey, FileExtentVal, InodeVal, OmapKey,
    OmapVal, PhysExtVal, SiblingLinkKey, SiblingMapVal, SiblingVal, XattrKey, XattrVal,
    key_header_id, key_header_type,
};
pub use node::{BtnodeHeader, BtreeInfo, KvLoc, KvOff, Nloc};
pub use object::{ObjectHeader, fletcher64, verify_object_checksum};
pub use volume::{ApfsSuperblock, NxSuperblock, OmapPhys};
