//! The checker's fatal-error contract is a process contract: corruption
//! must exit non-zero with a diagnostic on stderr.

#[path = "../../apck-btree/tests/common/mod.rs"]
mod common;

use apck_types::{
    APFS_MAGIC, BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, NX_MAGIC,
    OBJECT_TYPE_BLOCKREFTREE, OBJECT_TYPE_FS, OBJECT_TYPE_FSTREE, OBJECT_TYPE_NX_SUPERBLOCK,
    OBJECT_TYPE_OMAP, OBJECT_TYPE_SNAPMETATREE,
};
use common::{
    BS, FooterSpec, NodeSpec, build_node, extref_key, extref_val, image_with, inode_key,
    inode_val, object_header, omap_key, omap_phys_block, omap_val, seal,
};
use std::io::Write;
use std::process::Command;

const XID: u64 = 7;

fn container_image() -> Vec<u8> {
    let mut nxsb = vec![0_u8; BS];
    object_header(&mut nxsb, 1, XID, OBJECT_TYPE_NX_SUPERBLOCK, 0);
    nxsb[0x20..0x24].copy_from_slice(&NX_MAGIC.to_le_bytes());
    nxsb[0x24..0x28].copy_from_slice(&(BS as u32).to_le_bytes());
    nxsb[0x28..0x30].copy_from_slice(&16_u64.to_le_bytes());
    nxsb[0xA0..0xA8].copy_from_slice(&2_u64.to_le_bytes());
    nxsb[0xB4..0xB8].copy_from_slice(&1_u32.to_le_bytes());
    nxsb[0xB8..0xC0].copy_from_slice(&0x402_u64.to_le_bytes());
    seal(&mut nxsb);

    let mut apsb = vec![0_u8; BS];
    object_header(&mut apsb, 0x402, XID, OBJECT_TYPE_FS, 0);
    apsb[0x20..0x24].copy_from_slice(&APFS_MAGIC.to_le_bytes());
    apsb[0x80..0x88].copy_from_slice(&5_u64.to_le_bytes());
    apsb[0x88..0x90].copy_from_slice(&0x604_u64.to_le_bytes());
    apsb[0x90..0x98].copy_from_slice(&8_u64.to_le_bytes());
    apsb[0x98..0xA0].copy_from_slice(&9_u64.to_le_bytes());
    seal(&mut apsb);

    let container_omap_root = build_node(
        &NodeSpec::new(
            3,
            XID,
            OBJECT_TYPE_OMAP,
            BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
            0,
        )
        .record(omap_key(0x402, XID), omap_val(4))
        .footer(FooterSpec::omap(1, 1)),
    );
    let volume_omap_root = build_node(
        &NodeSpec::new(
            6,
            XID,
            OBJECT_TYPE_OMAP,
            BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE,
            0,
        )
        .record(omap_key(0x604, XID), omap_val(7))
        .footer(FooterSpec::omap(1, 1)),
    );
    let catalog_root = build_node(
        &NodeSpec::new(0x604, XID, OBJECT_TYPE_FSTREE, BTNODE_ROOT | BTNODE_LEAF, 0)
            .record(inode_key(2), inode_val())
            .footer(FooterSpec::catalog(1, 1, 8, 92)),
    );
    let extentref_root = build_node(
        &NodeSpec::new(
            8,
            XID,
            OBJECT_TYPE_BLOCKREFTREE,
            BTNODE_ROOT | BTNODE_LEAF,
            0,
        )
        .record(extref_key(0x800), extref_val(4, 0x604, 1))
        .footer(FooterSpec::extentref(1, 1)),
    );
    let snap_meta_root = build_node(
        &NodeSpec::new(
            9,
            XID,
            OBJECT_TYPE_SNAPMETATREE,
            BTNODE_ROOT | BTNODE_LEAF,
            0,
        )
        .footer(FooterSpec::snap_meta()),
    );

    image_with(
        16,
        vec![
            (0, nxsb),
            (2, omap_phys_block(2, XID, 3)),
            (3, container_omap_root),
            (4, apsb),
            (5, omap_phys_block(5, XID, 6)),
            (6, volume_omap_root),
            (7, catalog_root),
            (8, extentref_root),
            (9, snap_meta_root),
        ],
    )
}

fn write_image(image: &[u8]) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(image).expect("write image");
    tmp.flush().expect("flush image");
    tmp
}

#[test]
fn check_exits_zero_on_a_clean_image() {
    let tmp = write_image(&container_image());
    let out = Command::new(env!("CARGO_BIN_EXE_apfsck"))
        .args(["check"])
        .arg(tmp.path())
        .output()
        .expect("run apfsck");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("volume appears to be clean"));
}

#[test]
fn check_exits_nonzero_on_corruption() {
    let mut image = container_image();
    image[7 * BS + 100] ^= 0x01; // corrupt the catalog root
    let tmp = write_image(&image);

    let out = Command::new(env!("CARGO_BIN_EXE_apfsck"))
        .args(["check"])
        .arg(tmp.path())
        .output()
        .expect("run apfsck");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("bad checksum in block 0x7"), "stderr: {stderr}");
}

#[test]
fn check_emits_json_report() {
    let tmp = write_image(&container_image());
    let out = Command::new(env!("CARGO_BIN_EXE_apfsck"))
        .args(["check", "--json"])
        .arg(tmp.path())
        .output()
        .expect("run apfsck");
    assert!(out.status.success());

    let report: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("valid JSON report");
    assert_eq!(report["block_size"], 4096);
    assert_eq!(report["catalog"]["key_count"], 1);
}
