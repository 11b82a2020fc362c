#[path = "../src/backup.rs"]
mod backup;

use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[test]
fn zip_export_and_import_roundtrip_with_digest() {
    let workspace = temp_dir("assessd-backup-src");
    let workspace2 = temp_dir("assessd-backup-dst");
    let out_dir = temp_dir("assessd-backup-out");

    let db_src = workspace.join("assessd.sqlite3");
    let bytes = b"sqlite-test-payload";
    std::fs::write(&db_src, bytes).expect("write source db");

    let bundle_path = out_dir.join("workspace.assessd-backup.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256, sha256_hex(bytes));

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains(backup::BUNDLE_FORMAT_V1));
    assert!(manifest.contains(&export.db_sha256));
    archive
        .by_name("db/assessd.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);

    let restored = std::fs::read(workspace2.join("assessd.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn import_rejects_a_tampered_database_entry() {
    let out_dir = temp_dir("assessd-backup-tampered");
    let workspace = temp_dir("assessd-backup-tampered-dst");

    // Hand-built bundle whose manifest digest does not match the payload.
    let bundle_path = out_dir.join("tampered.zip");
    let f = File::create(&bundle_path).expect("create bundle");
    let mut zw = zip::ZipWriter::new(f);
    let opts = zip::write::FileOptions::default();
    zw.start_file("manifest.json", opts).expect("start manifest");
    let manifest = json!({
        "format": backup::BUNDLE_FORMAT_V1,
        "version": 1,
        "dbSha256": sha256_hex(b"the bytes the exporter saw"),
    });
    zw.write_all(manifest.to_string().as_bytes())
        .expect("write manifest");
    zw.start_file("db/assessd.sqlite3", opts)
        .expect("start db entry");
    zw.write_all(b"bytes someone swapped in afterwards")
        .expect("write db entry");
    zw.finish().expect("finish bundle");

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("tampered bundle must not import");
    assert!(err.to_string().contains("digest mismatch"), "{}", err);
    assert!(!workspace.join("assessd.sqlite3").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn import_rejects_unknown_bundle_formats() {
    let out_dir = temp_dir("assessd-backup-badformat");
    let workspace = temp_dir("assessd-backup-badformat-dst");

    let bundle_path = out_dir.join("foreign.zip");
    let f = File::create(&bundle_path).expect("create bundle");
    let mut zw = zip::ZipWriter::new(f);
    let opts = zip::write::FileOptions::default();
    zw.start_file("manifest.json", opts).expect("start manifest");
    zw.write_all(json!({ "format": "someone-elses-backup" }).to_string().as_bytes())
        .expect("write manifest");
    zw.start_file("db/assessd.sqlite3", opts)
        .expect("start db entry");
    zw.write_all(b"irrelevant").expect("write db entry");
    zw.finish().expect("finish bundle");

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("foreign bundle must not import");
    assert!(err.to_string().contains("unsupported bundle format"), "{}", err);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bare_sqlite_import_is_supported() {
    let out_dir = temp_dir("assessd-backup-bare");
    let workspace = temp_dir("assessd-backup-bare-dst");

    let bare_file = out_dir.join("plain.sqlite3");
    let bytes = b"bare-sqlite-copy";
    std::fs::write(&bare_file, bytes).expect("write bare sqlite file");

    let import =
        backup::import_workspace_bundle(&bare_file, &workspace).expect("import bare sqlite");
    assert_eq!(import.bundle_format_detected, "bare-sqlite3");

    let restored = std::fs::read(workspace.join("assessd.sqlite3")).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
