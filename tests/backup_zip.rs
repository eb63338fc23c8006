#[path = "../src/backup.rs"]
mod backup;

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

fn seed_db(path: &Path, class_name: &str) {
    let conn = rusqlite::Connection::open(path).expect("open sqlite");
    conn.execute_batch("CREATE TABLE classes(name TEXT NOT NULL)")
        .expect("create table");
    conn.execute("INSERT INTO classes(name) VALUES(?)", [class_name])
        .expect("insert class");
}

fn class_names(path: &Path) -> Vec<String> {
    let conn = rusqlite::Connection::open(path).expect("open sqlite");
    let mut stmt = conn
        .prepare("SELECT name FROM classes ORDER BY name")
        .expect("prepare");
    let names = stmt
        .query_map([], |r| r.get(0))
        .expect("query")
        .collect::<Result<Vec<String>, _>>()
        .expect("rows");
    names
}

fn rewrite_db_entry(src: &Path, dst: &Path, payload: &[u8]) {
    let mut archive = zip::ZipArchive::new(File::open(src).expect("open bundle")).expect("zip");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");

    let mut out = zip::ZipWriter::new(File::create(dst).expect("create tampered bundle"));
    let opts = zip::write::FileOptions::default();
    out.start_file("manifest.json", opts).expect("start manifest");
    out.write_all(manifest.as_bytes()).expect("write manifest");
    out.start_file("db/school.sqlite3", opts).expect("start db");
    out.write_all(payload).expect("write db");
    out.finish().expect("finish zip");
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = tempfile::tempdir().expect("src workspace");
    let workspace2 = tempfile::tempdir().expect("dst workspace");
    let out_dir = tempfile::tempdir().expect("out dir");

    let db_src = workspace.path().join("school.sqlite3");
    seed_db(&db_src, "Grade 5");
    let bytes = std::fs::read(&db_src).expect("read source db");

    let bundle_path = out_dir.path().join("nested").join("workspace.backup.zip");
    let export =
        backup::export_workspace_bundle(workspace.path(), &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256.len(), 64);

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
        .by_name("db/school.sqlite3")
        .expect("database entry in bundle");
    archive
        .by_name("meta/workspace.json")
        .expect("workspace metadata entry");

    seed_db(&workspace2.path().join("school.sqlite3"), "Old class");
    let import = backup::import_workspace_bundle(&bundle_path, workspace2.path())
        .expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);

    let restored_path = workspace2.path().join("school.sqlite3");
    let restored = std::fs::read(&restored_path).expect("read restored db");
    assert_eq!(restored, bytes);
    assert_eq!(class_names(&restored_path), vec!["Grade 5".to_string()]);
    assert!(!workspace2.path().join("school.sqlite3.importing").exists());
}

#[test]
fn tampered_bundle_is_rejected_and_leaves_database_alone() {
    let workspace = tempfile::tempdir().expect("src workspace");
    let target = tempfile::tempdir().expect("dst workspace");
    let out_dir = tempfile::tempdir().expect("out dir");

    seed_db(&workspace.path().join("school.sqlite3"), "Genuine");
    let bundle_path = out_dir.path().join("good.zip");
    backup::export_workspace_bundle(workspace.path(), &bundle_path).expect("export bundle");

    let tampered = out_dir.path().join("tampered.zip");
    rewrite_db_entry(&bundle_path, &tampered, b"forged");

    let target_db = target.path().join("school.sqlite3");
    seed_db(&target_db, "Keep me");
    let before = std::fs::read(&target_db).expect("read db");
    let result = backup::import_workspace_bundle(&tampered, target.path());
    let message = format!("{:#}", result.expect_err("checksum mismatch"));
    assert!(message.contains("checksum"), "{}", message);

    let kept = std::fs::read(&target_db).expect("read db");
    assert_eq!(kept, before);
}

#[test]
fn missing_workspace_database_fails_export() {
    let workspace = tempfile::tempdir().expect("empty workspace");
    let out = workspace.path().join("out.zip");
    assert!(backup::export_workspace_bundle(workspace.path(), &out).is_err());
}

#[test]
fn legacy_sqlite_import_is_supported() {
    let out_dir = tempfile::tempdir().expect("legacy dir");
    let workspace = tempfile::tempdir().expect("legacy dst");

    let legacy_file = out_dir.path().join("legacy.sqlite3");
    seed_db(&legacy_file, "Legacy class");
    let bytes = std::fs::read(&legacy_file).expect("read legacy file");

    let import = backup::import_workspace_bundle(&legacy_file, workspace.path())
        .expect("import legacy sqlite");
    assert_eq!(import.bundle_format_detected, "legacy-sqlite3");

    let restored_path = workspace.path().join("school.sqlite3");
    let restored = std::fs::read(&restored_path).expect("read restored sqlite");
    assert_eq!(restored, bytes);
    assert_eq!(class_names(&restored_path), vec!["Legacy class".to_string()]);
}

#[test]
fn non_sqlite_file_is_rejected_and_leaves_database_alone() {
    let out_dir = tempfile::tempdir().expect("input dir");
    let workspace = tempfile::tempdir().expect("workspace");

    let db_path = workspace.path().join("school.sqlite3");
    seed_db(&db_path, "Grade 7");
    let before = std::fs::read(&db_path).expect("read db");

    let notes = out_dir.path().join("notes.txt");
    std::fs::write(&notes, b"not a database at all").expect("write notes");
    let result = backup::import_workspace_bundle(&notes, workspace.path());
    let message = format!("{:#}", result.expect_err("non-sqlite import"));
    assert!(message.contains("SQLite"), "{}", message);

    assert_eq!(std::fs::read(&db_path).expect("read db"), before);
    assert_eq!(class_names(&db_path), vec!["Grade 7".to_string()]);
    assert!(!workspace.path().join("school.sqlite3.importing").exists());
}
