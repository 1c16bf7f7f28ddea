//! Fixture builders for synthetic backups

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use plist::{Dictionary, Uid, Value};
use rusqlite::{params, Connection};

pub fn uid(index: u64) -> Value {
    Value::Uid(Uid::new(index))
}

pub fn dict(pairs: Vec<(&str, Value)>) -> Value {
    Value::Dictionary(
        pairs
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<Dictionary>(),
    )
}

pub fn class(name: &str) -> Value {
    dict(vec![
        ("$classname", Value::String(name.to_string())),
        (
            "$classes",
            Value::Array(vec![
                Value::String(name.to_string()),
                Value::String("NSObject".to_string()),
            ]),
        ),
    ])
}

/// Binary keyed archive with a single `root`
pub fn keyed_archive(objects: Vec<Value>) -> Vec<u8> {
    let archive = dict(vec![
        ("$version", Value::Integer(100000.into())),
        ("$archiver", Value::String("NSKeyedArchiver".to_string())),
        ("$top", dict(vec![("root", uid(1))])),
        ("$objects", Value::Array(objects)),
    ]);
    let mut blob = Vec::new();
    archive.to_writer_binary(&mut blob).unwrap();
    blob
}

/// MBFile-shaped metadata blob
pub fn mbfile_blob(relative_path: &str, size: i64, last_modified: i64) -> Vec<u8> {
    keyed_archive(vec![
        Value::String("$null".to_string()),
        dict(vec![
            ("LastModified", Value::Integer(last_modified.into())),
            ("LastStatusChange", Value::Integer(last_modified.into())),
            ("Birth", Value::Integer(last_modified.into())),
            ("Size", Value::Integer(size.into())),
            ("InodeNumber", Value::Integer(1234.into())),
            ("Flags", Value::Integer(0.into())),
            ("UserID", Value::Integer(501.into())),
            ("GroupID", Value::Integer(501.into())),
            ("Mode", Value::Integer(0o100644.into())),
            ("ProtectionClass", Value::Integer(3.into())),
            ("RelativePath", uid(2)),
            ("$class", uid(3)),
        ]),
        Value::String(relative_path.to_string()),
        class("MBFile"),
    ])
}

pub struct ManifestRow<'a> {
    pub identifier: &'a str,
    pub domain: &'a str,
    pub relative_path: &'a str,
    pub flags: i64,
    pub metadata: Vec<u8>,
}

pub fn write_manifest_db(path: &Path, rows: &[ManifestRow<'_>]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE Files (
            fileID TEXT PRIMARY KEY,
            domain TEXT,
            relativePath TEXT,
            flags INTEGER,
            file BLOB
        );
        "#,
    )
    .unwrap();
    for row in rows {
        conn.execute(
            "INSERT INTO Files (fileID, domain, relativePath, flags, file) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.identifier,
                row.domain,
                row.relative_path,
                row.flags,
                row.metadata
            ],
        )
        .unwrap();
    }
}

pub fn write_descriptors(backup_dir: &Path, serial: &str, encrypted: bool) {
    dict(vec![
        ("IsEncrypted", Value::Boolean(encrypted)),
        ("Version", Value::String("10.0".to_string())),
    ])
    .to_file_binary(backup_dir.join("Manifest.plist"))
    .unwrap();
    dict(vec![
        ("Serial Number", Value::String(serial.to_string())),
        ("Device Name", Value::String("Fixture Phone".to_string())),
    ])
    .to_file_binary(backup_dir.join("Info.plist"))
    .unwrap();
    dict(vec![("SnapshotState", Value::String("finished".to_string()))])
        .to_file_binary(backup_dir.join("Status.plist"))
        .unwrap();
}

pub fn store_blob(backup_dir: &Path, identifier: &str, bytes: &[u8]) {
    let shard = backup_dir.join(&identifier[..2]);
    fs::create_dir_all(&shard).unwrap();
    fs::write(shard.join(identifier), bytes).unwrap();
}

pub fn metadata_row_count(index_path: &Path) -> i64 {
    Connection::open(index_path)
        .unwrap()
        .query_row("SELECT COUNT(*) FROM Metadata", [], |row| row.get(0))
        .unwrap()
}
