//! Zip archives of module directories
//!
//! Entries must stay inside the destination directory. A single directory
//! shared by every entry (e.g. `base32@1.2.0/`) is stripped on extraction.

use crate::source::SourceError;
use std::ffi::OsString;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

fn safe_rel_path(p: &Path) -> Result<PathBuf, SourceError> {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(SourceError::Archive(format!(
                    "unsafe path in archive entry: {}",
                    p.display()
                )));
            }
        }
    }
    Ok(out)
}

fn archive_err(err: impl std::fmt::Display) -> SourceError {
    SourceError::Archive(err.to_string())
}

/// Common leading directory of all entries, if every entry lives below it
fn common_root<R: Read + std::io::Seek>(zip: &mut ZipArchive<R>) -> Result<Option<PathBuf>, SourceError> {
    let mut prefix: Option<Vec<OsString>> = None;
    let mut max_depth = 0usize;

    for i in 0..zip.len() {
        let entry = zip.by_index(i).map_err(archive_err)?;
        let rel = safe_rel_path(Path::new(entry.name()))?;
        let comps: Vec<OsString> = rel.components().map(|c| c.as_os_str().to_os_string()).collect();
        if comps.is_empty() {
            continue;
        }
        max_depth = max_depth.max(comps.len());

        match &mut prefix {
            None => prefix = Some(comps),
            Some(current) => {
                let keep = current
                    .iter()
                    .zip(comps.iter())
                    .take_while(|(a, b)| a == b)
                    .count();
                current.truncate(keep);
            }
        }
    }

    Ok(prefix.and_then(|parts| {
        if parts.is_empty() || max_depth <= parts.len() {
            None
        } else {
            Some(parts.iter().collect())
        }
    }))
}

/// Extract a module archive into `dest`
pub fn unpack_into(bytes: &[u8], dest: &Path) -> Result<(), SourceError> {
    std::fs::create_dir_all(dest).map_err(|e| SourceError::io(dest, e))?;
    let mut zip = ZipArchive::new(Cursor::new(bytes)).map_err(archive_err)?;
    let root = common_root(&mut zip)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(archive_err)?;
        let mut rel = safe_rel_path(Path::new(entry.name()))?;
        if let Some(root) = &root {
            if let Ok(stripped) = rel.strip_prefix(root) {
                rel = stripped.to_path_buf();
            }
        }
        if rel.as_os_str().is_empty() {
            continue;
        }

        let out = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(|e| SourceError::io(&out, e))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;
        }
        let mut file = std::fs::File::create(&out).map_err(|e| SourceError::io(&out, e))?;
        std::io::copy(&mut entry, &mut file).map_err(|e| SourceError::io(&out, e))?;
    }
    Ok(())
}

/// Zip the contents of a module directory, entries in sorted path order
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>, SourceError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| SourceError::io(dir, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| SourceError::io(entry.path(), e))?;
        let name: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();

        let body = std::fs::read(entry.path()).map_err(|e| SourceError::io(entry.path(), e))?;
        zip.start_file(name.join("/"), options).map_err(archive_err)?;
        zip.write_all(&body).map_err(archive_err)?;
    }

    let cursor = zip.finish().map_err(archive_err)?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn strips_shared_root_directory() {
        let bytes = zip_of(&[
            ("base32@1.2.0/module.toml", "name = \"base32\""),
            ("base32@1.2.0/deploy/schema.sql", "CREATE SCHEMA base32;"),
        ]);
        let dest = tempfile::tempdir().unwrap();
        unpack_into(&bytes, dest.path()).unwrap();

        assert!(dest.path().join("module.toml").is_file());
        assert!(dest.path().join("deploy").join("schema.sql").is_file());
    }

    #[test]
    fn rejects_entries_escaping_destination() {
        let bytes = zip_of(&[("../evil.sql", "DROP DATABASE postgres;")]);
        let dest = tempfile::tempdir().unwrap();

        let err = unpack_into(&bytes, dest.path()).unwrap_err();
        assert!(matches!(err, SourceError::Archive(msg) if msg.contains("unsafe path")));
    }

    #[test]
    fn pack_then_unpack_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("deploy")).unwrap();
        std::fs::write(src.path().join("module.toml"), "name = \"base32\"").unwrap();
        std::fs::write(src.path().join("deploy").join("schema.sql"), "CREATE SCHEMA base32;").unwrap();

        let bytes = pack_dir(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unpack_into(&bytes, dest.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("deploy/schema.sql")).unwrap(),
            "CREATE SCHEMA base32;"
        );
    }
}
