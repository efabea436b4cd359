//! # Archive Extraction
//!
//! Unpacks gzip-compressed tarballs into a workspace. Entry names are checked
//! before anything touches the filesystem, so no crafted archive can write
//! outside the destination root.

use super::SourceError;
use flate2::read::GzDecoder;
use std::fs::{DirBuilder, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use tar::EntryType;
use tracing::debug;

const DIR_MODE: u32 = 0o755;

/// Extract a `.tar.gz` stream into `dest`
///
/// Only regular files and directories are supported. Entry names that are
/// absolute, contain a `..` segment or a backslash are rejected.
pub fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<(), SourceError> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| SourceError::Archive(format!("reading archive: {e}")))?;

    let mut files = 0usize;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| SourceError::Archive(format!("reading archive entry: {e}")))?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let entry_type = entry.header().entry_type();

        if entry_type == EntryType::XGlobalHeader {
            continue;
        }
        validate_entry_name(&name)?;
        let target = dest.join(&name);

        match entry_type {
            EntryType::Directory => {
                create_dir_all(&target)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    create_dir_all(parent)?;
                }
                let mode = entry.header().mode().map_err(|e| {
                    SourceError::Archive(format!("invalid mode for entry '{name}': {e}"))
                })? & 0o777;
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .mode(mode)
                    .open(&target)
                    .map_err(|source| SourceError::Io {
                        context: format!("creating {}", target.display()),
                        source,
                    })?;
                let expected = entry.size();
                let written =
                    std::io::copy(&mut entry, &mut file).map_err(|source| SourceError::Io {
                        context: format!("writing {}", target.display()),
                        source,
                    })?;
                if written != expected {
                    return Err(SourceError::Archive(format!(
                        "short write for entry '{name}': expected {expected} bytes, wrote {written}"
                    )));
                }
                files += 1;
            }
            other => {
                return Err(SourceError::Archive(format!(
                    "unsupported type {other:?} for entry '{name}'"
                )));
            }
        }
    }

    debug!(files, dest = %dest.display(), "Extracted artifact");
    Ok(())
}

fn validate_entry_name(name: &str) -> Result<(), SourceError> {
    let reason = if name.is_empty() {
        Some("empty name")
    } else if name.contains('\\') {
        Some("backslash in name")
    } else if name.starts_with('/') {
        Some("absolute path")
    } else if name.split('/').any(|segment| segment == "..") {
        Some("parent directory segment")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SourceError::Archive(format!(
            "refusing entry '{name}': {reason}"
        ))),
        None => Ok(()),
    }
}

fn create_dir_all(path: &Path) -> Result<(), SourceError> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|source| SourceError::Io {
            context: format!("creating directory {}", path.display()),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::os::unix::fs::PermissionsExt;

    /// Header with the raw name written in place, bypassing `set_path` checks
    fn raw_header(name: &str, entry_type: EntryType, size: u64, mode: u32) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name.as_bytes());
        }
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(mode);
        header.set_cksum();
        header
    }

    fn archive(entries: &[(&str, EntryType, &[u8], u32)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, entry_type, data, mode) in entries {
            let header = raw_header(name, *entry_type, data.len() as u64, *mode);
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_extracts_files_and_directories() {
        let bytes = archive(&[
            ("infra/", EntryType::Directory, b"", 0o755),
            ("infra/Pulumi.yaml", EntryType::Regular, b"name: network\n", 0o644),
            ("infra/bin/run.sh", EntryType::Regular, b"#!/bin/sh\n", 0o755),
        ]);
        let dest = tempfile::tempdir().unwrap();
        extract_tar_gz(bytes.as_slice(), dest.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("infra/Pulumi.yaml")).unwrap(),
            "name: network\n"
        );
        let mode = std::fs::metadata(dest.path().join("infra/bin/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let bytes = archive(&[("a/../../escape.txt", EntryType::Regular, b"x", 0o644)]);
        let outer = tempfile::tempdir().unwrap();
        let dest = outer.path().join("dest");
        std::fs::create_dir(&dest).unwrap();

        let err = extract_tar_gz(bytes.as_slice(), &dest).unwrap_err();
        assert!(matches!(err, SourceError::Archive(_)));
        assert!(!outer.path().join("escape.txt").exists());
    }

    #[test]
    fn test_rejects_absolute_and_backslash_names() {
        let dest = tempfile::tempdir().unwrap();
        for name in ["/etc/passwd", "dir\\file.txt"] {
            let bytes = archive(&[(name, EntryType::Regular, b"x", 0o644)]);
            let err = extract_tar_gz(bytes.as_slice(), dest.path()).unwrap_err();
            assert!(err.to_string().contains("refusing entry"), "{name}: {err}");
        }
    }

    #[test]
    fn test_rejects_symlinks() {
        let bytes = archive(&[("link", EntryType::Symlink, b"", 0o777)]);
        let dest = tempfile::tempdir().unwrap();
        let err = extract_tar_gz(bytes.as_slice(), dest.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported type"));
        assert!(!dest.path().join("link").exists());
    }

    #[test]
    fn test_validate_entry_name() {
        assert!(validate_entry_name("a/b/c.txt").is_ok());
        assert!(validate_entry_name("./a..b/c").is_ok());
        assert!(validate_entry_name("").is_err());
        assert!(validate_entry_name("..").is_err());
    }
}
