//! Filesystem snapshots and deterministic layer archives.
//!
//! A layer archive is a gzip'd tar whose entries are sorted by path and
//! carry zero mtime, uid and gid, so identical content always produces an
//! identical archive. Deleted paths are recorded as OCI whiteouts
//! (`.wh.<name>`).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use strata_core::error::{Result, StrataError};
use walkdir::WalkDir;

use super::digest::{sha256_file, HashingWriter};

/// Prefix marking a deleted path inside a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// File size in bytes (0 for directories)
    pub size: u64,
    /// Modification time (nanoseconds since epoch)
    pub mtime: i128,
    /// Permission bits
    pub mode: u32,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// A snapshot of a directory's file state.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Relative path → file entry
    pub entries: BTreeMap<PathBuf, FileEntry>,
}

/// One path in a layer: present content, or a deletion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    Upsert(PathBuf),
    Delete(PathBuf),
}

impl Change {
    pub fn path(&self) -> &Path {
        match self {
            Change::Upsert(p) | Change::Delete(p) => p,
        }
    }
}

impl DirSnapshot {
    /// Take a snapshot of a directory, recording all paths and their metadata.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| {
                StrataError::LayerError(format!(
                    "Failed to walk {}: {}",
                    root.display(),
                    e
                ))
            })?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| StrataError::LayerError(format!("Failed to strip prefix: {}", e)))?
                .to_path_buf();
            let metadata = entry.path().symlink_metadata().map_err(|e| {
                StrataError::LayerError(format!(
                    "Failed to read metadata for {}: {}",
                    entry.path().display(),
                    e
                ))
            })?;

            let kind = if metadata.file_type().is_symlink() {
                EntryKind::Symlink
            } else if metadata.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i128)
                .unwrap_or(0);

            entries.insert(
                relative,
                FileEntry {
                    size: if kind == EntryKind::Dir { 0 } else { metadata.len() },
                    mtime,
                    mode: file_mode(&metadata),
                    kind,
                },
            );
        }

        Ok(DirSnapshot { entries })
    }

    /// Compute the changes from this snapshot (before) to another (after).
    ///
    /// Added or modified paths become upserts. A removed path becomes a
    /// deletion unless one of its ancestors was removed too.
    pub fn diff(&self, after: &DirSnapshot) -> Vec<Change> {
        let mut changes = Vec::new();

        for (path, after_entry) in &after.entries {
            match self.entries.get(path) {
                None => changes.push(Change::Upsert(path.clone())),
                Some(before) if before != after_entry => {
                    // A directory whose listing changed only counts once
                    // something inside it is part of the layer
                    if before.kind == EntryKind::Dir
                        && after_entry.kind == EntryKind::Dir
                        && before.mode == after_entry.mode
                    {
                        continue;
                    }
                    changes.push(Change::Upsert(path.clone()))
                }
                Some(_) => {}
            }
        }

        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            let parent_removed = path.ancestors().skip(1).any(|a| {
                !a.as_os_str().is_empty()
                    && self.entries.contains_key(a)
                    && !after.entries.contains_key(a)
            });
            if !parent_removed {
                changes.push(Change::Delete(path.clone()));
            }
        }

        // Keep parent directories of changed paths so permissions survive
        let mut with_parents: Vec<Change> = Vec::with_capacity(changes.len());
        for change in &changes {
            for ancestor in change.path().ancestors().skip(1) {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                if after.entries.contains_key(ancestor) {
                    with_parents.push(Change::Upsert(ancestor.to_path_buf()));
                }
            }
        }
        changes.extend(with_parents);
        changes.sort_by(|a, b| a.path().cmp(b.path()).then(a.cmp(b)));
        changes.dedup();
        changes
    }
}

/// A finished layer archive on disk.
#[derive(Debug, Clone)]
pub struct LayerArchive {
    /// SHA256 of the compressed archive (hex, no prefix)
    pub digest: String,
    /// SHA256 of the uncompressed tar stream (hex, no prefix)
    pub diff_id: String,
    /// Compressed size in bytes
    pub size: u64,
}

/// Write a layer containing `changes`, read from `root`, to `output_path`.
pub fn write_layer(root: &Path, changes: &[Change], output_path: &Path) -> Result<LayerArchive> {
    let file = std::fs::File::create(output_path).map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(HashingWriter::new(encoder));
    builder.follow_symlinks(false);

    let mut sorted: Vec<&Change> = changes.iter().collect();
    sorted.sort_by(|a, b| a.path().cmp(b.path()));

    for change in sorted {
        match change {
            Change::Upsert(relative) => append_entry(&mut builder, root, relative)?,
            Change::Delete(relative) => append_whiteout(&mut builder, relative)?,
        }
    }

    let hashing = builder
        .into_inner()
        .map_err(|e| StrataError::LayerError(format!("Failed to finalize layer: {}", e)))?;
    let (diff_id, encoder) = hashing.finish();
    let mut file = encoder
        .finish()
        .map_err(|e| StrataError::LayerError(format!("Failed to compress layer: {}", e)))?;
    file.flush()?;

    let digest = sha256_file(output_path)?;
    let size = std::fs::metadata(output_path).map(|m| m.len())?;

    Ok(LayerArchive {
        digest,
        diff_id,
        size,
    })
}

/// Write a layer containing every path under `root`.
pub fn pack_dir(root: &Path, output_path: &Path) -> Result<LayerArchive> {
    let snapshot = DirSnapshot::capture(root)?;
    let changes: Vec<Change> = snapshot
        .entries
        .into_keys()
        .map(Change::Upsert)
        .collect();
    write_layer(root, &changes, output_path)
}

/// Uncompressed digest of an existing layer blob (hex, no prefix).
pub fn diff_id_of(layer_path: &Path) -> Result<String> {
    let file = std::fs::File::open(layer_path).map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to open layer {}: {}",
            layer_path.display(),
            e
        ))
    })?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut sink = HashingWriter::new(std::io::sink());
    std::io::copy(&mut decoder, &mut sink).map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to decompress layer {}: {}",
            layer_path.display(),
            e
        ))
    })?;
    Ok(sink.finish().0)
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, root: &Path, relative: &Path) -> Result<()> {
    let full_path = root.join(relative);
    let metadata = full_path.symlink_metadata().map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to read metadata for {}: {}",
            full_path.display(),
            e
        ))
    })?;

    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(file_mode(&metadata));

    let add_err = |e: std::io::Error| {
        StrataError::LayerError(format!(
            "Failed to add {} to layer: {}",
            relative.display(),
            e
        ))
    };

    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(&full_path)?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, relative, &target)
            .map_err(add_err)?;
    } else if metadata.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder
            .append_data(&mut header, relative, std::io::empty())
            .map_err(add_err)?;
    } else {
        let file = std::fs::File::open(&full_path).map_err(add_err)?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(metadata.len());
        builder
            .append_data(&mut header, relative, file)
            .map_err(add_err)?;
    }
    Ok(())
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, relative: &Path) -> Result<()> {
    let name = relative
        .file_name()
        .ok_or_else(|| StrataError::LayerError(format!("Invalid deleted path {}", relative.display())))?;
    let whiteout = relative.with_file_name(format!("{}{}", WHITEOUT_PREFIX, name.to_string_lossy()));

    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(0);
    builder
        .append_data(&mut header, &whiteout, std::io::empty())
        .map_err(|e| {
            StrataError::LayerError(format!(
                "Failed to add whiteout for {}: {}",
                relative.display(),
                e
            ))
        })
}

#[cfg(unix)]
pub(crate) fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn archive_paths(path: &Path) -> Vec<String> {
        let file = fs::File::open(path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_snapshot_empty_dir() {
        let tmp = TempDir::new().unwrap();
        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(snap.entries.is_empty());
    }

    #[test]
    fn test_snapshot_with_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("b.txt"), "world").unwrap();

        let snap = DirSnapshot::capture(tmp.path()).unwrap();
        assert_eq!(snap.entries[Path::new("a.txt")].kind, EntryKind::File);
        assert_eq!(snap.entries[Path::new("sub")].kind, EntryKind::Dir);
        assert_eq!(snap.entries[Path::new("sub/b.txt")].size, 5);
    }

    #[test]
    fn test_diff_new_file_in_new_dir() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();

        fs::create_dir(tmp.path().join("site-packages")).unwrap();
        fs::write(tmp.path().join("site-packages/pkgA.py"), "x").unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        assert_eq!(
            before.diff(&after),
            vec![
                Change::Upsert(PathBuf::from("site-packages")),
                Change::Upsert(PathBuf::from("site-packages/pkgA.py")),
            ]
        );
    }

    #[test]
    fn test_diff_modified_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();

        fs::write(tmp.path().join("a.txt"), "hello world").unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        assert_eq!(before.diff(&after), vec![Change::Upsert(PathBuf::from("a.txt"))]);
    }

    #[test]
    fn test_diff_deleted_tree_records_top_only() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("cache/deep")).unwrap();
        fs::write(tmp.path().join("cache/deep/x"), "x").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();

        fs::remove_dir_all(tmp.path().join("cache")).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();

        assert_eq!(before.diff(&after), vec![Change::Delete(PathBuf::from("cache"))]);
    }

    #[test]
    fn test_diff_no_changes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        let before = DirSnapshot::capture(tmp.path()).unwrap();
        let after = DirSnapshot::capture(tmp.path()).unwrap();
        assert!(before.diff(&after).is_empty());
    }

    #[test]
    fn test_write_layer_is_deterministic() {
        let rootfs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(rootfs.path().join("hello.txt"), "hello").unwrap();
        fs::write(rootfs.path().join("world.txt"), "world").unwrap();

        let changes = vec![
            Change::Upsert(PathBuf::from("world.txt")),
            Change::Upsert(PathBuf::from("hello.txt")),
        ];
        let first = write_layer(rootfs.path(), &changes, &out.path().join("a.tar.gz")).unwrap();

        // Touch the files: mtimes must not leak into the archive
        fs::write(rootfs.path().join("hello.txt"), "hello").unwrap();
        let second = write_layer(rootfs.path(), &changes, &out.path().join("b.tar.gz")).unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(first.diff_id, second.diff_id);
        assert_eq!(first.digest.len(), 64);
        assert_eq!(
            archive_paths(&out.path().join("a.tar.gz")),
            vec!["hello.txt", "world.txt"]
        );
    }

    #[test]
    fn test_write_layer_whiteout() {
        let rootfs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = out.path().join("layer.tar.gz");
        write_layer(
            rootfs.path(),
            &[Change::Delete(PathBuf::from("etc/motd"))],
            &path,
        )
        .unwrap();
        assert_eq!(archive_paths(&path), vec!["etc/.wh.motd"]);
    }

    #[test]
    fn test_diff_id_differs_from_digest() {
        let rootfs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(rootfs.path().join("app.py"), "print('hi')").unwrap();
        let info = pack_dir(rootfs.path(), &out.path().join("layer.tar.gz")).unwrap();
        assert_ne!(info.digest, info.diff_id);
        assert!(info.size > 0);
        assert_eq!(diff_id_of(&out.path().join("layer.tar.gz")).unwrap(), info.diff_id);
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_dir_keeps_symlinks() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir(src.path().join("bin")).unwrap();
        fs::write(src.path().join("bin/python3"), "#!").unwrap();
        std::os::unix::fs::symlink("python3", src.path().join("bin/python")).unwrap();

        let path = out.path().join("layer.tar.gz");
        pack_dir(src.path(), &path).unwrap();

        let file = fs::File::open(&path).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let link = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap() == Path::new("bin/python"))
            .unwrap();
        assert_eq!(link.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(link.link_name().unwrap().unwrap(), Path::new("python3"));
    }
}
