//! OCI layer extraction utilities.
//!
//! Handles extraction of OCI image layers (tar.gz format) to filesystem,
//! applying whiteouts so a stack of layers composes into one rootfs.

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use strata_core::error::{Result, StrataError};
use tar::Archive;

use crate::build::layer::WHITEOUT_PREFIX;

/// Marker removing every entry of lower layers inside a directory.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Extract a single OCI layer (tar.gz) on top of `target_dir`.
///
/// `.wh.<name>` entries delete `<name>` from what lower layers extracted;
/// an opaque whiteout empties its directory first.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(StrataError::LayerError(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    std::fs::create_dir_all(target_dir).map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let file = File::open(layer_path).map_err(|e| {
        StrataError::LayerError(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let extract_err = |e: std::io::Error| {
        StrataError::LayerError(format!(
            "Failed to extract layer {} to {}: {}",
            layer_path.display(),
            target_dir.display(),
            e
        ))
    };

    for entry in archive.entries().map_err(extract_err)? {
        let mut entry = entry.map_err(extract_err)?;
        let path = entry.path().map_err(extract_err)?.into_owned();
        let Some(relative) = sanitize(&path) else {
            tracing::warn!(path = %path.display(), "Skipping layer entry outside rootfs");
            continue;
        };

        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name == OPAQUE_WHITEOUT {
            let dir = target_dir.join(relative.parent().unwrap_or(Path::new("")));
            clear_dir(&dir)?;
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = target_dir.join(relative.with_file_name(hidden));
            remove_path(&victim)?;
            continue;
        }

        // Replacing a directory with a file (or the reverse) needs the old one gone
        let dest = target_dir.join(&relative);
        if let Ok(existing) = dest.symlink_metadata() {
            let incoming_dir = entry.header().entry_type().is_dir();
            if existing.is_dir() != incoming_dir || existing.file_type().is_symlink() {
                remove_path(&dest)?;
            }
        }

        entry.unpack_in(target_dir).map_err(extract_err)?;
    }

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "Extracted layer"
    );

    Ok(())
}

/// Strip leading `/` and `./`, rejecting any path that climbs out.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

fn remove_path(path: &Path) -> Result<()> {
    let Ok(metadata) = path.symlink_metadata() else {
        return Ok(());
    };
    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| {
        StrataError::LayerError(format!("Failed to remove {}: {}", path.display(), e))
    })
}

fn clear_dir(dir: &Path) -> Result<()> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in read_dir.flatten() {
        remove_path(&entry.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // Helper function to create a test tar.gz layer
    fn create_test_layer(path: &Path, files: &[(&str, &[u8])]) {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use tar::Builder;

        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);

        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();

            builder.append_data(&mut header, name, *content).unwrap();
        }

        builder.finish().unwrap();
    }

    #[test]
    fn test_extract_layer_extracts_files() {
        let temp_dir = TempDir::new().unwrap();
        let layer_path = temp_dir.path().join("layer.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(
            &layer_path,
            &[("file1.txt", b"content1"), ("dir/file2.txt", b"content2")],
        );
        extract_layer(&layer_path, &target_dir).unwrap();

        assert_eq!(fs::read_to_string(target_dir.join("file1.txt")).unwrap(), "content1");
        assert_eq!(fs::read_to_string(target_dir.join("dir/file2.txt")).unwrap(), "content2");
    }

    #[test]
    fn test_extract_layer_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = extract_layer(
            &temp_dir.path().join("nonexistent.tar.gz"),
            &temp_dir.path().join("extracted"),
        );
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Layer file not found"));
    }

    #[test]
    fn test_extract_layer_overwrites_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        let layer1_path = temp_dir.path().join("layer1.tar.gz");
        let layer2_path = temp_dir.path().join("layer2.tar.gz");
        let target_dir = temp_dir.path().join("extracted");

        create_test_layer(&layer1_path, &[("file.txt", b"version 1"), ("base.txt", b"b")]);
        create_test_layer(&layer2_path, &[("file.txt", b"version 2")]);

        extract_layer(&layer1_path, &target_dir).unwrap();
        extract_layer(&layer2_path, &target_dir).unwrap();

        assert_eq!(fs::read_to_string(target_dir.join("file.txt")).unwrap(), "version 2");
        assert!(target_dir.join("base.txt").exists());
    }

    #[test]
    fn test_extract_layer_applies_whiteout() {
        let temp_dir = TempDir::new().unwrap();
        let lower = temp_dir.path().join("lower.tar.gz");
        let upper = temp_dir.path().join("upper.tar.gz");
        let target_dir = temp_dir.path().join("rootfs");

        create_test_layer(&lower, &[("etc/motd", b"hi"), ("etc/hosts", b"127.0.0.1")]);
        create_test_layer(&upper, &[("etc/.wh.motd", b"")]);

        extract_layer(&lower, &target_dir).unwrap();
        extract_layer(&upper, &target_dir).unwrap();

        assert!(!target_dir.join("etc/motd").exists());
        assert!(!target_dir.join("etc/.wh.motd").exists());
        assert!(target_dir.join("etc/hosts").exists());
    }

    #[test]
    fn test_extract_layer_opaque_whiteout() {
        let temp_dir = TempDir::new().unwrap();
        let lower = temp_dir.path().join("lower.tar.gz");
        let upper = temp_dir.path().join("upper.tar.gz");
        let target_dir = temp_dir.path().join("rootfs");

        create_test_layer(&lower, &[("cache/a", b"a"), ("cache/b", b"b")]);
        create_test_layer(&upper, &[("cache/.wh..wh..opq", b""), ("cache/c", b"c")]);

        extract_layer(&lower, &target_dir).unwrap();
        extract_layer(&upper, &target_dir).unwrap();

        assert!(!target_dir.join("cache/a").exists());
        assert!(target_dir.join("cache/c").exists());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(Path::new("/usr/bin")), Some(PathBuf::from("usr/bin")));
        assert_eq!(sanitize(Path::new("./app.py")), Some(PathBuf::from("app.py")));
        assert_eq!(sanitize(Path::new("../escape")), None);
        assert_eq!(sanitize(Path::new("./")), None);
    }
}
