//! Source overlay: copying build-context files into a layer.
//!
//! Sources are collected up front into a [`CopySet`]: every file that will
//! be copied, with its destination, mode and content digest. The set is
//! what the overlay's cache key hashes, so editing any copied file changes
//! the key while edits to ignored or uncopied files do not.

use std::path::{Component, Path, PathBuf};

use strata_core::error::{Result, StrataError};
use walkdir::WalkDir;

use super::context::WorkingDirectory;
use super::digest::{sha256_file, KeyBuilder};
use super::exclude::IgnoreList;
use super::layer::{file_mode, EntryKind};

/// One path to create in the layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyEntry {
    /// Host path inside the build context
    pub source: PathBuf,
    /// Path relative to the image root
    pub dest: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    /// Content digest for files, link target for symlinks, empty for dirs
    pub content: String,
}

/// Everything a copy instruction will write, sorted by destination.
#[derive(Debug, Clone, Default)]
pub struct CopySet {
    pub entries: Vec<CopyEntry>,
}

impl CopySet {
    /// Resolve `sources` (relative to `context_dir`) against `dst`.
    ///
    /// A directory source copies its contents into `dst`. A file source
    /// lands at `dst`, or inside it when `dst` ends with `/`, is `.`, or
    /// there are several sources. Sources must stay inside the context.
    pub fn collect(
        context_dir: &Path,
        sources: &[String],
        dst: &str,
        workdir: &WorkingDirectory,
        ignore: &IgnoreList,
    ) -> Result<Self> {
        let context = context_dir.canonicalize().map_err(|e| StrataError::SourceCopy {
            path: context_dir.display().to_string(),
            message: format!("build context is not readable: {}", e),
        })?;

        let dst_abs = workdir.resolve(dst);
        let dst_rel = PathBuf::from(dst_abs.trim_start_matches('/'));
        let dst_is_dir = dst.ends_with('/') || dst == "." || sources.len() > 1;

        let mut entries = Vec::new();
        for source in sources {
            let relative = context_relative(source).ok_or_else(|| StrataError::SourceCopy {
                path: source.clone(),
                message: "path is outside the build context".to_string(),
            })?;
            let host = context.join(&relative);

            // Symlinked sources are followed only if they stay in the context
            let resolved = host.canonicalize().map_err(|e| StrataError::SourceCopy {
                path: source.clone(),
                message: e.to_string(),
            })?;
            if !resolved.starts_with(&context) {
                return Err(StrataError::SourceCopy {
                    path: source.clone(),
                    message: "path is outside the build context".to_string(),
                });
            }

            if resolved.is_dir() {
                collect_dir(&resolved, &context, &dst_rel, ignore, &mut entries)?;
            } else {
                if ignore.is_ignored(&relative, false) {
                    tracing::debug!(path = %source, "Source excluded by ignore list");
                    continue;
                }
                let dest = if dst_is_dir {
                    dst_rel.join(relative.file_name().unwrap_or(relative.as_os_str()))
                } else {
                    dst_rel.clone()
                };
                entries.push(file_entry(&resolved, source, dest)?);
            }
        }

        entries.sort_by(|a, b| a.dest.cmp(&b.dest));
        entries.dedup_by(|a, b| a.dest == b.dest);
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Feed every entry into a cache key.
    pub fn fingerprint(&self, mut key: KeyBuilder) -> KeyBuilder {
        key = key.field("entries", (self.entries.len() as u64).to_be_bytes());
        for entry in &self.entries {
            key = key
                .field("dest", entry.dest.to_string_lossy().as_bytes())
                .field("kind", format!("{:?}", entry.kind))
                .field("mode", format!("{:o}", entry.mode))
                .field("content", &entry.content);
        }
        key
    }

    /// Write the set under `root` (a host directory standing for `/`).
    pub fn materialize(&self, root: &Path) -> Result<()> {
        for entry in &self.entries {
            let target = root.join(&entry.dest);
            let copy_err = |e: std::io::Error| StrataError::SourceCopy {
                path: entry.source.display().to_string(),
                message: e.to_string(),
            };

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(copy_err)?;
            }
            if let Ok(existing) = target.symlink_metadata() {
                if existing.is_dir() && entry.kind != EntryKind::Dir {
                    std::fs::remove_dir_all(&target).map_err(copy_err)?;
                } else if !existing.is_dir() {
                    std::fs::remove_file(&target).map_err(copy_err)?;
                }
            }

            match entry.kind {
                EntryKind::Dir => std::fs::create_dir_all(&target).map_err(copy_err)?,
                EntryKind::File => {
                    std::fs::copy(&entry.source, &target).map_err(copy_err)?;
                }
                EntryKind::Symlink => symlink(&entry.content, &target).map_err(copy_err)?,
            }
            if entry.kind != EntryKind::Symlink {
                set_mode(&target, entry.mode).map_err(copy_err)?;
            }
        }
        Ok(())
    }
}

/// Normalize a source path, rejecting anything that climbs out.
fn context_relative(source: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(source).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return None;
                }
            }
            Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

fn collect_dir(
    dir: &Path,
    context: &Path,
    dst_rel: &Path,
    ignore: &IgnoreList,
    entries: &mut Vec<CopyEntry>,
) -> Result<()> {
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let in_context = e.path().strip_prefix(context).unwrap_or(e.path());
            !ignore.is_ignored(in_context, e.file_type().is_dir())
        });

    for item in walker {
        let item = item.map_err(|e| StrataError::SourceCopy {
            path: e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| dir.display().to_string()),
            message: e.to_string(),
        })?;
        let within = item.path().strip_prefix(dir).unwrap_or(item.path());
        let label = item
            .path()
            .strip_prefix(context)
            .unwrap_or(item.path())
            .display()
            .to_string();
        let dest = dst_rel.join(within);
        let file_type = item.file_type();

        if file_type.is_dir() {
            let metadata = item.metadata().map_err(|e| StrataError::SourceCopy {
                path: label.clone(),
                message: e.to_string(),
            })?;
            entries.push(CopyEntry {
                source: item.path().to_path_buf(),
                dest,
                kind: EntryKind::Dir,
                mode: file_mode(&metadata),
                content: String::new(),
            });
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(item.path()).map_err(|e| StrataError::SourceCopy {
                path: label.clone(),
                message: e.to_string(),
            })?;
            entries.push(CopyEntry {
                source: item.path().to_path_buf(),
                dest,
                kind: EntryKind::Symlink,
                mode: 0o777,
                content: target.to_string_lossy().into_owned(),
            });
        } else {
            entries.push(file_entry(item.path(), &label, dest)?);
        }
    }
    Ok(())
}

fn file_entry(host: &Path, label: &str, dest: PathBuf) -> Result<CopyEntry> {
    let metadata = host.metadata().map_err(|e| StrataError::SourceCopy {
        path: label.to_string(),
        message: e.to_string(),
    })?;
    // Hashing reads the whole file, so unreadable files fail here
    let content = sha256_file(host).map_err(|e| StrataError::SourceCopy {
        path: label.to_string(),
        message: e.to_string(),
    })?;
    Ok(CopyEntry {
        source: host.to_path_buf(),
        dest,
        kind: EntryKind::File,
        mode: file_mode(&metadata),
        content,
    })
}

#[cfg(unix)]
fn symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &str, link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("cannot create symlink {} -> {}", link.display(), target),
    ))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::digest::CacheKey;
    use strata_core::{BuildStage, IgnoreConfig};
    use tempfile::TempDir;

    fn context() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("app.py"), "print('hi')\n").unwrap();
        std::fs::write(tmp.path().join("requirements.txt"), "pkgA==1.0\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("static/css")).unwrap();
        std::fs::write(tmp.path().join("static/css/site.css"), "body{}").unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), "ref: main").unwrap();
        tmp
    }

    fn ignore(dir: &Path) -> IgnoreList {
        IgnoreList::load(dir, &IgnoreConfig::default()).unwrap()
    }

    fn key(set: &CopySet) -> CacheKey {
        set.fingerprint(KeyBuilder::new(BuildStage::SourceOverlay)).finish()
    }

    fn dests(set: &CopySet) -> Vec<String> {
        set.entries
            .iter()
            .map(|e| e.dest.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_whole_tree_respects_ignore_list() {
        let ctx = context();
        let wd = WorkingDirectory::new("/app");
        let set = CopySet::collect(ctx.path(), &[".".to_string()], ".", &wd, &ignore(ctx.path()))
            .unwrap();
        assert_eq!(
            dests(&set),
            vec![
                "app/app.py",
                "app/requirements.txt",
                "app/static",
                "app/static/css",
                "app/static/css/site.css"
            ]
        );
    }

    #[test]
    fn test_single_file_destinations() {
        let ctx = context();
        let wd = WorkingDirectory::new("/app");
        let list = ignore(ctx.path());

        let into_dir =
            CopySet::collect(ctx.path(), &["requirements.txt".to_string()], ".", &wd, &list)
                .unwrap();
        assert_eq!(dests(&into_dir), vec!["app/requirements.txt"]);

        let renamed = CopySet::collect(
            ctx.path(),
            &["requirements.txt".to_string()],
            "/opt/reqs.txt",
            &wd,
            &list,
        )
        .unwrap();
        assert_eq!(dests(&renamed), vec!["opt/reqs.txt"]);
    }

    #[test]
    fn test_escape_is_rejected() {
        let ctx = context();
        let err = CopySet::collect(
            ctx.path(),
            &["../outside".to_string()],
            ".",
            &WorkingDirectory::root(),
            &ignore(ctx.path()),
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::SourceCopy { .. }));
        assert!(err.to_string().contains("outside the build context"));
    }

    #[test]
    fn test_missing_source_is_source_copy_error() {
        let ctx = context();
        let err = CopySet::collect(
            ctx.path(),
            &["nope.py".to_string()],
            ".",
            &WorkingDirectory::root(),
            &ignore(ctx.path()),
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::SourceCopy { ref path, .. } if path == "nope.py"));
    }

    #[test]
    fn test_key_tracks_copied_content_only() {
        let ctx = context();
        let wd = WorkingDirectory::new("/app");
        let collect = || {
            CopySet::collect(ctx.path(), &[".".to_string()], ".", &wd, &ignore(ctx.path()))
                .unwrap()
        };

        let before = key(&collect());
        std::fs::write(ctx.path().join(".git/HEAD"), "ref: other").unwrap();
        assert_eq!(key(&collect()), before);

        std::fs::write(ctx.path().join("app.py"), "print('changed')\n").unwrap();
        assert_ne!(key(&collect()), before);
    }

    #[test]
    fn test_materialize_writes_tree() {
        let ctx = context();
        let out = TempDir::new().unwrap();
        let set = CopySet::collect(
            ctx.path(),
            &[".".to_string()],
            ".",
            &WorkingDirectory::new("/app"),
            &ignore(ctx.path()),
        )
        .unwrap();
        set.materialize(out.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(out.path().join("app/app.py")).unwrap(),
            "print('hi')\n"
        );
        assert!(out.path().join("app/static/css/site.css").is_file());
        assert!(!out.path().join("app/.git").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_fails_collection() {
        use std::os::unix::fs::PermissionsExt;

        let ctx = context();
        let secret = ctx.path().join("secret.txt");
        std::fs::write(&secret, "x").unwrap();
        std::fs::set_permissions(&secret, std::fs::Permissions::from_mode(0o000)).unwrap();
        // Root ignores permission bits
        if std::fs::read(&secret).is_ok() {
            return;
        }

        let err = CopySet::collect(
            ctx.path(),
            &[".".to_string()],
            ".",
            &WorkingDirectory::root(),
            &ignore(ctx.path()),
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::SourceCopy { ref path, .. } if path == "secret.txt"));
    }
}
