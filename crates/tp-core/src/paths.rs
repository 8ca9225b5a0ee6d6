//! Keeping agent-supplied paths inside a working root.

use std::path::{Component, Path, PathBuf};

/// Resolve `requested` against `root` and return it only if it stays inside
/// `root`. Relative paths are joined onto `root`; `..` is resolved lexically
/// so paths to files that do not exist yet can be checked too. When the
/// result (or its nearest existing ancestor) exists, symlinks are resolved
/// and checked as well.
pub fn resolve_within(root: &Path, requested: impl AsRef<Path>) -> Option<PathBuf> {
    let requested = requested.as_ref();
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let root = normalize(root)?;
    let candidate = normalize(&joined)?;
    if !candidate.starts_with(&root) {
        return None;
    }

    let real_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
    // Nearest existing ancestor at or below the root.
    let mut probe = Some(candidate.as_path());
    while let Some(path) = probe.filter(|p| p.starts_with(&root)) {
        if let Ok(real) = std::fs::canonicalize(path) {
            if !real.starts_with(&real_root) {
                return None;
            }
            break;
        }
        probe = path.parent();
    }
    Some(candidate)
}

/// Lexical normalization; `None` when `..` climbs above the filesystem root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_root() {
        let root = Path::new("/work/project");
        assert_eq!(
            resolve_within(root, "src/main.rs"),
            Some(PathBuf::from("/work/project/src/main.rs"))
        );
        assert_eq!(
            resolve_within(root, "./a/../b.txt"),
            Some(PathBuf::from("/work/project/b.txt"))
        );
    }

    #[test]
    fn escapes_are_rejected() {
        let root = Path::new("/work/project");
        assert!(resolve_within(root, "../other/file").is_none());
        assert!(resolve_within(root, "/etc/passwd").is_none());
        assert!(resolve_within(root, "/work/project-evil/x").is_none());
    }

    #[test]
    fn absolute_paths_inside_root_are_kept() {
        let root = Path::new("/work/project");
        assert_eq!(
            resolve_within(root, "/work/project/README.md"),
            Some(PathBuf::from("/work/project/README.md"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_out_of_root_are_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        assert!(resolve_within(root.path(), "link/secret.txt").is_none());
        assert!(resolve_within(root.path(), "plain.txt").is_some());
    }
}
