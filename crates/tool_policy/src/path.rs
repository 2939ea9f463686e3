use std::fs;
use std::path::{Component, Path, PathBuf};

/// Removes `.` components and folds `..` into its parent without touching the
/// filesystem. `..` at the root stays at the root.
#[must_use]
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Upper bound on dangling-link hops, matching the kernel's `ELOOP` limit.
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolves symlinks in the deepest existing ancestor of `path` and re-appends
/// the not-yet-existing remainder.
///
/// A dangling symlink on the way up is followed to the location a write
/// through it would create, so its target takes part in containment checks.
/// `path` must already be absolute and lexically normalized.
#[must_use]
pub fn resolve_existing_prefix(path: &Path) -> PathBuf {
    resolve_with_hops(path, MAX_SYMLINK_HOPS)
}

fn resolve_with_hops(path: &Path, hops: usize) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder = Vec::new();

    loop {
        let base = match existing.canonicalize() {
            Ok(canonical) => Some(canonical),
            Err(_) if hops > 0 => follow_dangling_link(&existing, hops - 1),
            Err(_) => None,
        };
        if let Some(mut resolved) = base {
            for part in remainder.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name().map(ToOwned::to_owned), existing.parent()) {
            (Some(name), Some(parent)) => {
                remainder.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Where a symlink at `link` points, resolved in turn; `None` when `link` is
/// not a symlink.
fn follow_dangling_link(link: &Path, hops: usize) -> Option<PathBuf> {
    let metadata = fs::symlink_metadata(link).ok()?;
    if !metadata.file_type().is_symlink() {
        return None;
    }
    let target = fs::read_link(link).ok()?;
    let parent = link.parent().unwrap_or(link);
    Some(resolve_with_hops(
        &normalize_lexically(&parent.join(target)),
        hops,
    ))
}

/// Full resolution of a user-supplied path against `cwd`.
///
/// Relative `cwd` values are taken relative to `root`.
#[must_use]
pub fn resolve_path(root: &Path, cwd: &Path, raw: &str) -> PathBuf {
    let base = if cwd.is_absolute() {
        cwd.to_path_buf()
    } else {
        root.join(cwd)
    };
    let joined = base.join(raw);
    resolve_existing_prefix(&normalize_lexically(&joined))
}
