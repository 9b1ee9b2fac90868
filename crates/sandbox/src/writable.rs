//! Two-phase writability check for upload destinations.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Outcome of [`ensure_writable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritableState {
    /// Exists and accepts writes.
    Ready,
    /// Does not exist yet, but the nearest existing ancestor is writable,
    /// so the caller may create it.
    MissingCreatable,
    /// Exists (or its nearest ancestor exists) but is read-only.
    NotWritable,
}

/// Reports whether `physical_path` can receive writes.
///
/// Never creates anything; the caller decides whether to act on
/// [`WritableState::MissingCreatable`]. Writability is judged from the
/// permission bits of the path or its nearest existing ancestor.
pub fn ensure_writable(physical_path: &Path) -> WritableState {
    if let Ok(metadata) = std::fs::metadata(physical_path) {
        return if metadata.permissions().readonly() {
            WritableState::NotWritable
        } else {
            WritableState::Ready
        };
    }

    let mut ancestor = physical_path.parent();
    while let Some(dir) = ancestor {
        if let Ok(metadata) = std::fs::metadata(dir) {
            return if metadata.is_dir() && !metadata.permissions().readonly() {
                WritableState::MissingCreatable
            } else {
                WritableState::NotWritable
            };
        }
        ancestor = dir.parent();
    }
    WritableState::NotWritable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_dir_is_ready() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(ensure_writable(tmp.path()), WritableState::Ready);
    }

    #[test]
    fn missing_dir_is_creatable() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("a").join("b");
        assert_eq!(ensure_writable(&target), WritableState::MissingCreatable);
        // The check must not create anything.
        assert!(!tmp.path().join("a").exists());
    }

    #[test]
    fn missing_under_file_is_not_writable() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();
        assert_eq!(ensure_writable(&file.join("child")), WritableState::NotWritable);
    }

    #[cfg(unix)]
    #[test]
    fn readonly_dir_is_not_writable() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("locked");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555)).unwrap();

        assert_eq!(ensure_writable(&dir), WritableState::NotWritable);
        assert_eq!(ensure_writable(&dir.join("new")), WritableState::NotWritable);

        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
