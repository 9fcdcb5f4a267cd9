//! Directory listing for snapshot capture.
//!
//! The capture engine visits one directory at a time so lifecycle actions
//! can bracket each subtree; this module produces the deterministic,
//! name-sorted listing it consumes.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// One entry discovered in a directory.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Name within its parent directory
    pub name: String,

    /// Size in bytes (0 for directories)
    pub size: u64,

    /// Is this a directory?
    pub is_dir: bool,

    /// Is this a symlink?
    pub is_symlink: bool,
}

/// List the immediate children of `dir`, sorted by name.
///
/// Symlinks are resolved to their targets to get the real file size.
/// Broken symlinks and symlinks to directories are skipped.
pub fn list_directory(dir: &Path) -> std::io::Result<Vec<EntryInfo>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let raw = entry.metadata()?;
        let is_symlink = raw.is_symlink();

        let (size, is_dir) = if is_symlink {
            match std::fs::metadata(entry.path()) {
                Ok(resolved) => {
                    if resolved.is_dir() {
                        // Symlink to directory — skip it
                        continue;
                    }
                    (resolved.len(), false)
                }
                Err(_) => {
                    // Broken symlink — skip it
                    continue;
                }
            }
        } else {
            (raw.len(), raw.is_dir())
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push(EntryInfo {
            path: entry.into_path(),
            name,
            size,
            is_dir,
            is_symlink,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_list_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let entries = list_directory(temp_dir.path())?;
        assert_eq!(entries.len(), 0);
        Ok(())
    }

    #[test]
    fn test_list_is_sorted_by_name() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("zebra.txt"), b"z")?;
        fs::write(temp_dir.path().join("alpha.txt"), b"a")?;
        fs::create_dir(temp_dir.path().join("middle"))?;

        let entries = list_directory(temp_dir.path())?;
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha.txt", "middle", "zebra.txt"]);
        Ok(())
    }

    #[test]
    fn test_list_does_not_descend() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("subdir/nested.txt"), b"deep")?;

        let entries = list_directory(temp_dir.path())?;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_symlink_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        std::os::unix::fs::symlink("/no/such/target", temp_dir.path().join("dangling"))?;

        let entries = list_directory(temp_dir.path())?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "file.txt");
        Ok(())
    }
}
