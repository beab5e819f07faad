use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const MAX_WRAPPER_DEPTH: usize = 5;

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory: {}", path.display()))?;
    }
    Ok(())
}

/// Deletes everything inside `dir` but keeps the directory itself.
pub fn clean_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        } else {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

/// Replaces `path` with `bytes` through a sibling temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp_path = parent.join(format!(
        ".{file_name}.tmp-{}-{}",
        std::process::id(),
        updraft_core::unique_suffix()
    ));

    fs::write(&tmp_path, bytes)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| {
            format!(
                "failed to move {} to {}",
                tmp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub fn copy_file_creating_parents(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))
}

/// Every regular file below `root` as a `/`-separated relative path, sorted.
pub fn collect_relative_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    if !root.is_dir() {
        return Ok(files);
    }

    let mut queue = VecDeque::from([PathBuf::new()]);
    while let Some(relative_dir) = queue.pop_front() {
        let current = root.join(&relative_dir);
        for entry in
            fs::read_dir(&current).with_context(|| format!("failed to read {}", current.display()))?
        {
            let entry = entry?;
            let relative = relative_dir.join(entry.file_name());
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat {}", entry.path().display()))?;
            if file_type.is_dir() {
                queue.push_back(relative);
            } else if file_type.is_file() {
                files.push(to_slash_path(&relative));
            }
        }
    }

    files.sort();
    Ok(files)
}

pub fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walks down single-child wrapper directories to the real root of an update.
///
/// Stops at the first directory holding files or several subdirectories.
/// An empty tree resolves to `path` itself.
pub fn detect_update_root(path: &Path) -> Result<PathBuf> {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_WRAPPER_DEPTH {
        if !current.is_dir() {
            return Ok(path.to_path_buf());
        }

        let mut has_files = false;
        let mut directories = Vec::new();
        for entry in
            fs::read_dir(&current).with_context(|| format!("failed to read {}", current.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                directories.push(entry.path());
            } else {
                has_files = true;
            }
        }

        if has_files || directories.len() > 1 {
            return Ok(current);
        }
        match directories.pop() {
            Some(only_child) => current = only_child,
            None => return Ok(path.to_path_buf()),
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_root;

    #[test]
    fn detect_update_root_descends_single_child_wrappers() {
        let root = test_root("fs-wrapper");
        let nested = root.join("Shop-update-v2").join("update");
        fs::create_dir_all(nested.join("app")).expect("must create dirs");
        fs::write(nested.join("index.php"), b"<?php").expect("must write file");

        assert_eq!(detect_update_root(&root).expect("must detect"), nested);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn detect_update_root_stops_at_multiple_directories() {
        let root = test_root("fs-siblings");
        fs::create_dir_all(root.join("wrap").join("app")).expect("must create dirs");
        fs::create_dir_all(root.join("wrap").join("vendor")).expect("must create dirs");

        assert_eq!(
            detect_update_root(&root).expect("must detect"),
            root.join("wrap")
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn detect_update_root_returns_original_for_empty_tree() {
        let root = test_root("fs-empty");
        fs::create_dir_all(root.join("a").join("b")).expect("must create dirs");

        assert_eq!(detect_update_root(&root).expect("must detect"), root);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn collect_relative_files_is_sorted_and_slash_separated() {
        let root = test_root("fs-collect");
        fs::create_dir_all(root.join("b").join("c")).expect("must create dirs");
        fs::write(root.join("b").join("c").join("z.txt"), b"z").expect("must write");
        fs::write(root.join("a.txt"), b"a").expect("must write");

        assert_eq!(
            collect_relative_files(&root).expect("must collect"),
            vec!["a.txt".to_string(), "b/c/z.txt".to_string()]
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn write_atomic_replaces_existing_content() {
        let root = test_root("fs-atomic");
        let path = root.join("state.json");
        write_atomic(&path, b"first").expect("must write");
        write_atomic(&path, b"second").expect("must overwrite");

        assert_eq!(fs::read(&path).expect("must read"), b"second");
        assert_eq!(fs::read_dir(&root).expect("must list").count(), 1);
        let _ = fs::remove_dir_all(&root);
    }
}
