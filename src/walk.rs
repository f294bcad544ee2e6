use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;

/// Lists every file below `dir`, sorted. A missing directory has no files.
pub fn list_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        tracing::debug!(dir = %dir.display(), "directory not found; nothing to list");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current)
            .with_context(|| format!("read dir: {}", current.display()))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("list dir: {}", current.display()))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("read entry type: {}", path.display()))?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if file_type.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Path segments of `path` relative to `root`.
pub fn relative_segments(root: &Path, path: &Path) -> anyhow::Result<Vec<String>> {
    let relative = path.strip_prefix(root).with_context(|| {
        format!(
            "{} is not below {}",
            path.display(),
            root.display()
        )
    })?;

    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy().into_owned()),
            Component::CurDir => {}
            other => anyhow::bail!("unexpected path component {other:?} in {}", path.display()),
        }
    }
    Ok(segments)
}

/// `/` followed by the path of `file` relative to `root`, `/`-separated.
pub fn url_path(root: &Path, file: &Path) -> anyhow::Result<String> {
    let segments = relative_segments(root, file)?;
    Ok(format!("/{}", segments.join("/")))
}
