use std::path::{Path, PathBuf};

use globset::GlobMatcher;

use crate::{
    error::{Error, Result},
    extract::DocumentFormat,
};

/// A discovered document file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the root it was found under.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

/// Compile a glob pattern used to filter discovered files by their
/// relative path.
pub fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    globset::Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::Config(format!("invalid glob {pattern:?}: {e}")))
}

/// Discover documents under `root`.
///
/// A file root is returned as is when its format is supported. A directory
/// is walked recursively, skipping hidden files and directories (names
/// starting with `.`) and files whose extension has no extractor. When
/// `filter` is given, only files whose relative path matches it are kept.
pub fn discover_files(
    root: &Path,
    filter: Option<&GlobMatcher>,
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize().map_err(|_| Error::NotFound {
        kind: "path",
        name: root.display().to_string(),
    })?;

    if canonical_root.is_file() {
        let relative_path = PathBuf::from(canonical_root.file_name().unwrap_or_default());
        return Ok(if is_supported(&canonical_root) {
            vec![DiscoveredFile {
                relative_path,
                absolute_path: canonical_root,
            }]
        } else {
            Vec::new()
        });
    }

    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &mut results)?;
    if let Some(filter) = filter {
        results.retain(|f| filter.is_match(&f.relative_path));
    }
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        // Skip hidden files and directories.
        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            walk_dir(root, &entry.path(), results)?;
        } else if file_type.is_symlink() {
            let Ok(resolved) = entry.path().canonicalize() else {
                continue;
            };
            // Directory links inside the root would be walked twice.
            if resolved.starts_with(root) && resolved.is_dir() {
                continue;
            }
            if resolved.is_file() && is_supported(&resolved) {
                results.push(discovered(root, &entry.path(), resolved));
            }
        } else if file_type.is_file() && is_supported(&entry.path()) {
            let abs = entry.path().canonicalize()?;
            results.push(discovered(root, &entry.path(), abs));
        }
    }

    Ok(())
}

fn is_supported(path: &Path) -> bool {
    DocumentFormat::from_path(path).is_some()
}

fn discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: PathBuf,
) -> DiscoveredFile {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();

    DiscoveredFile {
        relative_path,
        absolute_path,
    }
}
