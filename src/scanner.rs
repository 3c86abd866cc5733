//! Local folder enumeration.
//!
//! Builds the manifest sent in the INIT handshake: every regular file under
//! the sync root as a `/`-separated relative path. Nothing is filtered;
//! hidden files and ignore files sync like everything else.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::path::Path;

/// Enumerate every regular file under `root`, relative to it.
pub fn scan(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        anyhow::bail!("sync folder {} does not exist", root.display());
    }

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .follow_links(false)
        .build();

    let mut paths = Vec::new();
    for entry in walker {
        let entry = entry.context("failed to walk sync folder")?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .context("walked entry outside the sync root")?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        paths.push(parts.join("/"));
    }

    paths.sort();
    Ok(paths)
}
