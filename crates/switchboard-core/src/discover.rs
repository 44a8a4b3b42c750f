//! Server discovery
//!
//! One-level scan of a directory for projects that look like servers:
//! a `package.json` or `pyproject.toml` whose contents mention the
//! protocol. Discovery only reports candidates; registering them is an
//! explicit, separate step.

use crate::error::SwitchboardResult;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

const MANIFESTS: &[&str] = &["package.json", "pyproject.toml"];

/// A directory that looks like it contains a server
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub name: String,
    pub path: PathBuf,
    pub manifest: String,
}

/// Scan the immediate children of `root` for server projects
pub fn scan(root: &Path) -> SwitchboardResult<Vec<Candidate>> {
    let mut candidates = Vec::new();
    if !root.is_dir() {
        return Ok(candidates);
    }

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        for manifest in MANIFESTS {
            let manifest_path = path.join(manifest);
            if !manifest_path.is_file() {
                continue;
            }
            let contents = match std::fs::read_to_string(&manifest_path) {
                Ok(contents) => contents,
                Err(e) => {
                    debug!(path = %manifest_path.display(), "unreadable manifest: {}", e);
                    continue;
                }
            };
            let haystack = contents.to_lowercase();
            // The Node SDK spells the protocol out in full.
            if haystack.contains("mcp") || haystack.contains("modelcontextprotocol") {
                let name = entry.file_name().to_string_lossy().to_string();
                candidates.push(Candidate {
                    name,
                    path: path.clone(),
                    manifest: manifest.to_string(),
                });
                break;
            }
        }
    }

    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(root = %root.display(), found = candidates.len(), "discovery scan complete");
    Ok(candidates)
}
