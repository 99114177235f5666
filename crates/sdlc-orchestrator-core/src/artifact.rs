// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! On-disk artifact detection.
//!
//! After a step succeeds, the engine checks each name in the step's
//! `creates` against the project root. Detection is presence-based; when a
//! step opts into checksums, file contents are hashed for change detection
//! across loopbacks. Directories count as present when they exist.

use sha2::{Digest, Sha256};
use std::path::Path;

/// One artifact found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedArtifact {
    pub name: String,
    pub checksum: Option<String>,
}

/// Detection result: what was found and what was declared but absent.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub found: Vec<DetectedArtifact>,
    pub missing: Vec<String>,
}

/// Check declared artifact names against the project root.
pub fn detect_artifacts(project_root: &Path, names: &[String], with_checksum: bool) -> Detection {
    let mut detection = Detection::default();

    for name in names {
        let path = project_root.join(name.trim_end_matches('/'));
        if !path.exists() {
            detection.missing.push(name.clone());
            continue;
        }

        let checksum = if with_checksum && path.is_file() {
            checksum_file(&path)
        } else {
            None
        };
        detection.found.push(DetectedArtifact {
            name: name.clone(),
            checksum,
        });
    }

    detection
}

/// SHA-256 hex digest of a file's contents; `None` when unreadable.
fn checksum_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}
