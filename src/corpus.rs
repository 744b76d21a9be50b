/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::path::{Path, PathBuf};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::harness_error::Result;

/// compressed artifact that must decompress correctly
pub const VALID_SUFFIX: &str = "bz2";
/// intentionally damaged artifact that must be rejected gracefully
pub const CORRUPT_SUFFIX: &str = "bad";
/// plaintext that is compressed and round-tripped, also the plaintext companion of a `.bz2`
pub const REFERENCE_SUFFIX: &str = "ref";
/// `<hex digest> <filename>` sidecar with the md5 of the decompressed `.bz2`
pub const HASH_SUFFIX: &str = "md5";

/// Ground truth for a valid sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Companion {
    HashSidecar(PathBuf),
    Plaintext(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// None if neither a hash sidecar nor a plaintext reference exists, which fails the case
    Valid(Option<Companion>),
    Corrupt,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    /// corpus root the sample was found under, used to build stable names
    pub root: PathBuf,
    pub classification: Classification,
}

impl Sample {
    /// path relative to the corpus root it came from
    pub fn relative_path(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(&self.path)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Classifies a file by its suffix, looking for companions next to it.
/// Returns None for files that aren't samples (including the sidecars themselves).
pub fn classify(path: &Path) -> Option<Classification> {
    let extension = path.extension()?.to_str()?;

    match extension {
        CORRUPT_SUFFIX => Some(Classification::Corrupt),
        REFERENCE_SUFFIX => Some(Classification::Reference),
        VALID_SUFFIX => {
            let hash = path.with_extension(HASH_SUFFIX);
            let plaintext = path.with_extension(REFERENCE_SUFFIX);

            let companion = if hash.is_file() {
                Some(Companion::HashSidecar(hash))
            } else if plaintext.is_file() {
                Some(Companion::Plaintext(plaintext))
            } else {
                None
            };
            Some(Classification::Valid(companion))
        }
        _ => None,
    }
}

/// Recursively enumerates the samples under `root` in a deterministic order.
/// A root that doesn't exist or has no samples gives an empty list.
pub fn enumerate_samples(root: &Path) -> Result<Vec<Sample>> {
    let mut results = Vec::new();

    if !root.is_dir() {
        warn!("corpus root {:?} is not a directory, no samples", root);
        return Ok(results);
    }

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        if let Some(classification) = classify(entry.path()) {
            if classification == Classification::Valid(None) {
                warn!("{:?} has no .md5 or .ref companion", entry.path());
            }

            results.push(Sample {
                path: entry.path().to_path_buf(),
                root: root.to_path_buf(),
                classification,
            });
        }
    }

    debug!("{} samples under {:?}", results.len(), root);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn classification_by_suffix_and_companion() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();

        fs::create_dir_all(d.join("nested/deeper")).unwrap();
        fs::write(d.join("a.bz2"), b"").unwrap();
        fs::write(d.join("a.md5"), b"d41d8cd98f00b204e9800998ecf8427e  a\n").unwrap();
        fs::write(d.join("a.ref"), b"").unwrap();
        fs::write(d.join("nested/b.bz2"), b"").unwrap();
        fs::write(d.join("nested/b.ref"), b"plain").unwrap();
        fs::write(d.join("nested/deeper/truncated.bad"), b"BZh9").unwrap();
        fs::write(d.join("nested/deeper/orphan.bz2"), b"").unwrap();
        fs::write(d.join("README"), b"not a sample").unwrap();

        let samples = enumerate_samples(d).unwrap();
        let found: Vec<(String, Classification)> = samples
            .iter()
            .map(|s| {
                (
                    s.relative_path().to_string_lossy().replace('\\', "/"),
                    s.classification.clone(),
                )
            })
            .collect();

        assert_eq!(
            found,
            vec![
                (
                    "a.bz2".to_owned(),
                    Classification::Valid(Some(Companion::HashSidecar(d.join("a.md5"))))
                ),
                ("a.ref".to_owned(), Classification::Reference),
                (
                    "nested/b.bz2".to_owned(),
                    Classification::Valid(Some(Companion::Plaintext(d.join("nested/b.ref"))))
                ),
                ("nested/b.ref".to_owned(), Classification::Reference),
                ("nested/deeper/orphan.bz2".to_owned(), Classification::Valid(None)),
                ("nested/deeper/truncated.bad".to_owned(), Classification::Corrupt),
            ]
        );
    }

    #[test]
    fn empty_and_missing_roots() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        assert!(enumerate_samples(dir.path()).unwrap().is_empty());
        assert!(enumerate_samples(&dir.path().join("missing"))
            .unwrap()
            .is_empty());
    }
}
