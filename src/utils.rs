use std::{fs, path::Path};

use md5::{Digest, Md5};

use crate::harness_error::{err_exit_code, AddContext, FailureKind, HarnessError, Result};

/// lowercase hex md5, the digest the corpus sidecars use
pub fn content_digest(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// Reads the digest out of a `<hex digest> <filename>` sidecar.
pub fn read_hash_sidecar(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path).map_err(|e| {
        HarnessError::new(
            FailureKind::MissingCompanion,
            &format!("can't read hash sidecar {}: {}", path.display(), e),
        )
    })?;

    let Some(digest) = contents.split_whitespace().next() else {
        return err_exit_code(
            FailureKind::MissingCompanion,
            format!("hash sidecar {} is empty", path.display()),
        );
    };

    if digest.len() != 32 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return err_exit_code(
            FailureKind::MissingCompanion,
            format!("hash sidecar {} has no md5 digest: {:?}", path.display(), digest),
        );
    }

    Ok(digest.to_ascii_lowercase())
}

/// writes an intermediate artifact into the scratch directory
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).context(format!("writing {}", path.display()))
}

#[test]
fn empty_content_digest() {
    assert_eq!(content_digest(b""), "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(
        content_digest(b"hello world"),
        "5eb63bbbe01eeed093cb22bb8f5acdc3"
    );
}

#[test]
fn sidecar_parsing() {
    let dir = tempfile::tempdir().unwrap();

    let good = dir.path().join("a.md5");
    fs::write(&good, "D41D8CD98F00B204E9800998ECF8427E  a\n").unwrap();
    assert_eq!(
        read_hash_sidecar(&good).unwrap(),
        "d41d8cd98f00b204e9800998ecf8427e"
    );

    let bare = dir.path().join("b.md5");
    fs::write(&bare, "5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap();
    assert_eq!(
        read_hash_sidecar(&bare).unwrap(),
        "5eb63bbbe01eeed093cb22bb8f5acdc3"
    );

    let garbage = dir.path().join("c.md5");
    fs::write(&garbage, "not-a-digest c\n").unwrap();
    assert_eq!(
        read_hash_sidecar(&garbage).unwrap_err().kind(),
        FailureKind::MissingCompanion
    );

    assert_eq!(
        read_hash_sidecar(&dir.path().join("missing.md5"))
            .unwrap_err()
            .kind(),
        FailureKind::MissingCompanion
    );
}
