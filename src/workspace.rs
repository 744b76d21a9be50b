/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{
    fs,
    path::{Component, Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use log::{info, warn};
use tempfile::TempDir;

use crate::{
    config::HarnessConfig,
    harness_error::{err_exit_code, AddContext, FailureKind, Result},
};

/// The working directory is process-wide, so only one suite may run at a time.
static SUITE_LOCK: Mutex<()> = Mutex::new(());

/// Temporary directory owned by one suite run. All subprocesses run inside it
/// (each case in its own scratch subdirectory).
///
/// While alive the process working directory is the workspace. Dropping it
/// restores the previous working directory and deletes the directory unless
/// the configuration asks to keep it.
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    original_working_directory: PathBuf,
    keep: bool,
    _suite: MutexGuard<'static, ()>,
}

impl Workspace {
    pub fn create(config: &HarnessConfig) -> Result<Workspace> {
        // a panicking suite on another thread doesn't make the directory state invalid
        let suite = SUITE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let mut builder = tempfile::Builder::new();
        builder.prefix("bzverify-");
        let dir = match &config.temp_root {
            Some(root) => builder
                .tempdir_in(root)
                .context(format!("creating workspace in {:?}", root))?,
            None => builder.tempdir().context("creating workspace")?,
        };
        let path = dir.path().to_path_buf();

        let original_working_directory = std::env::current_dir()?;
        std::env::set_current_dir(&path).context("entering workspace")?;

        info!("workspace {:?}", path);

        Ok(Workspace {
            dir: Some(dir),
            path,
            original_working_directory,
            keep: config.keep_workspace,
            _suite: suite,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates (if needed) the isolated scratch directory of a case, named after
    /// the case. Case names are unique within a plan, so no two cases share one.
    pub fn case_scratch(&self, case_name: &str) -> Result<PathBuf> {
        let mut components = Path::new(case_name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return err_exit_code(
                FailureKind::Configuration,
                format!("case name {:?} is not usable as a directory name", case_name),
            );
        }

        let scratch = self.path.join(case_name);
        fs::create_dir_all(&scratch).context(format!("creating scratch for {}", case_name))?;
        Ok(scratch)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // restore the working directory before the workspace goes away
        if let Err(e) = std::env::set_current_dir(&self.original_working_directory) {
            warn!(
                "could not restore working directory {:?}: {}",
                self.original_working_directory, e
            );
        }

        if let Some(dir) = self.dir.take() {
            if self.keep {
                let path = dir.keep();
                info!("keeping workspace {:?}", path);
            } else {
                match dir.close() {
                    Ok(()) => info!("removed workspace {:?}", self.path),
                    Err(e) => warn!("could not remove workspace {:?}: {}", self.path, e),
                }
            }
        }
    }
}

#[cfg(test)]
fn test_config(temp_root: &Path, keep: bool) -> HarnessConfig {
    HarnessConfig {
        version: "1.0.8".to_owned(),
        path_source: temp_root.to_path_buf(),
        path_build: temp_root.to_path_buf(),
        executable: temp_root.join("bzip2"),
        memcheck: None,
        temp_root: Some(temp_root.to_path_buf()),
        keep_workspace: keep,
        timeout: None,
        cli: Default::default(),
    }
}

#[test]
fn workspace_is_entered_and_removed() {
    crate::init_logging();

    let root = tempfile::tempdir().unwrap();

    let ws_path;
    {
        let ws = Workspace::create(&test_config(root.path(), false)).unwrap();
        ws_path = ws.path().to_path_buf();

        assert!(ws_path.starts_with(root.path()));
        assert_eq!(
            std::env::current_dir().unwrap().canonicalize().unwrap(),
            ws_path.canonicalize().unwrap()
        );

        let a = ws.case_scratch("decomp_a_bz2").unwrap();
        let b = ws.case_scratch("decomp_b_bz2").unwrap();
        assert!(a.is_dir());
        assert_ne!(a, b);
        assert_eq!(a, ws.case_scratch("decomp_a_bz2").unwrap());
        assert_eq!(a, ws_path.join("decomp_a_bz2"));

        // names that would escape or alias another directory are refused
        for bad in ["", "..", "a/b", "/abs"] {
            assert_eq!(
                ws.case_scratch(bad).unwrap_err().kind(),
                FailureKind::Configuration,
                "{:?}",
                bad
            );
        }
    }

    // another suite may already own the working directory, but it can't be ours anymore
    assert!(!std::env::current_dir().unwrap().starts_with(&ws_path));
    assert!(!ws_path.exists());
}

#[test]
fn workspace_is_kept_on_request() {
    crate::init_logging();

    let root = tempfile::tempdir().unwrap();

    let ws_path;
    {
        let ws = Workspace::create(&test_config(root.path(), true)).unwrap();
        ws_path = ws.path().to_path_buf();
        fs::write(ws_path.join("post-mortem"), b"x").unwrap();
    }

    assert!(ws_path.join("post-mortem").is_file());
}
