/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use log::warn;

use crate::harness_error::{err_exit_code, FailureKind, Result};

/// The executable reads these as implicit extra arguments, so they are removed
/// before anything is spawned to keep runs independent of the invoking shell.
pub const SCRUBBED_ENV_VARS: &[&str] = &["BZIP", "BZIP2"];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

pub const KEY_VERSION: &str = "VERSION";
pub const KEY_PATH_SOURCE: &str = "PATH_SOURCE";
pub const KEY_PATH_BUILD: &str = "PATH_BUILD";
pub const KEY_PATH_EXECUTABLE: &str = "PATH_BZIP2";
pub const KEY_MEMCHECK: &str = "VALGRIND";
pub const KEY_TEMP: &str = "TMP";
pub const KEY_KEEP_TEMP: &str = "KEEPTEMP";
pub const KEY_TIMEOUT: &str = "TIMEOUT_SECS";

/// Command line contract of the executable under test. The defaults are the
/// bzip2 flags and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CliContract {
    pub compress: &'static str,
    pub decompress: &'static str,
    /// don't delete the input file
    pub keep: &'static str,
    pub stdout: &'static str,
    /// reduced-memory mode
    pub small: &'static str,
    pub version: &'static str,

    pub exit_success: i32,
    /// recoverable problem, e.g. some input files could not be processed
    pub exit_warning: i32,
    /// corrupt input or other fatal error
    pub exit_fatal: i32,
}

impl Default for CliContract {
    fn default() -> Self {
        CliContract {
            compress: "--compress",
            decompress: "--decompress",
            keep: "--keep",
            stdout: "--stdout",
            small: "--small",
            version: "--version",
            exit_success: 0,
            exit_warning: 1,
            exit_fatal: 2,
        }
    }
}

impl CliContract {
    /// compression strength argument, `-1` (fastest) to `-9` (best)
    pub fn level_arg(&self, level: u8) -> String {
        format!("-{}", level)
    }

    /// true if the exit code is an acceptable way to refuse corrupt input
    pub fn is_graceful_rejection(&self, exit_code: i32) -> bool {
        exit_code == self.exit_warning || exit_code == self.exit_fatal
    }
}

/// Process-wide settings for one suite run. Resolved once, then passed by
/// reference to every component.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// expected version string of the executable
    pub version: String,

    /// source tree, the corpus lives under `tests/input`
    pub path_source: PathBuf,

    pub path_build: PathBuf,

    /// the compressor under test
    pub executable: PathBuf,

    /// valgrind (or compatible) executable. None if memory checking is unavailable.
    pub memcheck: Option<PathBuf>,

    /// parent directory for the workspace, system temp dir if None
    pub temp_root: Option<PathBuf>,

    /// leave the workspace on disk after the run for post-mortem debugging
    pub keep_workspace: bool,

    /// wall-clock limit per invocation. None waits forever.
    pub timeout: Option<Duration>,

    pub cli: CliContract,
}

impl HarnessConfig {
    pub fn from_env() -> Result<HarnessConfig> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves the configuration from any environment-style key/value source.
    ///
    /// Missing `VERSION`, `PATH_SOURCE`, `PATH_BUILD` or an executable that cannot
    /// be found are configuration errors. A `VALGRIND` path that doesn't point to a
    /// file only disables memory checking.
    ///
    /// Values that are empty or only whitespace count as missing, with the
    /// exception of `KEEPTEMP`, where being set at all is the value. An empty
    /// `VERSION` would match every version banner.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<HarnessConfig> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let Some(version) = get(KEY_VERSION) else {
            return err_exit_code(
                FailureKind::Configuration,
                format!("{} environment variable not defined! Aborting...", KEY_VERSION),
            );
        };

        let path_source = required_path(&get, KEY_PATH_SOURCE)?;
        if !path_source.is_dir() {
            return err_exit_code(
                FailureKind::Configuration,
                format!("{} {:?} is not a directory", KEY_PATH_SOURCE, path_source),
            );
        }

        let path_build = required_path(&get, KEY_PATH_BUILD)?;

        let executable = match get(KEY_PATH_EXECUTABLE) {
            Some(p) => PathBuf::from(p),
            None => path_build.join(format!("bzip2{}", std::env::consts::EXE_SUFFIX)),
        };
        if !executable.is_file() {
            return err_exit_code(
                FailureKind::Configuration,
                format!(
                    "executable under test {:?} not found, set {} or {}",
                    executable, KEY_PATH_EXECUTABLE, KEY_PATH_BUILD
                ),
            );
        }
        let executable = absolute(&executable)?;

        let memcheck = match get(KEY_MEMCHECK) {
            Some(p) => {
                let p = PathBuf::from(p);
                if p.is_file() {
                    Some(absolute(&p)?)
                } else {
                    warn!("{} {:?} is not a file, memory checking disabled", KEY_MEMCHECK, p);
                    None
                }
            }
            None => None,
        };

        let timeout = match get(KEY_TIMEOUT) {
            Some(t) => match t.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(e) => {
                    return err_exit_code(
                        FailureKind::Configuration,
                        format!("{} {:?} is not a number of seconds: {}", KEY_TIMEOUT, t, e),
                    )
                }
            },
            None => Some(DEFAULT_TIMEOUT),
        };

        Ok(HarnessConfig {
            version,
            path_source,
            path_build,
            executable,
            memcheck,
            temp_root: get(KEY_TEMP).map(PathBuf::from),
            // any value counts, even an empty one
            keep_workspace: lookup(KEY_KEEP_TEMP).is_some(),
            timeout,
            cli: CliContract::default(),
        })
    }

    /// directory of one corpus below the source tree, eg `tests/input/quick`
    pub fn corpus_root(&self, name: &str) -> PathBuf {
        self.path_source.join("tests").join("input").join(name)
    }

    pub fn memcheck_enabled(&self) -> bool {
        self.memcheck.is_some()
    }
}

fn required_path(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<PathBuf> {
    match get(key) {
        Some(p) => absolute(Path::new(&p)),
        None => err_exit_code(
            FailureKind::Configuration,
            format!("{} environment variable not defined! Aborting...", key),
        ),
    }
}

/// Paths have to survive the change of working directory into the workspace.
fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn fake_tree() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join(format!("bzip2{}", std::env::consts::EXE_SUFFIX));
        std::fs::write(&exe, b"").unwrap();
        (dir, exe)
    }

    #[test]
    fn missing_version_is_fatal() {
        let (dir, _) = fake_tree();
        let d = dir.path().to_string_lossy().to_string();

        let e = HarnessConfig::from_lookup(lookup_from(&[
            (KEY_PATH_SOURCE, d.clone()),
            (KEY_PATH_BUILD, d),
        ]))
        .unwrap_err();

        assert_eq!(e.kind(), FailureKind::Configuration);
        assert!(e.kind().is_fatal_for_suite());
        assert!(e.message().contains("VERSION"));
    }

    #[test]
    fn empty_version_is_missing() {
        let (dir, _) = fake_tree();
        let d = dir.path().to_string_lossy().to_string();

        let e = HarnessConfig::from_lookup(lookup_from(&[
            (KEY_VERSION, "  ".to_owned()),
            (KEY_PATH_SOURCE, d.clone()),
            (KEY_PATH_BUILD, d.clone()),
        ]))
        .unwrap_err();
        assert_eq!(e.kind(), FailureKind::Configuration);
        assert!(e.message().contains("VERSION"));

        // while an empty KEEPTEMP still means keep
        let c = HarnessConfig::from_lookup(lookup_from(&[
            (KEY_VERSION, "1.0.8".to_owned()),
            (KEY_PATH_SOURCE, d.clone()),
            (KEY_PATH_BUILD, d),
            (KEY_KEEP_TEMP, String::new()),
        ]))
        .unwrap();
        assert!(c.keep_workspace);
    }

    #[test]
    fn executable_falls_back_to_build_dir() {
        let (dir, exe) = fake_tree();
        let d = dir.path().to_string_lossy().to_string();

        let c = HarnessConfig::from_lookup(lookup_from(&[
            (KEY_VERSION, "1.0.8".to_owned()),
            (KEY_PATH_SOURCE, d.clone()),
            (KEY_PATH_BUILD, d),
            (KEY_KEEP_TEMP, String::new()),
        ]))
        .unwrap();

        assert_eq!(c.version, "1.0.8");
        assert_eq!(c.executable, std::path::absolute(exe).unwrap());
        assert!(c.keep_workspace);
        assert_eq!(c.timeout, Some(DEFAULT_TIMEOUT));
        assert!(!c.memcheck_enabled());
        assert!(c
            .corpus_root("quick")
            .ends_with(Path::new("tests").join("input").join("quick")));
    }

    #[test]
    fn missing_executable_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().to_string_lossy().to_string();

        let e = HarnessConfig::from_lookup(lookup_from(&[
            (KEY_VERSION, "1.0.8".to_owned()),
            (KEY_PATH_SOURCE, d.clone()),
            (KEY_PATH_BUILD, d),
        ]))
        .unwrap_err();

        assert_eq!(e.kind(), FailureKind::Configuration);
    }

    #[test]
    fn memcheck_that_is_not_a_file_is_ignored() {
        let (dir, _) = fake_tree();
        let d = dir.path().to_string_lossy().to_string();

        let c = HarnessConfig::from_lookup(lookup_from(&[
            (KEY_VERSION, "1.0.8".to_owned()),
            (KEY_PATH_SOURCE, d.clone()),
            (KEY_PATH_BUILD, d.clone()),
            (KEY_MEMCHECK, dir.path().join("no-valgrind").to_string_lossy().to_string()),
            (KEY_TIMEOUT, "0".to_owned()),
        ]))
        .unwrap();

        assert!(c.memcheck.is_none());
        assert!(c.timeout.is_none());
        assert!(!c.keep_workspace);
    }

    #[test]
    fn bad_timeout_is_fatal() {
        let (dir, _) = fake_tree();
        let d = dir.path().to_string_lossy().to_string();

        let e = HarnessConfig::from_lookup(lookup_from(&[
            (KEY_VERSION, "1.0.8".to_owned()),
            (KEY_PATH_SOURCE, d.clone()),
            (KEY_PATH_BUILD, d),
            (KEY_TIMEOUT, "soon".to_owned()),
        ]))
        .unwrap_err();

        assert_eq!(e.kind(), FailureKind::Configuration);
    }

    #[test]
    fn graceful_rejection_codes() {
        let cli = CliContract::default();
        assert!(cli.is_graceful_rejection(1));
        assert!(cli.is_graceful_rejection(2));
        assert!(!cli.is_graceful_rejection(0));
        assert!(!cli.is_graceful_rejection(3));
        assert_eq!(cli.level_arg(9), "-9");
    }
}
