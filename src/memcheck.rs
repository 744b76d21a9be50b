/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{ffi::OsString, fs, path::Path};

use log::{debug, error};

use crate::harness_error::{err_exit_code, FailureKind, Result};

/// Exit code valgrind reports for a definite leak. Chosen to be distinct from
/// the exit codes of the executable under test.
pub const LEAK_EXIT_CODE: i32 = 123;

/// written inside the scratch directory of the case
pub const LOG_FILE_NAME: &str = "memcheck.log";

const SUMMARY_MARKER: &str = "ERROR SUMMARY";
const CLEAN_SUMMARY: &str = "ERROR SUMMARY: 0 errors";

/// lines this long are suppression dumps and only clutter the report
const MAX_ECHO_LINE_LEN: usize = 500;

/// how much of a log without any summary is echoed
const FALLBACK_TAIL_LINES: usize = 100;

/// Arguments placed between the memory checker and the executable under test.
pub fn memcheck_args(log_file: &Path) -> Vec<OsString> {
    let mut log_arg = OsString::from("--log-file=");
    log_arg.push(log_file.as_os_str());

    let mut args: Vec<OsString> = [
        "-v",
        "--trace-children=yes",
        "--track-fds=yes",
        "--leak-check=full",
        "--gen-suppressions=all",
        "--show-leak-kinds=definite",
        "--errors-for-leak-kinds=definite",
    ]
    .iter()
    .map(OsString::from)
    .collect();

    args.push(log_arg);
    args.push(format!("--error-exitcode={}", LEAK_EXIT_CODE).into());
    args
}

/// What the memory checker said about one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryCheckReport {
    /// every `ERROR SUMMARY` line, one per traced process
    pub summaries: Vec<String>,

    /// the part of the log worth echoing: from the first summary on, or the end of
    /// the log if there is no summary at all
    pub tail: Vec<String>,
}

impl MemoryCheckReport {
    pub fn parse(log: &str) -> MemoryCheckReport {
        let lines: Vec<&str> = log.lines().collect();

        let first_summary = lines.iter().position(|l| l.contains(SUMMARY_MARKER));

        let summaries = lines
            .iter()
            .filter(|l| l.contains(SUMMARY_MARKER))
            .map(|l| l.to_string())
            .collect();

        let start = first_summary.unwrap_or(lines.len().saturating_sub(FALLBACK_TAIL_LINES));
        let tail = lines[start..]
            .iter()
            .filter(|l| l.len() < MAX_ECHO_LINE_LEN)
            .map(|l| l.to_string())
            .collect();

        MemoryCheckReport { summaries, tail }
    }

    /// true only if there is at least one summary and all of them report zero errors
    pub fn is_clean(&self) -> bool {
        !self.summaries.is_empty() && self.summaries.iter().all(|s| s.contains(CLEAN_SUMMARY))
    }

    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }
}

/// Checks the log the memory checker wrote for one invocation.
///
/// A missing log means the checker never ran, which is as much a failure as a
/// summary with errors in it.
pub fn verify_memcheck_log(log_file: &Path) -> Result<MemoryCheckReport> {
    if !log_file.exists() {
        return err_exit_code(
            FailureKind::MemoryCheckViolation,
            format!("{} not found. Memory checker failed to run?", log_file.display()),
        );
    }

    debug!("Verifying {}...", log_file.display());

    let contents = fs::read(log_file)?;
    let report = MemoryCheckReport::parse(&String::from_utf8_lossy(&contents));

    if report.is_clean() {
        for s in &report.summaries {
            debug!("{}", s);
        }
        return Ok(report);
    }

    error!("{}", "*".repeat(80));
    error!("{:^80}", "Memory check failed!");
    error!("{:^80}", log_file.display());
    error!("{}", "*".repeat(80));
    for line in &report.tail {
        error!("{}", line);
    }

    let reason = if report.summaries.is_empty() {
        "no ERROR SUMMARY in log"
    } else {
        "errors reported"
    };

    err_exit_code(
        FailureKind::MemoryCheckViolation,
        format!(
            "memory check FAILED ({}), see {}:\n{}",
            reason,
            log_file.display(),
            report.tail_text()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN_LOG: &str = "\
==4242== Memcheck, a memory error detector
==4242== HEAP SUMMARY:
==4242==     in use at exit: 0 bytes in 0 blocks
==4242== All heap blocks were freed -- no leaks are possible
==4242==
==4242== ERROR SUMMARY: 0 errors from 0 contexts (suppressed: 0 from 0)
";

    const LEAKY_LOG: &str = "\
==4243== Memcheck, a memory error detector
==4243== 64 bytes in 1 blocks are definitely lost in loss record 1 of 1
==4243==    at 0x483B7F3: malloc (vg_replace_malloc.c:309)
==4243== LEAK SUMMARY:
==4243==    definitely lost: 64 bytes in 1 blocks
==4243== ERROR SUMMARY: 1 errors from 1 contexts (suppressed: 0 from 0)
";

    #[test]
    fn clean_log_passes() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        fs::write(&log, CLEAN_LOG).unwrap();

        let report = verify_memcheck_log(&log).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(report.tail.len(), 1);
    }

    #[test]
    fn errors_fail_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        fs::write(&log, LEAKY_LOG).unwrap();

        let e = verify_memcheck_log(&log).unwrap_err();
        assert_eq!(e.kind(), FailureKind::MemoryCheckViolation);
        assert!(e.message().contains("ERROR SUMMARY: 1 errors"));
    }

    #[test]
    fn missing_log_fails() {
        let dir = tempfile::tempdir().unwrap();
        let e = verify_memcheck_log(&dir.path().join(LOG_FILE_NAME)).unwrap_err();
        assert_eq!(e.kind(), FailureKind::MemoryCheckViolation);
        assert!(e.message().contains("failed to run"));
    }

    #[test]
    fn any_dirty_child_process_fails() {
        // --trace-children=yes gives one summary per process
        let log = format!("{}{}", CLEAN_LOG, LEAKY_LOG);
        let report = MemoryCheckReport::parse(&log);
        assert_eq!(report.summaries.len(), 2);
        assert!(!report.is_clean());

        let no_summary = MemoryCheckReport::parse("==1== Memcheck, a memory error detector\n");
        assert!(!no_summary.is_clean());
        assert_eq!(no_summary.tail.len(), 1);
    }

    #[test]
    fn long_lines_are_not_echoed() {
        let log = format!(
            "==1== ERROR SUMMARY: 2 errors from 2 contexts\n{}\n==1== end\n",
            "x".repeat(MAX_ECHO_LINE_LEN)
        );
        let report = MemoryCheckReport::parse(&log);
        assert_eq!(report.tail.len(), 2);
    }

    #[test]
    fn args_end_with_log_and_exit_code() {
        let args = memcheck_args(Path::new("/tmp/case-0/memcheck.log"));
        assert_eq!(args[0], "-v");
        assert!(args.contains(&OsString::from("--trace-children=yes")));
        assert!(args.contains(&OsString::from("--errors-for-leak-kinds=definite")));
        assert_eq!(
            args[args.len() - 2],
            OsString::from("--log-file=/tmp/case-0/memcheck.log")
        );
        assert_eq!(args[args.len() - 1], "--error-exitcode=123");
    }
}
