/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{
    ffi::OsString,
    fs,
    io::Read,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    config::{HarnessConfig, SCRUBBED_ENV_VARS},
    harness_error::{err_exit_code, AddContext, FailureKind, HarnessError, Result},
    memcheck::{memcheck_args, verify_memcheck_log, LEAK_EXIT_CODE, LOG_FILE_NAME},
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// how long the pipes may stay open once the process group was killed
const KILL_GRACE: Duration = Duration::from_secs(5);

/// how much of stderr goes into failure messages
const STDERR_EXCERPT_LEN: usize = 2048;

/// Outcome of one run of the executable under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// None if the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// the terminating signal, unix only
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl CommandResult {
    /// human readable exit status, eg "exit code 2" or "killed by signal 11"
    pub fn describe_exit(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "terminated without exit code".to_owned(),
        }
    }

    /// end of stderr as text, truncated to keep failure messages readable
    pub fn stderr_excerpt(&self) -> String {
        let start = self.stderr.len().saturating_sub(STDERR_EXCERPT_LEN);
        String::from_utf8_lossy(&self.stderr[start..])
            .trim_end()
            .to_owned()
    }
}

/// Runs the executable under test, optionally wrapped by the memory checker.
pub struct Executor<'a> {
    config: &'a HarnessConfig,
}

impl<'a> Executor<'a> {
    pub fn new(config: &'a HarnessConfig) -> Self {
        Executor { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        self.config
    }

    /// Runs the executable with `args` inside `scratch`.
    ///
    /// Both output streams are drained on their own threads while the process
    /// runs, so a child writing more than a pipe buffer can't deadlock us. On unix
    /// the child leads its own process group. If the configured timeout expires
    /// before the child has exited and closed its output, the whole group is
    /// killed and the call fails with `HungExecutable`. Anything the executable
    /// forked is covered by the same deadline. When `memcheck` is set and a memory checker is
    /// configured, its log is validated before the result is returned.
    pub fn execute(&self, args: &[OsString], scratch: &Path, memcheck: bool) -> Result<CommandResult> {
        let memcheck_tool = if memcheck {
            self.config.memcheck.as_deref()
        } else {
            None
        };

        let log_file = scratch.join(LOG_FILE_NAME);

        let (program, mut argv) = match memcheck_tool {
            Some(tool) => {
                // a stale log from a previous invocation would hide a checker that never ran
                if log_file.exists() {
                    fs::remove_file(&log_file).context("removing stale memcheck log")?;
                }
                let mut argv = memcheck_args(&log_file);
                argv.push(self.config.executable.clone().into_os_string());
                (tool, argv)
            }
            None => (self.config.executable.as_path(), Vec::new()),
        };
        argv.extend(args.iter().cloned());

        let command_line = render_command_line(program, &argv);
        debug!("Running: {}", command_line);

        let mut command = Command::new(program);
        command
            .args(&argv)
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in SCRUBBED_ENV_VARS {
            command.env_remove(var);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let started_at = Instant::now();
        let mut child = command
            .spawn()
            .context(format!("spawning {}", command_line))?;

        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let deadline = self.config.timeout.map(|t| started_at + t);
        let status = wait_for_child(&mut child, deadline, &command_line)?;

        // a forked process can keep the pipes open after the child exited,
        // so reading is bounded by the same deadline
        let read_deadline = match status {
            Some(_) => deadline,
            None => Some(Instant::now() + KILL_GRACE),
        };
        let stdout = join_reader(&stdout_reader, read_deadline)?;
        let stderr = join_reader(&stderr_reader, read_deadline)?;
        let elapsed = started_at.elapsed();

        if status.is_some() && (stdout.is_none() || stderr.is_none()) {
            // the leader is already reaped, its group lives on as long as a member does
            kill_process_group(&mut child, &command_line);
        }
        let (Some(status), Some(stdout), Some(stderr)) = (status, stdout, stderr) else {
            return err_exit_code(
                FailureKind::HungExecutable,
                format!(
                    "{} did not finish within {:?} and was killed",
                    command_line, elapsed
                ),
            );
        };

        let result = CommandResult {
            exit_code: status.code(),
            signal: exit_signal(&status),
            stdout,
            stderr,
            elapsed,
        };

        debug!(
            "{} after {:?}, {} bytes out, {} bytes err",
            result.describe_exit(),
            elapsed,
            result.stdout.len(),
            result.stderr.len()
        );

        if memcheck_tool.is_some() {
            if result.exit_code == Some(LEAK_EXIT_CODE) {
                let details = match verify_memcheck_log(&log_file) {
                    Ok(_) => String::new(),
                    Err(e) => e.message().to_owned(),
                };
                return err_exit_code(
                    FailureKind::MemoryCheckViolation,
                    format!(
                        "{} reported a definite leak (exit code {})\n{}",
                        command_line, LEAK_EXIT_CODE, details
                    ),
                );
            }

            verify_memcheck_log(&log_file).context(&command_line)?;
        }

        Ok(result)
    }
}

/// Polls the child until it exits or `deadline` passes. Returns None if it had to be killed.
fn wait_for_child(
    child: &mut Child,
    deadline: Option<Instant>,
    command_line: &str,
) -> Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return Ok(Some(child.wait().context(command_line)?));
    };

    loop {
        match child.try_wait().context(command_line)? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    kill_process_group(child, command_line);
                    child.wait().context(command_line)?;
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Kills the child and, on unix, every process in its group.
fn kill_process_group(child: &mut Child, command_line: &str) {
    warn!("{} timed out, killing it", command_line);

    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let killed = Command::new("kill")
            .args(["-KILL", "--", group.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match killed {
            Ok(status) if status.success() => {}
            other => debug!("kill of process group {} gave {:?}", group, other),
        }
    }

    // the child may have exited on its own in the meantime, that's fine
    let _ = child.kill();
}

/// Reads the pipe to its end on a detached thread. A reader that never sees
/// the end is abandoned together with its pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<std::io::Result<Vec<u8>>> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let read = match pipe {
            Some(mut pipe) => pipe.read_to_end(&mut buffer).map(|_| ()),
            None => Ok(()),
        };
        let _ = sender.send(read.map(|()| buffer));
    });
    receiver
}

/// None if the output didn't end before `deadline`
fn join_reader(
    reader: &Receiver<std::io::Result<Vec<u8>>>,
    deadline: Option<Instant>,
) -> Result<Option<Vec<u8>>> {
    let read = match deadline {
        Some(deadline) => {
            match reader.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(read) => read,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return reader_panicked(),
            }
        }
        None => match reader.recv() {
            Ok(read) => read,
            Err(_) => return reader_panicked(),
        },
    };
    Ok(Some(read.context("reading child output")?))
}

fn reader_panicked<T>() -> Result<T> {
    Err(HarnessError::new(
        FailureKind::OsError,
        "output reader thread panicked",
    ))
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// command line as it would be typed, for logs and for reproducing a failure by hand
pub fn render_command_line(program: &Path, args: &[OsString]) -> String {
    let mut line = program.to_string_lossy().into_owned();
    for a in args {
        line.push(' ');
        line.push_str(&a.to_string_lossy());
    }
    line
}

#[cfg(all(test, unix))]
mod tests {
    use std::{os::unix::fs::PermissionsExt, path::PathBuf};

    use super::*;
    use crate::config::CliContract;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(executable: PathBuf, memcheck: Option<PathBuf>, timeout: Option<Duration>) -> HarnessConfig {
        let dir = executable.parent().unwrap().to_path_buf();
        HarnessConfig {
            version: "1.0.8".to_owned(),
            path_source: dir.clone(),
            path_build: dir,
            executable,
            memcheck,
            temp_root: None,
            keep_workspace: false,
            timeout,
            cli: CliContract::default(),
        }
    }

    #[test]
    fn captures_exit_code_and_streams() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tool", "echo out; echo err >&2; exit 2");
        let config = config(exe, None, Some(Duration::from_secs(30)));

        let r = Executor::new(&config)
            .execute(&[], dir.path(), false)
            .unwrap();

        assert_eq!(r.exit_code, Some(2));
        assert_eq!(r.signal, None);
        assert_eq!(r.stdout, b"out\n");
        assert_eq!(r.stderr_excerpt(), "err");
        assert_eq!(r.describe_exit(), "exit code 2");
    }

    #[test]
    fn large_output_does_not_deadlock() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        // 1 MiB on each stream, well beyond any pipe buffer
        let exe = script(
            dir.path(),
            "tool",
            "head -c 1048576 /dev/zero; head -c 1048576 /dev/zero >&2",
        );
        let config = config(exe, None, Some(Duration::from_secs(60)));

        let r = Executor::new(&config)
            .execute(&[], dir.path(), false)
            .unwrap();

        assert_eq!(r.exit_code, Some(0));
        assert_eq!(r.stdout.len(), 1048576);
        assert_eq!(r.stderr.len(), 1048576);
    }

    #[test]
    fn hung_executable_is_killed() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tool", "exec sleep 30");
        let config = config(exe, None, Some(Duration::from_millis(200)));

        let start = Instant::now();
        let e = Executor::new(&config)
            .execute(&[], dir.path(), false)
            .unwrap_err();

        assert_eq!(e.kind(), FailureKind::HungExecutable);
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn forked_children_are_killed_with_the_executable() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        // no exec, the shell waits on a sleep that holds both pipes
        let exe = script(dir.path(), "tool", "sleep 30");
        let config = config(exe, None, Some(Duration::from_millis(200)));

        let start = Instant::now();
        let e = Executor::new(&config)
            .execute(&[], dir.path(), false)
            .unwrap_err();

        assert_eq!(e.kind(), FailureKind::HungExecutable);
        assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    }

    #[test]
    fn background_process_holding_output_times_out() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        // the executable itself exits at once, its child keeps stdout open
        let exe = script(dir.path(), "tool", "sleep 30 &\necho started");
        let config = config(exe, None, Some(Duration::from_millis(500)));

        let start = Instant::now();
        let e = Executor::new(&config)
            .execute(&[], dir.path(), false)
            .unwrap_err();

        assert_eq!(e.kind(), FailureKind::HungExecutable);
        assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    }

    #[test]
    fn scrubbed_variables_are_not_inherited() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tool", "printf '%s' \"${BZIP-unset}${BZIP2-unset}\"");
        let config = config(exe, None, None);

        let r = Executor::new(&config)
            .execute(&[], dir.path(), false)
            .unwrap();

        assert_eq!(r.stdout, b"unsetunset");
    }

    #[test]
    fn memcheck_wraps_and_validates() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tool", "printf '%s' \"$*\"");
        let checker = script(
            dir.path(),
            "checker",
            r#"log=
while [ $# -gt 0 ]; do
  case "$1" in
    --log-file=*) log="${1#--log-file=}"; shift ;;
    -*) shift ;;
    *) break ;;
  esac
done
"$@"
ec=$?
echo "==7== ERROR SUMMARY: 0 errors from 0 contexts" > "$log"
exit $ec"#,
        );
        let config = config(exe, Some(checker), Some(Duration::from_secs(30)));

        let r = Executor::new(&config)
            .execute(&["--decompress".into(), "x".into()], dir.path(), true)
            .unwrap();

        assert_eq!(r.exit_code, Some(0));
        assert_eq!(r.stdout, b"--decompress x");
        assert!(dir.path().join(LOG_FILE_NAME).is_file());
    }

    #[test]
    fn memcheck_that_never_writes_a_log_fails() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tool", "exit 0");
        let checker = script(dir.path(), "checker", "exit 0");
        let config = config(exe, Some(checker), Some(Duration::from_secs(30)));

        let e = Executor::new(&config)
            .execute(&[], dir.path(), true)
            .unwrap_err();
        assert_eq!(e.kind(), FailureKind::MemoryCheckViolation);

        // without memcheck requested the checker isn't involved at all
        let r = Executor::new(&config)
            .execute(&[], dir.path(), false)
            .unwrap();
        assert_eq!(r.exit_code, Some(0));
    }

    #[test]
    fn leak_exit_code_fails() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tool", "exit 0");
        let checker = script(dir.path(), "checker", "exit 123");
        let config = config(exe, Some(checker), Some(Duration::from_secs(30)));

        let e = Executor::new(&config)
            .execute(&[], dir.path(), true)
            .unwrap_err();
        assert_eq!(e.kind(), FailureKind::MemoryCheckViolation);
        assert!(e.message().contains("definite leak"));
    }

    #[test]
    fn signal_termination_is_reported() {
        crate::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "tool", "kill -SEGV $$");
        let config = config(exe, None, Some(Duration::from_secs(30)));

        let r = Executor::new(&config)
            .execute(&[], dir.path(), false)
            .unwrap();
        assert_eq!(r.exit_code, None);
        assert_eq!(r.signal, Some(11));
        assert_eq!(r.describe_exit(), "killed by signal 11");
    }
}
