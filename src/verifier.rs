/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{
    config::HarnessConfig,
    corpus::{Classification, Companion, Sample},
    executor::{render_command_line, CommandResult, Executor},
    harness_error::{err_exit_code, AddContext, FailureKind, HarnessError, Result},
    hex_diff::{hex_compare, DEFAULT_ROW_WIDTH},
    test_plan::{CaseTarget, MemoryMode, TestCase},
    utils::{content_digest, read_hash_sidecar, write_file},
};

/// What the output of a valid sample has to hash to.
struct GroundTruth {
    digest: String,
    /// only known when the companion is a plaintext reference, used for diffs
    plaintext: Option<Vec<u8>>,
}

/// Runs the verification protocol for each kind of test case.
///
/// Every step of a case consumes the output of the previous one, so the steps
/// run strictly in order; the first violation ends the case.
pub struct Verifier<'a> {
    executor: Executor<'a>,
}

impl<'a> Verifier<'a> {
    pub fn new(config: &'a HarnessConfig) -> Self {
        Verifier {
            executor: Executor::new(config),
        }
    }

    fn config(&self) -> &HarnessConfig {
        self.executor.config()
    }

    /// Runs `case` with `scratch` as the working directory for all invocations and
    /// intermediate files. Ok means the case passed.
    pub fn run_case(&self, case: &TestCase, scratch: &Path) -> Result<()> {
        match &case.target {
            CaseTarget::Version => self.verify_version(scratch),
            CaseTarget::Sample(sample) => match &sample.classification {
                Classification::Corrupt => self.verify_corrupt(case, sample, scratch),
                Classification::Valid(companion) => {
                    self.verify_valid(case, sample, companion.as_ref(), scratch)
                }
                Classification::Reference => {
                    let Some(level) = case.level else {
                        return err_exit_code(
                            FailureKind::Configuration,
                            format!("reference case {} has no compression level", case.name),
                        );
                    };
                    self.verify_reference(case, sample, level, scratch)
                }
            },
        }
    }

    /// Corrupt input must be refused with a warning or fatal exit code, in both
    /// memory modes. Success is as wrong as a crash.
    fn verify_corrupt(&self, case: &TestCase, sample: &Sample, scratch: &Path) -> Result<()> {
        let cli = self.config().cli;

        for mode in [MemoryMode::Default, MemoryMode::Small] {
            let mut args = vec![cli.decompress];
            if mode == MemoryMode::Small {
                args.push(cli.small);
            }
            args.extend([cli.keep, cli.stdout]);
            let args = command_args(&args, &sample.path);

            let step = format!("decompress corrupt {} ({:?} mode)", sample.path.display(), mode);
            let result = self
                .executor
                .execute(&args, scratch, case.memcheck)
                .context(&step)?;

            match result.exit_code {
                Some(code) if cli.is_graceful_rejection(code) => {
                    debug!("{}: rejected with exit code {}", step, code);
                }
                _ => {
                    return Err(self.violation(
                        &step,
                        &args,
                        &result,
                        &format!(
                            "expected exit code {} or {}",
                            cli.exit_warning, cli.exit_fatal
                        ),
                    ))
                }
            }
        }

        Ok(())
    }

    /// Decompress, check the digest, then compress that output and decompress it
    /// again. The executable's own output has to be valid input for itself.
    fn verify_valid(
        &self,
        case: &TestCase,
        sample: &Sample,
        companion: Option<&Companion>,
        scratch: &Path,
    ) -> Result<()> {
        let cli = self.config().cli;
        let truth = load_ground_truth(sample, companion)?;

        let with_mode = |flags: &[&'static str]| {
            let mut f = flags.to_vec();
            if case.mode == MemoryMode::Small {
                f.push(cli.small);
            }
            f
        };

        let args = command_args(&with_mode(&[cli.decompress, cli.keep, cli.stdout]), &sample.path);
        let step = format!("decompress {}", sample.path.display());
        let first = self.expect_success(&step, &args, scratch, case.memcheck)?;

        info!(
            "Checking that {} matches its reference when decompressed...",
            sample.file_name()
        );
        check_digest(&step, &first.stdout, &truth.digest, truth.plaintext.as_deref())?;

        let decompressed = scratch_file(scratch, &format!("{}.decompressed", sample.file_name()));
        write_file(&decompressed, &first.stdout)?;

        let args = command_args(&with_mode(&[cli.compress, cli.stdout]), &decompressed);
        let step = format!("recompress output of {}", sample.path.display());
        let recompressed = self.expect_success(&step, &args, scratch, case.memcheck)?;

        let recompressed_path = scratch_file(
            scratch,
            &format!("{}.decompressed.bz2", sample.file_name()),
        );
        write_file(&recompressed_path, &recompressed.stdout)?;

        let args = command_args(&with_mode(&[cli.decompress, cli.stdout]), &recompressed_path);
        let step = format!("decompress recompressed {}", sample.path.display());
        let second = self.expect_success(&step, &args, scratch, case.memcheck)?;

        // the first output already matched the digest, so it's a fine diff target
        let expected = truth.plaintext.as_deref().unwrap_or(&first.stdout);
        check_digest(&step, &second.stdout, &truth.digest, Some(expected))
    }

    /// Compress a plaintext at `level`, decompress the result and compare. The
    /// decompressor is the only oracle for the compressed format.
    fn verify_reference(&self, case: &TestCase, sample: &Sample, level: u8, scratch: &Path) -> Result<()> {
        let cli = self.config().cli;

        let plaintext = fs::read(&sample.path).context(format!("reading {}", sample.path.display()))?;
        let reference_digest = content_digest(&plaintext);

        let level_arg = cli.level_arg(level);
        let mut args = vec![OsString::from(cli.compress), OsString::from(&level_arg)];
        args.extend(command_args(&[cli.keep, cli.stdout], &sample.path));
        let step = format!("compress {} at {}", sample.path.display(), level_arg);
        let compressed = self.expect_success(&step, &args, scratch, case.memcheck)?;

        let compressed_path = scratch_file(scratch, &format!("{}.bz2", sample.file_name()));
        info!(
            "Writing compressed {} file to disk as {}...",
            sample.file_name(),
            compressed_path.display()
        );
        write_file(&compressed_path, &compressed.stdout)?;

        let args = command_args(&[cli.decompress, cli.stdout], &compressed_path);
        let step = format!("decompress {}", compressed_path.display());
        let result = self.expect_success(&step, &args, scratch, case.memcheck)?;

        info!(
            "Checking that {} matches {} when decompressed...",
            compressed_path.display(),
            sample.file_name()
        );
        check_digest(&step, &result.stdout, &reference_digest, Some(plaintext.as_slice()))
    }

    /// The version banner has to name the version the build was configured with.
    /// Never run under the memory checker, the banner path isn't interesting.
    fn verify_version(&self, scratch: &Path) -> Result<()> {
        let config = self.config();
        let args = vec![OsString::from(config.cli.version)];
        let step = "print version".to_owned();
        let result = self.expect_success(&step, &args, scratch, false)?;

        let banner = format!(
            "{}{}",
            String::from_utf8_lossy(&result.stdout),
            String::from_utf8_lossy(&result.stderr)
        );
        if !banner.contains(&config.version) {
            return err_exit_code(
                FailureKind::ProtocolViolation,
                format!(
                    "{}: version {:?} not found in banner:\n{}",
                    step,
                    config.version,
                    banner.trim_end()
                ),
            );
        }
        Ok(())
    }

    fn expect_success(
        &self,
        step: &str,
        args: &[OsString],
        scratch: &Path,
        memcheck: bool,
    ) -> Result<CommandResult> {
        let result = self.executor.execute(args, scratch, memcheck).context(step)?;

        if result.exit_code != Some(self.config().cli.exit_success) {
            return Err(self.violation(step, args, &result, "expected success"));
        }
        Ok(result)
    }

    /// Everything needed to reproduce the failed step by hand.
    fn violation(&self, step: &str, args: &[OsString], result: &CommandResult, expectation: &str) -> HarnessError {
        HarnessError::new(
            FailureKind::ProtocolViolation,
            &format!(
                "{}: {}, got {}\ncommand: {}\nstderr:\n{}",
                step,
                expectation,
                result.describe_exit(),
                render_command_line(&self.config().executable, args),
                result.stderr_excerpt()
            ),
        )
    }
}

fn load_ground_truth(sample: &Sample, companion: Option<&Companion>) -> Result<GroundTruth> {
    match companion {
        Some(Companion::HashSidecar(path)) => Ok(GroundTruth {
            digest: read_hash_sidecar(path)?,
            plaintext: None,
        }),
        Some(Companion::Plaintext(path)) => {
            let plaintext = fs::read(path).map_err(|e| {
                HarnessError::new(
                    FailureKind::MissingCompanion,
                    &format!("can't read reference {}: {}", path.display(), e),
                )
            })?;
            Ok(GroundTruth {
                digest: content_digest(&plaintext),
                plaintext: Some(plaintext),
            })
        }
        None => err_exit_code(
            FailureKind::MissingCompanion,
            format!(
                "{} has neither a .md5 nor a .ref companion, can't verify it",
                sample.path.display()
            ),
        ),
    }
}

/// Exact digest equality, compression is lossless. With the expected bytes at
/// hand the failure carries a hex diff.
fn check_digest(step: &str, output: &[u8], expected_digest: &str, expected: Option<&[u8]>) -> Result<()> {
    let digest = content_digest(output);
    if digest == expected_digest {
        return Ok(());
    }

    let mut message = format!(
        "{}: output and reference differ (md5 {} != {}, {} bytes of output)",
        step,
        digest,
        expected_digest,
        output.len()
    );
    if let Some(expected) = expected {
        message.push_str(":\n");
        message.push_str(&hex_compare(output, expected, DEFAULT_ROW_WIDTH));
    }

    err_exit_code(FailureKind::ProtocolViolation, message)
}

fn command_args(flags: &[&str], file: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = flags.iter().map(OsString::from).collect();
    args.push(file.as_os_str().to_owned());
    args
}

fn scratch_file(scratch: &Path, name: &str) -> PathBuf {
    scratch.join(name)
}

#[test]
fn digest_mismatch_carries_diff() {
    let e = check_digest(
        "decompress a.bz2",
        b"hellO",
        &content_digest(b"hello"),
        Some(&b"hello"[..]),
    )
    .unwrap_err();

    assert_eq!(e.kind(), FailureKind::ProtocolViolation);
    assert!(e.message().contains("decompress a.bz2"));
    assert!(e.message().contains("expected (5):"));

    // no plaintext, digests only
    let e = check_digest("x", b"", "5eb63bbbe01eeed093cb22bb8f5acdc3", None).unwrap_err();
    assert!(e.message().contains("d41d8cd98f00b204e9800998ecf8427e"));
    assert!(!e.message().contains("expected ("));

    assert!(check_digest("x", b"", "d41d8cd98f00b204e9800998ecf8427e", None).is_ok());
}

#[test]
fn missing_companion_cannot_be_verified() {
    let sample = Sample {
        path: PathBuf::from("/corpus/orphan.bz2"),
        root: PathBuf::from("/corpus"),
        classification: Classification::Valid(None),
    };

    let e = load_ground_truth(&sample, None).err().unwrap();
    assert_eq!(e.kind(), FailureKind::MissingCompanion);
}
