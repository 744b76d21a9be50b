/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

// forbid lints that we already have eliminated from the codebase so they don't show up in the future
#![forbid(unsafe_code)]
#![forbid(trivial_casts)]
#![forbid(trivial_numeric_casts)]
#![forbid(non_ascii_idents)]
#![forbid(unused_extern_crates)]
#![forbid(unused_import_braces)]
#![forbid(unused_lifetimes)]
#![forbid(unused_macro_rules)]
#![forbid(macro_use_extern_crate)]

mod config;
mod corpus;
mod executor;
mod harness_error;
mod hex_diff;
mod memcheck;
mod runner;
mod test_plan;
mod utils;
mod verifier;
mod workspace;

pub use config::{CliContract, HarnessConfig, DEFAULT_TIMEOUT, SCRUBBED_ENV_VARS};
pub use corpus::{classify, enumerate_samples, Classification, Companion, Sample};
pub use executor::{render_command_line, CommandResult, Executor};
pub use harness_error::{err_exit_code, AddContext, FailureKind, HarnessError, Result};
pub use hex_diff::{hex_compare, DEFAULT_ROW_WIDTH};
pub use memcheck::{verify_memcheck_log, MemoryCheckReport, LEAK_EXIT_CODE};
pub use runner::{run_case, run_plan, run_suite, CaseReport, SuiteSummary};
pub use test_plan::{
    synthesize, CaseTarget, MemoryMode, SuiteProfile, TestCase, TestPlan, LARGE, PROFILES, QUICK,
};
pub use utils::{content_digest, read_hash_sidecar};
pub use verifier::Verifier;
pub use workspace::Workspace;

#[cfg(test)]
static INIT: std::sync::Once = std::sync::Once::new();

/// Initialize the logger for tests. This is a no-op if the logger is already initialized.
#[cfg(test)]
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
