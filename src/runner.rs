/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use log::{error, info};

use crate::{
    config::HarnessConfig,
    harness_error::{AddContext, HarnessError},
    test_plan::{TestCase, TestPlan},
    verifier::Verifier,
    workspace::Workspace,
};

/// Outcome of one case.
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub elapsed: Duration,
    /// None if the case passed
    pub failure: Option<HarnessError>,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Reports of a whole run, in plan order.
#[derive(Debug, Clone, Default)]
pub struct SuiteSummary {
    pub reports: Vec<CaseReport>,
}

impl SuiteSummary {
    pub fn passed(&self) -> usize {
        self.reports.iter().filter(|r| r.passed()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &CaseReport> {
        self.reports.iter().filter(|r| !r.passed())
    }

    pub fn all_passed(&self) -> bool {
        self.reports.iter().all(|r| r.passed())
    }

    pub fn report(&self, name: &str) -> Option<&CaseReport> {
        self.reports.iter().find(|r| r.name == name)
    }
}

/// Runs one case in its own scratch directory.
pub fn run_case(verifier: &Verifier, workspace: &Workspace, case: &TestCase) -> CaseReport {
    info!("running {}", case);
    let started_at = Instant::now();

    let outcome = workspace
        .case_scratch(&case.name)
        .and_then(|scratch| verifier.run_case(case, &scratch))
        .context(case);

    let report = CaseReport {
        name: case.name.clone(),
        elapsed: started_at.elapsed(),
        failure: outcome.err(),
    };

    match &report.failure {
        None => info!("{} ... ok ({:?})", case.name, report.elapsed),
        Some(e) => error!("{} ... FAILED ({:?})\n{}", case.name, report.elapsed, e),
    }
    report
}

/// Runs every case of `plan` inside `workspace`, on up to `jobs` threads.
///
/// A failing case never stops the others. Cases only share the workspace
/// root; each one has its own scratch directory, so they can run concurrently.
pub fn run_plan(config: &HarnessConfig, workspace: &Workspace, plan: &TestPlan, jobs: usize) -> SuiteSummary {
    let verifier = Verifier::new(config);
    let jobs = jobs.clamp(1, plan.len().max(1));

    let reports = if jobs == 1 {
        plan.cases
            .iter()
            .map(|case| run_case(&verifier, workspace, case))
            .collect()
    } else {
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<CaseReport>>> = Mutex::new(vec![None; plan.len()]);

        thread::scope(|s| {
            for _ in 0..jobs {
                s.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(case) = plan.cases.get(index) else {
                        break;
                    };
                    let report = run_case(&verifier, workspace, case);
                    slots.lock().unwrap_or_else(|e| e.into_inner())[index] = Some(report);
                });
            }
        });

        slots
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .into_iter()
            .flatten()
            .collect()
    };

    let summary = SuiteSummary { reports };
    info!(
        "{} passed, {} failed, {} total",
        summary.passed(),
        summary.reports.len() - summary.passed(),
        summary.reports.len()
    );
    summary
}

/// Creates the workspace, runs the plan and tears the workspace down again.
pub fn run_suite(config: &HarnessConfig, plan: &TestPlan, jobs: usize) -> crate::Result<SuiteSummary> {
    let workspace = Workspace::create(config)?;
    Ok(run_plan(config, &workspace, plan, jobs))
}
