use anyhow::{bail, Context};
use clap::Parser;
use env_logger::Builder;
use log::{error, LevelFilter};

use std::{path::PathBuf, process::ExitCode, time::Duration};

use bzverify::{
    run_suite, synthesize, HarnessConfig, HarnessError, SuiteProfile, SCRUBBED_ENV_VARS,
};

#[derive(Parser)]
#[command(name = "bzverify")]
#[command(about = "Verifies a bzip2 executable against a corpus of sample files", long_about = None)]
struct Cli {
    /// Which suite to run: quick (small corpus, under valgrind if VALGRIND is set)
    /// or large (bzip2-testfiles, both memory modes, no valgrind)
    #[arg(long, default_value = "quick", value_parser = ["quick", "large"])]
    suite: String,

    /// Corpus directory to scan instead of the suite's default below PATH_SOURCE.
    /// Can be given more than once.
    #[arg(long)]
    corpus: Vec<PathBuf>,

    /// Only run cases whose name contains this string
    #[arg(long)]
    filter: Option<String>,

    /// List the synthesized case names and exit
    #[arg(long, default_value = "false")]
    list: bool,

    /// Number of cases to run in parallel
    #[arg(short = 'j', long, default_value = "1")]
    jobs: usize,

    /// Seconds before a hung executable is killed, 0 waits forever. Overrides TIMEOUT_SECS.
    #[arg(long)]
    timeout: Option<u64>,

    /// Keep the workspace after the run, same as setting KEEPTEMP
    #[arg(long, default_value = "false")]
    keep_workspace: bool,

    /// Don't run under the memory checker even if VALGRIND is set
    #[arg(long, default_value = "false")]
    no_memcheck: bool,

    /// level of logging to use
    #[arg(long, default_value = "Info")]
    loglevel: LevelFilter,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    Builder::new().filter_level(cli.loglevel).init();

    // still single threaded here, nothing else reads the environment concurrently
    for var in SCRUBBED_ENV_VARS {
        std::env::remove_var(var);
    }

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{:?}", e);
            let fatal = e
                .downcast_ref::<HarnessError>()
                .is_some_and(|h| h.kind().is_fatal_for_suite());
            ExitCode::from(if fatal { 2 } else { 1 })
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let Some(profile) = SuiteProfile::by_name(&cli.suite) else {
        bail!("unknown suite {}", cli.suite);
    };

    let mut config = HarnessConfig::from_env()?;
    if let Some(secs) = cli.timeout {
        config.timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if cli.keep_workspace {
        config.keep_workspace = true;
    }
    if cli.no_memcheck {
        config.memcheck = None;
    }

    let roots = if cli.corpus.is_empty() {
        vec![config.corpus_root(profile.corpus)]
    } else {
        cli.corpus
    };

    let mut plan = synthesize(&profile, &roots, config.memcheck_enabled())
        .with_context(|| format!("synthesizing suite {}", profile.name))?;
    if let Some(pattern) = &cli.filter {
        plan = plan.filter(pattern);
    }

    if cli.list {
        for name in plan.names() {
            println!("{}", name);
        }
        return Ok(true);
    }

    let summary = run_suite(&config, &plan, cli.jobs)?;

    for report in summary.failed() {
        if let Some(e) = &report.failure {
            println!("FAILED {}: {}", report.name, e);
        }
    }
    println!(
        "suite {}: {} passed, {} failed, {} total",
        profile.name,
        summary.passed(),
        summary.reports.len() - summary.passed(),
        summary.reports.len()
    );

    Ok(summary.all_passed())
}
