/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{collections::HashSet, fmt::Display, path::PathBuf};

use log::info;

use crate::{
    corpus::{enumerate_samples, Classification, Sample},
    harness_error::Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryMode {
    Default,
    /// the executable's reduced-memory decompression mode
    Small,
}

/// Which corpus a suite runs over and how each kind of sample is parameterized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuiteProfile {
    pub name: &'static str,

    /// corpus directory name below `tests/input` of the source tree
    pub corpus: &'static str,

    /// one case per mode for each valid `.bz2` sample
    pub valid_modes: &'static [MemoryMode],

    /// one case per compression level for each `.ref` sample
    pub reference_levels: &'static [u8],

    /// run under the memory checker if one is configured
    pub try_memcheck: bool,

    /// add a case checking the executable's version banner
    pub check_version: bool,
}

/// Small curated corpus, cheap enough to run everything under valgrind.
pub const QUICK: SuiteProfile = SuiteProfile {
    name: "quick",
    corpus: "quick",
    valid_modes: &[MemoryMode::Default],
    reference_levels: &[1, 2, 3],
    try_memcheck: true,
    check_version: true,
};

/// The full bzip2-testfiles corpus. Valgrind would take the better part of an hour here.
pub const LARGE: SuiteProfile = SuiteProfile {
    name: "large",
    corpus: "bzip2-testfiles",
    valid_modes: &[MemoryMode::Default, MemoryMode::Small],
    reference_levels: &[1, 2, 3],
    try_memcheck: false,
    check_version: false,
};

pub const PROFILES: &[SuiteProfile] = &[QUICK, LARGE];

impl SuiteProfile {
    pub fn by_name(name: &str) -> Option<SuiteProfile> {
        PROFILES.iter().find(|p| p.name == name).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseTarget {
    Sample(Sample),
    /// `--version` banner check, not tied to a sample
    Version,
}

/// One synthesized test. Immutable once the plan is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// unique within the plan and stable across runs
    pub name: String,
    pub target: CaseTarget,
    pub mode: MemoryMode,
    /// compression strength for reference round-trips
    pub level: Option<u8>,
    pub memcheck: bool,
}

impl TestCase {
    pub fn sample(&self) -> Option<&Sample> {
        match &self.target {
            CaseTarget::Sample(s) => Some(s),
            CaseTarget::Version => None,
        }
    }
}

impl Display for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(s) = self.sample() {
            write!(f, " [{}", s.path.display())?;
            if self.mode == MemoryMode::Small {
                write!(f, ", small")?;
            }
            if let Some(level) = self.level {
                write!(f, ", level {}", level)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Ordered list of cases for one run.
#[derive(Debug, Clone, Default)]
pub struct TestPlan {
    pub cases: Vec<TestCase>,
}

impl TestPlan {
    /// keeps the cases whose name contains `pattern`, in the original order
    pub fn filter(self, pattern: &str) -> TestPlan {
        TestPlan {
            cases: self
                .cases
                .into_iter()
                .filter(|c| c.name.contains(pattern))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|c| c.name.as_str())
    }
}

/// Builds the plan for `profile` from the samples under `roots`.
///
/// Corrupt samples get a single case (it exercises both memory modes), valid
/// samples one case per mode, reference samples one case per compression level.
pub fn synthesize(profile: &SuiteProfile, roots: &[PathBuf], memcheck_available: bool) -> Result<TestPlan> {
    let memcheck = profile.try_memcheck && memcheck_available;

    let mut names = UniqueNames::default();
    let mut cases = Vec::new();

    if profile.check_version {
        cases.push(TestCase {
            name: names.claim("version".to_owned(), "version"),
            target: CaseTarget::Version,
            mode: MemoryMode::Default,
            level: None,
            memcheck: false,
        });
    }

    for root in roots {
        for sample in enumerate_samples(root)? {
            let stem = sanitize(&sample.relative_path().to_string_lossy());
            let identity = sample.path.to_string_lossy().into_owned();

            let mut push = |name: String, mode: MemoryMode, level: Option<u8>| {
                cases.push(TestCase {
                    name: names.claim(name, &identity),
                    target: CaseTarget::Sample(sample.clone()),
                    mode,
                    level,
                    memcheck,
                });
            };

            match &sample.classification {
                Classification::Corrupt => {
                    push(format!("corrupt_{}", stem), MemoryMode::Default, None);
                }
                Classification::Valid(_) => {
                    for mode in profile.valid_modes {
                        let name = match mode {
                            MemoryMode::Default => format!("decomp_{}", stem),
                            MemoryMode::Small => format!("decomp_{}_small", stem),
                        };
                        push(name, *mode, None);
                    }
                }
                Classification::Reference => {
                    for level in profile.reference_levels {
                        push(
                            format!("comp_decomp_{}_{}", stem, level),
                            MemoryMode::Default,
                            Some(*level),
                        );
                    }
                }
            }
        }
    }

    info!("suite {}: synthesized {} cases", profile.name, cases.len());
    Ok(TestPlan { cases })
}

/// maps everything but ascii letters and digits to `_`
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[derive(Default)]
struct UniqueNames {
    seen: HashSet<String>,
}

impl UniqueNames {
    /// Returns `name`, or `name` with a hash of `identity` appended if it was
    /// already taken (eg `a_b/c.bz2` and `a/b_c.bz2` sanitize to the same stem).
    fn claim(&mut self, name: String, identity: &str) -> String {
        let mut candidate = name.clone();
        let mut salt = 0u32;
        while self.seen.contains(&candidate) {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(identity.as_bytes());
            hasher.update(&salt.to_le_bytes());
            candidate = format!("{}_{:08x}", name, hasher.finalize());
            salt += 1;
        }
        self.seen.insert(candidate.clone());
        candidate
    }
}
