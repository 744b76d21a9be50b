/*---------------------------------------------------------------------------------------------
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the Apache License, Version 2.0. See LICENSE.txt in the project root for license information.
 *  This software incorporates material from third parties. See NOTICE.txt for details.
 *--------------------------------------------------------------------------------------------*/

use std::{fmt::Display, io::ErrorKind};

#[derive(Debug, Clone)]
pub struct HarnessError {
    /// what kind of failure this is, decides whether the suite or only the case is affected
    kind: FailureKind,

    /// diagnostic message including location. Content should not be relied on.
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailureKind {
    /// required configuration missing or invalid. Aborts the whole suite.
    Configuration = 1,
    /// the executable's exit code or output did not match the contract for the sample
    ProtocolViolation = 2,
    /// the memory checker reported errors, leaks, or never ran
    MemoryCheckViolation = 3,
    /// the executable did not finish within the configured timeout
    HungExecutable = 4,
    /// ground truth for a sample (hash sidecar or reference plaintext) is missing or unreadable
    MissingCompanion = 5,
    ShortRead = 6,
    OsError = 7,
}

impl FailureKind {
    /// true if this failure means no case can run at all
    pub fn is_fatal_for_suite(&self) -> bool {
        *self == FailureKind::Configuration
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// translates std::io::Error into HarnessError
impl From<std::io::Error> for HarnessError {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        match e.downcast::<HarnessError>() {
            Ok(he) => he,
            Err(e) => {
                let caller = std::panic::Location::caller();
                HarnessError {
                    kind: get_io_error_kind(&e),
                    message: format!("error {} at {}", e, caller),
                }
            }
        }
    }
}

impl From<walkdir::Error> for HarnessError {
    #[track_caller]
    fn from(e: walkdir::Error) -> Self {
        let caller = std::panic::Location::caller();
        HarnessError {
            kind: FailureKind::OsError,
            message: format!("error walking corpus {} at {}", e, caller),
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{0}: {1}", self.kind, self.message)
    }
}

fn get_io_error_kind(e: &std::io::Error) -> FailureKind {
    if e.kind() == ErrorKind::UnexpectedEof {
        FailureKind::ShortRead
    } else {
        FailureKind::OsError
    }
}

impl HarnessError {
    pub fn new(kind: FailureKind, message: &str) -> HarnessError {
        HarnessError {
            kind,
            message: message.to_owned(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// prefixes the message with where (and for what) the error passed through
    #[track_caller]
    pub fn add_context(mut self, context: impl Display) -> HarnessError {
        let caller = std::panic::Location::caller();
        self.message = format!("{} ({}): {}", context, caller, self.message);
        self
    }
}

/// Adds a human readable context string to errors as they propagate up through the
/// verification protocol, so a failure names the case and step it came from.
pub trait AddContext<T> {
    #[track_caller]
    fn context(self, context: impl Display) -> Result<T>;
}

impl<T, E: Into<HarnessError>> AddContext<T> for std::result::Result<T, E> {
    #[track_caller]
    fn context(self, context: impl Display) -> Result<T> {
        match self {
            Ok(x) => Ok(x),
            Err(e) => Err(e.into().add_context(context)),
        }
    }
}

#[cold]
#[track_caller]
pub fn err_exit_code<T>(kind: FailureKind, message: impl AsRef<str>) -> Result<T> {
    Err(HarnessError::new(kind, message.as_ref()))
}

/// translates HarnessError into std::io::Error, which involves putting into a Box and using Other
impl From<HarnessError> for std::io::Error {
    fn from(e: HarnessError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, e)
    }
}

impl std::error::Error for HarnessError {}

#[test]
fn test_error_translation() {
    // test wrapping inside an io error
    fn my_std_error() -> std::result::Result<(), std::io::Error> {
        Err(HarnessError::new(FailureKind::ProtocolViolation, "test error").into())
    }

    let e: HarnessError = my_std_error().unwrap_err().into();
    assert_eq!(e.kind, FailureKind::ProtocolViolation);
    assert_eq!(e.message, "test error");

    // an IO error should be translated into an OsError
    let e: HarnessError =
        std::io::Error::new(std::io::ErrorKind::NotFound, "file not found").into();
    assert_eq!(e.kind, FailureKind::OsError);

    let e: HarnessError = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
    assert_eq!(e.kind, FailureKind::ShortRead);
}

#[test]
fn test_context_keeps_kind() {
    let r: std::result::Result<(), HarnessError> =
        err_exit_code(FailureKind::HungExecutable, "slow");

    let e = r.context("decompress a.bz2").unwrap_err();
    assert_eq!(e.kind(), FailureKind::HungExecutable);
    assert!(e.message().starts_with("decompress a.bz2"));
    assert!(e.message().ends_with("slow"));
    assert!(!e.kind().is_fatal_for_suite());
    assert!(FailureKind::Configuration.is_fatal_for_suite());
}
