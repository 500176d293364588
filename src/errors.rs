// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use thiserror::Error;

/// Stable error taxonomy of the package pipeline. The updater runs in a
/// minimal recovery environment, so every failure travels as one of these
/// kinds instead of unwinding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PkgError {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("invalid or truncated file")]
    InvalidFile,
    #[error("invalid package format")]
    InvalidPkgFormat,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("digest mismatch")]
    InvalidDigest,
    #[error("stream read/write error")]
    InvalidStream,
    #[error("allocation failed or buffer too small")]
    NoneMemory,
    #[error("invalid lz4 data")]
    InvalidLz4,
    #[error("product or version mismatch")]
    InvalidVersion,
    #[error("requested algorithm not registered")]
    NotExistAlgorithm,
    #[error("operation invalid in current state")]
    InvalidState,
}

impl From<std::io::Error> for PkgError {
    fn from(_: std::io::Error) -> Self {
        PkgError::InvalidStream
    }
}

pub type PkgResult<T> = Result<T, PkgError>;

/// Exit codes of the updater binary sub-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    InvalidArgs = 1,
    ReadPackageError = 2,
    ScriptNotFound = 3,
    ScriptParseError = 4,
    ScriptExecError = 5,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}
