//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Error kinds that decide the process exit code
//!
//! Most of the crate propagates `anyhow::Error` and attaches one of these
//! kinds as context at the point where the kind is known. `main()` walks the
//! chain to find the kind and maps it to an exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MavisError {
    /// Bad or missing user configuration, nonexistent input files
    #[error("{0}")]
    InvalidInput(String),

    /// Duplicate job names, unresolvable dependencies, dependency cycles
    #[error("{0}")]
    Structural(String),

    /// A scheduler command exited non-zero or could not be spawned
    #[error("{0}")]
    Scheduler(String),

    /// A scheduler command succeeded but its output did not match the
    /// expected grammar
    #[error("unexpected scheduler output: {0}")]
    UnexpectedResponse(String),

    /// The pipeline has crashed, incomplete or missing jobs
    #[error("{0}")]
    Incomplete(String),
}

impl MavisError {
    pub fn exit_code(&self) -> i32 {
        match self {
            MavisError::InvalidInput(_) => 1,
            MavisError::Structural(_) => 1,
            MavisError::Scheduler(_) => 2,
            MavisError::UnexpectedResponse(_) => 2,
            MavisError::Incomplete(_) => 3,
        }
    }
}

/// Find the exit code for an error chain
///
/// The first `MavisError` in the chain wins, whether it was attached as
/// context or raised directly. Everything else is treated as a user-input
/// problem.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<MavisError>()
        .or_else(|| {
            error
                .chain()
                .find_map(|cause| cause.downcast_ref::<MavisError>())
        })
        .map(MavisError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_exit_code_from_context_chain() {
        let err = Err::<(), _>(std::fmt::Error)
            .context(MavisError::Scheduler("qsub failed".to_string()))
            .context("submitting job")
            .unwrap_err();
        assert_eq!(2, exit_code(&err));
    }

    #[test]
    fn test_exit_code_default() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(1, exit_code(&err));
    }

    #[test]
    fn test_exit_code_incomplete() {
        let err = anyhow::Error::new(MavisError::Incomplete("2 tasks crashed".to_string()));
        assert_eq!(3, exit_code(&err));
    }
}
