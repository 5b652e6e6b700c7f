//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The one seam through which external commands are run
//!
//! Scheduler binaries and input-conversion commands are both invoked through
//! [CommandRunner], so tests can substitute canned responses without a
//! scheduler on the host.

use std::process::Command;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use tracing::debug;

pub trait CommandRunner {
    /// Run a command and capture its stdout
    ///
    /// A non-zero exit is an error carrying the full command line and the
    /// captured stderr.
    fn check_output(&self, command: &[String]) -> Result<String>;

    /// Run a full command line through the shell
    fn check_shell(&self, command: &str) -> Result<String> {
        self.check_output(&[
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ])
    }
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn check_output(&self, command: &[String]) -> Result<String> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("Cannot run an empty command"))?;

        debug!("Running: {}", command.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Spawning '{}'", command.join(" ")))?;

        if !output.status.success() {
            return Err(anyhow!(
                "Command '{}' failed ({}): {}",
                command.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| anyhow!("Command '{}' produced non-UTF8 output: {}", command.join(" "), e))
    }
}

#[cfg(test)]
pub mod test_support {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    /// Replays a fixed list of responses and records every command it was
    /// asked to run
    pub struct ScriptedRunner {
        responses: RefCell<VecDeque<Result<String, String>>>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            ScriptedRunner {
                responses: RefCell::new(VecDeque::new()),
                calls: RefCell::new(Vec::new()),
            }
        }

        pub fn respond<S: Into<String>>(self, response: S) -> Self {
            self.responses
                .borrow_mut()
                .push_back(Ok(response.into()));
            self
        }

        pub fn fail<S: Into<String>>(self, message: S) -> Self {
            self.responses
                .borrow_mut()
                .push_back(Err(message.into()));
            self
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.borrow().clone()
        }

        /// The n-th recorded command, joined with spaces
        pub fn command_line(&self, n: usize) -> String {
            self.calls.borrow()[n].join(" ")
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn check_output(&self, command: &[String]) -> Result<String> {
            self.calls.borrow_mut().push(command.to_vec());
            match self.responses.borrow_mut().pop_front() {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(anyhow!("{}", message)),
                None => Err(anyhow!(
                    "ScriptedRunner ran out of responses for '{}'",
                    command.join(" ")
                )),
            }
        }
    }
}
