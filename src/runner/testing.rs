use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use super::{CommandRunner, CommandSpec, OutputLines};
use crate::error::{DeployError, DeployResult};

struct Script {
    prefix: Vec<String>,
    lines: Vec<String>,
    stderr: Vec<String>,
    exit_code: i32,
}

/// Replays canned output for commands whose argv starts with a given prefix,
/// recording every command it was asked to run
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    scripts: Vec<Script>,
    invocations: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// `prefix` is matched word by word against the start of argv
    pub fn on(mut self, prefix: &str, lines: &[&str], exit_code: i32) -> Self {
        self.scripts.push(Script {
            prefix: prefix.split_whitespace().map(String::from).collect(),
            lines: lines.iter().map(|l| l.to_string()).collect(),
            stderr: Vec::new(),
            exit_code,
        });
        self
    }

    /// stderr output for the most recently added script. It comes before the
    /// stdout lines, and is dropped for `stdout_only` commands.
    pub fn stderr(mut self, lines: &[&str]) -> Self {
        if let Some(script) = self.scripts.last_mut() {
            script.stderr = lines.iter().map(|l| l.to_string()).collect();
        }
        self
    }

    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invoked(&self, prefix: &str) -> bool {
        let prefix: Vec<&str> = prefix.split_whitespace().collect();
        self.invocations()
            .iter()
            .any(|spec| starts_with(&spec.argv(), &prefix))
    }
}

fn starts_with<S: AsRef<str>>(argv: &[String], prefix: &[S]) -> bool {
    argv.len() >= prefix.len()
        && argv
            .iter()
            .zip(prefix)
            .all(|(arg, expected)| arg == expected.as_ref())
}

impl CommandRunner for ScriptedRunner {
    fn spawn(&self, spec: &CommandSpec, cancel: CancellationToken) -> DeployResult<OutputLines> {
        self.invocations.lock().unwrap().push(spec.clone());
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let argv = spec.argv();
        let (lines, exit_code) = self
            .scripts
            .iter()
            .find(|script| starts_with(&argv, &script.prefix))
            .map(|script| {
                let mut lines = Vec::new();
                if spec.merge_stderr {
                    lines.extend(script.stderr.iter().cloned());
                }
                lines.extend(script.lines.iter().cloned());
                (lines, script.exit_code)
            })
            .unwrap_or_default();

        let exit = if exit_code == 0 {
            Ok(())
        } else {
            Err(DeployError::ExternalCommand {
                code: exit_code,
                argv,
            })
        };
        Ok(OutputLines::from_lines(lines, exit))
    }
}
