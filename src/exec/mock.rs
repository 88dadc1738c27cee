//! Scripted command runner for testing
//!
//! Responses are queued per program name. The last queued response for a
//! program keeps being returned once the queue is down to one entry, so a
//! single `on("systemctl", ...)` covers any number of calls.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{render, CommandOutput, CommandRunner};
use crate::AgentError;

/// Mock command runner for testing
///
/// # Example
/// ```
/// use vm_agent::exec::mock::MockCommandRunner;
/// use vm_agent::exec::CommandOutput;
///
/// let runner = MockCommandRunner::new()
///     .on("systemctl", CommandOutput::ok("activating"))
///     .on("systemctl", CommandOutput::ok("active"));
/// ```
#[derive(Debug, Default)]
pub struct MockCommandRunner {
    responses: Mutex<HashMap<String, VecDeque<Result<CommandOutput, String>>>>,
    calls: Mutex<Vec<String>>,
}

impl MockCommandRunner {
    /// Create a runner where every program succeeds with empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an output for the next call of `program`
    pub fn on(self, program: &str, output: CommandOutput) -> Self {
        self.push(program, Ok(output));
        self
    }

    /// Queue a failure to execute `program` at all
    pub fn on_spawn_error(self, program: &str, message: &str) -> Self {
        self.push(program, Err(message.to_string()));
        self
    }

    fn push(&self, program: &str, response: Result<CommandOutput, String>) {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        responses
            .entry(program.to_string())
            .or_default()
            .push_back(response);
    }

    /// Every command line run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Command lines run for one program
    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c == program || c.starts_with(&format!("{program} ")))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, AgentError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(render(program, args));

        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        let response = match responses.get_mut(program) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };

        match response {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(AgentError::command(program, message)),
            None => Ok(CommandOutput::ok("")),
        }
    }
}
