use std::sync::Mutex;

use crate::dependencies::{Command, CommandOutput, CommandRunner, DependencyError, Stdin};

/// One command seen by the `MockRunner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub command: String,
    /// Standard input, with secrets exposed so tests can assert on them.
    pub stdin: Option<String>,
}

struct MockResponse {
    prefix: String,
    code: i32,
    stdout: String,
    once: bool,
}

/// A command runner that records every command and replays scripted results.
///
/// Responses are matched by prefix against the rendered command line. The
/// first matching response wins; `once` responses are consumed when used.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct MockRunner {
    calls: Mutex<Vec<MockCall>>,
    responses: Mutex<Vec<MockResponse>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every matching command with the given exit code and stdout.
    pub fn on(&self, prefix: &str, code: i32, stdout: &str) -> &Self {
        self.push(prefix, code, stdout, false)
    }

    /// Answers the next matching command with the given exit code and stdout.
    pub fn once(&self, prefix: &str, code: i32, stdout: &str) -> &Self {
        self.push(prefix, code, stdout, true)
    }

    fn push(&self, prefix: &str, code: i32, stdout: &str, once: bool) -> &Self {
        self.responses.lock().unwrap().push(MockResponse {
            prefix: prefix.into(),
            code,
            stdout: stdout.into(),
            once,
        });
        self
    }

    /// Returns all calls so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Returns the rendered command lines of all calls so far.
    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.command).collect()
    }

    /// Returns the rendered command lines starting with `prefix`.
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|command| command.starts_with(prefix))
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl CommandRunner for MockRunner {
    fn output(&self, cmd: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        let command = cmd.render_command();
        self.calls.lock().unwrap().push(MockCall {
            command: command.clone(),
            stdin: cmd.stdin().map(|stdin| match stdin {
                Stdin::Text(text) => text.clone(),
                Stdin::Secret(secret) => secret.expose().to_owned(),
            }),
        });

        let mut responses = self.responses.lock().unwrap();
        let Some(index) = responses
            .iter()
            .position(|response| command.starts_with(&response.prefix))
        else {
            return Ok(CommandOutput::from_parts(cmd, 0, "", ""));
        };

        let response = &responses[index];
        let output = CommandOutput::from_parts(cmd, response.code, &response.stdout, "");
        if response.once {
            responses.remove(index);
        }
        Ok(output)
    }
}
