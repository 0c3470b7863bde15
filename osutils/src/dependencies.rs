use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::Output,
};

use log::trace;
use strum_macros::IntoStaticStr;

use blockgraph_api::{
    error::{BlockgraphError, BlockgraphResultExt, ExecutionError},
    primitives::secret::Secret,
};

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Failed to find dependency '{dependency}': {source}")]
    NotFound {
        dependency: Dependency,
        #[source]
        source: which::Error,
    },

    #[error("Failed to execute dependency '{dependency}': {inner}")]
    CouldNotExecute {
        dependency: Dependency,
        #[source]
        inner: io::Error,
    },

    #[error("Dependency '{dependency}' finished unsuccessfully: {explanation}\nCmdline: {rendered_command}\n{output}")]
    ExecutionFailed {
        dependency: Dependency,
        rendered_command: String,
        code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
        explanation: String,
        output: String,
    },
}

impl From<DependencyError> for BlockgraphError {
    #[track_caller]
    fn from(value: DependencyError) -> Self {
        match value {
            DependencyError::NotFound { dependency, source } => BlockgraphError::with_source(
                ExecutionError::MissingBinary {
                    binary: dependency.name(),
                },
                source.into(),
            ),
            DependencyError::CouldNotExecute { dependency, inner } => {
                BlockgraphError::with_source(
                    ExecutionError::CommandCouldNotExecute {
                        binary: dependency.name(),
                    },
                    inner.into(),
                )
            }
            DependencyError::ExecutionFailed {
                dependency,
                explanation,
                ..
            } => BlockgraphError::new(ExecutionError::CommandFailed {
                binary: dependency.name(),
                explanation,
            }),
        }
    }
}

pub trait DependencyResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlockgraphError>;
}

impl<T> DependencyResultExt<T> for Result<T, Box<DependencyError>> {
    #[track_caller]
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlockgraphError> {
        let result: Result<T, BlockgraphError> = self.map_err(|e| (*e).into());
        result.message(context)
    }
}

/// Enum of runtime and test dependencies used in the code base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Blkid,
    Btrfs,
    Cryptsetup,
    Dmsetup,
    E2label,
    Fatlabel,
    Lsblk,
    Mdadm,
    #[strum(serialize = "mkfs.btrfs")]
    MkfsBtrfs,
    #[strum(serialize = "mkfs.ext2")]
    MkfsExt2,
    #[strum(serialize = "mkfs.ext3")]
    MkfsExt3,
    #[strum(serialize = "mkfs.ext4")]
    MkfsExt4,
    #[strum(serialize = "mkfs.vfat")]
    MkfsVfat,
    #[strum(serialize = "mkfs.xfs")]
    MkfsXfs,
    Mkswap,
    Mount,
    Resize2fs,
    Sfdisk,
    #[strum(serialize = "installation-helper")]
    SnapperInstallationHelper,
    Udevadm,
    Umount,
    Wipefs,
    #[strum(serialize = "xfs_admin")]
    XfsAdmin,
    #[strum(serialize = "xfs_growfs")]
    XfsGrowfs,
    // Test dependencies
    #[cfg(test)]
    DoesNotExist,
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
    #[cfg(test)]
    Cat,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Gets the path for a dependency not in $PATH
    fn path_override(&self) -> Option<PathBuf> {
        Some(PathBuf::from(match self {
            Self::SnapperInstallationHelper => "/usr/lib/snapper/installation-helper",
            _ => return None,
        }))
    }

    /// Gets the name of the dependency
    ///
    /// For example, Dependency::Mdadm => "mdadm"
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Checks if the dependency is present in the system
    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    /// Gets the path of the dependency
    pub fn path(&self) -> Result<PathBuf, Box<DependencyError>> {
        which::which(match self.path_override() {
            Some(path) => path,
            None => self.name().into(),
        })
        .map_err(|source| {
            Box::new(DependencyError::NotFound {
                dependency: *self,
                source,
            })
        })
    }

    /// Converts the dependency to a new Command instance
    /// (Note this does not create a std::process::Command instance)
    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: vec![],
            envs: vec![],
            stdin: None,
        }
    }
}

/// Data piped to the standard input of a command.
#[derive(Debug, Clone)]
pub enum Stdin {
    /// Plain text, shown in traces.
    Text(String),
    /// A secret, never rendered.
    Secret(Secret),
}

impl Stdin {
    fn bytes(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Secret(secret) => secret.expose().as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    stdin: Option<Stdin>,
}

impl Command {
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn with_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Command
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs
            .push((key.as_ref().to_os_string(), val.as_ref().to_os_string()));
        self
    }

    /// Pipes plain text to the standard input of the command.
    pub fn stdin_text(&mut self, text: impl Into<String>) -> &mut Command {
        self.stdin = Some(Stdin::Text(text.into()));
        self
    }

    /// Pipes a secret to the standard input of the command.
    pub fn stdin_secret(&mut self, secret: &Secret) -> &mut Command {
        self.stdin = Some(Stdin::Secret(secret.clone()));
        self
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    pub fn stdin(&self) -> Option<&Stdin> {
        self.stdin.as_ref()
    }

    pub fn render_command(&self) -> String {
        if self.args.is_empty() {
            self.dependency.to_string()
        } else {
            format!(
                "{} {}",
                self.dependency,
                self.args
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{arg}'")
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }

    /// Executes the command on this system.
    pub fn output(&self) -> Result<CommandOutput, Box<DependencyError>> {
        let mut expr = duct::cmd(self.dependency.path()?, &self.args)
            .stdout_capture()
            .stderr_capture()
            .unchecked();
        for (key, val) in &self.envs {
            expr = expr.env(key, val);
        }
        if let Some(stdin) = &self.stdin {
            expr = expr.stdin_bytes(stdin.bytes());
        }

        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");
        let output = expr.run().map_err(|inner| DependencyError::CouldNotExecute {
            dependency: self.dependency,
            inner,
        })?;
        let output = CommandOutput {
            rendered_command: rendered_command.clone(),
            dependency: self.dependency,
            inner: output,
        };
        trace!(
            "Executed '{rendered_command}': {}. Report:\n{}",
            output.explain_exit(),
            output.output_report(),
        );
        Ok(output)
    }
}

/// Executes commands on behalf of the agent.
///
/// Everything that drives a system tool goes through a runner so that it can
/// be replaced by a recording runner in tests.
pub trait CommandRunner: Send + Sync {
    fn output(&self, cmd: &Command) -> Result<CommandOutput, Box<DependencyError>>;

    fn run_and_check(&self, cmd: &Command) -> Result<(), Box<DependencyError>> {
        self.output(cmd)?.check()
    }

    fn output_and_check(&self, cmd: &Command) -> Result<String, Box<DependencyError>> {
        self.output(cmd)?.check_output()
    }
}

/// Runs commands on the live system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn output(&self, cmd: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        cmd.output()
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    rendered_command: String,
    dependency: Dependency,
    inner: Output,
}

impl CommandOutput {
    /// Builds an output as if `cmd` had exited with `code`.
    #[cfg(any(test, feature = "test-utilities"))]
    pub fn from_parts(cmd: &Command, code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            rendered_command: cmd.render_command(),
            dependency: cmd.dependency,
            inner: Output {
                status: std::process::ExitStatus::from_raw(code << 8),
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            },
        }
    }

    /// Checks if the process exited successfully
    pub fn success(&self) -> bool {
        self.inner.status.success()
    }

    /// Gets the exit code of the process, if it exited normally
    pub fn code(&self) -> Option<i32> {
        self.inner.status.code()
    }

    /// Gets the signal that terminated the process, if it was terminated by a signal
    fn signal(&self) -> Option<i32> {
        self.inner.status.signal()
    }

    /// Gets stderr
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stderr).into()
    }

    /// Gets stdout
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stdout).into()
    }

    /// Gets all available output, useful for reporting or debugging
    pub fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);

        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }

        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }

        res
    }

    /// Checks if the process exited successfully, otherwise produces an error
    pub fn check(&self) -> Result<(), Box<DependencyError>> {
        if self.success() {
            return Ok(());
        }

        Err(Box::new(DependencyError::ExecutionFailed {
            dependency: self.dependency,
            rendered_command: self.rendered_command.clone(),
            code: self.code(),
            signal: self.signal(),
            stdout: self.output(),
            stderr: self.error_output(),
            explanation: self.explain_exit(),
            output: match self.output_report() {
                s if !s.is_empty() => s,
                _ => "(no output collected)".into(),
            },
        }))
    }

    /// Checks if the process exited successfully and returns the output,
    /// otherwise produces an error with the output
    pub fn check_output(&self) -> Result<String, Box<DependencyError>> {
        self.check()?;
        Ok(self.output())
    }

    /// Produces a string explaining the exit status of the process
    fn explain_exit(&self) -> String {
        if let Some(code) = self.code() {
            format!("exited with status: {code}")
        } else if let Some(signal) = self.signal() {
            format!("terminated by signal: {signal}")
        } else {
            "exited with unknown status".into()
        }
    }
}
