//! External command execution.
//!
//! Every tool the workflow drives (`git`, `kubectl`, `vcluster`, `ssh`,
//! `sysctl`) is invoked through a [`CommandRunner`]. Production code uses
//! [`ProcessRunner`]; host-level steps wrap it in an [`SshRunner`]; tests
//! inject scripted runners.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::config::SshConfig;
use crate::error::ExecError;

/// A single external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(after);
        self
    }

    /// Program followed by its arguments, as a single vector.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

/// Renders a copy-pasteable command line. Environment values are omitted.
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in self.argv() {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(&shell_quote(part))?;
            first = false;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout, for error messages.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Boxed future returned by [`CommandRunner::run`].
pub type RunFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ExecError>> + Send + 'a>>;

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` to completion and capture its output.
    ///
    /// A non-zero exit status is reported through [`CommandOutput::code`],
    /// not as an `Err`.
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        (**self).run(invocation)
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        (**self).run(invocation)
    }
}

/// Runs commands as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        Box::pin(async move {
            let program = invocation.program.clone();
            debug!(command = %invocation, "exec");

            let mut cmd = tokio::process::Command::new(&invocation.program);
            cmd.args(&invocation.args)
                .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(if invocation.stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

            // stdin is fed while output drains; the timeout covers both.
            let input = invocation.stdin.clone();
            let stdin = child.stdin.take();
            let feed = async move {
                if let (Some(input), Some(mut stdin)) = (input, stdin) {
                    stdin.write_all(input.as_bytes()).await?;
                }
                Ok::<(), std::io::Error>(())
            };
            let exchange = async {
                let (fed, output) = tokio::join!(feed, child.wait_with_output());
                match fed {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => output,
                }
            };
            let output = match invocation.timeout {
                Some(after) => tokio::time::timeout(after, exchange)
                    .await
                    .map_err(|_| ExecError::Timeout {
                        program: program.clone(),
                        after,
                    })?,
                None => exchange.await,
            }
            .map_err(|source| ExecError::Io {
                program: program.clone(),
                source,
            })?;

            let result = CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            trace!(%program, code = ?result.code, "exec finished");
            Ok(result)
        })
    }
}

/// Where and how to reach the SSH host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub options: Vec<String>,
}

impl SshTarget {
    pub fn from_config(config: &SshConfig) -> Self {
        Self {
            host: config.host.clone(),
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            options: config.options.clone(),
        }
    }

    /// `user@host`, or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    /// Connection flags shared by remote execution and port forwarding.
    /// Batch mode keeps a CI job from hanging on a password prompt.
    pub fn connection_args(&self) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }
}

/// Runs every invocation on the SSH host by delegating to an inner runner.
pub struct SshRunner<R> {
    target: SshTarget,
    inner: R,
}

impl<R: CommandRunner> SshRunner<R> {
    pub fn new(target: SshTarget, inner: R) -> Self {
        Self { target, inner }
    }

    /// Translate `invocation` into the equivalent `ssh` invocation.
    pub fn wrap(&self, invocation: &Invocation) -> Invocation {
        let mut remote = Vec::new();
        if !invocation.env.is_empty() {
            remote.push("env".to_string());
            for (key, value) in &invocation.env {
                remote.push(shell_quote(&format!("{key}={value}")));
            }
        }
        remote.extend(invocation.argv().into_iter().map(shell_quote));

        Invocation {
            program: "ssh".to_string(),
            args: self
                .target
                .connection_args()
                .into_iter()
                .chain([self.target.destination(), "--".to_string(), remote.join(" ")])
                .collect(),
            env: Vec::new(),
            stdin: invocation.stdin.clone(),
            timeout: invocation.timeout,
        }
    }
}

impl<R: CommandRunner> CommandRunner for SshRunner<R> {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        Box::pin(async move {
            let wrapped = self.wrap(invocation);
            self.inner.run(&wrapped).await
        })
    }
}

/// Quote `s` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
