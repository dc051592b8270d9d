use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::redirect::Redirect;

/// How long a blocking operation may run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Block until the operation completes.
    #[default]
    Infinite,
    /// Use whatever remains of the process's configured deadline. If the
    /// deadline has already passed, the operation degrades to a readiness
    /// check; if no deadline is configured, this is [`Timeout::Infinite`].
    Deadline,
    /// Block for at most this long.
    Finite(Duration),
}

impl Timeout {
    /// Shorthand for `Timeout::Finite(Duration::from_millis(ms))`.
    pub fn from_millis(ms: u64) -> Timeout {
        Timeout::Finite(Duration::from_millis(ms))
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Timeout {
        Timeout::Finite(duration)
    }
}

/// One step of a stop sequence: a verb and the time to wait for the process
/// to exit afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StopAction {
    /// Skip this step entirely, including its wait.
    #[default]
    Noop,
    /// Wait for the process to exit on its own.
    Wait(Timeout),
    /// Send the polite termination signal, then wait.
    Terminate(Timeout),
    /// Send the forceful termination signal, then wait.
    Kill(Timeout),
}

/// Up to three [`StopAction`]s executed in order by [`Process::stop`] and by
/// drop.
///
/// An all-`Noop` sequence passed to [`Process::start`] is replaced with
/// `{Wait, Terminate, Kill}`, each bounded by the process deadline.
///
/// [`Process::stop`]: crate::Process::stop
/// [`Process::start`]: crate::Process::start
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct StopSequence {
    /// The first action attempted.
    pub first: StopAction,
    /// Attempted if the first action's wait timed out.
    pub second: StopAction,
    /// Attempted if the second action's wait timed out.
    pub third: StopAction,
}

/// The environment the child process starts with.
#[derive(Debug, Clone)]
pub enum Env {
    /// The parent's environment, with these entries added or overriding.
    Extend(Vec<(OsString, OsString)>),
    /// Exactly these entries and nothing else.
    Replace(Vec<(OsString, OsString)>),
}

impl Default for Env {
    fn default() -> Env {
        Env::Extend(Vec::new())
    }
}

impl Env {
    /// The full variable list the child will see.
    pub(crate) fn resolved(&self) -> Vec<(OsString, OsString)> {
        match self {
            Env::Replace(vars) => vars.clone(),
            Env::Extend(extra) => {
                let mut vars: Vec<(OsString, OsString)> = std::env::vars_os().collect();
                for (key, value) in extra {
                    match vars.iter_mut().find(|(name, _)| name == key) {
                        Some(entry) => entry.1 = value.clone(),
                        None => vars.push((key.clone(), value.clone())),
                    }
                }
                vars
            }
        }
    }
}

/// Options accepted by [`Process::start`].
///
/// The `Default` value redirects all three standard streams to pipes,
/// inherits the parent's environment and working directory, and configures
/// no input, deadline or stop sequence.
///
/// [`Process::start`]: crate::Process::start
#[derive(Debug, Default)]
pub struct Options {
    /// Where the child's standard input comes from.
    pub stdin: Redirect,
    /// Where the child's standard output goes.
    pub stdout: Redirect,
    /// Where the child's standard error goes. [`Redirect::Stdout`] is only
    /// valid here.
    pub stderr: Redirect,
    /// The child's environment.
    pub env: Env,
    /// The child's working directory; the parent's if unset.
    pub cwd: Option<PathBuf>,
    /// Put the parent-side endpoints of piped streams in non-blocking mode.
    pub nonblocking: bool,
    /// Bytes written to the child's standard input before the child starts;
    /// the stream is closed afterwards. Requires `stdin` to be
    /// [`Redirect::Pipe`].
    pub input: Option<Vec<u8>>,
    /// The stop sequence applied when the process is dropped while running.
    pub stop: StopSequence,
    /// Time the process is allowed to run, measured from `start`.
    pub deadline: Option<Duration>,
    /// Alias for `deadline`; consulted only when `deadline` is unset.
    pub timeout: Option<Duration>,
}

impl Options {
    pub(crate) fn validate(mut self) -> Result<Options> {
        if matches!(self.stdin, Redirect::Stdout) || matches!(self.stdout, Redirect::Stdout) {
            return Err(Error::Invalid("stdout aliasing is only valid for stderr"));
        }
        if self.input.is_some() && !matches!(self.stdin, Redirect::Pipe) {
            return Err(Error::Invalid("input requires stdin to be redirected to a pipe"));
        }
        if self.deadline.is_none() {
            self.deadline = self.timeout;
        }
        if self.stop == StopSequence::default() {
            self.stop = StopSequence {
                first: StopAction::Wait(Timeout::Deadline),
                second: StopAction::Terminate(Timeout::Deadline),
                third: StopAction::Kill(Timeout::Deadline),
            };
        }
        Ok(self)
    }
}
