use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::time::Instant;

use crate::clock;
use crate::error::{Error, Result};
use crate::options::{Options, StopAction, StopSequence, Timeout};
use crate::poll::WaitSet;
use crate::redirect;
use crate::sys;

/// Identifies one of the three standard streams of a child process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stream {
    /// Standard input.
    In,
    /// Standard output.
    Out,
    /// Standard error.
    Err,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Status {
    NotStarted,
    Running,
    Exited(i32),
}

/// A child process and the parent's endpoints of its redirected streams.
///
/// A `Process` is created in the not-started state and launched with
/// [`start`](Self::start). While the child runs, the parent interacts with it
/// through [`read`](Self::read), [`write`](Self::write),
/// [`close`](Self::close), [`wait`](Self::wait) and the crate-level
/// [`poll`](crate::poll()). Dropping a running `Process` applies the stop
/// sequence configured at start, then releases every handle it owns.
///
/// A `Process` is driven from one thread at a time (`&mut self`); distinct
/// instances may be used concurrently from distinct threads.
#[derive(Debug)]
pub struct Process {
    handle: Option<sys::ChildHandle>,
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    exit: Option<sys::ExitHandle>,
    status: Status,
    stop: StopSequence,
    deadline: Option<Instant>,
    nonblocking: bool,
}

impl Default for Process {
    fn default() -> Process {
        Process::new()
    }
}

impl Process {
    /// A process in the not-started state, owning no OS resources.
    pub fn new() -> Process {
        Process {
            handle: None,
            stdin: None,
            stdout: None,
            stderr: None,
            exit: None,
            status: Status::NotStarted,
            stop: StopSequence::default(),
            deadline: None,
            nonblocking: false,
        }
    }

    /// Launch `argv[0]` with arguments `argv[1..]` according to `options`.
    ///
    /// Requires the not-started state and a non-empty `argv` whose first
    /// element is non-empty. On failure every allocation made along the way
    /// is released and the process remains startable.
    pub fn start<S: AsRef<OsStr>>(&mut self, argv: &[S], options: Options) -> Result<()> {
        if self.status != Status::NotStarted {
            return Err(Error::Invalid("process has already been started"));
        }
        let argv: Vec<OsString> = argv.iter().map(|arg| arg.as_ref().to_owned()).collect();
        if argv.is_empty() || argv[0].is_empty() {
            return Err(Error::Invalid("argv must contain a non-empty program name"));
        }
        let options = options.validate()?;

        let (mut stdin, child_in) =
            redirect::init(Stream::In, options.stdin, options.nonblocking, None)?;
        let (stdout, child_out) =
            redirect::init(Stream::Out, options.stdout, options.nonblocking, None)?;
        let (stderr, child_err) = redirect::init(
            Stream::Err,
            options.stderr,
            options.nonblocking,
            child_out.as_ref(),
        )?;

        if let Some(input) = &options.input {
            prewrite(&mut stdin, input)?;
        }

        let env = options.env.resolved();
        let (handle, exit) = sys::spawn(
            &argv,
            &env,
            options.cwd.as_deref(),
            [child_in, child_out, child_err],
        )?;

        self.handle = Some(handle);
        self.stdin = stdin;
        self.stdout = stdout;
        self.stderr = stderr;
        self.exit = Some(exit);
        self.stop = options.stop;
        self.deadline = options.deadline.map(|d| Instant::now() + d);
        self.nonblocking = options.nonblocking;
        self.status = Status::Running;
        Ok(())
    }

    /// Read from the child's standard output or error.
    ///
    /// End-of-file closes the endpoint and reads as [`Error::BrokenPipe`], as
    /// do reads from an endpoint that is already closed or was never a pipe.
    /// A non-blocking endpoint with nothing buffered, or a configured
    /// deadline expiring first, reads as [`Error::TimedOut`].
    pub fn read(&mut self, stream: Stream, buf: &mut [u8]) -> Result<usize> {
        let deadline = self.deadline;
        let nonblocking = self.nonblocking;
        let pipe = match stream {
            Stream::Out => &mut self.stdout,
            Stream::Err => &mut self.stderr,
            Stream::In => return Err(Error::Invalid("cannot read from stdin")),
        };
        if pipe.is_none() {
            return Err(Error::BrokenPipe);
        }
        if !nonblocking && deadline.is_some() {
            // The configured deadline bounds blocking reads.
            let mut sets = [WaitSet::new()];
            match stream {
                Stream::Out => sets[0].stdout = pipe.as_ref(),
                _ => sets[0].stderr = pipe.as_ref(),
            }
            sys::wait(&mut sets, clock::expiry(None, deadline))?;
        }
        let result = match pipe.as_ref() {
            Some(f) => sys::read_pipe(f, buf),
            None => return Err(Error::BrokenPipe),
        };
        match result {
            Ok(0) if !buf.is_empty() => {
                *pipe = None;
                Err(Error::BrokenPipe)
            }
            Ok(n) => Ok(n),
            Err(Error::BrokenPipe) => {
                *pipe = None;
                Err(Error::BrokenPipe)
            }
            Err(err) => Err(err),
        }
    }

    /// Write to the child's standard input, returning the number of bytes
    /// written.
    ///
    /// An empty buffer is a no-op. Partial writes happen on non-blocking
    /// endpoints; callers loop. [`Error::BrokenPipe`] closes the endpoint.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(f) = self.stdin.as_ref() else {
            return Err(Error::BrokenPipe);
        };
        match sys::write_pipe(f, buf) {
            Err(Error::BrokenPipe) => {
                self.stdin = None;
                Err(Error::BrokenPipe)
            }
            result => result,
        }
    }

    /// Close the parent's endpoint of the given stream. Idempotent.
    ///
    /// Closing stdin is how the child is told no more input is coming.
    pub fn close(&mut self, stream: Stream) {
        match stream {
            Stream::In => self.stdin = None,
            Stream::Out => self.stdout = None,
            Stream::Err => self.stderr = None,
        }
    }

    /// Wait up to `timeout` for the child to exit and return its exit code.
    ///
    /// An exit caused by a signal is encoded as `128 + signo` (see
    /// [`SIGTERM`](crate::SIGTERM) and [`SIGKILL`](crate::SIGKILL)). Once the
    /// child has been reaped the code is stored and later waits return it
    /// immediately. [`Error::TimedOut`] passes through unchanged and leaves
    /// the state untouched.
    pub fn wait(&mut self, timeout: Timeout) -> Result<i32> {
        match self.status {
            Status::NotStarted => Err(Error::Invalid("process has not been started")),
            Status::Exited(code) => Ok(code),
            Status::Running => {
                let timeout = match timeout {
                    Timeout::Infinite => None,
                    Timeout::Finite(duration) => Some(duration),
                    Timeout::Deadline => clock::expiry(None, self.deadline),
                };
                {
                    let mut sets = [WaitSet::new()];
                    sets[0].exit = self.exit.as_ref();
                    sys::wait(&mut sets, timeout)?;
                }
                let code = match self.handle.as_ref() {
                    Some(handle) => sys::reap(handle)?,
                    None => return Err(Error::Invalid("process has no handle")),
                };
                self.exit = None;
                self.status = Status::Exited(code);
                Ok(code)
            }
        }
    }

    /// Send the polite termination signal: `SIGTERM` on POSIX, a console
    /// break event on Windows. A no-op once the child has exited.
    pub fn terminate(&mut self) -> Result<()> {
        match self.running_handle()? {
            Some(handle) => sys::terminate(handle),
            None => Ok(()),
        }
    }

    /// Send the forceful termination signal: `SIGKILL` on POSIX,
    /// `TerminateProcess` on Windows. A no-op once the child has exited.
    pub fn kill(&mut self) -> Result<()> {
        match self.running_handle()? {
            Some(handle) => sys::kill(handle),
            None => Ok(()),
        }
    }

    /// Run up to three stop actions in order until one of their waits
    /// returns something other than [`Error::TimedOut`], and return that
    /// final result.
    ///
    /// [`StopAction::Noop`] steps are skipped without waiting. A failure to
    /// signal the child ends the sequence with that error.
    pub fn stop(&mut self, sequence: StopSequence) -> Result<i32> {
        if self.status == Status::NotStarted {
            return Err(Error::Invalid("process has not been started"));
        }
        let mut result = Ok(0);
        for action in [sequence.first, sequence.second, sequence.third] {
            let timeout = match action {
                StopAction::Noop => {
                    result = Ok(0);
                    continue;
                }
                StopAction::Wait(timeout) => timeout,
                StopAction::Terminate(timeout) => {
                    self.terminate()?;
                    timeout
                }
                StopAction::Kill(timeout) => {
                    self.kill()?;
                    timeout
                }
            };
            result = self.wait(timeout);
            match result {
                Err(Error::TimedOut) => continue,
                _ => break,
            }
        }
        result
    }

    /// The OS process id, once started.
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|handle| handle.pid())
    }

    /// The exit code, if the child is known to have exited. Performs no
    /// system calls.
    pub fn exit_status(&self) -> Option<i32> {
        match self.status {
            Status::Exited(code) => Some(code),
            _ => None,
        }
    }

    fn running_handle(&self) -> Result<Option<&sys::ChildHandle>> {
        match self.status {
            Status::NotStarted => Err(Error::Invalid("process has not been started")),
            Status::Exited(_) => Ok(None),
            Status::Running => self
                .handle
                .as_ref()
                .map(Some)
                .ok_or(Error::Invalid("process has no handle")),
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn stdin_ref(&self) -> Option<&File> {
        self.stdin.as_ref()
    }

    pub(crate) fn stdout_ref(&self) -> Option<&File> {
        self.stdout.as_ref()
    }

    pub(crate) fn stderr_ref(&self) -> Option<&File> {
        self.stderr.as_ref()
    }

    pub(crate) fn exit_ref(&self) -> Option<&sys::ExitHandle> {
        self.exit.as_ref()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.status == Status::Running {
            // Best effort; there is no further action to take on failure.
            let _ = self.stop(self.stop);
        }
    }
}

/// Write `input` into the child's stdin pipe before the child exists, then
/// close the pipe so the child sees end-of-file once the input is consumed.
///
/// The pipe is made non-blocking first: nothing can drain it yet, so an
/// input larger than the pipe capacity fails with [`Error::TimedOut`]
/// instead of blocking forever. Empty input leaves the endpoint untouched.
fn prewrite(stdin: &mut Option<File>, input: &[u8]) -> Result<()> {
    if input.is_empty() {
        return Ok(());
    }
    let Some(pipe) = stdin.as_ref() else {
        return Err(Error::Invalid("input requires stdin to be redirected to a pipe"));
    };
    sys::set_nonblocking(pipe, true)?;
    let mut written = 0;
    while written < input.len() {
        match sys::write_pipe(pipe, &input[written..])? {
            0 => return Err(Error::TimedOut),
            n => written += n,
        }
    }
    *stdin = None;
    Ok(())
}
