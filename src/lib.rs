//! Execution and control of child processes over redirected standard
//! streams.
//!
//! The entry point is the [`Process`] struct, which walks one child through
//! its whole lifecycle: [`start`](Process::start) launches it with the
//! redirections described by [`Options`], [`read`](Process::read),
//! [`write`](Process::write) and [`close`](Process::close) drive its
//! standard streams, [`wait`](Process::wait) collects its exit code, and
//! [`terminate`](Process::terminate) / [`kill`](Process::kill) /
//! [`stop`](Process::stop) end it early. Dropping a running `Process`
//! applies its configured [`StopSequence`] so no child is ever leaked.
//!
//! Compared to `std::process`, the crate offers:
//!
//! * [`poll`], which waits on the streams, exits and deadlines of many
//!   processes in one blocking call, without threads.
//!
//! * Deadlines: a process started with a deadline bounds every subsequent
//!   blocking operation on it.
//!
//! * Richer redirection, including merging the child's stderr into its
//!   stdout ([`Redirect::Stdout`]) and discarding a stream wholesale.
//!
//! * Graceful shutdown as data: a stop sequence such as *wait 5s, then
//!   terminate and wait 2s, then kill* is plain configuration.
//!
//! # Example
//!
//! ```no_run
//! use reproc::{drain, Options, Process, Stream, Timeout};
//!
//! fn main() -> reproc::Result<()> {
//!     let mut process = Process::new();
//!     process.start(&["echo", "hello"], Options::default())?;
//!     process.close(Stream::In);
//!
//!     let (mut out, mut err) = (Vec::new(), Vec::new());
//!     drain(&mut process, &mut out, &mut err)?;
//!
//!     assert_eq!(process.wait(Timeout::Infinite)?, 0);
//!     assert_eq!(out, b"hello\n");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod clock;
mod drain;
mod error;
mod options;
mod poll;
mod process;
mod redirect;

#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod win32;

#[cfg(unix)]
use posix as sys;
#[cfg(windows)]
use win32 as sys;

pub use crate::drain::drain;
pub use crate::error::{Error, Result};
pub use crate::options::{Env, Options, StopAction, StopSequence, Timeout};
pub use crate::poll::{poll, Event, Source};
pub use crate::process::{Process, Stream};
pub use crate::redirect::Redirect;

/// Exit code reported for a child that died to the forceful termination
/// signal (`128 + 9`).
pub const SIGKILL: i32 = 128 + 9;
/// Exit code reported for a child that died to the polite termination
/// signal (`128 + 15`).
pub const SIGTERM: i32 = 128 + 15;
