use std::fmt;
use std::fs::File;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::options::Timeout;
use crate::process::Process;
use crate::sys;

/// A bitmask of conditions satisfied on a process's endpoints.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Event(u8);

impl Event {
    /// No condition.
    pub const NONE: Event = Event(0);
    /// The process's standard input can be written to.
    pub const IN: Event = Event(1 << 0);
    /// The process's standard output can be read from.
    pub const OUT: Event = Event(1 << 1);
    /// The process's standard error can be read from.
    pub const ERR: Event = Event(1 << 2);
    /// The process terminated.
    pub const EXIT: Event = Event(1 << 3);
    /// The process's deadline expired.
    pub const DEADLINE: Event = Event(1 << 4);

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (name, bit) in [
            ("IN", Event::IN),
            ("OUT", Event::OUT),
            ("ERR", Event::ERR),
            ("EXIT", Event::EXIT),
            ("DEADLINE", Event::DEADLINE),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One process's contribution to a [`poll`] call.
pub struct Source<'a> {
    /// The process whose endpoints are watched.
    pub process: &'a Process,
    /// The conditions the caller wants watched.
    pub interests: Event,
    /// The conditions satisfied when [`poll`] returns; output only.
    pub events: Event,
}

impl<'a> Source<'a> {
    /// A source with the given interests and no events.
    pub fn new(process: &'a Process, interests: Event) -> Source<'a> {
        Source {
            process,
            interests,
            events: Event::NONE,
        }
    }
}

/// The endpoints one source hands to the platform wait; `None` entries are
/// ignored.
pub(crate) struct WaitSet<'a> {
    pub stdin: Option<&'a File>,
    pub stdout: Option<&'a File>,
    pub stderr: Option<&'a File>,
    pub exit: Option<&'a sys::ExitHandle>,
    pub events: Event,
}

impl<'a> WaitSet<'a> {
    pub(crate) fn new() -> WaitSet<'a> {
        WaitSet {
            stdin: None,
            stdout: None,
            stderr: None,
            exit: None,
            events: Event::NONE,
        }
    }
}

/// Wait until a watched condition is satisfied on at least one source, a
/// source's deadline expires, or `timeout` elapses.
///
/// Returns the number of sources with a non-empty `events` field. A deadline
/// expiry is reported as [`Event::DEADLINE`] on the source that owns the
/// deadline and counts as success; a plain timeout is [`Error::TimedOut`].
/// When no source contributes a valid stdin, stdout or stderr endpoint the
/// call fails with [`Error::BrokenPipe`].
///
/// `timeout` may not be [`Timeout::Deadline`]; per-process deadlines are
/// always in effect here.
pub fn poll(sources: &mut [Source<'_>], timeout: Timeout) -> Result<usize> {
    if sources.is_empty() {
        return Err(Error::Invalid("poll requires at least one source"));
    }
    let timeout = match timeout {
        Timeout::Infinite => None,
        Timeout::Finite(duration) => Some(duration),
        Timeout::Deadline => {
            return Err(Error::Invalid("poll does not accept the per-process deadline"));
        }
    };
    for source in sources.iter_mut() {
        source.events = Event::NONE;
    }

    // The earliest deadline across all sources bounds the whole call.
    let earliest = sources
        .iter()
        .enumerate()
        .filter_map(|(i, source)| source.process.deadline().map(|deadline| (i, deadline)))
        .min_by_key(|&(_, deadline)| deadline);
    let remaining = earliest.map(|(i, deadline)| (i, deadline.saturating_duration_since(Instant::now())));
    if let Some((i, remaining)) = remaining {
        if remaining.is_zero() {
            sources[i].events = Event::DEADLINE;
            return Ok(1);
        }
    }
    let effective = match (timeout, remaining) {
        (timeout, None) => timeout,
        (None, Some((_, remaining))) => Some(remaining),
        (Some(timeout), Some((_, remaining))) => Some(timeout.min(remaining)),
    };
    // Whether the deadline, not the caller's timeout, bounds the wait.
    let deadline_bound = match (timeout, remaining) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(timeout), Some((_, remaining))) => remaining <= timeout,
    };

    let mut sets: Vec<WaitSet<'_>> = sources
        .iter()
        .map(|source| {
            let process = source.process;
            WaitSet {
                stdin: if source.interests.contains(Event::IN) {
                    process.stdin_ref()
                } else {
                    None
                },
                stdout: if source.interests.contains(Event::OUT) {
                    process.stdout_ref()
                } else {
                    None
                },
                stderr: if source.interests.contains(Event::ERR) {
                    process.stderr_ref()
                } else {
                    None
                },
                exit: if source.interests.contains(Event::EXIT) {
                    process.exit_ref()
                } else {
                    None
                },
                events: Event::NONE,
            }
        })
        .collect();

    if !sets
        .iter()
        .any(|set| set.stdin.is_some() || set.stdout.is_some() || set.stderr.is_some())
    {
        return Err(Error::BrokenPipe);
    }

    match sys::wait(&mut sets, effective) {
        Ok(()) => {
            let mut ready = 0;
            for (source, set) in sources.iter_mut().zip(&sets) {
                source.events = set.events;
                if !set.events.is_empty() {
                    ready += 1;
                }
            }
            Ok(ready)
        }
        Err(Error::TimedOut) if deadline_bound => {
            if let Some((i, _)) = remaining {
                sources[i].events = Event::DEADLINE;
            }
            Ok(1)
        }
        Err(err) => Err(err),
    }
}
