use std::io::Write;

use crate::error::{Error, Result};
use crate::options::Timeout;
use crate::poll::{self, Event, Source};
use crate::process::{Process, Stream};

const CHUNK: usize = 4096;

/// Read the process's standard output and error until both reach
/// end-of-file, writing everything into the `out` and `err` sinks.
///
/// The streams are multiplexed with [`poll`](crate::poll()), so a child that
/// fills one pipe while the parent is busy with the other cannot deadlock.
/// If the parent still holds the child's stdin endpoint, close it first or
/// the child may wait for input forever. A configured deadline expiring
/// during the drain surfaces as [`Error::TimedOut`].
pub fn drain<O: Write, E: Write>(process: &mut Process, out: &mut O, err: &mut E) -> Result<()> {
    let mut buf = [0u8; CHUNK];
    loop {
        let events = {
            let mut sources = [Source::new(&*process, Event::OUT | Event::ERR)];
            match poll::poll(&mut sources, Timeout::Infinite) {
                Ok(_) => sources[0].events,
                // Both streams are closed; nothing is left to drain.
                Err(Error::BrokenPipe) => return Ok(()),
                Err(other) => return Err(other),
            }
        };
        if events.contains(Event::DEADLINE) {
            return Err(Error::TimedOut);
        }
        if events.contains(Event::OUT) {
            match process.read(Stream::Out, &mut buf) {
                Ok(n) => out.write_all(&buf[..n])?,
                Err(Error::BrokenPipe) => {}
                Err(other) => return Err(other),
            }
        }
        if events.contains(Event::ERR) {
            match process.read(Stream::Err, &mut buf) {
                Ok(n) => err.write_all(&buf[..n])?,
                Err(Error::BrokenPipe) => {}
                Err(other) => return Err(other),
            }
        }
    }
}
