use std::fs::{File, OpenOptions};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::process::Stream;
use crate::sys;

/// What to connect a standard stream of the child process to.
#[derive(Debug, Default)]
pub enum Redirect {
    /// An anonymous pipe whose other end stays with the parent. The default.
    #[default]
    Pipe,
    /// The parent's own standard stream for that slot.
    Inherit,
    /// The platform's null device.
    Discard,
    /// A caller-supplied handle, installed as the child's stream verbatim.
    Handle(File),
    /// Reuse the child-side standard output handle, merging the child's
    /// stderr into its stdout stream. Only valid for stderr.
    Stdout,
}

/// Resolve one stream's redirection into the parent-side endpoint (pipes
/// only) and the handle the child inherits as that stream.
///
/// `stdout_child` is the already-resolved child-side stdout handle, consulted
/// only by [`Redirect::Stdout`]. Child ends are reference-counted so aliasing
/// never duplicates an OS handle.
pub(crate) fn init(
    stream: Stream,
    redirect: Redirect,
    nonblocking: bool,
    stdout_child: Option<&Arc<File>>,
) -> Result<(Option<File>, Option<Arc<File>>)> {
    match redirect {
        Redirect::Pipe => {
            let (read, write) = sys::pipe()?;
            let (parent, child) = match stream {
                Stream::In => (write, read),
                Stream::Out | Stream::Err => (read, write),
            };
            if nonblocking {
                sys::set_nonblocking(&parent, true)?;
            }
            sys::set_inheritable(&parent, false)?;
            Ok((Some(parent), Some(Arc::new(child))))
        }
        Redirect::Inherit => {
            let child = sys::dup_standard_stream(stream)?;
            sys::set_inheritable(&child, true)?;
            Ok((None, Some(Arc::new(child))))
        }
        Redirect::Discard => {
            let null = match stream {
                Stream::In => OpenOptions::new().read(true).open(sys::NULL_DEVICE)?,
                Stream::Out | Stream::Err => {
                    OpenOptions::new().write(true).open(sys::NULL_DEVICE)?
                }
            };
            sys::set_inheritable(&null, true)?;
            Ok((None, Some(Arc::new(null))))
        }
        Redirect::Handle(file) => {
            sys::set_inheritable(&file, true)?;
            Ok((None, Some(Arc::new(file))))
        }
        Redirect::Stdout => {
            let stdout = stdout_child.ok_or(Error::Invalid("stdout is not redirected"))?;
            Ok((None, Some(Arc::clone(stdout))))
        }
    }
}
