use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use libc::{c_char, c_int};

use crate::error::{Error, Result};
use crate::poll::{Event, WaitSet};
use crate::process::Stream;

pub(crate) const NULL_DEVICE: &str = "/dev/null";

/// Read end of the pipe whose write end is held only by the child; it hits
/// end-of-file exactly when the child terminates.
pub(crate) type ExitHandle = File;

#[derive(Debug, Copy, Clone)]
pub(crate) struct ChildHandle {
    pid: libc::pid_t,
}

impl ChildHandle {
    pub(crate) fn pid(&self) -> u32 {
        self.pid as u32
    }
}

fn check_err<T: Ord + Default>(num: T) -> io::Result<T> {
    if num < T::default() {
        return Err(io::Error::last_os_error());
    }
    Ok(num)
}

pub(crate) fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as c_int; 2];
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    set_cloexec(&read, true)?;
    set_cloexec(&write, true)?;
    Ok((read, write))
}

fn set_cloexec(f: &File, cloexec: bool) -> io::Result<()> {
    let fd = f.as_raw_fd();
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let new = if cloexec {
        old | libc::FD_CLOEXEC
    } else {
        old & !libc::FD_CLOEXEC
    };
    check_err(unsafe { libc::fcntl(fd, libc::F_SETFD, new) })?;
    Ok(())
}

pub(crate) fn set_inheritable(f: &File, inheritable: bool) -> io::Result<()> {
    // Child ends are installed with dup2, which clears close-on-exec on the
    // installed copy, so only the parent ends need the flag forced on.
    if !inheritable {
        set_cloexec(f, true)?;
    }
    Ok(())
}

pub(crate) fn set_nonblocking(f: &File, nonblocking: bool) -> io::Result<()> {
    let fd = f.as_raw_fd();
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let new = if nonblocking {
        old | libc::O_NONBLOCK
    } else {
        old & !libc::O_NONBLOCK
    };
    check_err(unsafe { libc::fcntl(fd, libc::F_SETFL, new) })?;
    Ok(())
}

pub(crate) fn dup_standard_stream(stream: Stream) -> io::Result<File> {
    let fd = match stream {
        Stream::In => 0,
        Stream::Out => 1,
        Stream::Err => 2,
    };
    let duped = check_err(unsafe { libc::dup(fd) })?;
    Ok(unsafe { File::from_raw_fd(duped) })
}

pub(crate) fn read_pipe(mut f: &File, buf: &mut [u8]) -> Result<usize> {
    loop {
        match f.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

pub(crate) fn write_pipe(mut f: &File, buf: &[u8]) -> Result<usize> {
    loop {
        match f.write(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Block until a condition is satisfied on some valid endpoint of `sets`, or
/// `timeout` (`None` = infinite) elapses. Satisfied conditions are recorded
/// in each set's `events` field.
pub(crate) fn wait(sets: &mut [WaitSet<'_>], timeout: Option<Duration>) -> Result<()> {
    let mut fds: Vec<libc::pollfd> = Vec::new();
    let mut index: Vec<(usize, Event)> = Vec::new();
    let mut push = |fd: RawFd, events: libc::c_short, entry: (usize, Event)| {
        fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        index.push(entry);
    };
    for (i, set) in sets.iter().enumerate() {
        // Readiness on the parent's stdin endpoint means writability; the
        // other three are read-side conditions.
        if let Some(f) = set.stdin {
            push(f.as_raw_fd(), libc::POLLOUT, (i, Event::IN));
        }
        if let Some(f) = set.stdout {
            push(f.as_raw_fd(), libc::POLLIN, (i, Event::OUT));
        }
        if let Some(f) = set.stderr {
            push(f.as_raw_fd(), libc::POLLIN, (i, Event::ERR));
        }
        if let Some(f) = set.exit {
            push(f.as_raw_fd(), libc::POLLIN, (i, Event::EXIT));
        }
    }
    if fds.is_empty() {
        return Err(Error::BrokenPipe);
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let n = unsafe {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, poll_millis(deadline))
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        if n == 0 {
            // The timeout handed to poll(2) may have been truncated; only
            // report expiry once the full deadline has passed.
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Err(Error::TimedOut),
                _ => continue,
            }
        }
        break;
    }

    for (entry, &(i, bit)) in fds.iter().zip(&index) {
        let satisfied = entry.events | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
        if entry.revents & satisfied != 0 {
            sets[i].events |= bit;
        }
    }
    Ok(())
}

fn poll_millis(deadline: Option<Instant>) -> c_int {
    match deadline {
        None => -1,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ms = remaining.as_millis().min(c_int::MAX as u128) as c_int;
            // Round sub-millisecond remainders up so the loop cannot spin.
            if Duration::from_millis(ms as u64) < remaining {
                ms.saturating_add(1)
            } else {
                ms
            }
        }
    }
}

/// Fork and exec `argv`, with `stdio` installed as the child's standard
/// streams. Returns the child's handle and the read end of the exit pipe.
///
/// Exec failures in the child are reported back through a dedicated pipe
/// (the child exits 127 and is reaped here), so a failed spawn surfaces as
/// the underlying OS error and leaks nothing.
pub(crate) fn spawn(
    argv: &[OsString],
    env: &[(OsString, OsString)],
    cwd: Option<&Path>,
    stdio: [Option<Arc<File>>; 3],
) -> Result<(ChildHandle, ExitHandle)> {
    let argv_c: Vec<CString> = argv
        .iter()
        .map(|arg| os_to_cstring(arg))
        .collect::<Result<_>>()?;
    let env_c: Vec<CString> = env
        .iter()
        .map(|(key, value)| {
            let mut entry = key.clone();
            entry.push("=");
            entry.push(value);
            os_to_cstring(&entry)
        })
        .collect::<Result<_>>()?;
    let cwd_c = cwd.map(|p| os_to_cstring(p.as_os_str())).transpose()?;

    // Pointer tables are built before forking; the child must not allocate.
    let mut argv_ptr: Vec<*const c_char> = argv_c.iter().map(|s| s.as_ptr()).collect();
    argv_ptr.push(ptr::null());
    let mut env_ptr: Vec<*const c_char> = env_c.iter().map(|s| s.as_ptr()).collect();
    env_ptr.push(ptr::null());

    let (exit_read, exit_write) = pipe()?;
    let (mut fail_read, fail_write) = pipe()?;

    let pid = check_err(unsafe { libc::fork() })?;
    if pid == 0 {
        // Child: exec or exit, nothing else.
        let err = exec_child(&argv_ptr, &env_ptr, cwd_c.as_deref(), &stdio, &exit_write);
        let errno = err.raw_os_error().unwrap_or(-1);
        let _ = (&fail_write).write_all(&errno.to_le_bytes());
        unsafe { libc::_exit(127) }
    }

    drop(exit_write);
    drop(fail_write);
    // The parent's copies of the child-side stream ends.
    drop(stdio);

    match read_exact_or_eof(&mut fail_read)? {
        None => Ok((ChildHandle { pid }, exit_read)),
        Some(bytes) => {
            let errno = i32::from_le_bytes(bytes);
            // The child has already exited; collect it so a failed start
            // leaves no trace.
            let mut status = 0 as c_int;
            let _ = unsafe { libc::waitpid(pid, &mut status, 0) };
            Err(Error::Os(io::Error::from_raw_os_error(errno)))
        }
    }
}

unsafe extern "C" {
    #[allow(non_upper_case_globals)]
    static mut environ: *const *const c_char;
}

fn exec_child(
    argv: &[*const c_char],
    envp: &[*const c_char],
    cwd: Option<&CStr>,
    stdio: &[Option<Arc<File>>; 3],
    exit_write: &File,
) -> io::Error {
    for (fd, end) in stdio.iter().enumerate() {
        if let Some(f) = end {
            if f.as_raw_fd() != fd as RawFd
                && unsafe { libc::dup2(f.as_raw_fd(), fd as c_int) } < 0
            {
                return io::Error::last_os_error();
            }
        }
    }
    // The exit pipe's write end is the one handle that must survive the
    // exec; it is inherited but never used by the child's program.
    let exit_fd = exit_write.as_raw_fd();
    let flags = unsafe { libc::fcntl(exit_fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(exit_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return io::Error::last_os_error();
    }
    if let Some(cwd) = cwd {
        if unsafe { libc::chdir(cwd.as_ptr()) } < 0 {
            return io::Error::last_os_error();
        }
    }
    if let Err(err) = reset_sigpipe() {
        return err;
    }
    unsafe {
        // Swapping the environment first lets execvp keep its PATH search
        // while the child still gets the resolved variable list.
        environ = envp.as_ptr();
        libc::execvp(argv[0], argv.as_ptr());
    }
    io::Error::last_os_error()
}

fn reset_sigpipe() -> io::Result<()> {
    // Rust ignores SIGPIPE and signal-handling libraries often set a mask.
    // The child inherits both, and most Unix programs do not reset them on
    // their own.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        check_err(libc::sigemptyset(&mut set))?;
        check_err(libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut()))?;
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read exactly four bytes, or return `None` on immediate end-of-file. A
/// partial read is an error.
fn read_exact_or_eof(source: &mut File) -> io::Result<Option<[u8; 4]>> {
    let mut buf = [0u8; 4];
    let mut total = 0;
    while total < buf.len() {
        match source.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    match total {
        0 => Ok(None),
        n if n == buf.len() => Ok(Some(buf)),
        _ => Err(io::ErrorKind::UnexpectedEof.into()),
    }
}

/// Collect the exit status of a terminated child. Signal deaths are encoded
/// as `128 + signo`.
pub(crate) fn reap(handle: &ChildHandle) -> Result<i32> {
    let mut status = 0 as c_int;
    loop {
        let r = unsafe { libc::waitpid(handle.pid, &mut status, 0) };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        break;
    }
    Ok(decode_wait_status(status))
}

fn decode_wait_status(status: c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        status
    }
}

pub(crate) fn terminate(handle: &ChildHandle) -> Result<()> {
    send_signal(handle, libc::SIGTERM)
}

pub(crate) fn kill(handle: &ChildHandle) -> Result<()> {
    send_signal(handle, libc::SIGKILL)
}

fn send_signal(handle: &ChildHandle, signal: c_int) -> Result<()> {
    check_err(unsafe { libc::kill(handle.pid, signal) })?;
    Ok(())
}

fn os_to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::Invalid("embedded NUL in argument"))
}
