#![allow(non_snake_case)]

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::iter;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::os::windows::io::{AsRawHandle, FromRawHandle, RawHandle};
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use winapi::shared::minwindef::{BOOL, DWORD, FALSE, TRUE};
use winapi::shared::winerror::{ERROR_BROKEN_PIPE, ERROR_NO_DATA, WAIT_TIMEOUT};
use winapi::um::handleapi::{CloseHandle, DuplicateHandle, SetHandleInformation, INVALID_HANDLE_VALUE};
use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
use winapi::um::namedpipeapi::{CreatePipe, PeekNamedPipe, SetNamedPipeHandleState};
use winapi::um::processenv::GetStdHandle;
use winapi::um::processthreadsapi::{
    CreateProcessW, GetCurrentProcess, GetExitCodeProcess, TerminateProcess,
    PROCESS_INFORMATION, STARTUPINFOW,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{
    CREATE_NEW_PROCESS_GROUP, CREATE_UNICODE_ENVIRONMENT, INFINITE, PIPE_NOWAIT,
    STARTF_USESTDHANDLES, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE, WAIT_OBJECT_0,
};
use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use winapi::um::winnt::{DUPLICATE_SAME_ACCESS, HANDLE};

use crate::error::{Error, Result};
use crate::poll::{Event, WaitSet};
use crate::process::Stream;

pub(crate) const NULL_DEVICE: &str = "nul";

const HANDLE_FLAG_INHERIT: DWORD = 1;
const STATUS_CONTROL_C_EXIT: DWORD = 0xC000_013A;

/// Owned raw handle, closed on drop.
pub(crate) struct Handle(RawHandle);

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0 as HANDLE);
        }
    }
}

impl AsRawHandle for Handle {
    fn as_raw_handle(&self) -> RawHandle {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:p})", self.0)
    }
}

/// The process handle doubles as the exit notification object; it is
/// duplicated so the lifecycle can close it independently of the child
/// handle.
pub(crate) type ExitHandle = Handle;

#[derive(Debug)]
pub(crate) struct ChildHandle {
    handle: Handle,
    pid: u32,
}

impl ChildHandle {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }
}

fn check(status: BOOL) -> io::Result<()> {
    if status != 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn to_nullterm(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0u16)).collect()
}

pub(crate) fn pipe() -> io::Result<(File, File)> {
    let mut sa = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    check(unsafe { CreatePipe(&mut read, &mut write, &mut sa, 0) })?;
    Ok(unsafe {
        (
            File::from_raw_handle(read as RawHandle),
            File::from_raw_handle(write as RawHandle),
        )
    })
}

pub(crate) fn set_inheritable(f: &File, inheritable: bool) -> io::Result<()> {
    check(unsafe {
        SetHandleInformation(
            f.as_raw_handle() as HANDLE,
            HANDLE_FLAG_INHERIT,
            if inheritable { HANDLE_FLAG_INHERIT } else { 0 },
        )
    })
}

pub(crate) fn set_nonblocking(f: &File, nonblocking: bool) -> io::Result<()> {
    let mut mode: DWORD = if nonblocking { PIPE_NOWAIT } else { 0 };
    check(unsafe {
        SetNamedPipeHandleState(
            f.as_raw_handle() as HANDLE,
            &mut mode,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    })
}

pub(crate) fn dup_standard_stream(stream: Stream) -> io::Result<File> {
    let which = match stream {
        Stream::In => STD_INPUT_HANDLE,
        Stream::Out => STD_OUTPUT_HANDLE,
        Stream::Err => STD_ERROR_HANDLE,
    };
    let std_handle = unsafe { GetStdHandle(which) };
    if std_handle == INVALID_HANDLE_VALUE || std_handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    let duped = duplicate_handle(std_handle, true)?;
    Ok(unsafe { File::from_raw_handle(duped as RawHandle) })
}

fn duplicate_handle(source: HANDLE, inheritable: bool) -> io::Result<HANDLE> {
    let mut duped: HANDLE = ptr::null_mut();
    check(unsafe {
        DuplicateHandle(
            GetCurrentProcess(),
            source,
            GetCurrentProcess(),
            &mut duped,
            0,
            if inheritable { TRUE } else { FALSE },
            DUPLICATE_SAME_ACCESS,
        )
    })?;
    Ok(duped)
}

pub(crate) fn read_pipe(mut f: &File, buf: &mut [u8]) -> Result<usize> {
    match f.read(buf) {
        Ok(n) => Ok(n),
        // A non-blocking pipe with nothing buffered fails with
        // ERROR_NO_DATA, which std lumps in with broken pipes.
        Err(err) if err.raw_os_error() == Some(ERROR_NO_DATA as i32) => Err(Error::TimedOut),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn write_pipe(mut f: &File, buf: &[u8]) -> Result<usize> {
    match f.write(buf) {
        Ok(n) => Ok(n),
        // ERROR_NO_DATA on the write side means the read end is gone.
        Err(err) if err.raw_os_error() == Some(ERROR_NO_DATA as i32) => Err(Error::BrokenPipe),
        Err(err) => Err(err.into()),
    }
}

/// Block until a condition is satisfied on some valid endpoint of `sets`, or
/// `timeout` (`None` = infinite) elapses.
///
/// A lone exit handle blocks in the kernel. Anything involving pipes falls
/// back to a readiness-sampling loop: anonymous pipes are not waitable
/// objects, so readability is sampled with PeekNamedPipe. Write readiness is
/// not observable at all; a set containing a stdin endpoint reports
/// [`Event::IN`] immediately and the subsequent write discovers the true
/// state.
pub(crate) fn wait(sets: &mut [WaitSet<'_>], timeout: Option<Duration>) -> Result<()> {
    let has_endpoint = |set: &WaitSet<'_>| {
        set.stdin.is_some() || set.stdout.is_some() || set.stderr.is_some() || set.exit.is_some()
    };
    if !sets.iter().any(has_endpoint) {
        return Err(Error::BrokenPipe);
    }

    if sets.len() == 1
        && sets[0].stdin.is_none()
        && sets[0].stdout.is_none()
        && sets[0].stderr.is_none()
    {
        if let Some(exit) = sets[0].exit {
            match unsafe { WaitForSingleObject(exit.as_raw_handle() as HANDLE, to_millis(timeout)) }
            {
                WAIT_OBJECT_0 => {
                    sets[0].events = Event::EXIT;
                    return Ok(());
                }
                WAIT_TIMEOUT => return Err(Error::TimedOut),
                _ => return Err(io::Error::last_os_error().into()),
            }
        }
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let mut ready = false;
        for set in sets.iter_mut() {
            let mut events = Event::NONE;
            if set.stdin.is_some() {
                events |= Event::IN;
            }
            if let Some(f) = set.stdout {
                if peek_readable(f)? {
                    events |= Event::OUT;
                }
            }
            if let Some(f) = set.stderr {
                if peek_readable(f)? {
                    events |= Event::ERR;
                }
            }
            if let Some(exit) = set.exit {
                if unsafe { WaitForSingleObject(exit.as_raw_handle() as HANDLE, 0) }
                    == WAIT_OBJECT_0
                {
                    events |= Event::EXIT;
                }
            }
            set.events = events;
            ready |= !events.is_empty();
        }
        if ready {
            return Ok(());
        }
        let pause = match deadline {
            None => Duration::from_millis(10),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::TimedOut);
                }
                remaining.min(Duration::from_millis(10))
            }
        };
        thread::sleep(pause);
    }
}

fn peek_readable(f: &File) -> Result<bool> {
    let mut available: DWORD = 0;
    let ok = unsafe {
        PeekNamedPipe(
            f.as_raw_handle() as HANDLE,
            ptr::null_mut(),
            0,
            ptr::null_mut(),
            &mut available,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        let err = io::Error::last_os_error();
        // End-of-file is a readable condition; the read maps it to the
        // canonical broken-pipe result.
        if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
            return Ok(true);
        }
        return Err(err.into());
    }
    Ok(available > 0)
}

fn to_millis(timeout: Option<Duration>) -> DWORD {
    match timeout {
        None => INFINITE,
        Some(t) => t.as_millis().min((INFINITE - 1) as u128) as DWORD,
    }
}

/// Create the child with `stdio` as its standard streams. The child gets its
/// own process group so console control events from [`terminate`] reach only
/// it. The returned exit object is a duplicate of the process handle, which
/// becomes signalled when the child terminates.
pub(crate) fn spawn(
    argv: &[OsString],
    env: &[(OsString, OsString)],
    cwd: Option<&Path>,
    stdio: [Option<Arc<File>>; 3],
) -> Result<(ChildHandle, ExitHandle)> {
    let mut cmdline = assemble_cmdline(argv)?;
    let env_block = format_env_block(env);
    let cwd_w = cwd.map(|p| to_nullterm(p.as_os_str()));

    let raw = |end: &Option<Arc<File>>| {
        end.as_ref()
            .map_or(ptr::null_mut(), |f| f.as_raw_handle() as HANDLE)
    };

    let mut si: STARTUPINFOW = unsafe { mem::zeroed() };
    si.cb = mem::size_of::<STARTUPINFOW>() as DWORD;
    si.dwFlags = STARTF_USESTDHANDLES;
    si.hStdInput = raw(&stdio[0]);
    si.hStdOutput = raw(&stdio[1]);
    si.hStdError = raw(&stdio[2]);
    let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };

    check(unsafe {
        CreateProcessW(
            ptr::null(),
            cmdline.as_mut_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            TRUE,
            CREATE_UNICODE_ENVIRONMENT | CREATE_NEW_PROCESS_GROUP,
            env_block.as_ptr() as *mut _,
            cwd_w.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
            &mut si,
            &mut pi,
        )
    })?;
    // The parent's copies of the child-side stream ends.
    drop(stdio);

    let process = Handle(pi.hProcess as RawHandle);
    unsafe {
        CloseHandle(pi.hThread);
    }
    let exit = Handle(duplicate_handle(pi.hProcess, false)? as RawHandle);
    Ok((
        ChildHandle {
            handle: process,
            pid: pi.dwProcessId,
        },
        exit,
    ))
}

/// Collect the exit code of a terminated child.
///
/// The POSIX `128 + signo` encoding is approximated: [`kill`] terminates
/// with code 137 and a child that died to a console control event
/// (`STATUS_CONTROL_C_EXIT`) reports 143. All other codes pass through.
pub(crate) fn reap(handle: &ChildHandle) -> Result<i32> {
    let mut code: DWORD = 0;
    check(unsafe { GetExitCodeProcess(handle.handle.as_raw_handle() as HANDLE, &mut code) })?;
    Ok(match code {
        STATUS_CONTROL_C_EXIT => 128 + 15,
        other => other as i32,
    })
}

pub(crate) fn terminate(handle: &ChildHandle) -> Result<()> {
    // The closest analogue of SIGTERM. The child is alone in its process
    // group, so the event reaches nothing else.
    if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, handle.pid) } != 0 {
        return Ok(());
    }
    // No shared console; fall back to hard termination with the
    // SIGTERM-equivalent exit code.
    check(unsafe {
        TerminateProcess(handle.handle.as_raw_handle() as HANDLE, (128 + 15) as DWORD)
    })?;
    Ok(())
}

pub(crate) fn kill(handle: &ChildHandle) -> Result<()> {
    check(unsafe {
        TerminateProcess(handle.handle.as_raw_handle() as HANDLE, (128 + 9) as DWORD)
    })?;
    Ok(())
}

fn format_env_block(env: &[(OsString, OsString)]) -> Vec<u16> {
    fn to_uppercase(s: &OsStr) -> OsString {
        OsString::from_wide(
            &s.encode_wide()
                .map(|c| {
                    if c < 128 {
                        (c as u8).to_ascii_uppercase() as u16
                    } else {
                        c
                    }
                })
                .collect::<Vec<_>>(),
        )
    }
    // Later entries win; variable names compare case-insensitively.
    let mut pruned: Vec<_> = {
        let mut seen = HashSet::<OsString>::new();
        env.iter()
            .rev()
            .filter(|&(k, _)| seen.insert(to_uppercase(k)))
            .collect()
    };
    pruned.reverse();
    let mut block = vec![];
    for (k, v) in pruned {
        block.extend(k.encode_wide());
        block.push('=' as u16);
        block.extend(v.encode_wide());
        block.push(0);
    }
    block.push(0);
    block
}

fn assemble_cmdline(argv: &[OsString]) -> Result<Vec<u16>> {
    let mut cmdline = vec![];
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            cmdline.push(' ' as u16);
        }
        if arg.encode_wide().any(|c| c == 0) {
            return Err(Error::Invalid("embedded NUL in argument"));
        }
        append_quoted(arg, &mut cmdline);
    }
    cmdline.push(0);
    Ok(cmdline)
}

// Translated from ArgvQuote at
// https://learn.microsoft.com/en-us/archive/blogs/twistylittlepassagesallalike/everyone-quotes-command-line-arguments-the-wrong-way
fn append_quoted(arg: &OsStr, cmdline: &mut Vec<u16>) {
    if !arg.is_empty()
        && !arg.encode_wide().any(|c| {
            c == ' ' as u16
                || c == '\t' as u16
                || c == '\n' as u16
                || c == '\x0b' as u16
                || c == '\"' as u16
        })
    {
        cmdline.extend(arg.encode_wide());
        return;
    }
    cmdline.push('"' as u16);

    let arg: Vec<_> = arg.encode_wide().collect();
    let mut i = 0;
    while i < arg.len() {
        let mut num_backslashes = 0;
        while i < arg.len() && arg[i] == '\\' as u16 {
            i += 1;
            num_backslashes += 1;
        }

        if i == arg.len() {
            for _ in 0..num_backslashes * 2 {
                cmdline.push('\\' as u16);
            }
            break;
        } else if arg[i] == b'"' as u16 {
            for _ in 0..num_backslashes * 2 + 1 {
                cmdline.push('\\' as u16);
            }
            cmdline.push(arg[i]);
        } else {
            for _ in 0..num_backslashes {
                cmdline.push('\\' as u16);
            }
            cmdline.push(arg[i]);
        }
        i += 1;
    }
    cmdline.push('"' as u16);
}
