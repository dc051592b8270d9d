use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::common::{drain_string, sh, MESSAGE};
use crate::{
    Env, Error, Options, Process, Redirect, StopAction, StopSequence, Stream, Timeout, SIGKILL,
};

#[test]
fn echo_stdout() {
    let mut p = sh("cat", Options::default());
    assert_eq!(p.write(MESSAGE.as_bytes()).unwrap(), MESSAGE.len());
    p.close(Stream::In);
    let (out, err) = drain_string(&mut p);
    assert_eq!(out, MESSAGE);
    assert_eq!(err, "");
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn echo_stderr() {
    let mut p = sh("cat >&2", Options::default());
    assert_eq!(p.write(MESSAGE.as_bytes()).unwrap(), MESSAGE.len());
    p.close(Stream::In);
    let (out, err) = drain_string(&mut p);
    assert_eq!(out, "");
    assert_eq!(err, MESSAGE);
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn merged_output() {
    let mut p = sh(
        "tee /dev/stderr",
        Options {
            stderr: Redirect::Stdout,
            ..Default::default()
        },
    );
    assert_eq!(p.write(MESSAGE.as_bytes()).unwrap(), MESSAGE.len());
    p.close(Stream::In);
    let (out, err) = drain_string(&mut p);
    assert_eq!(out, [MESSAGE, MESSAGE].concat());
    assert_eq!(err, "");
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn read_timeout_then_eof() {
    let mut p = sh(
        "cat",
        Options {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        },
    );
    let mut buf = [0u8; 1];
    assert!(matches!(p.read(Stream::Out, &mut buf), Err(Error::TimedOut)));
    p.close(Stream::In);
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
    assert!(matches!(
        p.read(Stream::Out, &mut buf),
        Err(Error::BrokenPipe)
    ));
    // The endpoint was closed on end-of-file; reading again reports the same.
    assert!(matches!(
        p.read(Stream::Out, &mut buf),
        Err(Error::BrokenPipe)
    ));
}

#[test]
fn nonblocking_read_is_immediate() {
    let mut p = sh(
        "sleep 1",
        Options {
            nonblocking: true,
            ..Default::default()
        },
    );
    let mut buf = [0u8; 8];
    assert!(matches!(p.read(Stream::Out, &mut buf), Err(Error::TimedOut)));
    p.kill().unwrap();
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), SIGKILL);
}

#[test]
fn exit_code_reported() {
    let mut p = sh("exit 13", Options::default());
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 13);
    assert_eq!(p.exit_status(), Some(13));
    // terminate and kill are no-ops once the child has exited
    p.terminate().unwrap();
    p.kill().unwrap();
}

#[test]
fn kill_exit_code() {
    let mut p = sh("sleep 10", Options::default());
    assert!(p.pid().is_some());
    p.kill().unwrap();
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), SIGKILL);
}

#[test]
fn wait_zero_polls() {
    let mut p = sh("sleep 1", Options::default());
    assert!(matches!(
        p.wait(Timeout::from_millis(0)),
        Err(Error::TimedOut)
    ));
    p.kill().unwrap();
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), SIGKILL);
    // Waiting again returns the stored code without blocking.
    assert_eq!(p.wait(Timeout::from_millis(0)).unwrap(), SIGKILL);
}

#[test]
fn empty_write_is_noop() {
    let mut p = sh("cat", Options::default());
    assert_eq!(p.write(&[]).unwrap(), 0);
    p.close(Stream::In);
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn close_is_idempotent() {
    let mut p = sh("cat", Options::default());
    p.close(Stream::In);
    p.close(Stream::In);
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn operations_before_start() {
    let mut p = Process::new();
    assert!(matches!(p.wait(Timeout::Infinite), Err(Error::Invalid(_))));
    assert!(matches!(p.terminate(), Err(Error::Invalid(_))));
    assert!(matches!(p.kill(), Err(Error::Invalid(_))));
    assert!(matches!(
        p.stop(StopSequence::default()),
        Err(Error::Invalid(_))
    ));
    let mut buf = [0u8; 1];
    assert!(matches!(
        p.read(Stream::Out, &mut buf),
        Err(Error::BrokenPipe)
    ));
    assert!(matches!(p.write(b"x"), Err(Error::BrokenPipe)));
}

#[test]
fn start_twice_is_invalid() {
    let mut p = sh("exit 0", Options::default());
    assert!(matches!(
        p.start(&["sh", "-c", "exit 0"], Options::default()),
        Err(Error::Invalid(_))
    ));
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn empty_argv_is_invalid() {
    let mut p = Process::new();
    let argv: [&str; 0] = [];
    assert!(matches!(
        p.start(&argv, Options::default()),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        p.start(&[""], Options::default()),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn failed_start_rolls_back() {
    let mut p = Process::new();
    assert!(matches!(
        p.start(&["reproc-no-such-program"], Options::default()),
        Err(Error::Os(_))
    ));
    // The rollback leaves the process startable.
    p.start(&["sh", "-c", "exit 0"], Options::default()).unwrap();
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn read_from_stdin_is_invalid() {
    let mut p = sh("cat", Options::default());
    let mut buf = [0u8; 1];
    assert!(matches!(
        p.read(Stream::In, &mut buf),
        Err(Error::Invalid(_))
    ));
    p.close(Stream::In);
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn input_prewritten_to_stdin() {
    let mut p = Process::new();
    p.start(
        &["sh", "-c", "cat"],
        Options {
            input: Some(MESSAGE.as_bytes().to_vec()),
            ..Default::default()
        },
    )
    .unwrap();
    // The stdin endpoint was consumed by the prewrite.
    assert!(matches!(p.write(b"x"), Err(Error::BrokenPipe)));
    let (out, _) = drain_string(&mut p);
    assert_eq!(out, MESSAGE);
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn input_requires_piped_stdin() {
    let mut p = Process::new();
    assert!(matches!(
        p.start(
            &["sh", "-c", "cat"],
            Options {
                stdin: Redirect::Discard,
                input: Some(vec![1]),
                ..Default::default()
            },
        ),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn stdout_alias_only_for_stderr() {
    let mut p = Process::new();
    assert!(matches!(
        p.start(
            &["sh", "-c", "exit 0"],
            Options {
                stdout: Redirect::Stdout,
                ..Default::default()
            },
        ),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn env_replace() {
    let mut p = Process::new();
    p.start(
        &["/bin/sh", "-c", "echo \"$REPROC_TEST\""],
        Options {
            env: Env::Replace(vec![("REPROC_TEST".into(), "value".into())]),
            ..Default::default()
        },
    )
    .unwrap();
    p.close(Stream::In);
    let (out, _) = drain_string(&mut p);
    assert_eq!(out, "value\n");
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn env_extend_inherits_parent() {
    let mut p = sh(
        "echo \"$REPROC_EXTRA:$PATH\"",
        Options {
            env: Env::Extend(vec![("REPROC_EXTRA".into(), "extra".into())]),
            ..Default::default()
        },
    );
    p.close(Stream::In);
    let (out, _) = drain_string(&mut p);
    assert!(out.starts_with("extra:"));
    // The parent's PATH came through.
    assert!(out.trim_end().len() > "extra:".len());
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let canonical = dir.path().canonicalize().unwrap();
    let mut p = Process::new();
    p.start(
        &["sh", "-c", "pwd"],
        Options {
            cwd: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    )
    .unwrap();
    p.close(Stream::In);
    let (out, _) = drain_string(&mut p);
    assert_eq!(
        PathBuf::from(out.trim_end()).canonicalize().unwrap(),
        canonical
    );
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn discard_output() {
    let mut p = Process::new();
    p.start(
        &["sh", "-c", "echo discarded"],
        Options {
            stdin: Redirect::Discard,
            stdout: Redirect::Discard,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
    let mut buf = [0u8; 8];
    assert!(matches!(
        p.read(Stream::Out, &mut buf),
        Err(Error::BrokenPipe)
    ));
}

#[test]
fn redirect_to_file_handle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out");
    let file = File::create(&path).unwrap();
    let mut p = Process::new();
    p.start(
        &["sh", "-c", "printf hello"],
        Options {
            stdin: Redirect::Discard,
            stdout: Redirect::Handle(file),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
}

#[test]
fn deadline_bounds_wait() {
    let mut p = sh(
        "sleep 5",
        Options {
            deadline: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    );
    let begin = Instant::now();
    assert!(matches!(p.wait(Timeout::Deadline), Err(Error::TimedOut)));
    assert!(begin.elapsed() < Duration::from_secs(4));
    p.kill().unwrap();
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), SIGKILL);
}

#[test]
fn stop_terminate_then_kill() {
    // The child ignores the polite signal, so the sequence escalates.
    let mut p = sh("trap '' TERM; while :; do sleep 0.05; done", Options::default());
    let code = p
        .stop(StopSequence {
            first: StopAction::Terminate(Timeout::from_millis(100)),
            second: StopAction::Kill(Timeout::from_millis(100)),
            third: StopAction::Noop,
        })
        .unwrap();
    assert_eq!(code, SIGKILL);
}

#[test]
fn stop_wait_collects_quick_exit() {
    let mut p = sh("exit 7", Options::default());
    let code = p
        .stop(StopSequence {
            first: StopAction::Wait(Timeout::Finite(Duration::from_secs(5))),
            second: StopAction::Noop,
            third: StopAction::Noop,
        })
        .unwrap();
    assert_eq!(code, 7);
}

#[test]
fn drop_applies_stop_sequence() {
    let p = sh(
        "trap '' TERM; while :; do sleep 0.05; done",
        Options {
            stop: StopSequence {
                first: StopAction::Terminate(Timeout::from_millis(100)),
                second: StopAction::Kill(Timeout::from_millis(100)),
                third: StopAction::Noop,
            },
            ..Default::default()
        },
    );
    let begin = Instant::now();
    drop(p);
    assert!(begin.elapsed() < Duration::from_secs(5));
}
