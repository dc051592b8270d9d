use std::time::{Duration, Instant};

use super::common::sh;
use crate::{poll, Error, Event, Options, Process, Source, Timeout, SIGKILL};

#[test]
fn poll_sees_output() {
    let mut quiet = sh("sleep 2", Options::default());
    let mut noisy = sh("printf hi", Options::default());
    let mut sources = [
        Source::new(&quiet, Event::OUT),
        Source::new(&noisy, Event::OUT),
    ];
    let ready = poll(&mut sources, Timeout::Infinite).unwrap();
    assert!(ready >= 1);
    assert!(sources[1].events.contains(Event::OUT));
    assert!(sources[0].events.is_empty());
    quiet.kill().unwrap();
    assert_eq!(quiet.wait(Timeout::Infinite).unwrap(), SIGKILL);
    assert_eq!(noisy.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn poll_times_out() {
    let mut p = sh("sleep 2", Options::default());
    let mut sources = [Source::new(&p, Event::OUT)];
    assert!(matches!(
        poll(&mut sources, Timeout::from_millis(50)),
        Err(Error::TimedOut)
    ));
    p.kill().unwrap();
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), SIGKILL);
}

#[test]
fn poll_reports_deadline_before_io() {
    // One source's deadline fires long before the other produces output.
    let mut slow = sh(
        "sleep 2",
        Options {
            deadline: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    let mut writer = sh("sleep 2; echo done", Options::default());
    let begin = Instant::now();
    let mut sources = [
        Source::new(&slow, Event::OUT),
        Source::new(&writer, Event::OUT),
    ];
    let ready = poll(&mut sources, Timeout::Infinite).unwrap();
    assert_eq!(ready, 1);
    assert_eq!(sources[0].events, Event::DEADLINE);
    assert!(sources[1].events.is_empty());
    assert!(begin.elapsed() < Duration::from_secs(1));
    slow.kill().unwrap();
    slow.wait(Timeout::Infinite).unwrap();
    writer.kill().unwrap();
    writer.wait(Timeout::Infinite).unwrap();
}

#[test]
fn poll_expired_deadline_returns_immediately() {
    let mut p = sh(
        "sleep 2",
        Options {
            deadline: Some(Duration::from_millis(20)),
            ..Default::default()
        },
    );
    std::thread::sleep(Duration::from_millis(50));
    let mut sources = [Source::new(&p, Event::OUT)];
    assert_eq!(poll(&mut sources, Timeout::Infinite).unwrap(), 1);
    assert_eq!(sources[0].events, Event::DEADLINE);
    p.kill().unwrap();
    p.wait(Timeout::Infinite).unwrap();
}

#[test]
fn poll_reports_exit() {
    let mut p = sh("exit 0", Options::default());
    let mut events = Event::NONE;
    for _ in 0..50 {
        let mut sources = [Source::new(&p, Event::OUT | Event::EXIT)];
        poll(&mut sources, Timeout::Infinite).unwrap();
        events = sources[0].events;
        if events.contains(Event::EXIT) {
            break;
        }
    }
    assert!(events.contains(Event::EXIT));
    assert_eq!(p.wait(Timeout::Infinite).unwrap(), 0);
}

#[test]
fn poll_without_valid_endpoints() {
    let p = Process::new();
    let mut sources = [Source::new(&p, Event::IN | Event::OUT | Event::ERR)];
    assert!(matches!(
        poll(&mut sources, Timeout::from_millis(10)),
        Err(Error::BrokenPipe)
    ));
}

#[test]
fn poll_with_no_interests() {
    let mut p = sh("sleep 1", Options::default());
    let mut sources = [Source::new(&p, Event::NONE)];
    assert!(matches!(
        poll(&mut sources, Timeout::from_millis(10)),
        Err(Error::BrokenPipe)
    ));
    p.kill().unwrap();
    p.wait(Timeout::Infinite).unwrap();
}

#[test]
fn poll_requires_sources() {
    let mut sources: [Source<'_>; 0] = [];
    assert!(matches!(
        poll(&mut sources, Timeout::Infinite),
        Err(Error::Invalid(_))
    ));
}
