use crate::{drain, Options, Process};

pub const MESSAGE: &str = "reproc stands for REdirected PROCess";

/// Start `script` under `sh -c` with the given options.
pub fn sh(script: &str, options: Options) -> Process {
    let mut process = Process::new();
    process.start(&["sh", "-c", script], options).unwrap();
    process
}

/// Drain both output streams into strings.
pub fn drain_string(process: &mut Process) -> (String, String) {
    let (mut out, mut err) = (Vec::new(), Vec::new());
    drain(process, &mut out, &mut err).unwrap();
    (
        String::from_utf8(out).unwrap(),
        String::from_utf8(err).unwrap(),
    )
}
