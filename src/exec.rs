//! Child process execution.
//!
//! Commands run under `/bin/sh -c` with stdout and stderr merged into one
//! pipe so interleaved tool output stays in order.  While the child runs,
//! a slow-callback fires periodically so the queue can report long-running
//! actions; the callback returns the next interval.

use std::time::Duration;

use crate::graph::EnvVar;

pub struct ExecResult {
    pub return_code: i32,
    pub was_signalled: bool,
    /// The child was torn down by an interrupt-style signal; the queue
    /// escalates this into an aborted build.
    pub was_aborted: bool,
    pub output: Vec<u8>,
}

impl ExecResult {
    pub fn success() -> ExecResult {
        ExecResult {
            return_code: 0,
            was_signalled: false,
            was_aborted: false,
            output: Vec::new(),
        }
    }

    pub fn failure(message: String) -> ExecResult {
        ExecResult {
            return_code: 1,
            was_signalled: false,
            was_aborted: false,
            output: message.into_bytes(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.return_code == 0 && !self.was_signalled
    }
}

/// Called when the child has been running for a while; returns the delay
/// until the next call.
pub type SlowCallback<'a> = &'a mut dyn FnMut() -> Duration;

#[cfg(unix)]
pub fn execute_process(
    cmdline: &str,
    env_vars: &[EnvVar],
    mut slow_callback: Option<SlowCallback>,
    slow_callback_interval: Duration,
) -> ExecResult {
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::process::{Command, Stdio};
    use wait_timeout::ChildExt;

    // One pipe, written by both child fds, so stdout/stderr interleave the
    // way the tool produced them.  All three descriptors are close-on-exec:
    // a child spawned concurrently by another worker must not inherit our
    // write end, or the reader would not see EOF until that child exits too.
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return ExecResult::failure(format!(
            "pipe: {}",
            std::io::Error::last_os_error()
        ));
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    unsafe {
        libc::fcntl(read_fd, libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(write_fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    let write_dup = unsafe { libc::fcntl(write_fd, libc::F_DUPFD_CLOEXEC, 0) };
    if write_dup < 0 {
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        return ExecResult::failure(format!(
            "dup: {}",
            std::io::Error::last_os_error()
        ));
    }

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(cmdline)
        .stdin(Stdio::null())
        .stdout(unsafe { Stdio::from_raw_fd(write_fd) })
        .stderr(unsafe { Stdio::from_raw_fd(write_dup) });
    for var in env_vars {
        cmd.env(&var.name, &var.value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            unsafe { libc::close(read_fd) };
            return ExecResult::failure(format!("spawn {:?}: {}", cmdline, err));
        }
    };
    // The write ends were consumed by spawn; only the child holds them now,
    // so the reader sees EOF when the child (and its children) exit.
    let mut pipe = unsafe { std::fs::File::from_raw_fd(read_fd) };

    let reader = std::thread::spawn(move || {
        let mut output = Vec::new();
        let _ = pipe.read_to_end(&mut output);
        output
    });

    let mut interval = slow_callback_interval;
    let status = loop {
        match child.wait_timeout(interval) {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if let Some(cb) = slow_callback.as_mut() {
                    interval = cb();
                }
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return ExecResult::failure(format!("wait {:?}: {}", cmdline, err));
            }
        }
    };

    let mut output = reader.join().unwrap_or_default();

    let mut was_signalled = false;
    let mut was_aborted = false;
    let return_code = match status.code() {
        Some(code) => code,
        None => {
            use std::os::unix::process::ExitStatusExt;
            was_signalled = true;
            let sig = status.signal().unwrap_or(0);
            match sig {
                libc::SIGINT | libc::SIGTERM | libc::SIGQUIT => {
                    was_aborted = true;
                    output.extend_from_slice(b"interrupted\n");
                }
                _ => {
                    output.extend_from_slice(format!("terminated by signal {}\n", sig).as_bytes());
                }
            }
            1
        }
    };

    ExecResult {
        return_code,
        was_signalled,
        was_aborted,
        output,
    }
}

#[cfg(not(unix))]
pub fn execute_process(
    cmdline: &str,
    _env_vars: &[EnvVar],
    _slow_callback: Option<SlowCallback>,
    _slow_callback_interval: Duration,
) -> ExecResult {
    ExecResult::failure(format!("cannot execute {:?} on this platform", cmdline))
}
