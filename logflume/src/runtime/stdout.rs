//! Process-wide standard-output capture.
//!
//! A plugin process talks frames on its real standard output, but user code
//! may `print!` at any time and would corrupt the framed channel. Before any
//! user code runs, the runtime duplicates the real stdout descriptor for the
//! pipe, then points file descriptor 1 at an internal pipe whose read end is
//! drained by a capture task that forwards the bytes to the parent as
//! `Stdout` messages. The capture task reads until EOF, which arrives on
//! final process teardown.
//!
//! SIGINT is ignored via an explicit signal disposition so the parent alone
//! controls plugin lifetime through `Stop`.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::FromRawFd;

use tokio::task::JoinHandle;

use crate::message::{Body, Message};
use crate::pipe::PipeWriter;

/// The two descriptors produced by [`redirect_stdout`].
pub struct StdoutRedirect {
    /// The real standard output, for the framed pipe.
    pub pipe_out: File,
    /// Read end of the internal pipe fd 1 now points at.
    pub capture: File,
}

/// Replace fd 1 with an internal pipe, preserving the original for frames.
///
/// Must run before any user code so no print can slip through onto the
/// framed channel.
pub fn redirect_stdout() -> io::Result<StdoutRedirect> {
    let pipe_out_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if pipe_out_fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(pipe_out_fd) };
        return Err(err);
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    if unsafe { libc::dup2(write_fd, libc::STDOUT_FILENO) } < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(pipe_out_fd);
            libc::close(read_fd);
            libc::close(write_fd);
        }
        return Err(err);
    }
    unsafe { libc::close(write_fd) };

    Ok(StdoutRedirect {
        pipe_out: unsafe { File::from_raw_fd(pipe_out_fd) },
        capture: unsafe { File::from_raw_fd(read_fd) },
    })
}

/// Ignore SIGINT for the rest of the process lifetime.
pub fn ignore_interrupt() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}

/// Drain the capture pipe into `Stdout` messages until EOF.
pub fn spawn_stdout_capture(capture: File, writer: PipeWriter) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut capture = capture;
        let mut buf = [0u8; 4096];
        loop {
            match capture.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if writer
                        .write(Message::control(Body::Stdout(buf[..n].to_vec())))
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!(error = %e, "stdout capture failed");
                    return;
                }
            }
        }
    })
}
