// Helper class for watching file descriptors
// OS-compatibility layer
//
// Austin Shafer - 2024
extern crate nix;

use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;

use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

// A file descriptor watcher
//
// The event loop parks here between frames. The timeout is in
// microseconds since the frame scheduler hands out sub-millisecond
// deadlines, which is why this sits on ppoll instead of poll.
pub struct FdWatch {
    // Fds to watch for readability
    fdw_fds: Vec<RawFd>,
}

impl FdWatch {
    pub fn new() -> FdWatch {
        FdWatch { fdw_fds: Vec::new() }
    }

    pub fn add_fd(&mut self, fd: RawFd) {
        self.fdw_fds.push(fd);
    }

    pub fn register_events(&mut self) {
        // noop since ppoll doesn't need registration
    }

    // timeout in us, None blocks forever
    // returns true if something is ready to be read
    pub fn wait_for_events(&mut self, timeout_usec: Option<u64>) -> bool {
        let mut fds: Vec<PollFd> = self
            .fdw_fds
            .iter()
            .map(|fd| {
                // The fds in our set outlive this call, we only hold
                // them raw so FdWatch doesn't own the connection
                let bfd = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(bfd, PollFlags::POLLIN)
            })
            .collect();

        let timeout = timeout_usec.map(|us| TimeSpec::from(Duration::from_micros(us)));

        match ppoll(fds.as_mut_slice(), timeout, None) {
            Ok(n) => n > 0,
            Err(_) => false,
        }
    }
}
