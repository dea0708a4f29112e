//! Thread-blocking waiter over `poll(2)`.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::{PqGen, Ready, Step, Wait};
use crate::errors::Error;

/// Drive `gen` to completion, blocking the calling thread between
/// suspension points. `timeout` bounds the whole operation; expiry
/// abandons the machine and surfaces [`Error::Timeout`].
pub fn wait_select<G: PqGen>(mut gen: G, timeout: Option<Duration>) -> Result<G::Output, Error> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut ready = None;
    loop {
        match gen.step(ready.take())? {
            Step::Done(value) => return Ok(value),
            Step::Pending { fd, interest } => ready = Some(poll_fd(fd, interest, deadline)?),
        }
    }
}

fn poll_fd(fd: RawFd, interest: Wait, deadline: Option<Instant>) -> Result<Ready, Error> {
    let flags = match interest {
        Wait::R => PollFlags::POLLIN,
        Wait::W => PollFlags::POLLOUT,
        Wait::Rw => PollFlags::POLLIN | PollFlags::POLLOUT,
    };
    // The descriptor is owned by the native client handle, which outlives
    // this wait.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    loop {
        let timeout = match deadline {
            None => PollTimeout::NONE,
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::Timeout);
                }
                let ms = remaining.as_millis().clamp(1, i32::MAX as u128) as i32;
                PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
            }
        };
        let mut fds = [PollFd::new(borrowed, flags)];
        match poll(&mut fds, timeout) {
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(std::io::Error::from(errno).into()),
            Ok(0) => continue, // deadline recheck at the top
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                // Errors and hangups surface through `consume_input`, so
                // report them as read readiness.
                if revents
                    .intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
                {
                    return Ok(Ready::R);
                }
                if revents.contains(PollFlags::POLLOUT) {
                    return Ok(Ready::W);
                }
            }
        }
    }
}
